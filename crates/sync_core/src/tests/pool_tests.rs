use super::*;

#[test]
fn pool_never_hands_out_more_than_capacity() {
    let pool = WorkerPool::new(2);
    let first = pool.try_start(JobId::new()).expect("first slot");
    let _second = pool.try_start(JobId::new()).expect("second slot");
    assert!(pool.try_start(JobId::new()).is_none());
    assert_eq!(pool.free_slots(), 0);

    drop(first);
    assert_eq!(pool.free_slots(), 1);
    assert!(pool.try_start(JobId::new()).is_some());
}

#[test]
fn same_job_cannot_hold_two_slots() {
    let pool = WorkerPool::new(3);
    let job = JobId::new();
    let slot = pool.try_start(job).expect("slot");
    assert!(pool.try_start(job).is_none());
    assert!(pool.is_running(job));
    assert_eq!(pool.running_count(), 1);

    drop(slot);
    assert!(!pool.is_running(job));
    assert_eq!(pool.free_slots(), 3);
}
