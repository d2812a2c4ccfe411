use std::{
    sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    time::Duration,
};

use super::*;

#[tokio::test]
async fn tasks_on_one_queue_never_overlap() {
    let queue = SerialTaskQueue::new("test");
    let active = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let receivers: Vec<_> = (0..8)
        .map(|_| {
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            queue.push(Priority::Normal, async move {
                let now = active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                max_seen.fetch_max(now, AtomicOrdering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, AtomicOrdering::SeqCst);
            })
        })
        .collect();

    for rx in receivers {
        rx.await.expect("task finished");
    }
    assert_eq!(max_seen.load(AtomicOrdering::SeqCst), 1);
}

#[tokio::test]
async fn higher_priority_jumps_ahead_of_queued_work() {
    let queue = SerialTaskQueue::new("test");
    let order = Arc::new(Mutex::new(Vec::new()));
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let blocker = queue.push(Priority::Normal, async move {
        let _ = release_rx.await;
    });

    let mut receivers = Vec::new();
    for (label, priority) in [
        ("low", Priority::Low),
        ("normal-1", Priority::Normal),
        ("high", Priority::High),
        ("normal-2", Priority::Normal),
    ] {
        let order = Arc::clone(&order);
        receivers.push(queue.push(priority, async move {
            order.lock().expect("order lock").push(label);
        }));
    }

    release_tx.send(()).expect("release blocker");
    blocker.await.expect("blocker");
    for rx in receivers {
        rx.await.expect("task");
    }

    assert_eq!(
        *order.lock().expect("order lock"),
        vec!["high", "normal-1", "normal-2", "low"]
    );
}

#[tokio::test]
async fn run_returns_task_output() {
    let queue = SerialTaskQueue::new("test");
    let value = queue
        .run(Priority::High, async { 41 + 1 })
        .await
        .expect("run");
    assert_eq!(value, 42);
}

#[tokio::test]
async fn panicking_task_does_not_wedge_the_queue() {
    let queue = SerialTaskQueue::new("test");
    let failed = queue.run(Priority::Normal, async {
        panic!("boom");
    });
    assert!(matches!(
        failed.await,
        Err(SyncError::QueueAbandoned("test"))
    ));

    let after = queue
        .run(Priority::Normal, async { "still running" })
        .await
        .expect("queue keeps draining");
    assert_eq!(after, "still running");
}

#[tokio::test]
async fn separate_queues_run_independently() {
    let first = SerialTaskQueue::new("first");
    let second = SerialTaskQueue::new("second");
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let _blocked = first.push(Priority::Normal, async move {
        let _ = release_rx.await;
    });
    let done = tokio::time::timeout(
        Duration::from_secs(1),
        second.run(Priority::Normal, async { 7 }),
    )
    .await
    .expect("second queue not blocked by first")
    .expect("run");
    assert_eq!(done, 7);

    assert!(!first.is_idle());
    release_tx.send(()).expect("release");
    first.on_idle().await;
    assert!(first.is_idle());
    assert_eq!(first.queued(), 0);
}
