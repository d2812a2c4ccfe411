use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use shared::domain::JobId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed number of download slots plus the registry of jobs holding them.
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<JobId>>>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(Mutex::new(HashSet::new())),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_running(&self, job: JobId) -> bool {
        lock(&self.running).contains(&job)
    }

    /// Claims a slot for `job` unless it is already running or the pool is full.
    pub fn try_start(&self, job: JobId) -> Option<WorkerSlot> {
        let mut running = lock(&self.running);
        if running.contains(&job) {
            return None;
        }
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        running.insert(job);
        Some(WorkerSlot {
            job,
            running: Arc::clone(&self.running),
            _permit: permit,
        })
    }
}

/// Held while a job runs; dropping it frees the slot.
pub struct WorkerSlot {
    job: JobId,
    running: Arc<Mutex<HashSet<JobId>>>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerSlot {
    pub fn job(&self) -> JobId {
        self.job
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.job);
    }
}

fn lock(running: &Mutex<HashSet<JobId>>) -> MutexGuard<'_, HashSet<JobId>> {
    running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "../tests/pool_tests.rs"]
mod tests;
