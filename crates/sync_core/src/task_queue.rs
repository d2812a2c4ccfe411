//! Strictly ordered, priority-aware task queue with concurrency 1.
//!
//! Each conversation owns one of these per queue family. Tasks on the same queue
//! never overlap; tasks on different queues proceed independently on the runtime.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex},
};

use futures::FutureExt;
use shared::protocol::Priority;
use tokio::sync::{oneshot, Notify};
use tracing::error;

use crate::error::{SyncError, SyncResult};

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send>>;

struct QueuedTask {
    priority: Priority,
    seq: u64,
    task: BoxTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // Max-heap: higher priority first, then FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    pending: BinaryHeap<QueuedTask>,
    running: bool,
    next_seq: u64,
}

struct QueueShared {
    name: &'static str,
    state: Mutex<QueueState>,
    idle: Notify,
}

#[derive(Clone)]
pub struct SerialTaskQueue {
    shared: Arc<QueueShared>,
}

impl SerialTaskQueue {
    pub fn new(name: &'static str) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                name,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Enqueues `fut` and returns a receiver for its output. Dropping the receiver
    /// does not cancel the task.
    pub fn push<F, T>(&self, priority: Priority, fut: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: BoxTask = Box::pin(async move {
            let _ = tx.send(fut.await);
        });

        let start_drain = {
            let mut state = lock(&self.shared.state);
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(QueuedTask {
                priority,
                seq,
                task,
            });
            !std::mem::replace(&mut state.running, true)
        };

        if start_drain {
            tokio::spawn(drain(Arc::clone(&self.shared)));
        }
        rx
    }

    /// Enqueues `fut` and waits for its output.
    pub async fn run<F, T>(&self, priority: Priority, fut: F) -> SyncResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.push(priority, fut)
            .await
            .map_err(|_| SyncError::QueueAbandoned(self.shared.name))
    }

    /// Tasks waiting to run, excluding the one in flight.
    pub fn queued(&self) -> usize {
        lock(&self.shared.state).pending.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = lock(&self.shared.state);
        !state.running && state.pending.is_empty()
    }

    pub async fn on_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn drain(shared: Arc<QueueShared>) {
    loop {
        let next = {
            let mut state = lock(&shared.state);
            match state.pending.pop() {
                Some(next) => next,
                None => {
                    state.running = false;
                    drop(state);
                    shared.idle.notify_waiters();
                    return;
                }
            }
        };

        if AssertUnwindSafe(next.task).catch_unwind().await.is_err() {
            error!(queue = shared.name, seq = next.seq, "task queue: task panicked");
        }
    }
}

fn lock(state: &Mutex<QueueState>) -> std::sync::MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/task_queue_tests.rs"]
mod tests;
