//! Coalescing writer that adapts its batch size to observed store latency.

use std::{
    collections::{HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use shared::{domain::MessageId, model::Message};
use tokio::{sync::oneshot, time::Instant};
use tracing::{debug, warn};

use crate::{
    error::{SyncError, SyncResult},
    store::StoreGateway,
};

/// Upper bound for any batch ceiling.
pub const MAX_BATCH_CEILING: usize = 50;

pub trait BatchEntity: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Send;

    fn batch_key(&self) -> Self::Key;
}

impl BatchEntity for Message {
    type Key = MessageId;

    fn batch_key(&self) -> MessageId {
        self.id
    }
}

#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn write_batch(&self, items: &[T]) -> SyncResult<()>;
}

pub struct MessageSink {
    store: StoreGateway,
}

impl MessageSink {
    pub fn new(store: StoreGateway) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchSink<Message> for MessageSink {
    async fn write_batch(&self, items: &[Message]) -> SyncResult<()> {
        self.store.save_messages(items).await
    }
}

/// Additive increase/decrease controller for the batch ceiling.
#[derive(Debug, Clone)]
pub struct BatchSizeController {
    ceiling: usize,
    hard_ceiling: usize,
    max: usize,
    target: Duration,
}

impl BatchSizeController {
    pub fn new(initial: usize, max: usize, target: Duration) -> Self {
        let max = max.clamp(1, MAX_BATCH_CEILING);
        Self {
            ceiling: initial.clamp(1, max),
            hard_ceiling: max,
            max,
            target,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn hard_ceiling(&self) -> usize {
        self.hard_ceiling
    }

    /// Feeds one flush measurement and returns the next ceiling.
    pub fn observe(&mut self, elapsed: Duration, batch_len: usize) -> usize {
        if elapsed >= self.target * 3 {
            self.ceiling = self.ceiling.saturating_sub(1).max(1);
            self.hard_ceiling = self.ceiling;
        } else if elapsed >= self.target {
            self.ceiling = self.ceiling.saturating_sub(1).max(1);
        } else if elapsed < self.target / 4 && batch_len == self.ceiling {
            self.ceiling = (self.ceiling + 1).min(self.hard_ceiling).min(self.max);
        }
        self.ceiling
    }
}

struct PendingWrite<T> {
    item: T,
    done: Option<oneshot::Sender<SyncResult<()>>>,
}

struct BatchState<T> {
    pending: VecDeque<PendingWrite<T>>,
    timer_armed: bool,
    controller: BatchSizeController,
}

struct BatcherInner<T: BatchEntity> {
    name: &'static str,
    sink: Arc<dyn BatchSink<T>>,
    wait: Duration,
    state: Mutex<BatchState<T>>,
    flush_lock: tokio::sync::Mutex<()>,
}

pub struct AdaptiveWriteBatcher<T: BatchEntity> {
    inner: Arc<BatcherInner<T>>,
}

impl<T: BatchEntity> Clone for AdaptiveWriteBatcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: BatchEntity> AdaptiveWriteBatcher<T> {
    pub fn new(
        name: &'static str,
        sink: Arc<dyn BatchSink<T>>,
        wait: Duration,
        controller: BatchSizeController,
    ) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                name,
                sink,
                wait,
                state: Mutex::new(BatchState {
                    pending: VecDeque::new(),
                    timer_armed: false,
                    controller,
                }),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Queues `item` and returns a receiver resolved once the batch holding it is
    /// written. Safe to call while holding other locks.
    pub fn enqueue(&self, item: T) -> oneshot::Receiver<SyncResult<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.lock();
        state.pending.push_back(PendingWrite {
            item,
            done: Some(tx),
        });
        self.inner.schedule(&mut state);
        rx
    }

    /// Queues `item` and waits for its batch.
    pub async fn save(&self, item: T) -> SyncResult<()> {
        let name = self.inner.name;
        self.enqueue(item)
            .await
            .map_err(|_| SyncError::QueueAbandoned(name))?
    }

    /// Writes everything queued so far.
    pub async fn flush_all(&self) -> SyncResult<()> {
        while !self.inner.lock().pending.is_empty() {
            self.inner.flush().await?;
        }
        Ok(())
    }

    pub fn ceiling(&self) -> usize {
        self.inner.lock().controller.ceiling()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl<T: BatchEntity> BatcherInner<T> {
    fn lock(&self) -> MutexGuard<'_, BatchState<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule(self: &Arc<Self>, state: &mut BatchState<T>) {
        if state.pending.is_empty() {
            return;
        }
        if state.pending.len() >= state.controller.ceiling() {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let _ = inner.flush().await;
            });
        } else {
            self.arm_timer(state);
        }
    }

    /// Spawned from a plain fn so `flush` never names its own future.
    fn arm_timer(self: &Arc<Self>, state: &mut BatchState<T>) {
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.wait).await;
            let _ = inner.flush().await;
        });
    }

    async fn flush(self: &Arc<Self>) -> SyncResult<()> {
        let _guard = self.flush_lock.lock().await;

        let (taken, ceiling) = {
            let mut state = self.lock();
            state.timer_armed = false;
            let ceiling = state.controller.ceiling();
            let take = state.pending.len().min(ceiling);
            let taken: Vec<_> = state.pending.drain(..take).collect();
            (taken, ceiling)
        };
        if taken.is_empty() {
            return Ok(());
        }

        let batch_len = taken.len();
        let mut waiters = Vec::with_capacity(batch_len);
        let mut items = Vec::with_capacity(batch_len);
        for write in taken {
            waiters.extend(write.done);
            items.push(write.item);
        }
        let items = keep_last_per_key(items);

        let started = Instant::now();
        let result = self.sink.write_batch(&items).await;
        let elapsed = started.elapsed();

        let mut state = self.lock();
        let next = state.controller.observe(elapsed, batch_len);
        debug!(
            batcher = self.name,
            written = items.len(),
            batch_len,
            ceiling,
            next_ceiling = next,
            elapsed_ms = elapsed.as_millis() as u64,
            "write batcher: flushed"
        );

        match result {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                self.schedule(&mut state);
                Ok(())
            }
            Err(err) => {
                warn!(batcher = self.name, error = %err, items = items.len(), "write batcher: flush failed, retrying next cycle");
                for waiter in waiters {
                    let _ = waiter.send(Err(err.replicate()));
                }
                // Newer updates queued meanwhile sit behind these and win the dedup.
                for item in items.into_iter().rev() {
                    state.pending.push_front(PendingWrite { item, done: None });
                }
                self.arm_timer(&mut state);
                Err(err)
            }
        }
    }
}

/// Drops every update that a later update to the same entity supersedes.
fn keep_last_per_key<T: BatchEntity>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::new();
    let mut kept: Vec<T> = items
        .into_iter()
        .rev()
        .filter(|item| seen.insert(item.batch_key()))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
#[path = "tests/write_batcher_tests.rs"]
mod tests;
