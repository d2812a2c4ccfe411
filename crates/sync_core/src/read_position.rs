//! Read cursor reconciliation and the cached read-position collection.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use shared::{
    domain::DeviceId,
    model::ReadPosition,
    protocol::Priority,
};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    conversation::ConversationHandle,
    error::{SyncError, SyncResult},
    events::{EventBus, SyncEvent},
    store::StoreGateway,
    unread,
};

/// Read positions already loaded for one conversation, plus the contiguous
/// timestamp interval known to be complete.
#[derive(Debug, Default)]
pub struct ReadPositionCache {
    covered: Option<(i64, i64)>,
    positions: BTreeMap<(i64, DeviceId), ReadPosition>,
}

impl ReadPositionCache {
    pub fn covered(&self) -> Option<(i64, i64)> {
        self.covered
    }

    /// Sub-intervals of `[start, end]` not covered yet.
    pub fn missing(&self, start: i64, end: i64) -> Vec<(i64, i64)> {
        if start > end {
            return Vec::new();
        }
        let Some((c0, c1)) = self.covered else {
            return vec![(start, end)];
        };
        let mut pieces = Vec::new();
        if start < c0 {
            pieces.push((start, end.min(c0 - 1)));
        }
        if end > c1 {
            pieces.push((start.max(c1.saturating_add(1)), end));
        }
        pieces
    }

    /// Records a fetched piece. `boundary` is the first stored timestamp past
    /// `end`, used to tell whether the gap up to the covered interval is empty.
    pub fn absorb(
        &mut self,
        start: i64,
        end: i64,
        records: Vec<ReadPosition>,
        boundary: Option<i64>,
    ) {
        for record in records {
            self.insert(record);
        }
        self.covered = Some(match self.covered {
            None => (start, end),
            Some((c0, c1)) if start <= c1.saturating_add(1) && end.saturating_add(1) >= c0 => {
                (start.min(c0), end.max(c1))
            }
            Some((c0, c1)) if end < c0 && boundary.map_or(true, |ts| ts >= c0) => (start, c1),
            Some(_) => (start, end),
        });
    }

    pub fn insert(&mut self, position: ReadPosition) {
        self.positions.insert(
            (position.max_server_timestamp, position.source_device),
            position,
        );
    }

    pub fn range(&self, start: i64, end: i64) -> Vec<ReadPosition> {
        if start > end {
            return Vec::new();
        }
        self.positions
            .range((start, DeviceId(i64::MIN))..=(end, DeviceId(i64::MAX)))
            .map(|(_, position)| position.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarkReadOptions {
    /// Messages newly read by this move, when the caller knows.
    pub count_delta: Option<u32>,
    pub priority: Priority,
    /// Wait for the durable phase and surface its failure.
    pub wait: bool,
}

enum Commit {
    Done(u32),
    Superseded,
    NeedsCount,
}

#[derive(Clone)]
pub struct ReadPositionTracker {
    store: StoreGateway,
    events: EventBus,
    stuck_after: Duration,
}

impl ReadPositionTracker {
    pub fn new(store: StoreGateway, events: EventBus, stuck_after: Duration) -> Self {
        Self {
            store,
            events,
            stuck_after,
        }
    }

    /// Applies the unread delta immediately, then queues durable reconciliation.
    /// Returns the displayed count: the immediate one, or the durable one with
    /// `wait`.
    pub async fn mark_read(
        &self,
        handle: &Arc<ConversationHandle>,
        position: ReadPosition,
        options: MarkReadOptions,
    ) -> SyncResult<u32> {
        let immediate = self.apply_immediate(handle, &position, options.count_delta);

        let tracker = self.clone();
        let task_handle = Arc::clone(handle);
        let durable = handle.read_queue().push(options.priority, async move {
            let result = tracker.reconcile(&task_handle, position).await;
            if let Err(err) = &result {
                warn!(
                    conversation_id = %task_handle.id(),
                    error = %err,
                    "read positions: durable update failed"
                );
            }
            result
        });

        if !options.wait {
            return Ok(immediate);
        }
        durable
            .await
            .map_err(|_| SyncError::QueueAbandoned(handle.read_queue().name()))?
    }

    fn apply_immediate(
        &self,
        handle: &ConversationHandle,
        position: &ReadPosition,
        count_delta: Option<u32>,
    ) -> u32 {
        let ts = position.max_server_timestamp;
        let (display, changed) = handle.with_state(|state| {
            let conversation = &mut state.conversation;
            if conversation.read_cursor().is_some_and(|cursor| ts <= cursor) {
                return (unread::display_unread_count(conversation), false);
            }
            let before = conversation.unread_count;
            unread::update_unread_count(conversation, ts, count_delta);
            (
                unread::display_unread_count(conversation),
                before != conversation.unread_count,
            )
        });
        if changed {
            self.events.publish(SyncEvent::UnreadCountChanged {
                conversation_id: handle.id(),
                unread_count: display,
            });
            self.events.publish(SyncEvent::ConversationNeedsPersistence {
                conversation_id: handle.id(),
            });
        }
        display
    }

    /// Durable phase. Runs on the conversation's read-position queue.
    async fn reconcile(&self, handle: &ConversationHandle, position: ReadPosition) -> SyncResult<u32> {
        let ts = position.max_server_timestamp;
        let now = Instant::now();
        let (snapshot, stuck) = handle.with_state(|state| {
            let stuck = match state.last_attempted {
                Some((last, first_seen)) if last == ts => {
                    let stuck = state.durable_unread > 0
                        && now.duration_since(first_seen) > self.stuck_after;
                    if stuck {
                        state.last_attempted = Some((ts, now));
                    }
                    stuck
                }
                _ => {
                    state.last_attempted = Some((ts, now));
                    false
                }
            };
            (state.conversation.clone(), stuck)
        });

        let previous = snapshot.read_cursor();
        if previous.is_some_and(|cursor| ts <= cursor) {
            if !stuck {
                return Ok(unread::display_unread_count(&snapshot));
            }
            let unread_count = unread::recount(&self.store, &snapshot).await?;
            info!(
                conversation_id = %handle.id(),
                cursor = ts,
                unread_count,
                "read positions: forced recount of stuck unread count"
            );
            return self.commit_unread(handle, unread_count).await;
        }

        let mut newly_read = if unread::cursor_covers_bottom(&snapshot, ts) {
            None
        } else {
            Some(self.count_newly_read(handle, previous, ts).await?)
        };

        self.store.save_read_position(&position).await?;
        // Ingestion may have moved the durable count or the bottom since the
        // snapshot, so the new count is derived from live state.
        let unread_count = loop {
            let outcome = handle.with_state(|state| {
                if state
                    .conversation
                    .read_cursor()
                    .is_some_and(|cursor| ts <= cursor)
                {
                    return Commit::Superseded;
                }
                let unread_count = if unread::cursor_covers_bottom(&state.conversation, ts) {
                    0
                } else if let Some(newly_read) = newly_read {
                    state.durable_unread.saturating_sub(newly_read)
                } else {
                    return Commit::NeedsCount;
                };
                state.conversation.last_read_position = Some(position.clone());
                state.conversation.unread_count = unread_count;
                state.durable_unread = unread_count;
                state.read_cache.insert(position.clone());
                Commit::Done(unread_count)
            });
            match outcome {
                Commit::Done(unread_count) => break unread_count,
                Commit::Superseded => {
                    return Ok(handle.with_state(|state| unread::display_unread_count(&state.conversation)));
                }
                Commit::NeedsCount => {
                    newly_read = Some(self.count_newly_read(handle, previous, ts).await?);
                }
            }
        };
        handle.persist(&self.store).await?;

        info!(
            conversation_id = %handle.id(),
            source_device = %position.source_device,
            cursor = ts,
            unread_count,
            "read positions: cursor advanced"
        );
        self.events.publish(SyncEvent::NewReadPosition(position));
        let display = handle.with_state(|state| unread::display_unread_count(&state.conversation));
        self.events.publish(SyncEvent::UnreadCountChanged {
            conversation_id: handle.id(),
            unread_count: display,
        });
        Ok(display)
    }

    async fn count_newly_read(
        &self,
        handle: &ConversationHandle,
        previous: Option<i64>,
        ts: i64,
    ) -> SyncResult<u32> {
        self.store
            .get_unread_message_count(handle.id(), previous.unwrap_or(i64::MIN), ts)
            .await
    }

    async fn commit_unread(&self, handle: &ConversationHandle, unread_count: u32) -> SyncResult<u32> {
        let display = handle.with_state(|state| {
            state.conversation.unread_count = unread_count;
            state.durable_unread = unread_count;
            unread::display_unread_count(&state.conversation)
        });
        handle.persist(&self.store).await?;
        self.events.publish(SyncEvent::UnreadCountChanged {
            conversation_id: handle.id(),
            unread_count: display,
        });
        Ok(display)
    }

    /// Positions with `start <= max_server_timestamp <= end`, querying the store
    /// only for the part not cached yet.
    pub async fn load_read_positions(
        &self,
        handle: &ConversationHandle,
        start: i64,
        end: i64,
    ) -> SyncResult<Vec<ReadPosition>> {
        let pieces = handle.with_state(|state| state.read_cache.missing(start, end));
        for (piece_start, piece_end) in pieces {
            let records = self
                .store
                .get_read_positions(handle.id(), piece_start, piece_end, None)
                .await?;
            let boundary = match piece_end.checked_add(1) {
                Some(after) => self
                    .store
                    .get_read_positions(handle.id(), after, i64::MAX, Some(1))
                    .await?
                    .first()
                    .map(|position| position.max_server_timestamp),
                None => None,
            };
            handle.with_state(|state| {
                state
                    .read_cache
                    .absorb(piece_start, piece_end, records, boundary)
            });
        }
        Ok(handle.with_state(|state| state.read_cache.range(start, end)))
    }
}

#[cfg(test)]
#[path = "tests/read_position_tests.rs"]
mod tests;
