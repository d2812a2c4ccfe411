//! Windowed fetching of remote messages, one serial queue per conversation.

use std::sync::Arc;

use shared::protocol::{ConversationRef, Priority, PullDirection, SequenceRange};
use tracing::{debug, info, warn};

use crate::{
    conversation::ConversationHandle,
    error::{SyncError, SyncResult},
    store::StoreGateway,
    transport::{PullOptions, SyncTransport},
    window::compute_window,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOutcome {
    pub has_more: bool,
    /// Window sent to the server, if any.
    pub requested: Option<SequenceRange>,
}

#[derive(Clone)]
pub struct RemoteMessagePuller {
    store: StoreGateway,
    transport: Arc<dyn SyncTransport>,
    max_len: i64,
}

impl RemoteMessagePuller {
    pub fn new(store: StoreGateway, transport: Arc<dyn SyncTransport>, max_len: i64) -> Self {
        Self {
            store,
            transport,
            max_len: max_len.max(1),
        }
    }

    /// Queues one pull. Without `wait` the outcome is not observed and failures
    /// are only logged.
    pub async fn pull(
        &self,
        handle: &Arc<ConversationHandle>,
        direction: PullDirection,
        wait: bool,
        priority: Priority,
    ) -> SyncResult<PullOutcome> {
        let puller = self.clone();
        let task_handle = Arc::clone(handle);
        let outcome = handle.pull_queue().push(priority, async move {
            let result = puller.pull_core(&task_handle, direction, priority).await;
            if let Err(err) = &result {
                warn!(
                    conversation_id = %task_handle.id(),
                    ?direction,
                    error = %err,
                    "puller: pull failed"
                );
            }
            result
        });

        if !wait {
            return Ok(PullOutcome::default());
        }
        outcome
            .await
            .map_err(|_| SyncError::QueueAbandoned(handle.pull_queue().name()))?
    }

    /// Newer-direction pulls until the loaded window reaches the remote end.
    /// Returns how many windows were requested.
    pub async fn pull_all_unread(&self, handle: &Arc<ConversationHandle>) -> SyncResult<usize> {
        let mut requested = 0;
        loop {
            let outcome = self
                .pull(handle, PullDirection::Newer, true, Priority::Normal)
                .await?;
            if outcome.requested.is_some() {
                requested += 1;
            }
            if !outcome.has_more {
                return Ok(requested);
            }
        }
    }

    async fn pull_core(
        &self,
        handle: &ConversationHandle,
        direction: PullDirection,
        priority: Priority,
    ) -> SyncResult<PullOutcome> {
        let (conversation, window) = handle.with_state(|state| {
            let c = &state.conversation;
            (
                ConversationRef {
                    conversation_id: c.id,
                    kind: c.kind,
                },
                compute_window(
                    c.remote_range(),
                    c.loaded_range(),
                    c.latest_as_read_msg_seq_id,
                    direction,
                    self.max_len,
                ),
            )
        });
        let Some(window) = window else {
            debug!(conversation_id = %handle.id(), ?direction, "puller: nothing to pull");
            return Ok(PullOutcome::default());
        };

        info!(
            conversation_id = %handle.id(),
            ?direction,
            window_start = window.start,
            window_end = window.end,
            "puller: requesting window"
        );
        self.transport
            .pull_messages(conversation, window, PullOptions { direction, priority })
            .await?;

        let has_more = handle.with_state(|state| {
            let c = &mut state.conversation;
            let loaded = c
                .loaded_range()
                .map_or(window, |loaded| loaded.union(&window));
            c.oldest_loaded_msg_seq_id = Some(loaded.start);
            c.latest_loaded_msg_seq_id = Some(loaded.end);
            compute_window(
                c.remote_range(),
                Some(loaded),
                c.latest_as_read_msg_seq_id,
                direction,
                self.max_len,
            )
            .is_some()
        });
        handle.persist(&self.store).await?;

        Ok(PullOutcome {
            has_more,
            requested: Some(window),
        })
    }

    /// Widens the remote-known bounds and persists them when they changed.
    pub async fn observe_remote_bounds(
        &self,
        handle: &ConversationHandle,
        oldest: Option<i64>,
        latest: Option<i64>,
    ) -> SyncResult<bool> {
        let changed = handle.with_state(|state| {
            let c = &mut state.conversation;
            let before = (c.oldest_remote_msg_seq_id, c.latest_remote_msg_seq_id);
            if let Some(oldest) = oldest {
                c.oldest_remote_msg_seq_id =
                    Some(c.oldest_remote_msg_seq_id.map_or(oldest, |o| o.min(oldest)));
            }
            if let Some(latest) = latest {
                c.latest_remote_msg_seq_id =
                    Some(c.latest_remote_msg_seq_id.map_or(latest, |l| l.max(latest)));
            }
            before != (c.oldest_remote_msg_seq_id, c.latest_remote_msg_seq_id)
        });
        if changed {
            handle.persist(&self.store).await?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
#[path = "tests/puller_tests.rs"]
mod tests;
