//! Peer-messaging sync core: attachment downloads, windowed message pulls, read
//! positions, read receipts and batched message writes over a durable store.

use std::sync::Arc;

use shared::{
    domain::{ConversationId, MessageId},
    model::{Attachment, Conversation, ForwardRef, Message, ReadPosition},
    protocol::{Priority, PullDirection},
};
use storage::SyncStore;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

pub mod attachments;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod http_transport;
pub mod messages;
pub mod puller;
pub mod read_position;
pub mod receipts;
pub mod store;
pub mod task_queue;
pub mod transport;
pub mod unread;
pub mod window;
pub mod write_batcher;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

pub use attachments::{
    AttachmentJobQueue, AttachmentProcessor, AttachmentQueueConfig, FsAttachmentProcessor,
    JobTarget, WorkerPool,
};
pub use config::{load_settings, SyncSettings};
pub use conversation::{ConversationHandle, ConversationRegistry};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use http_transport::HttpSyncTransport;
pub use puller::{PullOutcome, RemoteMessagePuller};
pub use read_position::{MarkReadOptions, ReadPositionTracker};
pub use receipts::{LocalIdentity, MessageRead, ReadReceiptSyncer};
pub use transport::{MissingSyncTransport, PullOptions, SyncTransport};
pub use write_batcher::{AdaptiveWriteBatcher, BatchSizeController, MessageSink};

use crate::{messages::MessageRegistry, store::StoreGateway};

/// Every sync component wired over one store and one transport.
pub struct SyncEngine {
    store: StoreGateway,
    events: EventBus,
    conversations: ConversationRegistry,
    messages: Arc<MessageRegistry>,
    batcher: AdaptiveWriteBatcher<Message>,
    attachments: AttachmentJobQueue,
    puller: RemoteMessagePuller,
    read_positions: ReadPositionTracker,
    receipts: ReadReceiptSyncer,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn SyncStore>,
        transport: Arc<dyn SyncTransport>,
        processor: Arc<dyn AttachmentProcessor>,
        identity: LocalIdentity,
        settings: &SyncSettings,
    ) -> Self {
        let store = StoreGateway::new(store, settings.store_timeout());
        let events = EventBus::new(settings.event_buffer);
        let messages = Arc::new(MessageRegistry::new(store.clone()));
        let batcher = AdaptiveWriteBatcher::new(
            "messages",
            Arc::new(MessageSink::new(store.clone())),
            settings.batch_wait(),
            BatchSizeController::new(
                settings.batch_initial_size,
                settings.batch_max_size,
                settings.batch_target_flush(),
            ),
        );
        let attachments = AttachmentJobQueue::new(
            store.clone(),
            Arc::clone(&messages),
            batcher.clone(),
            Arc::clone(&transport),
            processor,
            WorkerPool::new(settings.attachment_concurrency),
            events.clone(),
            AttachmentQueueConfig {
                tick: settings.attachment_tick(),
                retry_budget: settings.attachment_retry_budget,
                backoff: settings.attachment_backoff(),
            },
        );

        Self {
            conversations: ConversationRegistry::new(store.clone()),
            puller: RemoteMessagePuller::new(
                store.clone(),
                Arc::clone(&transport),
                settings.pull_window,
            ),
            read_positions: ReadPositionTracker::new(
                store.clone(),
                events.clone(),
                settings.stuck_unread_recount(),
            ),
            receipts: ReadReceiptSyncer::new(
                store.clone(),
                transport,
                identity,
                settings.receipt_history_page,
                settings.receipt_batch_cap,
            ),
            store,
            events,
            messages,
            batcher,
            attachments,
        }
    }

    /// Recovers jobs interrupted by a previous run and starts the periodic
    /// attachment scheduler.
    pub async fn start(&self) -> SyncResult<JoinHandle<()>> {
        self.attachments.start().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn attachments(&self) -> &AttachmentJobQueue {
        &self.attachments
    }

    pub fn conversations(&self) -> &ConversationRegistry {
        &self.conversations
    }

    pub async fn conversation(&self, id: ConversationId) -> SyncResult<Option<Arc<ConversationHandle>>> {
        self.conversations.get(id).await
    }

    pub async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> SyncResult<Arc<ConversationHandle>> {
        self.conversations.create(conversation).await
    }

    pub async fn pull(
        &self,
        id: ConversationId,
        direction: PullDirection,
        wait: bool,
        priority: Priority,
    ) -> SyncResult<PullOutcome> {
        let handle = self.require(id).await?;
        self.puller.pull(&handle, direction, wait, priority).await
    }

    pub async fn pull_all_unread(&self, id: ConversationId) -> SyncResult<usize> {
        let handle = self.require(id).await?;
        self.puller.pull_all_unread(&handle).await
    }

    pub async fn observe_remote_bounds(
        &self,
        id: ConversationId,
        oldest: Option<i64>,
        latest: Option<i64>,
    ) -> SyncResult<bool> {
        let handle = self.require(id).await?;
        self.puller.observe_remote_bounds(&handle, oldest, latest).await
    }

    pub async fn mark_read(
        &self,
        id: ConversationId,
        position: ReadPosition,
        options: MarkReadOptions,
    ) -> SyncResult<u32> {
        let handle = self.require(id).await?;
        self.read_positions.mark_read(&handle, position, options).await
    }

    pub async fn load_read_positions(
        &self,
        id: ConversationId,
        start: i64,
        end: i64,
    ) -> SyncResult<Vec<ReadPosition>> {
        let handle = self.require(id).await?;
        self.read_positions.load_read_positions(&handle, start, end).await
    }

    pub async fn send_receipts(
        &self,
        id: ConversationId,
        reads: Vec<MessageRead>,
        read_at: i64,
    ) -> SyncResult<usize> {
        let handle = self.require(id).await?;
        self.receipts.send_receipts(&handle, reads, read_at).await
    }

    pub async fn sync_cursor_with_history(&self, id: ConversationId) -> SyncResult<usize> {
        let handle = self.require(id).await?;
        self.receipts.sync_cursor_with_history(&handle).await
    }

    pub async fn unread_count(&self, id: ConversationId) -> SyncResult<u32> {
        let handle = self.require(id).await?;
        Ok(handle.with_state(|state| unread::display_unread_count(&state.conversation)))
    }

    /// Flags the conversation unread as of `server_timestamp`. Reading past that
    /// point clears the flag.
    pub async fn mark_unread(&self, id: ConversationId, server_timestamp: i64) -> SyncResult<u32> {
        let handle = self.require(id).await?;
        let display = handle.with_state(|state| {
            let conversation = &mut state.conversation;
            conversation.marked_unread_at = Some(
                conversation
                    .marked_unread_at
                    .map_or(server_timestamp, |marked| marked.max(server_timestamp)),
            );
            unread::display_unread_count(conversation)
        });
        handle.persist(&self.store).await?;
        self.events.publish(SyncEvent::UnreadCountChanged {
            conversation_id: id,
            unread_count: display,
        });
        Ok(display)
    }

    pub async fn submit_attachment(
        &self,
        attachment: Attachment,
        target: JobTarget,
    ) -> SyncResult<Attachment> {
        self.attachments.submit(attachment, target).await
    }

    /// Takes in a message delivered by the transport: queues downloads for its
    /// unresolved slots, saves it and updates the conversation's boundaries and
    /// unread count. A message already known is returned unchanged.
    pub async fn ingest_message(&self, message: Message) -> SyncResult<Message> {
        let handle = self.require(message.conversation_id).await?;
        if let Some(existing) = self.messages.get(message.id) {
            debug!(message_id = %message.id, "sync: message already being ingested");
            return Ok(existing);
        }
        if let Some(existing) = self.store.get_message(message.id).await? {
            debug!(message_id = %message.id, "sync: message already ingested");
            return Ok(existing);
        }

        let downloads = unresolved_slots(&message);
        let lease = match self.messages.claim(message.clone()) {
            Ok(lease) => lease,
            Err(existing) => return Ok(existing),
        };
        let resident = match self.save_ingested(message.id, downloads).await {
            Ok(resident) => resident,
            Err(err) => {
                // Unsaved: a retry must start from scratch.
                lease.discard();
                warn!(message_id = %message.id, error = %err, "sync: ingest failed, rolled back");
                return Err(err);
            }
        };
        drop(lease);

        let (unread_changed, unread_count) = handle.with_state(|state| {
            let conversation = &mut state.conversation;
            let before = conversation.unread_count;
            let ts = resident.server_timestamp;
            conversation.last_message_timestamp =
                Some(conversation.last_message_timestamp.map_or(ts, |last| last.max(ts)));
            if resident.is_incoming() {
                conversation.last_incoming_timestamp = Some(
                    conversation
                        .last_incoming_timestamp
                        .map_or(ts, |last| last.max(ts)),
                );
                if conversation.read_cursor().map_or(true, |cursor| ts > cursor) {
                    conversation.unread_count = conversation.unread_count.saturating_add(1);
                    state.durable_unread = state.durable_unread.saturating_add(1);
                }
            }
            if let Some(seq) = resident.sequence_id {
                absorb_sequence(conversation, seq);
            }
            (
                before != conversation.unread_count,
                unread::display_unread_count(conversation),
            )
        });
        handle.persist(&self.store).await?;

        info!(
            conversation_id = %resident.conversation_id,
            message_id = %resident.id,
            sequence_id = ?resident.sequence_id,
            "sync: message ingested"
        );
        self.events.publish(SyncEvent::MessageChanged {
            conversation_id: resident.conversation_id,
            message_id: resident.id,
        });
        if unread_changed {
            self.events.publish(SyncEvent::UnreadCountChanged {
                conversation_id: resident.conversation_id,
                unread_count,
            });
        }
        Ok(resident)
    }

    /// Writes every queued message save.
    pub async fn flush(&self) -> SyncResult<()> {
        self.batcher.flush_all().await
    }

    /// Queues downloads for `downloads`, swaps their placeholders into the
    /// resident copy and waits for that copy to be saved.
    async fn save_ingested(
        &self,
        message_id: MessageId,
        downloads: Vec<(JobTarget, Attachment)>,
    ) -> SyncResult<Message> {
        for (target, original) in downloads {
            let placeholder = self
                .attachments
                .submit(original.clone(), target.clone())
                .await?;
            self.messages.update(message_id, |resident| {
                let slot = resident
                    .content_for_mut(target.forward_ref.as_ref())
                    .and_then(|content| content.slot_mut(target.kind, target.index));
                // A fast job may already have resolved or failed the slot.
                if let Some(slot) = slot.filter(|slot| **slot == original) {
                    *slot = placeholder;
                }
            });
        }

        let (resident, saved) = self
            .messages
            .update(message_id, |resident| {
                (resident.clone(), self.batcher.enqueue(resident.clone()))
            })
            .ok_or(SyncError::OrphanedReference {
                message_id: message_id.0,
            })?;
        saved
            .await
            .map_err(|_| SyncError::QueueAbandoned("messages"))??;
        Ok(resident)
    }

    async fn require(&self, id: ConversationId) -> SyncResult<Arc<ConversationHandle>> {
        self.conversations
            .get(id)
            .await?
            .ok_or(SyncError::UnknownConversation {
                conversation_id: id.0,
            })
    }
}

/// Slots of `message` and its forwarded sub-messages that still need a download.
fn unresolved_slots(message: &Message) -> Vec<(JobTarget, Attachment)> {
    let mut contents = vec![(None, &message.content)];
    for forwarded in &message.forwarded {
        contents.push((
            Some(ForwardRef {
                forward_id: forwarded.forward_id.clone(),
            }),
            &forwarded.content,
        ));
    }

    let mut slots = Vec::new();
    for (forward_ref, content) in contents {
        for (kind, index, attachment) in content.slots() {
            if !attachment.needs_download() {
                continue;
            }
            let target = JobTarget {
                message_id: message.id,
                kind,
                index,
                forward_ref: forward_ref.clone(),
            };
            slots.push((target, attachment.clone()));
        }
    }
    slots
}

/// Widens the remote bounds to `seq`, and the loaded window when `seq` is
/// adjacent to it.
fn absorb_sequence(conversation: &mut Conversation, seq: i64) {
    conversation.oldest_remote_msg_seq_id = Some(
        conversation
            .oldest_remote_msg_seq_id
            .map_or(seq, |oldest| oldest.min(seq)),
    );
    conversation.latest_remote_msg_seq_id = Some(
        conversation
            .latest_remote_msg_seq_id
            .map_or(seq, |latest| latest.max(seq)),
    );
    if let (Some(start), Some(end)) = (
        conversation.oldest_loaded_msg_seq_id,
        conversation.latest_loaded_msg_seq_id,
    ) {
        if seq >= start.saturating_sub(1) && seq <= end.saturating_add(1) {
            conversation.oldest_loaded_msg_seq_id = Some(start.min(seq));
            conversation.latest_loaded_msg_seq_id = Some(end.max(seq));
        }
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
