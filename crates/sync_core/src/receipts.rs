//! Read receipts to peers and read-cursor sync to the reader's own devices.

use std::{collections::BTreeMap, sync::Arc};

use shared::{
    domain::{ConversationKind, DeviceId, UserId},
    model::{Conversation, ReadPosition},
    protocol::{Priority, ReadReceiptBatch, ReadSyncEntry, ReceiptExtension},
};
use storage::MessageRange;
use tracing::{info, warn};

use crate::{
    conversation::ConversationHandle,
    error::{SyncError, SyncResult},
    store::StoreGateway,
    transport::SyncTransport,
};

/// A message the local user has read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRead {
    pub sender: UserId,
    pub sent_at: i64,
    pub server_timestamp: i64,
    pub receipt_sent: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub device_id: DeviceId,
}

#[derive(Clone)]
pub struct ReadReceiptSyncer {
    store: StoreGateway,
    transport: Arc<dyn SyncTransport>,
    identity: LocalIdentity,
    history_page: u32,
    batch_cap: usize,
}

impl ReadReceiptSyncer {
    pub fn new(
        store: StoreGateway,
        transport: Arc<dyn SyncTransport>,
        identity: LocalIdentity,
        history_page: u32,
        batch_cap: usize,
    ) -> Self {
        Self {
            store,
            transport,
            identity,
            history_page: history_page.max(1),
            batch_cap: batch_cap.max(1),
        }
    }

    /// Sends one receipt batch per original sender on the conversation's receipt
    /// queue. Returns how many batches went out.
    pub async fn send_receipts(
        &self,
        handle: &Arc<ConversationHandle>,
        reads: Vec<MessageRead>,
        read_at: i64,
    ) -> SyncResult<usize> {
        let syncer = self.clone();
        let task_handle = Arc::clone(handle);
        handle
            .receipt_queue()
            .run(Priority::Normal, async move {
                syncer.send_receipts_core(&task_handle, reads, read_at).await
            })
            .await?
    }

    async fn send_receipts_core(
        &self,
        handle: &ConversationHandle,
        reads: Vec<MessageRead>,
        read_at: i64,
    ) -> SyncResult<usize> {
        let mut by_sender: BTreeMap<UserId, Vec<&MessageRead>> = BTreeMap::new();
        for read in reads
            .iter()
            .filter(|read| !read.receipt_sent && read.sender != self.identity.user_id)
        {
            by_sender.entry(read.sender).or_default().push(read);
        }
        if by_sender.is_empty() {
            return Ok(0);
        }

        let conversation = handle.snapshot();
        let extension = extension_for(&conversation);
        let mut sent = 0;
        for (sender, reads) in by_sender {
            let batch = ReadReceiptBatch {
                sender,
                timestamps: reads.iter().map(|read| read.sent_at).collect(),
                read_position: self.position_for(&conversation, sender, &reads, read_at),
            };
            match self.transport.send_read_receipts(&batch, &extension).await {
                Ok(_) => {}
                Err(SyncError::IdentityMismatch { user_id }) => {
                    warn!(
                        conversation_id = %conversation.id,
                        user_id,
                        "receipts: recipient identity changed, refreshing and retrying once"
                    );
                    self.transport.refresh_identity(UserId(user_id)).await?;
                    self.transport
                        .send_read_receipts(&batch, &extension)
                        .await?;
                }
                Err(err) => return Err(err),
            }
            sent += 1;
        }
        info!(conversation_id = %conversation.id, batches = sent, "receipts: sent");
        Ok(sent)
    }

    fn position_for(
        &self,
        conversation: &Conversation,
        sender: UserId,
        reads: &[&MessageRead],
        read_at: i64,
    ) -> ReadPosition {
        let newest = reads.iter().max_by_key(|read| read.server_timestamp);
        ReadPosition {
            source_device: self.identity.device_id,
            conversation_id: conversation.id,
            sender: Some(sender),
            sent_at: newest.map_or(0, |read| read.sent_at),
            read_at,
            max_server_timestamp: newest.map_or(0, |read| read.server_timestamp),
            max_notify_sequence_id: conversation.latest_loaded_msg_seq_id.unwrap_or_default(),
            group_id: group_id(conversation),
        }
    }

    /// Propagates the read cursor to the reader's other devices on the
    /// cursor-sync queue. Returns how many entries were synced.
    pub async fn sync_cursor_with_history(&self, handle: &Arc<ConversationHandle>) -> SyncResult<usize> {
        let syncer = self.clone();
        let task_handle = Arc::clone(handle);
        handle
            .cursor_sync_queue()
            .run(Priority::Normal, async move {
                syncer.sync_cursor_core(&task_handle).await
            })
            .await?
    }

    async fn sync_cursor_core(&self, handle: &ConversationHandle) -> SyncResult<usize> {
        let conversation = handle.snapshot();
        let Some(cursor) = conversation.read_cursor() else {
            return Ok(0);
        };
        let synced = conversation.last_synced_read_timestamp.unwrap_or(i64::MIN);
        if synced >= cursor {
            return Ok(0);
        }
        let extension = extension_for(&conversation);

        let mut after = synced;
        let mut pending: Vec<ReadSyncEntry> = Vec::new();
        let mut total = 0;
        loop {
            let page = self
                .store
                .get_messages(
                    handle.id(),
                    MessageRange::ServerTimestamp {
                        after,
                        until: cursor,
                    },
                    self.history_page,
                )
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.server_timestamp;

            for message in page.iter().filter(|message| message.is_incoming()) {
                pending.push(ReadSyncEntry {
                    sender: message.sender,
                    sent_at: message.sent_at,
                    server_timestamp: message.server_timestamp,
                });
                if pending.len() >= self.batch_cap {
                    let marker = message.server_timestamp;
                    total += self.flush(handle, &extension, &mut pending, marker).await?;
                }
            }
            if page.len() < self.history_page as usize {
                break;
            }
        }

        total += self.flush(handle, &extension, &mut pending, cursor).await?;
        Ok(total)
    }

    /// Sends `pending` and only then advances the persisted marker to `marker`.
    async fn flush(
        &self,
        handle: &ConversationHandle,
        extension: &ReceiptExtension,
        pending: &mut Vec<ReadSyncEntry>,
        marker: i64,
    ) -> SyncResult<usize> {
        let sent = pending.len();
        if sent > 0 {
            self.transport.sync_read_cursor(pending, extension).await?;
            pending.clear();
        }
        handle.with_state(|state| {
            state.conversation.last_synced_read_timestamp = Some(marker);
        });
        handle.persist(&self.store).await?;
        info!(conversation_id = %handle.id(), entries = sent, marker, "receipts: cursor synced");
        Ok(sent)
    }
}

fn group_id(conversation: &Conversation) -> Option<String> {
    (conversation.kind == ConversationKind::Group).then(|| conversation.id.to_string())
}

fn extension_for(conversation: &Conversation) -> ReceiptExtension {
    ReceiptExtension {
        conversation_id: Some(conversation.id),
        group_id: group_id(conversation),
    }
}

#[cfg(test)]
#[path = "tests/receipts_tests.rs"]
mod tests;
