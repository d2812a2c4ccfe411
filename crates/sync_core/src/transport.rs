use async_trait::async_trait;
use shared::{
    domain::UserId,
    model::Attachment,
    protocol::{
        Ack, ConversationRef, Priority, PullDirection, ReadReceiptBatch, ReadSyncEntry,
        ReceiptExtension, SequenceRange,
    },
};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOptions {
    pub direction: PullDirection,
    pub priority: Priority,
}

/// Remote operations the sync core consumes. Pulled messages arrive through
/// the ingestion path, not as a return value.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn download_attachment(&self, attachment: &Attachment) -> SyncResult<Vec<u8>>;

    async fn send_read_receipts(
        &self,
        batch: &ReadReceiptBatch,
        extension: &ReceiptExtension,
    ) -> SyncResult<Ack>;

    async fn sync_read_cursor(
        &self,
        entries: &[ReadSyncEntry],
        extension: &ReceiptExtension,
    ) -> SyncResult<Ack>;

    async fn pull_messages(
        &self,
        conversation: ConversationRef,
        window: SequenceRange,
        options: PullOptions,
    ) -> SyncResult<()>;

    /// Re-fetches a peer's identity after it changed under an established session.
    async fn refresh_identity(&self, user: UserId) -> SyncResult<()>;
}

pub struct MissingSyncTransport;

#[async_trait]
impl SyncTransport for MissingSyncTransport {
    async fn download_attachment(&self, _attachment: &Attachment) -> SyncResult<Vec<u8>> {
        Err(unavailable())
    }

    async fn send_read_receipts(
        &self,
        _batch: &ReadReceiptBatch,
        _extension: &ReceiptExtension,
    ) -> SyncResult<Ack> {
        Err(unavailable())
    }

    async fn sync_read_cursor(
        &self,
        _entries: &[ReadSyncEntry],
        _extension: &ReceiptExtension,
    ) -> SyncResult<Ack> {
        Err(unavailable())
    }

    async fn pull_messages(
        &self,
        _conversation: ConversationRef,
        _window: SequenceRange,
        _options: PullOptions,
    ) -> SyncResult<()> {
        Err(unavailable())
    }

    async fn refresh_identity(&self, _user: UserId) -> SyncResult<()> {
        Err(unavailable())
    }
}

fn unavailable() -> SyncError {
    SyncError::TransientNetwork("sync transport is unavailable".into())
}
