use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, JobId, MessageId},
    model::{AttachmentDownloadJob, Conversation, Message, ReadPosition},
};
use storage::{MessageRange, SyncStore};

use crate::error::{bounded, SyncResult};

/// Store access with a deadline on every call.
#[derive(Clone)]
pub struct StoreGateway {
    inner: Arc<dyn SyncStore>,
    timeout: Duration,
}

impl StoreGateway {
    pub fn new(inner: Arc<dyn SyncStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub async fn load_conversation(&self, id: ConversationId) -> SyncResult<Option<Conversation>> {
        bounded("load_conversation", self.timeout, self.inner.load_conversation(id)).await
    }

    pub async fn save_conversation(&self, conversation: &Conversation) -> SyncResult<()> {
        bounded(
            "save_conversation",
            self.timeout,
            self.inner.save_conversation(conversation),
        )
        .await
    }

    pub async fn get_message(&self, id: MessageId) -> SyncResult<Option<Message>> {
        bounded("get_message", self.timeout, self.inner.get_message(id)).await
    }

    pub async fn get_messages(
        &self,
        conversation_id: ConversationId,
        range: MessageRange,
        limit: u32,
    ) -> SyncResult<Vec<Message>> {
        bounded(
            "get_messages",
            self.timeout,
            self.inner.get_messages(conversation_id, range, limit),
        )
        .await
    }

    pub async fn save_messages(&self, messages: &[Message]) -> SyncResult<()> {
        bounded("save_messages", self.timeout, self.inner.save_messages(messages)).await
    }

    pub async fn get_read_positions(
        &self,
        conversation_id: ConversationId,
        begin: i64,
        end: i64,
        limit: Option<u32>,
    ) -> SyncResult<Vec<ReadPosition>> {
        bounded(
            "get_read_positions",
            self.timeout,
            self.inner
                .get_read_positions(conversation_id, begin, end, limit),
        )
        .await
    }

    pub async fn save_read_position(&self, position: &ReadPosition) -> SyncResult<()> {
        bounded(
            "save_read_position",
            self.timeout,
            self.inner.save_read_position(position),
        )
        .await
    }

    pub async fn get_unread_message_count(
        &self,
        conversation_id: ConversationId,
        after: i64,
        until: i64,
    ) -> SyncResult<u32> {
        bounded(
            "get_unread_message_count",
            self.timeout,
            self.inner
                .get_unread_message_count(conversation_id, after, until),
        )
        .await
    }

    pub async fn save_job(&self, job: &AttachmentDownloadJob) -> SyncResult<()> {
        bounded("save_job", self.timeout, self.inner.save_job(job)).await
    }

    pub async fn get_next_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> SyncResult<Vec<AttachmentDownloadJob>> {
        bounded("get_next_jobs", self.timeout, self.inner.get_next_jobs(limit, now)).await
    }

    pub async fn set_job_pending(&self, id: JobId, pending: bool) -> SyncResult<()> {
        bounded(
            "set_job_pending",
            self.timeout,
            self.inner.set_job_pending(id, pending),
        )
        .await
    }

    pub async fn remove_job(&self, id: JobId) -> SyncResult<()> {
        bounded("remove_job", self.timeout, self.inner.remove_job(id)).await
    }

    pub async fn reset_all_pending_flags(&self) -> SyncResult<u64> {
        bounded(
            "reset_all_pending_flags",
            self.timeout,
            self.inner.reset_all_pending_flags(),
        )
        .await
    }
}
