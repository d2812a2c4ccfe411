//! In-memory doubles for the store, transport and post-processor.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, DeviceId, JobId, MessageDirection, MessageId, UserId},
    model::{Attachment, AttachmentDownloadJob, Conversation, Message, MessageContent, ReadPosition},
    protocol::{Ack, ConversationRef, ReadReceiptBatch, ReadSyncEntry, ReceiptExtension, SequenceRange},
};
use storage::{MessageRange, SyncStore};
use tokio::sync::Notify;

use crate::{
    attachments::AttachmentProcessor,
    error::{SyncError, SyncResult},
    transport::{PullOptions, SyncTransport},
};

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, Conversation>,
    messages: BTreeMap<MessageId, Message>,
    read_positions: Vec<ReadPosition>,
    jobs: HashMap<JobId, AttachmentDownloadJob>,
    calls: HashMap<&'static str, usize>,
    saved_message_batches: Vec<Vec<Message>>,
    saved_cursors: Vec<Option<i64>>,
    fail_next: HashMap<&'static str, usize>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    save_messages_latency: Mutex<Option<Duration>>,
    gates: Mutex<HashMap<&'static str, Arc<Notify>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock");
        *state.calls.entry(operation).or_default() += 1;
        if let Some(remaining) = state.fail_next.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(anyhow!("injected {operation} failure"));
            }
        }
        Ok(())
    }

    /// Blocks the next call to `operation` until the returned gate is notified.
    pub fn gate(&self, operation: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .expect("gates lock")
            .insert(operation, gate.clone());
        gate
    }

    async fn pass_gate(&self, operation: &'static str) {
        let gate = self.gates.lock().expect("gates lock").remove(operation);
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    pub fn calls(&self, operation: &'static str) -> usize {
        let state = self.state.lock().expect("memory store lock");
        state.calls.get(operation).copied().unwrap_or_default()
    }

    pub fn fail_next(&self, operation: &'static str, times: usize) {
        let mut state = self.state.lock().expect("memory store lock");
        state.fail_next.insert(operation, times);
    }

    pub fn set_save_messages_latency(&self, latency: Duration) {
        *self.save_messages_latency.lock().expect("latency lock") = Some(latency);
    }

    pub fn saved_message_batches(&self) -> Vec<Vec<Message>> {
        let state = self.state.lock().expect("memory store lock");
        state.saved_message_batches.clone()
    }

    /// Read cursor carried by every conversation save, in order.
    pub fn saved_cursors(&self) -> Vec<Option<i64>> {
        let state = self.state.lock().expect("memory store lock");
        state.saved_cursors.clone()
    }

    pub fn conversation(&self, id: ConversationId) -> Option<Conversation> {
        let state = self.state.lock().expect("memory store lock");
        state.conversations.get(&id).cloned()
    }

    pub fn message(&self, id: MessageId) -> Option<Message> {
        let state = self.state.lock().expect("memory store lock");
        state.messages.get(&id).cloned()
    }

    pub fn read_positions(&self) -> Vec<ReadPosition> {
        let state = self.state.lock().expect("memory store lock");
        state.read_positions.clone()
    }

    pub fn jobs(&self) -> Vec<AttachmentDownloadJob> {
        let state = self.state.lock().expect("memory store lock");
        state.jobs.values().cloned().collect()
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock().expect("memory store lock");
        state.conversations.insert(conversation.id, conversation);
    }

    pub fn insert_messages(&self, messages: impl IntoIterator<Item = Message>) {
        let mut state = self.state.lock().expect("memory store lock");
        for message in messages {
            state.messages.insert(message.id, message);
        }
    }

    pub fn insert_read_position(&self, position: ReadPosition) {
        let mut state = self.state.lock().expect("memory store lock");
        state.read_positions.push(position);
    }

    pub fn delete_message(&self, id: MessageId) {
        let mut state = self.state.lock().expect("memory store lock");
        state.messages.remove(&id);
    }

    pub fn insert_job(&self, job: AttachmentDownloadJob) {
        let mut state = self.state.lock().expect("memory store lock");
        state.jobs.insert(job.id, job);
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn load_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        self.record("load_conversation")?;
        self.pass_gate("load_conversation").await;
        Ok(self.conversation(id))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.record("save_conversation")?;
        let mut state = self.state.lock().expect("memory store lock");
        state.saved_cursors.push(conversation.read_cursor());
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        self.record("get_message")?;
        Ok(self.message(id))
    }

    async fn get_messages(
        &self,
        conversation_id: ConversationId,
        range: MessageRange,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.record("get_messages")?;
        let state = self.state.lock().expect("memory store lock");
        let mut matching: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| match range {
                MessageRange::Sequence { start, end } => {
                    m.sequence_id.is_some_and(|seq| seq >= start && seq <= end)
                }
                MessageRange::ServerTimestamp { after, until } => {
                    m.server_timestamp > after && m.server_timestamp <= until
                }
            })
            .cloned()
            .collect();
        match range {
            MessageRange::Sequence { .. } => matching.sort_by_key(|m| m.sequence_id),
            MessageRange::ServerTimestamp { .. } => matching.sort_by_key(|m| m.server_timestamp),
        }
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn save_messages(&self, messages: &[Message]) -> Result<()> {
        let latency = *self.save_messages_latency.lock().expect("latency lock");
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.record("save_messages")?;
        let mut state = self.state.lock().expect("memory store lock");
        state.saved_message_batches.push(messages.to_vec());
        for message in messages {
            state.messages.insert(message.id, message.clone());
        }
        Ok(())
    }

    async fn get_read_positions(
        &self,
        conversation_id: ConversationId,
        begin: i64,
        end: i64,
        limit: Option<u32>,
    ) -> Result<Vec<ReadPosition>> {
        self.record("get_read_positions")?;
        let state = self.state.lock().expect("memory store lock");
        let mut matching: Vec<ReadPosition> = state
            .read_positions
            .iter()
            .filter(|p| p.conversation_id == conversation_id)
            .filter(|p| p.max_server_timestamp >= begin && p.max_server_timestamp <= end)
            .cloned()
            .collect();
        matching.sort_by_key(|p| (p.max_server_timestamp, p.source_device));
        if let Some(limit) = limit {
            matching.truncate(limit as usize);
        }
        Ok(matching)
    }

    async fn save_read_position(&self, position: &ReadPosition) -> Result<()> {
        self.record("save_read_position")?;
        let mut state = self.state.lock().expect("memory store lock");
        if !state
            .read_positions
            .iter()
            .any(|p| p.identity() == position.identity())
        {
            state.read_positions.push(position.clone());
        }
        Ok(())
    }

    async fn get_unread_message_count(
        &self,
        conversation_id: ConversationId,
        after: i64,
        until: i64,
    ) -> Result<u32> {
        self.record("get_unread_message_count")?;
        self.pass_gate("get_unread_message_count").await;
        let state = self.state.lock().expect("memory store lock");
        let count = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id && m.is_incoming())
            .filter(|m| m.server_timestamp > after && m.server_timestamp <= until)
            .count();
        Ok(count as u32)
    }

    async fn save_job(&self, job: &AttachmentDownloadJob) -> Result<()> {
        self.record("save_job")?;
        self.insert_job(job.clone());
        Ok(())
    }

    async fn get_next_jobs(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttachmentDownloadJob>> {
        self.record("get_next_jobs")?;
        let state = self.state.lock().expect("memory store lock");
        let mut due: Vec<_> = state
            .jobs
            .values()
            .filter(|job| !job.pending && job.scheduled_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|job| job.scheduled_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn set_job_pending(&self, id: JobId, pending: bool) -> Result<()> {
        self.record("set_job_pending")?;
        let mut state = self.state.lock().expect("memory store lock");
        if let Some(job) = state.jobs.get_mut(&id) {
            job.pending = pending;
        }
        Ok(())
    }

    async fn remove_job(&self, id: JobId) -> Result<()> {
        self.record("remove_job")?;
        let mut state = self.state.lock().expect("memory store lock");
        state.jobs.remove(&id);
        Ok(())
    }

    async fn reset_all_pending_flags(&self) -> Result<u64> {
        self.record("reset_all_pending_flags")?;
        let mut state = self.state.lock().expect("memory store lock");
        let mut reset = 0;
        for job in state.jobs.values_mut().filter(|job| job.pending) {
            job.pending = false;
            reset += 1;
        }
        Ok(reset)
    }
}

/// Scripted transport that records every call.
#[derive(Default)]
pub struct FakeTransport {
    pub downloads: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    download_gate: Mutex<Option<Arc<Notify>>>,
    download_failures: Mutex<HashMap<String, Vec<SyncError>>>,
    pub pulls: Mutex<Vec<SequenceRange>>,
    pub pull_failures: Mutex<Vec<SyncError>>,
    pub receipt_batches: Mutex<Vec<ReadReceiptBatch>>,
    pub receipt_failures: Mutex<Vec<SyncError>>,
    pub cursor_syncs: Mutex<Vec<Vec<ReadSyncEntry>>>,
    /// Scripted outcomes per call; `None` lets that call through.
    pub cursor_sync_script: Mutex<Vec<Option<SyncError>>>,
    pub refreshed: Mutex<Vec<UserId>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Downloads block until the returned notify releases them.
    pub fn gate_downloads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.download_gate.lock().expect("gate lock") = Some(Arc::clone(&gate));
        gate
    }

    pub fn fail_download(&self, cdn_key: &str, errors: Vec<SyncError>) {
        self.download_failures
            .lock()
            .expect("failures lock")
            .insert(cdn_key.to_string(), errors);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> Vec<SequenceRange> {
        self.pulls.lock().expect("pulls lock").clone()
    }
}

#[async_trait]
impl SyncTransport for FakeTransport {
    async fn download_attachment(&self, attachment: &Attachment) -> SyncResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let gate = self.download_gate.lock().expect("gate lock").clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = {
            let mut failures = self.download_failures.lock().expect("failures lock");
            failures
                .get_mut(&attachment.cdn_key)
                .and_then(|errors| (!errors.is_empty()).then(|| errors.remove(0)))
        };
        match scripted {
            Some(err) => Err(err),
            None => Ok(ciphertext_for(&attachment.cdn_key)),
        }
    }

    async fn send_read_receipts(
        &self,
        batch: &ReadReceiptBatch,
        _extension: &ReceiptExtension,
    ) -> SyncResult<Ack> {
        let scripted = {
            let mut failures = self.receipt_failures.lock().expect("failures lock");
            (!failures.is_empty()).then(|| failures.remove(0))
        };
        if let Some(err) = scripted {
            return Err(err);
        }
        self.receipt_batches
            .lock()
            .expect("receipts lock")
            .push(batch.clone());
        Ok(Ack {
            accepted: batch.timestamps.len() as u32,
        })
    }

    async fn sync_read_cursor(
        &self,
        entries: &[ReadSyncEntry],
        _extension: &ReceiptExtension,
    ) -> SyncResult<Ack> {
        let scripted = {
            let mut script = self.cursor_sync_script.lock().expect("script lock");
            if script.is_empty() {
                None
            } else {
                script.remove(0)
            }
        };
        if let Some(err) = scripted {
            return Err(err);
        }
        self.cursor_syncs
            .lock()
            .expect("cursor sync lock")
            .push(entries.to_vec());
        Ok(Ack {
            accepted: entries.len() as u32,
        })
    }

    async fn pull_messages(
        &self,
        _conversation: ConversationRef,
        window: SequenceRange,
        _options: PullOptions,
    ) -> SyncResult<()> {
        let scripted = {
            let mut failures = self.pull_failures.lock().expect("failures lock");
            (!failures.is_empty()).then(|| failures.remove(0))
        };
        if let Some(err) = scripted {
            return Err(err);
        }
        self.pulls.lock().expect("pulls lock").push(window);
        Ok(())
    }

    async fn refresh_identity(&self, user: UserId) -> SyncResult<()> {
        self.refreshed.lock().expect("refreshed lock").push(user);
        Ok(())
    }
}

/// Stores processed content under a synthetic path, recording each call.
#[derive(Default)]
pub struct FakeProcessor {
    pub processed: AtomicUsize,
    pub seen_keys: Mutex<HashSet<String>>,
}

#[async_trait]
impl AttachmentProcessor for FakeProcessor {
    async fn process(&self, ciphertext: Vec<u8>, descriptor: &Attachment) -> SyncResult<Attachment> {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.seen_keys
            .lock()
            .expect("seen lock")
            .insert(descriptor.cdn_key.clone());
        Ok(Attachment {
            path: Some(format!("/attachments/{}", descriptor.cdn_key)),
            size_bytes: ciphertext.len() as u64,
            ..descriptor.clone()
        })
    }
}

pub fn ciphertext_for(cdn_key: &str) -> Vec<u8> {
    format!("ciphertext:{cdn_key}").into_bytes()
}

/// Descriptor whose digest matches what `FakeTransport` serves for `cdn_key`.
pub fn remote_attachment(cdn_key: &str) -> Attachment {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use sha2::{Digest, Sha256};

    Attachment {
        cdn_key: cdn_key.to_string(),
        content_type: Some("image/png".into()),
        digest: Some(STANDARD.encode(Sha256::digest(ciphertext_for(cdn_key)))),
        key: Some(STANDARD.encode(b"content-key")),
        ..Attachment::default()
    }
}

pub fn conversation(id: i64) -> Conversation {
    Conversation::new(ConversationId(id), ConversationKind::Direct)
}

pub fn incoming(id: i64, conversation_id: i64, seq: i64, server_timestamp: i64) -> Message {
    Message {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender: UserId(900),
        sent_at: server_timestamp - 5,
        server_timestamp,
        sequence_id: Some(seq),
        notify_sequence_id: Some(seq),
        direction: MessageDirection::Incoming,
        thread_id: None,
        content: MessageContent::default(),
        forwarded: Vec::new(),
        errors: Vec::new(),
    }
}

pub fn outgoing(id: i64, conversation_id: i64, seq: i64, server_timestamp: i64) -> Message {
    Message {
        direction: MessageDirection::Outgoing,
        sender: UserId(1),
        ..incoming(id, conversation_id, seq, server_timestamp)
    }
}

pub fn read_position(conversation_id: i64, device: i64, max_server_timestamp: i64) -> ReadPosition {
    ReadPosition {
        source_device: DeviceId(device),
        conversation_id: ConversationId(conversation_id),
        sender: Some(UserId(900)),
        sent_at: max_server_timestamp - 5,
        read_at: max_server_timestamp + 1_000,
        max_server_timestamp,
        max_notify_sequence_id: 0,
        group_id: None,
    }
}
