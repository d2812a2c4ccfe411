//! Loaded conversations and the per-conversation state the sync components share.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use shared::{domain::ConversationId, model::Conversation};
use tokio::time::Instant;
use tracing::info;

use crate::{
    error::SyncResult, read_position::ReadPositionCache, store::StoreGateway,
    task_queue::SerialTaskQueue,
};

pub struct ConversationState {
    pub conversation: Conversation,
    pub read_cache: ReadPositionCache,
    /// Unread count as of the last durable reconciliation.
    pub durable_unread: u32,
    /// Last cursor handed to the durable phase and when it was first seen.
    pub last_attempted: Option<(i64, Instant)>,
}

/// One loaded conversation: its state plus the four serial queues that order
/// mutations on it.
pub struct ConversationHandle {
    id: ConversationId,
    state: Mutex<ConversationState>,
    persist_lock: tokio::sync::Mutex<()>,
    pull_queue: SerialTaskQueue,
    read_queue: SerialTaskQueue,
    receipt_queue: SerialTaskQueue,
    cursor_sync_queue: SerialTaskQueue,
}

impl ConversationHandle {
    pub fn new(conversation: Conversation) -> Self {
        Self {
            id: conversation.id,
            state: Mutex::new(ConversationState {
                durable_unread: conversation.unread_count,
                conversation,
                read_cache: ReadPositionCache::default(),
                last_attempted: None,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
            pull_queue: SerialTaskQueue::new("pull"),
            read_queue: SerialTaskQueue::new("read_position"),
            receipt_queue: SerialTaskQueue::new("receipts"),
            cursor_sync_queue: SerialTaskQueue::new("cursor_sync"),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn snapshot(&self) -> Conversation {
        self.lock().conversation.clone()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ConversationState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn pull_queue(&self) -> &SerialTaskQueue {
        &self.pull_queue
    }

    pub fn read_queue(&self) -> &SerialTaskQueue {
        &self.read_queue
    }

    pub fn receipt_queue(&self) -> &SerialTaskQueue {
        &self.receipt_queue
    }

    pub fn cursor_sync_queue(&self) -> &SerialTaskQueue {
        &self.cursor_sync_queue
    }

    /// Waits until every queue of this conversation has drained.
    pub async fn drained(&self) {
        self.pull_queue.on_idle().await;
        self.read_queue.on_idle().await;
        self.receipt_queue.on_idle().await;
        self.cursor_sync_queue.on_idle().await;
    }

    /// Saves the current state. Snapshots are taken under the persist lock so a
    /// later save never carries an older snapshot.
    pub async fn persist(&self, store: &StoreGateway) -> SyncResult<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        store.save_conversation(&snapshot).await
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ConversationRegistry {
    store: StoreGateway,
    handles: tokio::sync::Mutex<HashMap<ConversationId, Arc<ConversationHandle>>>,
}

impl ConversationRegistry {
    pub fn new(store: StoreGateway) -> Self {
        Self {
            store,
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Loaded handle, loading from the store on first access.
    pub async fn get(&self, id: ConversationId) -> SyncResult<Option<Arc<ConversationHandle>>> {
        if let Some(handle) = self.handles.lock().await.get(&id) {
            return Ok(Some(Arc::clone(handle)));
        }
        let Some(conversation) = self.store.load_conversation(id).await? else {
            return Ok(None);
        };
        // First loader wins; later ones adopt its handle.
        let mut handles = self.handles.lock().await;
        let handle = handles
            .entry(id)
            .or_insert_with(|| Arc::new(ConversationHandle::new(conversation)));
        Ok(Some(Arc::clone(handle)))
    }

    /// Registers a newly discovered conversation, or returns the loaded one.
    pub async fn create(&self, conversation: Conversation) -> SyncResult<Arc<ConversationHandle>> {
        if let Some(existing) = self.get(conversation.id).await? {
            return Ok(existing);
        }
        let id = conversation.id;
        self.store.save_conversation(&conversation).await?;
        let mut handles = self.handles.lock().await;
        let handle = handles
            .entry(id)
            .or_insert_with(|| Arc::new(ConversationHandle::new(conversation)));
        info!(conversation_id = %id, "conversations: registered");
        Ok(Arc::clone(handle))
    }

    /// Drops the registry's handle. Tasks already queued keep their own reference
    /// and finish in the background.
    pub async fn unload(&self, id: ConversationId) -> bool {
        self.handles.lock().await.remove(&id).is_some()
    }

    pub async fn loaded_ids(&self) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self.handles.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
