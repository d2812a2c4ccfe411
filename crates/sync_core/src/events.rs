use shared::{
    domain::{ConversationId, MessageId},
    model::ReadPosition,
};
use tokio::sync::broadcast;

/// Notifications published by the sync core for view layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    MessageChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    ForwardUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        forward_id: String,
    },
    NewReadPosition(ReadPosition),
    ConversationNeedsPersistence {
        conversation_id: ConversationId,
    },
    UnreadCountChanged {
        conversation_id: ConversationId,
        unread_count: u32,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}
