use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, ConversationKind, UserId},
    model::ReadPosition,
};

/// Inclusive window of per-conversation sequence ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRange {
    pub start: i64,
    pub end: i64,
}

impl SequenceRange {
    pub fn new(start: i64, end: i64) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    pub fn from_bounds(start: Option<i64>, end: Option<i64>) -> Option<Self> {
        Self::new(start?, end?)
    }

    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    pub fn contains(&self, seq: i64) -> bool {
        (self.start..=self.end).contains(&seq)
    }

    pub fn covers(&self, other: &SequenceRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Smallest range spanning both inputs.
    pub fn union(&self, other: &SequenceRange) -> SequenceRange {
        SequenceRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullDirection {
    Newer,
    Older,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRef {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullMessagesRequest {
    pub conversation: ConversationRef,
    pub window: SequenceRange,
    pub direction: PullDirection,
    pub priority: Priority,
}

/// One receipt batch addressed to a single original sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptBatch {
    pub sender: UserId,
    /// `sent_at` of every message being acknowledged.
    pub timestamps: Vec<i64>,
    pub read_position: ReadPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSyncEntry {
    pub sender: UserId,
    pub sent_at: i64,
    pub server_timestamp: i64,
}

/// Routing hints carried next to receipts and cursor syncs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceiptsRequest {
    pub batch: ReadReceiptBatch,
    pub extension: ReceiptExtension,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReadCursorRequest {
    pub entries: Vec<ReadSyncEntry>,
    pub extension: ReceiptExtension,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub accepted: u32,
}
