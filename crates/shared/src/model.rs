use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        AttachmentJobKind, ConversationId, ConversationKind, DeviceId, JobId, MessageDirection,
        MessageId, UserId,
    },
    protocol::SequenceRange,
};

/// Descriptor of remote attachment content and, once fetched, its local materialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub cdn_key: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    /// Base64 SHA-256 of the ciphertext.
    #[serde(default)]
    pub digest: Option<String>,
    /// Base64 content key handed to the decryption layer.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub download_job_id: Option<JobId>,
}

impl Attachment {
    pub fn has_local_content(&self) -> bool {
        self.path.is_some()
    }

    pub fn has_decryption_material(&self) -> bool {
        self.digest.as_deref().is_some_and(|d| !d.is_empty())
            && self.key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// True when the slot references remote content nobody is fetching yet.
    pub fn needs_download(&self) -> bool {
        !self.has_local_content() && !self.pending && !self.error && !self.cdn_key.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub display_name: String,
    #[serde(default)]
    pub avatar: Option<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedAttachment {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<Attachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub author: UserId,
    pub sent_at: i64,
    #[serde(default)]
    pub attachments: Vec<QuotedAttachment>,
}

/// Renderable payload shared by top-level messages and forwarded sub-messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub long_text: Option<Attachment>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub contacts: Vec<ContactCard>,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub group_avatar: Option<Attachment>,
}

impl MessageContent {
    pub fn slot(&self, kind: AttachmentJobKind, index: usize) -> Option<&Attachment> {
        match kind {
            AttachmentJobKind::LongText => self.long_text.as_ref(),
            AttachmentJobKind::Attachment => self.attachments.get(index),
            AttachmentJobKind::ContactAvatar => self.contacts.get(index)?.avatar.as_ref(),
            AttachmentJobKind::QuoteThumbnail => {
                self.quote.as_ref()?.attachments.get(index)?.thumbnail.as_ref()
            }
            AttachmentJobKind::GroupAvatar => self.group_avatar.as_ref(),
        }
    }

    pub fn slot_mut(&mut self, kind: AttachmentJobKind, index: usize) -> Option<&mut Attachment> {
        match kind {
            AttachmentJobKind::LongText => self.long_text.as_mut(),
            AttachmentJobKind::Attachment => self.attachments.get_mut(index),
            AttachmentJobKind::ContactAvatar => self.contacts.get_mut(index)?.avatar.as_mut(),
            AttachmentJobKind::QuoteThumbnail => self
                .quote
                .as_mut()?
                .attachments
                .get_mut(index)?
                .thumbnail
                .as_mut(),
            AttachmentJobKind::GroupAvatar => self.group_avatar.as_mut(),
        }
    }

    /// Every occupied slot as `(kind, index, attachment)`.
    pub fn slots(&self) -> Vec<(AttachmentJobKind, usize, &Attachment)> {
        let mut slots = Vec::new();
        if let Some(long_text) = &self.long_text {
            slots.push((AttachmentJobKind::LongText, 0, long_text));
        }
        for (index, attachment) in self.attachments.iter().enumerate() {
            slots.push((AttachmentJobKind::Attachment, index, attachment));
        }
        for (index, contact) in self.contacts.iter().enumerate() {
            if let Some(avatar) = &contact.avatar {
                slots.push((AttachmentJobKind::ContactAvatar, index, avatar));
            }
        }
        if let Some(quote) = &self.quote {
            for (index, quoted) in quote.attachments.iter().enumerate() {
                if let Some(thumbnail) = &quoted.thumbnail {
                    slots.push((AttachmentJobKind::QuoteThumbnail, index, thumbnail));
                }
            }
        }
        if let Some(avatar) = &self.group_avatar {
            slots.push((AttachmentJobKind::GroupAvatar, 0, avatar));
        }
        slots
    }
}

/// Identifies a forwarded sub-message inside its carrier message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardRef {
    pub forward_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedMessage {
    pub forward_id: String,
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    /// Sender clock, milliseconds. Never used for ordering.
    pub sent_at: i64,
    pub server_timestamp: i64,
    #[serde(default)]
    pub sequence_id: Option<i64>,
    #[serde(default)]
    pub notify_sequence_id: Option<i64>,
    pub direction: MessageDirection,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub forwarded: Vec<ForwardedMessage>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Message {
    pub fn content_for(&self, forward_ref: Option<&ForwardRef>) -> Option<&MessageContent> {
        match forward_ref {
            None => Some(&self.content),
            Some(forward) => self
                .forwarded
                .iter()
                .find(|f| f.forward_id == forward.forward_id)
                .map(|f| &f.content),
        }
    }

    pub fn content_for_mut(&mut self, forward_ref: Option<&ForwardRef>) -> Option<&mut MessageContent> {
        match forward_ref {
            None => Some(&mut self.content),
            Some(forward) => self
                .forwarded
                .iter_mut()
                .find(|f| f.forward_id == forward.forward_id)
                .map(|f| &mut f.content),
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == MessageDirection::Incoming
    }
}

/// The furthest point a device has read in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPosition {
    pub source_device: DeviceId,
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub sender: Option<UserId>,
    pub sent_at: i64,
    pub read_at: i64,
    pub max_server_timestamp: i64,
    #[serde(default)]
    pub max_notify_sequence_id: i64,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl ReadPosition {
    pub fn identity(&self) -> (DeviceId, ConversationId, i64) {
        (
            self.source_device,
            self.conversation_id,
            self.max_server_timestamp,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default)]
    pub members: BTreeSet<UserId>,
    #[serde(default)]
    pub last_read_position: Option<ReadPosition>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub oldest_remote_msg_seq_id: Option<i64>,
    #[serde(default)]
    pub latest_remote_msg_seq_id: Option<i64>,
    #[serde(default)]
    pub oldest_loaded_msg_seq_id: Option<i64>,
    #[serde(default)]
    pub latest_loaded_msg_seq_id: Option<i64>,
    #[serde(default)]
    pub latest_as_read_msg_seq_id: Option<i64>,
    /// Server timestamp attached to a manual "mark unread".
    #[serde(default)]
    pub marked_unread_at: Option<i64>,
    /// Read cursor already propagated to this user's other devices.
    #[serde(default)]
    pub last_synced_read_timestamp: Option<i64>,
    #[serde(default)]
    pub last_message_timestamp: Option<i64>,
    #[serde(default)]
    pub last_incoming_timestamp: Option<i64>,
}

impl Conversation {
    pub fn new(id: ConversationId, kind: ConversationKind) -> Self {
        Self {
            id,
            kind,
            members: BTreeSet::new(),
            last_read_position: None,
            unread_count: 0,
            oldest_remote_msg_seq_id: None,
            latest_remote_msg_seq_id: None,
            oldest_loaded_msg_seq_id: None,
            latest_loaded_msg_seq_id: None,
            latest_as_read_msg_seq_id: None,
            marked_unread_at: None,
            last_synced_read_timestamp: None,
            last_message_timestamp: None,
            last_incoming_timestamp: None,
        }
    }

    pub fn read_cursor(&self) -> Option<i64> {
        self.last_read_position
            .as_ref()
            .map(|position| position.max_server_timestamp)
    }

    pub fn remote_range(&self) -> Option<SequenceRange> {
        SequenceRange::from_bounds(self.oldest_remote_msg_seq_id, self.latest_remote_msg_seq_id)
    }

    pub fn loaded_range(&self) -> Option<SequenceRange> {
        SequenceRange::from_bounds(self.oldest_loaded_msg_seq_id, self.latest_loaded_msg_seq_id)
    }

    /// Remote ids the server knows about above the locally materialized window.
    pub fn unloaded_backlog(&self) -> u32 {
        match (self.latest_remote_msg_seq_id, self.latest_loaded_msg_seq_id) {
            (Some(remote), Some(loaded)) if remote > loaded => {
                u32::try_from(remote - loaded).unwrap_or(u32::MAX)
            }
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDownloadJob {
    pub id: JobId,
    pub message_id: MessageId,
    pub kind: AttachmentJobKind,
    pub index: usize,
    pub attachment: Attachment,
    pub attempts: u32,
    pub pending: bool,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub forward_ref: Option<ForwardRef>,
}

impl AttachmentDownloadJob {
    pub fn new(
        message_id: MessageId,
        kind: AttachmentJobKind,
        index: usize,
        attachment: Attachment,
        forward_ref: Option<ForwardRef>,
    ) -> Self {
        Self {
            id: JobId::new(),
            message_id,
            kind,
            index,
            attachment,
            attempts: 0,
            pending: false,
            scheduled_at: Utc::now(),
            forward_ref,
        }
    }
}

#[cfg(test)]
#[path = "tests/model_tests.rs"]
mod tests;
