use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug,
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(UserId);
id_newtype!(DeviceId);

/// Globally unique identifier of a persisted attachment download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Incoming,
    Outgoing,
}

/// Which slot of a message an attachment download job fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentJobKind {
    LongText,
    Attachment,
    ContactAvatar,
    QuoteThumbnail,
    GroupAvatar,
}

impl AttachmentJobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LongText => "long_text",
            Self::Attachment => "attachment",
            Self::ContactAvatar => "contact_avatar",
            Self::QuoteThumbnail => "quote_thumbnail",
            Self::GroupAvatar => "group_avatar",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "long_text" => Some(Self::LongText),
            "attachment" => Some(Self::Attachment),
            "contact_avatar" => Some(Self::ContactAvatar),
            "quote_thumbnail" => Some(Self::QuoteThumbnail),
            "group_avatar" => Some(Self::GroupAvatar),
            _ => None,
        }
    }
}
