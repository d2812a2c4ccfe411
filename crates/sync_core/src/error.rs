use std::{future::Future, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("permanent content failure: {0}")]
    PermanentContent(String),
    #[error("identity changed for user {user_id}")]
    IdentityMismatch { user_id: i64 },
    #[error("message {message_id} no longer exists")]
    OrphanedReference { message_id: i64 },
    #[error("store call '{operation}' timed out after {elapsed:?}")]
    StoreTimeout {
        operation: &'static str,
        elapsed: Duration,
    },
    #[error("conversation {conversation_id} is not known")]
    UnknownConversation { conversation_id: i64 },
    #[error("attachment slot already holds resolved content")]
    SlotAlreadyResolved,
    #[error("task queue '{0}' dropped the task before it completed")]
    QueueAbandoned(&'static str),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// Failures worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::StoreTimeout { .. } | Self::Store(_)
        )
    }

    /// Copy for fanning one failure out to several waiters.
    pub(crate) fn replicate(&self) -> Self {
        match self {
            Self::TransientNetwork(msg) => Self::TransientNetwork(msg.clone()),
            Self::PermanentContent(msg) => Self::PermanentContent(msg.clone()),
            Self::IdentityMismatch { user_id } => Self::IdentityMismatch { user_id: *user_id },
            Self::OrphanedReference { message_id } => Self::OrphanedReference {
                message_id: *message_id,
            },
            Self::StoreTimeout { operation, elapsed } => Self::StoreTimeout {
                operation,
                elapsed: *elapsed,
            },
            Self::UnknownConversation { conversation_id } => Self::UnknownConversation {
                conversation_id: *conversation_id,
            },
            Self::SlotAlreadyResolved => Self::SlotAlreadyResolved,
            Self::QueueAbandoned(name) => Self::QueueAbandoned(name),
            Self::Store(err) => Self::Store(anyhow::anyhow!("{err:#}")),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Runs a store call under `limit`, mapping an elapsed deadline to `StoreTimeout`.
pub(crate) async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> SyncResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(SyncError::Store),
        Err(_) => Err(SyncError::StoreTimeout {
            operation,
            elapsed: limit,
        }),
    }
}
