use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    IdentityMismatch,
    Internal,
}

/// Error body returned by the sync server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Recipient whose identity no longer matches, for `IdentityMismatch`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            user_id: None,
        }
    }

    pub fn identity_mismatch(user_id: i64) -> Self {
        Self {
            code: ErrorCode::IdentityMismatch,
            message: format!("identity changed for user {user_id}"),
            user_id: Some(user_id),
        }
    }
}
