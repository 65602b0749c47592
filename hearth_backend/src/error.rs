//! Error taxonomy for the monitoring engine.
//!
//! Only [`ConfigurationError`] is fatal, and only during INIT. Everything else is
//! absorbed inside one orchestration cycle and degrades to a default value.

use std::time::Duration;

/// Fatal setup failure. The process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("chat name is not configured (set CHAT_NAME or chat_name in the config file)")]
    MissingChatName,

    #[error("chat '{0}' was not found in the message store")]
    ChatNotFound(String),

    #[error("message store at {path} is not readable: {reason}")]
    SourceUnavailable { path: String, reason: String },

    #[error("missing credentials for provider '{provider}' (set {env_var})")]
    MissingCredentials {
        provider: &'static str,
        env_var: &'static str,
    },

    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to load {what} from {path}: {reason}")]
    Unreadable {
        what: &'static str,
        path: String,
        reason: String,
    },
}

/// Failure of a generation call. Recoverable.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::RateLimited(_) => "rate_limit",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Http(_) => "network",
            Self::Api { .. } => "api",
        }
    }
}

/// The dispatcher could not hand the reply to the messaging application.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("send command failed: {0}")]
    Command(String),

    #[error("failed to launch sender: {0}")]
    Launch(#[from] std::io::Error),
}

/// A single source record that could not become an [`Event`](crate::conversation::Event).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed record {record_id:?}: {reason}")]
pub struct MalformedEventError {
    /// Row id of the offending record, when known, so the cursor can still move past it.
    pub record_id: Option<i64>,
    pub reason: String,
}

impl MalformedEventError {
    pub fn new(record_id: Option<i64>, reason: impl Into<String>) -> Self {
        Self {
            record_id,
            reason: reason.into(),
        }
    }
}

/// A poll or bootstrap against the message source failed at runtime.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("message store query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("message store lock poisoned")]
    Poisoned,

    #[error("source unavailable: {0}")]
    Unavailable(String),
}
