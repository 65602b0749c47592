//! Boundaries to the messaging application: reading events and sending replies.

pub mod applescript;
pub mod imessage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::conversation::{Cursor, Event};
use crate::error::{DeliveryError, MalformedEventError, SourceError};

pub use applescript::AppleScriptDispatcher;
pub use imessage::ChatDbSource;

/// One source row: either a usable event or the reason it could not be read.
pub type SourceRecord = Result<Event, MalformedEventError>;

/// Row id of a record, whether or not it parsed.
pub fn record_seq(record: &SourceRecord) -> Option<i64> {
    match record {
        Ok(event) => Some(event.id.seq),
        Err(malformed) => malformed.record_id,
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Current tail of the conversation. Polling from here replays nothing.
    async fn latest_cursor(&self) -> Result<Cursor, SourceError>;

    /// The last `n` records, oldest first.
    async fn bootstrap_tail(&self, n: usize) -> Result<Vec<SourceRecord>, SourceError>;

    /// Records strictly after `since`, oldest first.
    async fn poll(&self, since: Cursor) -> Result<Vec<SourceRecord>, SourceError>;
}

/// Proof that a reply left the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentReceipt {
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, text: &str) -> Result<SentReceipt, DeliveryError>;
}
