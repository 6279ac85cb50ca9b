//! Mention Feed
//!
//! A [`MentionSource`] hands the coordinator batches of mentions, hiding
//! whether they were polled from a search endpoint or pushed through a
//! filtered stream. Delivery is at-least-once: the same mention may show up
//! in several batches and suppressing duplicates is the coordinator's job.

pub mod poll;
pub mod stream;
pub mod x_api;

use async_trait::async_trait;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use poll::PollingSource;
pub use stream::StreamingSource;
pub use x_api::XClient;

/// Errors that can occur while reading the feed or posting to it
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Missing credential: {0}")]
    MissingCredential(&'static str),
}

/// A feed event referencing the monitored account. Immutable once received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// Feed-assigned unique id
    pub id: String,
    pub author_id: String,
    pub text: String,
    /// Unix timestamp in milliseconds when the mention was received
    pub observed_at: u64,
}

impl Mention {
    pub fn new(id: impl Into<String>, author_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author_id: author_id.into(),
            text: text.into(),
            observed_at: current_timestamp_millis(),
        }
    }
}

/// Source of mention batches.
///
/// Sources are infinite and not restartable. `next_batch` suspends until at
/// least one cycle has completed; a cycle may legitimately produce an empty
/// batch. `None` means the source has shut down for good.
#[async_trait]
pub trait MentionSource: Send {
    async fn next_batch(&mut self) -> Option<Vec<Mention>>;

    /// Short label used in logs
    fn name(&self) -> &'static str;
}

/// Transport used to acquire mentions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMode {
    Poll,
    Stream,
}

impl FromStr for FeedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "poll" | "search" => Ok(FeedMode::Poll),
            "stream" => Ok(FeedMode::Stream),
            other => Err(format!("unknown feed mode '{}', expected 'poll' or 'stream'", other)),
        }
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
