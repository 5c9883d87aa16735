//! Match data entries and their sink.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;

/// Match data entry layout version
pub const MATCH_DATA_ENTRY_VERSION: u32 = 1;

/// Maximum values per match
pub const MAX_MATCH_VALUES: usize = 64;

/// Per-match values a game server attaches to a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchDataEntry {
    /// Layout version
    pub version: u32,
    /// Unix seconds
    pub timestamp: u32,
    /// Buyer id
    pub buyer_id: u64,
    /// Server address
    pub server_address: String,
    /// Datacenter id
    pub datacenter_id: u64,
    /// Hashed user id
    pub user_hash: u64,
    /// Session id
    pub session_id: u64,
    /// Match id
    pub match_id: u64,
    /// Buyer-defined values, at most [`MAX_MATCH_VALUES`]
    pub match_values: Vec<f64>,
}

impl MatchDataEntry {
    /// Drop values beyond [`MAX_MATCH_VALUES`].
    pub fn clamp(&mut self) {
        self.match_values.truncate(MAX_MATCH_VALUES);
    }
}

/// Destination for match data
#[async_trait]
pub trait Matcher: Send + Sync {
    /// Submit one entry; implementations may buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the entry could not be accepted.
    async fn submit(&self, entry: &MatchDataEntry) -> Result<(), SinkError>;

    /// Push out anything buffered.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if buffered entries could not be written.
    async fn flush(&self) -> Result<(), SinkError>;

    /// Release the sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the sink failed to shut down cleanly.
    async fn close(&self) -> Result<(), SinkError>;
}

/// Matcher that only logs entries
#[derive(Debug, Default)]
pub struct LocalMatcher {
    entries: AtomicU64,
}

impl LocalMatcher {
    /// Create a matcher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries submitted so far
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Matcher for LocalMatcher {
    async fn submit(&self, entry: &MatchDataEntry) -> Result<(), SinkError> {
        self.entries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            match_id = entry.match_id,
            values = entry.match_values.len(),
            "match data"
        );
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
