//! Real-time portal messages and their publishers.
//!
//! Two message kinds go to the portal: per-server [`SessionCountData`]
//! heartbeats in a fixed little-endian layout, and per-slice
//! [`SessionPortalData`] snapshots encoded with bincode.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PacketError, PublishError};
use crate::routing::Location;

/// Topic for session count heartbeats
pub const TOPIC_SESSION_COUNTS: &str = "session_counts";

/// Topic for per-slice session snapshots
pub const TOPIC_SESSION_DATA: &str = "session_data";

/// [`SessionCountData`] layout version
pub const SESSION_COUNT_DATA_VERSION: u32 = 1;

/// [`SessionPortalData`] layout version
pub const SESSION_PORTAL_DATA_VERSION: u8 = 1;

/// Encoded size of [`SessionCountData`]
pub const SESSION_COUNT_DATA_SIZE: usize = 4 + 8 + 8 + 4;

/// Number of sessions on one game server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCountData {
    /// Layout version
    pub version: u32,
    /// Hash of the server address
    pub server_id: u64,
    /// Buyer id
    pub buyer_id: u64,
    /// Sessions currently on the server
    pub num_sessions: u32,
}

impl SessionCountData {
    /// Encode as little-endian fields.
    #[must_use]
    pub fn marshal_binary(&self) -> [u8; SESSION_COUNT_DATA_SIZE] {
        let mut out = [0u8; SESSION_COUNT_DATA_SIZE];
        out[0..4].copy_from_slice(&SESSION_COUNT_DATA_VERSION.to_le_bytes());
        out[4..12].copy_from_slice(&self.server_id.to_le_bytes());
        out[12..20].copy_from_slice(&self.buyer_id.to_le_bytes());
        out[20..24].copy_from_slice(&self.num_sessions.to_le_bytes());
        out
    }

    /// Decode a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooShort`] on truncated input and
    /// [`PacketError::InvalidSessionDataVersion`] for a newer layout.
    pub fn unmarshal_binary(data: &[u8]) -> Result<Self, PacketError> {
        let Some(bytes) = data.get(..SESSION_COUNT_DATA_SIZE) else {
            return Err(PacketError::TooShort {
                expected: SESSION_COUNT_DATA_SIZE,
                actual: data.len(),
            });
        };
        let u32_at = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let u64_at = |at: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(raw)
        };

        let version = u32_at(0);
        if version > SESSION_COUNT_DATA_VERSION {
            return Err(PacketError::InvalidSessionDataVersion(version));
        }
        Ok(Self {
            version,
            server_id: u64_at(4),
            buyer_id: u64_at(12),
            num_sessions: u32_at(20),
        })
    }
}

/// Latency, jitter and loss of one path
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    /// RTT (ms)
    pub rtt: f64,
    /// Jitter (ms)
    pub jitter: f64,
    /// Packet loss (%)
    pub packet_loss: f64,
}

/// A relay on the session's route
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayHop {
    /// Relay id
    pub id: u64,
    /// Relay name
    pub name: String,
}

/// A near relay and how the client sees it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NearRelayPortalData {
    /// Relay id
    pub id: u64,
    /// Relay name
    pub name: String,
    /// Client to relay stats
    pub client_stats: PathStats,
}

/// Slow-changing session description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    /// Session id
    pub id: u64,
    /// Hashed user id
    pub user_hash: u64,
    /// Datacenter name
    pub datacenter_name: String,
    /// Datacenter alias
    pub datacenter_alias: String,
    /// On a relay route this slice
    pub on_network_next: bool,
    /// Next RTT (ms)
    pub next_rtt: f64,
    /// Direct RTT (ms)
    pub direct_rtt: f64,
    /// Improvement of next over direct, never negative
    pub delta_rtt: f64,
    /// Client location
    pub location: Location,
    /// Client address
    pub client_addr: String,
    /// Server address
    pub server_addr: String,
    /// Route relays
    pub hops: Vec<RelayHop>,
    /// SDK version
    pub sdk: String,
    /// Connection type
    pub connection: u8,
    /// Near relays
    pub nearby_relays: Vec<NearRelayPortalData>,
    /// Platform type
    pub platform: u8,
    /// Buyer id
    pub buyer_id: u64,
}

/// One slice of session measurements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSlice {
    /// Unix seconds
    pub timestamp: u64,
    /// Relay route stats
    pub next: PathStats,
    /// Direct stats
    pub direct: PathStats,
    /// Predicted stats
    pub predicted: PathStats,
    /// Client to server stats
    pub client_to_server: PathStats,
    /// Server to client stats
    pub server_to_client: PathStats,
    /// Distinct near relays with a usable route
    pub route_diversity: u32,
    /// Envelope up (kbps)
    pub envelope_up_kbps: i64,
    /// Envelope down (kbps)
    pub envelope_down_kbps: i64,
    /// Multipath active
    pub is_multipath: bool,
    /// Route not yet committed
    pub is_try_before_you_buy: bool,
    /// On a relay route this slice
    pub on_network_next: bool,
}

/// Session position for the map view
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMapPoint {
    /// Latitude
    pub latitude: f64,
    /// Longitude
    pub longitude: f64,
    /// Session id
    pub session_id: u64,
}

/// Per-slice session snapshot for the portal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPortalData {
    /// Layout version
    pub version: u8,
    /// Session description
    pub meta: SessionMeta,
    /// This slice
    pub slice: SessionSlice,
    /// Map position
    pub point: SessionMapPoint,
    /// Buyer flagged as a large customer
    pub large_customer: bool,
    /// Session was ever on a relay route
    pub ever_on_next: bool,
}

impl SessionPortalData {
    /// Encode with bincode.
    ///
    /// # Errors
    ///
    /// Returns the bincode error if serialization fails.
    pub fn marshal_binary(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Decode with bincode.
    ///
    /// # Errors
    ///
    /// Returns the bincode error on malformed input.
    pub fn unmarshal_binary(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// A pub/sub endpoint for portal messages
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `data` on `topic`, returning the bytes sent.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Retryable`] for transient failures and
    /// [`PublishError::Fatal`] otherwise.
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<usize, PublishError>;
}

/// Publisher that only logs messages
#[derive(Debug, Default)]
pub struct LocalPublisher {
    messages: AtomicU64,
}

impl LocalPublisher {
    /// Create a publisher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published so far
    #[must_use]
    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Publisher for LocalPublisher {
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<usize, PublishError> {
        self.messages.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(topic, bytes = data.len(), "portal message");
        Ok(data.len())
    }
}
