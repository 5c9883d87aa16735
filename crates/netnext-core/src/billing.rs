//! Per-slice billing records and relay pricing.
//!
//! Every session update produces one [`BillingEntry2`]. The entry is filled
//! in groups: fields sent on every slice, fields meaningful on the first and
//! summary slices, summary-only counters, relay route details and error
//! state. Pricing is by bandwidth envelope, not by bytes actually carried.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::routing::{Nibblin, Relay, Seller};
use crate::{MAX_DEBUG_LENGTH, MAX_NEAR_RELAYS, MAX_RELAYS_PER_ROUTE, MAX_TAGS};

/// Billing entry layout version
pub const BILLING_ENTRY_VERSION: u32 = 2;

/// Longest ISP name kept in an entry
pub const BILLING_MAX_ISP_LENGTH: usize = 64;

/// Longest address string kept in an entry
pub const BILLING_MAX_ADDRESS_LENGTH: usize = 256;

/// Network next margin added to every GB carried, in nibblins
pub const NEXT_PRICE_NIBBLINS_PER_GB: Nibblin = 1_000_000_000;

const BYTES_PER_GB: f64 = 1_000_000_000.0;

/// One billing record per session slice
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingEntry2 {
    /// Layout version
    pub version: u32,
    /// Unix seconds the entry was built
    pub timestamp: u32,
    /// Session id
    pub session_id: u64,
    /// Slice number reported by the SDK
    pub slice_number: u32,
    /// Direct RTT (ms)
    pub direct_rtt: i32,
    /// Direct jitter (ms)
    pub direct_jitter: i32,
    /// Direct packet loss (%)
    pub direct_packet_loss: i32,
    /// Integer part of the real packet loss
    pub real_packet_loss: i32,
    /// Fractional part of the real packet loss, in 1/255ths
    pub real_packet_loss_frac: u32,
    /// Real jitter (ms)
    pub real_jitter: u32,
    /// Slice was carried on a relay route
    pub next: bool,
    /// Player reported a problem
    pub flagged: bool,
    /// Final slice of the session
    pub summary: bool,
    /// Buyer has debug enabled
    pub use_debug: bool,
    /// Debug text from the route decision
    pub debug: String,
    /// Distinct near relays with a usable route
    pub route_diversity: i32,
    /// Buyer-defined flags
    pub user_flags: u64,

    /// Datacenter id
    pub datacenter_id: u64,
    /// Buyer id
    pub buyer_id: u64,
    /// Hashed user id
    pub user_hash: u64,
    /// Billed envelope bytes up this slice
    pub envelope_bytes_up: u64,
    /// Billed envelope bytes down this slice
    pub envelope_bytes_down: u64,
    /// Client latitude
    pub latitude: f32,
    /// Client longitude
    pub longitude: f32,
    /// Client address
    pub client_address: String,
    /// Server address
    pub server_address: String,
    /// Client ISP
    pub isp: String,
    /// Connection type
    pub connection_type: i32,
    /// Platform type
    pub platform_type: i32,
    /// SDK version string
    pub sdk_version: String,
    /// Valid entries in `tags`
    pub num_tags: i32,
    /// Session tags
    pub tags: [u64; MAX_TAGS],
    /// Session is in an A/B test
    pub ab_test: bool,
    /// Pro mode active
    pub pro: bool,

    /// Cumulative packets sent client to server
    pub client_to_server_packets_sent: u64,
    /// Cumulative packets sent server to client
    pub server_to_client_packets_sent: u64,
    /// Cumulative packets lost client to server
    pub client_to_server_packets_lost: u64,
    /// Cumulative packets lost server to client
    pub server_to_client_packets_lost: u64,
    /// Cumulative out of order packets client to server
    pub client_to_server_packets_out_of_order: u64,
    /// Cumulative out of order packets server to client
    pub server_to_client_packets_out_of_order: u64,
    /// Valid near relay entries
    pub num_near_relays: i32,
    /// Near relay ids
    pub near_relay_ids: [u64; MAX_NEAR_RELAYS],
    /// Near relay RTTs
    pub near_relay_rtts: [i32; MAX_NEAR_RELAYS],
    /// Near relay jitters
    pub near_relay_jitters: [i32; MAX_NEAR_RELAYS],
    /// Near relay packet losses
    pub near_relay_packet_losses: [i32; MAX_NEAR_RELAYS],
    /// Session was ever on a relay route
    pub ever_on_next: bool,
    /// Session length in seconds, summary slice only
    pub session_duration: u32,

    /// Next RTT (ms)
    pub next_rtt: i32,
    /// Next jitter (ms)
    pub next_jitter: i32,
    /// Next packet loss (%)
    pub next_packet_loss: i32,
    /// Predicted RTT of the route
    pub predicted_next_rtt: i32,
    /// RTT from the client to the first route relay
    pub near_relay_rtt: i32,
    /// Relays on the route
    pub num_next_relays: i32,
    /// Route relay ids
    pub next_relays: [u64; MAX_RELAYS_PER_ROUTE],
    /// Per-relay price for this slice
    pub next_relay_price: [u64; MAX_RELAYS_PER_ROUTE],
    /// Total price for this slice
    pub total_price: u64,
    /// Route not yet committed
    pub uncommitted: bool,
    /// Multipath active
    pub multipath: bool,
    /// Route taken to reduce latency
    pub rtt_reduction: bool,
    /// Route taken to reduce packet loss
    pub packet_loss_reduction: bool,
    /// Route relays changed this slice
    pub route_changed: bool,
    /// Bytes carried up on the relay route last slice
    pub next_bytes_up: u64,
    /// Bytes carried down on the relay route last slice
    pub next_bytes_down: u64,

    /// SDK fell back to direct
    pub fallback_to_direct: bool,
    /// Multipath overload veto
    pub multipath_vetoed: bool,
    /// Mispredict veto
    pub mispredicted: bool,
    /// Any veto latched
    pub vetoed: bool,
    /// Latency worse than direct
    pub latency_worse: bool,
    /// No route available
    pub no_route: bool,
    /// Best route over the RTT ceiling
    pub next_latency_too_high: bool,
    /// Try-before-you-buy veto
    pub commit_veto: bool,
    /// Datacenter unknown
    pub unknown_datacenter: bool,
    /// Datacenter not enabled for the buyer
    pub datacenter_not_enabled: bool,
    /// Buyer not live
    pub buyer_not_live: bool,
    /// Route matrix stale
    pub stale_route_matrix: bool,
}

impl BillingEntry2 {
    /// Bring variable-length fields and counts within their limits.
    pub fn clamp(&mut self) {
        truncate_utf8(&mut self.debug, MAX_DEBUG_LENGTH);
        truncate_utf8(&mut self.isp, BILLING_MAX_ISP_LENGTH);
        truncate_utf8(&mut self.client_address, BILLING_MAX_ADDRESS_LENGTH);
        truncate_utf8(&mut self.server_address, BILLING_MAX_ADDRESS_LENGTH);
        self.num_tags = self.num_tags.clamp(0, MAX_TAGS as i32);
        self.num_near_relays = self.num_near_relays.clamp(0, MAX_NEAR_RELAYS as i32);
        self.num_next_relays = self.num_next_relays.clamp(0, MAX_RELAYS_PER_ROUTE as i32);
    }
}

pub(crate) fn truncate_utf8(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Split packet loss into its integer part and a fraction in 1/255ths.
#[must_use]
pub fn split_packet_loss(packet_loss: f32) -> (i32, u32) {
    let whole = packet_loss.trunc();
    let frac = ((packet_loss - whole) * 255.0).round();
    (whole as i32, frac as u32)
}

/// Envelope bytes up and down for a slice of `slice_seconds`.
#[must_use]
pub fn envelope_bytes(kbps_up: u64, kbps_down: u64, slice_seconds: u64) -> (u64, u64) {
    (
        1000 * kbps_up / 8 * slice_seconds,
        1000 * kbps_down / 8 * slice_seconds,
    )
}

/// Egress price per GB for a relay: its override when set, else its seller's.
#[must_use]
pub fn relay_egress_price(relay: &Relay, seller: Option<&Seller>) -> Nibblin {
    if relay.egress_price_override > 0 {
        relay.egress_price_override
    } else {
        seller.map_or(0, |seller| seller.egress_price_nibblins_per_gb)
    }
}

fn envelope_gb(bytes_up: u64, bytes_down: u64) -> f64 {
    bytes_up as f64 / BYTES_PER_GB + bytes_down as f64 / BYTES_PER_GB
}

/// Total price of a slice over a route.
///
/// `relay_prices` holds the per-GB egress price of each route relay. The
/// network next margin is added once per GB. An empty route costs nothing.
#[must_use]
pub fn total_price(relay_prices: &[Nibblin], bytes_up: u64, bytes_down: u64) -> Nibblin {
    if relay_prices.is_empty() {
        return 0;
    }
    let per_gb = relay_prices
        .iter()
        .fold(NEXT_PRICE_NIBBLINS_PER_GB, |sum, price| sum.saturating_add(*price));
    (per_gb as f64 * envelope_gb(bytes_up, bytes_down)) as Nibblin
}

/// Price each route relay earns for the slice, excluding the margin.
#[must_use]
pub fn route_relay_prices(
    relay_prices: &[Nibblin],
    bytes_up: u64,
    bytes_down: u64,
) -> [Nibblin; MAX_RELAYS_PER_ROUTE] {
    let mut prices = [0; MAX_RELAYS_PER_ROUTE];
    let gb = envelope_gb(bytes_up, bytes_down);
    for (out, price) in prices.iter_mut().zip(relay_prices) {
        *out = (*price as f64 * gb) as Nibblin;
    }
    prices
}

/// Destination for billing entries
#[async_trait]
pub trait Biller: Send + Sync {
    /// Submit one entry; implementations may buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the entry could not be accepted.
    async fn bill(&self, entry: &BillingEntry2) -> Result<(), SinkError>;

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

/// Biller that only logs entries
#[derive(Debug, Default)]
pub struct LocalBiller {
    entries: AtomicU64,
}

impl LocalBiller {
    /// Create a biller
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries billed so far
    #[must_use]
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Biller for LocalBiller {
    async fn bill(&self, entry: &BillingEntry2) -> Result<(), SinkError> {
        self.entries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            session_id = %format!("{:016x}", entry.session_id),
            slice = entry.slice_number,
            next = entry.next,
            total_price = entry.total_price,
            "billed slice"
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
