//! Routing data model, route matrix snapshot and route decisions.
//!
//! The backend never mutates any of this from a handler: the configuration
//! [`Database`] and the [`RouteMatrix`] are whole snapshots swapped in by
//! their provider, and [`RouteState`] lives inside the per-session
//! [`SessionData`](crate::SessionData) blob.

pub mod decision;
pub mod matrix;
pub mod model;

pub use decision::{
    LowestCostDecider, RouteDecider, RouteInputs, RouteSelection, StayDecision, TakeDecision,
    near_relay_cost, reframe_near_relays, reframe_route,
};
pub use matrix::{MatrixRelay, RouteEntry, RouteMatrix, route_hash, tri_matrix_index};
pub use model::{
    Buyer, Database, Datacenter, DatacenterMap, InternalConfig, Location, Nibblin, Relay,
    RouteShader, Seller,
};

use crate::MAX_NEAR_RELAYS;
use crate::error::PacketError;

/// Maximum alternative routes stored per matrix entry
pub const MAX_ROUTES_PER_ENTRY: usize = 16;

/// Near relay cost marking a relay as unroutable
pub const UNROUTABLE_COST: i32 = 255;

/// How the SDK should carry this slice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RouteType {
    /// Public internet
    #[default]
    Direct = 0,
    /// A freshly issued relay route
    New = 1,
    /// Keep the current relay route
    Continue = 2,
}

impl TryFrom<i32> for RouteType {
    type Error = PacketError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Direct),
            1 => Ok(Self::New),
            2 => Ok(Self::Continue),
            _ => Err(PacketError::UnknownRouteType(value)),
        }
    }
}

/// Routing state carried across slices inside the session data blob
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteState {
    /// Hashed user id reported by the SDK
    pub user_id: u64,
    /// Session is on a relay route
    pub next: bool,
    /// Session left a relay route and may not return
    pub veto: bool,
    /// User is banned by the buyer
    pub banned: bool,
    /// Buyer disabled acceleration
    pub disabled: bool,
    /// User fell outside the selection percentage
    pub not_selected: bool,
    /// Session takes part in an A/B test
    pub ab_test: bool,
    /// A/B test group A
    pub a: bool,
    /// A/B test group B (always direct)
    pub b: bool,
    /// Relay route forced regardless of cost
    pub forced_next: bool,
    /// Route was taken to reduce latency
    pub reduce_latency: bool,
    /// Route was taken to reduce packet loss
    pub reduce_packet_loss: bool,
    /// Pro mode active
    pub pro_mode: bool,
    /// Packets are sent on both direct and relay routes
    pub multipath: bool,
    /// Game traffic is committed to the relay route
    pub committed: bool,
    /// Try-before-you-buy vetoed the route
    pub commit_veto: bool,
    /// Slices spent evaluating an uncommitted route
    pub commit_counter: i32,
    /// Relay route made latency worse
    pub latency_worse: bool,
    /// Client could not be located
    pub location_veto: bool,
    /// Multipath overloaded the connection
    pub multipath_overload: bool,
    /// No relay route remained
    pub no_route: bool,
    /// Best relay route exceeded the RTT ceiling
    pub next_latency_too_high: bool,
    /// Near relays the SDK pings
    pub num_near_relays: usize,
    /// Smoothed near relay RTT
    pub near_relay_rtt: [i32; MAX_NEAR_RELAYS],
    /// Smoothed near relay jitter
    pub near_relay_jitter: [i32; MAX_NEAR_RELAYS],
    /// Packet loss history bitmask per near relay
    pub near_relay_pl_history: [u32; MAX_NEAR_RELAYS],
    /// Packet loss events per near relay
    pub near_relay_pl_count: [u32; MAX_NEAR_RELAYS],
    /// Direct packet loss history bitmask
    pub direct_pl_history: u32,
    /// Direct packet loss events
    pub direct_pl_count: u32,
    /// Next slot in the packet loss history
    pub pl_history_index: i32,
    /// Valid samples in the packet loss history
    pub pl_history_samples: i32,
    /// A relay on the route left the matrix
    pub relay_went_away: bool,
    /// The held route disappeared from the matrix
    pub route_lost: bool,
    /// Worst direct jitter seen
    pub direct_jitter: i32,
    /// Predicted RTT was repeatedly wrong
    pub mispredict: bool,
    /// Too few distinct near relays had routes
    pub lack_of_diversity: bool,
    /// Consecutive mispredicted slices
    pub mispredict_counter: u32,
    /// Consecutive latency-worse slices on multipath
    pub latency_worse_counter: u32,
    /// User is multipath-vetoed
    pub multipath_restricted: bool,
    /// Consecutive slices of sustained packet loss
    pub pl_sustained_counter: i32,
}

impl RouteState {
    /// Whether any terminal direct condition has latched
    #[must_use]
    pub fn vetoed(&self) -> bool {
        self.veto || self.location_veto || self.banned || self.disabled || self.not_selected || self.b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_type_from_i32() {
        assert_eq!(RouteType::try_from(0).unwrap(), RouteType::Direct);
        assert_eq!(RouteType::try_from(1).unwrap(), RouteType::New);
        assert_eq!(RouteType::try_from(2).unwrap(), RouteType::Continue);
        assert!(RouteType::try_from(3).is_err());
        assert_eq!(RouteType::default(), RouteType::Direct);
    }

    #[test]
    fn test_route_state_vetoed() {
        let mut state = RouteState::default();
        assert!(!state.vetoed());
        state.location_veto = true;
        assert!(state.vetoed());
    }
}
