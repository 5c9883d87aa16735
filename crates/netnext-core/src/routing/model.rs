//! Buyers, sellers, datacenters and relays.
//!
//! A [`Database`] is the read-only configuration snapshot the handlers
//! consult through a [`Storer`](crate::storage::Storer). It deserializes
//! from JSON; key material is hex encoded.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

/// Billing currency unit (1e-9 of a dollar)
pub type Nibblin = u64;

/// Current [`Location`] binary layout version
pub const LOCATION_VERSION: u32 = 1;

/// Longest ISP name kept in a [`Location`]
pub const MAX_ISP_NAME_LENGTH: usize = 64;

/// Per-buyer knobs that shape route selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteShader {
    /// Never accelerate this buyer
    pub disable_network_next: bool,
    /// Percentage of users eligible for acceleration
    pub selection_percent: i32,
    /// Split users into A/B groups by user id parity
    pub ab_test: bool,
    /// Accept routes that trade latency for multipath
    pub pro_mode: bool,
    /// Take routes that lower latency
    pub reduce_latency: bool,
    /// Take routes that lower jitter
    pub reduce_jitter: bool,
    /// Take routes that lower packet loss
    pub reduce_packet_loss: bool,
    /// Send on direct and relay routes at once
    pub multipath: bool,
    /// Direct RTT at or below which no acceleration is attempted
    pub acceptable_latency: i32,
    /// Minimum RTT improvement worth a relay route
    pub latency_threshold: i32,
    /// Direct packet loss tolerated before trying a relay route
    pub acceptable_packet_loss: f32,
    /// Upstream bandwidth envelope in kbps
    pub bandwidth_envelope_up_kbps: u32,
    /// Downstream bandwidth envelope in kbps
    pub bandwidth_envelope_down_kbps: u32,
    /// Users that always go direct
    pub banned_users: HashSet<u64>,
}

impl Default for RouteShader {
    fn default() -> Self {
        Self {
            disable_network_next: false,
            selection_percent: 100,
            ab_test: false,
            pro_mode: false,
            reduce_latency: true,
            reduce_jitter: true,
            reduce_packet_loss: true,
            multipath: false,
            acceptable_latency: 0,
            latency_threshold: 10,
            acceptable_packet_loss: 1.0,
            bandwidth_envelope_up_kbps: 1024,
            bandwidth_envelope_down_kbps: 1024,
            banned_users: HashSet::new(),
        }
    }
}

/// Operator-side route decision tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalConfig {
    /// Cost window for initial route selection
    pub route_select_threshold: i32,
    /// Cost gap before switching away from the held route
    pub route_switch_threshold: i32,
    /// Extra latency accepted to reduce packet loss
    pub max_latency_trade_off: i32,
    /// Latency veto margin
    pub rtt_veto_default: i32,
    /// Latency veto margin while multipathing
    pub rtt_veto_multipath: i32,
    /// Latency veto margin while reducing packet loss
    pub rtt_veto_packet_loss: i32,
    /// Direct RTT at which multipath is considered overloaded
    pub multipath_overload_threshold: i32,
    /// Evaluate routes before committing game traffic
    pub try_before_you_buy: bool,
    /// Take any relay route
    pub force_next: bool,
    /// Hold near relays after the first slices
    pub large_customer: bool,
    /// Never commit game traffic
    pub uncommitted: bool,
    /// Relay routes above this RTT are never taken
    pub max_rtt: i32,
    /// SDK pings at high frequency
    pub high_frequency_pings: bool,
    /// Minimum distinct near relays with routes
    pub route_diversity: i32,
    /// Latency improvement above which multipath is disabled
    pub multipath_threshold: i32,
}

impl Default for InternalConfig {
    fn default() -> Self {
        Self {
            route_select_threshold: 2,
            route_switch_threshold: 5,
            max_latency_trade_off: 20,
            rtt_veto_default: -10,
            rtt_veto_multipath: -20,
            rtt_veto_packet_loss: -30,
            multipath_overload_threshold: 500,
            try_before_you_buy: false,
            force_next: false,
            large_customer: false,
            uncommitted: false,
            max_rtt: 300,
            high_frequency_pings: true,
            route_diversity: 0,
            multipath_threshold: 25,
        }
    }
}

/// A customer operating game servers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    /// Buyer id carried in every SDK packet
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Short company code, keys the multipath veto store
    #[serde(default)]
    pub company_code: String,
    /// Buyer is active
    #[serde(default)]
    pub live: bool,
    /// Responses carry a debug string
    #[serde(default)]
    pub debug: bool,
    /// Ed25519 key verifying packet signatures
    #[serde(with = "hex_bytes", default)]
    pub public_key: Vec<u8>,
    /// Route selection knobs
    #[serde(default)]
    pub route_shader: RouteShader,
    /// Operator tuning
    #[serde(default)]
    pub internal_config: InternalConfig,
}

/// A relay operator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seller {
    /// Seller id
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Egress price per GB
    #[serde(default)]
    pub egress_price_nibblins_per_gb: Nibblin,
}

/// A datacenter hosting game servers and relays
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datacenter {
    /// Datacenter id, the hash of its name
    pub id: u64,
    /// Canonical name
    pub name: String,
    /// Buyer-facing alias
    #[serde(default)]
    pub alias_name: String,
    /// Latitude in degrees
    #[serde(default)]
    pub latitude: f32,
    /// Longitude in degrees
    #[serde(default)]
    pub longitude: f32,
}

/// Buyer-side alias enabling a datacenter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterMap {
    /// Buyer the entry belongs to
    pub buyer_id: u64,
    /// Datacenter the alias resolves to
    pub datacenter_id: u64,
    /// Name the buyer's servers report
    #[serde(default)]
    pub alias: String,
}

/// A relay node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    /// Relay id
    pub id: u64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Public address
    pub addr: SocketAddr,
    /// Address reachable from relays of the same seller
    #[serde(default)]
    pub internal_addr: Option<SocketAddr>,
    /// Clients may reach the internal address directly
    #[serde(default)]
    pub internal_address_client_routable: bool,
    /// X25519 route key
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// Operating seller
    pub seller_id: u64,
    /// Hosting datacenter
    #[serde(default)]
    pub datacenter_id: u64,
    /// Per-relay egress price replacing the seller's, when non-zero
    #[serde(default)]
    pub egress_price_override: Nibblin,
}

/// Client geolocation, resolved once on slice 0
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees
    pub latitude: f32,
    /// Longitude in degrees
    pub longitude: f32,
    /// Internet service provider
    #[serde(default)]
    pub isp: String,
    /// Autonomous system number
    #[serde(default)]
    pub asn: u32,
}

impl Location {
    /// Whether this is the (0, 0) "null island" sentinel
    #[must_use]
    pub fn is_null_island(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    fn isp_bytes(&self) -> &[u8] {
        let mut end = self.isp.len().min(MAX_ISP_NAME_LENGTH);
        while !self.isp.is_char_boundary(end) {
            end -= 1;
        }
        &self.isp.as_bytes()[..end]
    }

    /// Size of the binary encoding
    #[must_use]
    pub fn size(&self) -> usize {
        4 + 4 + 4 + 4 + self.isp_bytes().len() + 4
    }

    /// Encode as little-endian binary. Long ISP names are truncated.
    #[must_use]
    pub fn marshal_binary(&self) -> Vec<u8> {
        let isp = self.isp_bytes();
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&LOCATION_VERSION.to_le_bytes());
        out.extend_from_slice(&self.latitude.to_le_bytes());
        out.extend_from_slice(&self.longitude.to_le_bytes());
        out.extend_from_slice(&(isp.len() as u32).to_le_bytes());
        out.extend_from_slice(isp);
        out.extend_from_slice(&self.asn.to_le_bytes());
        out
    }

    /// Decode the little-endian binary form.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::InvalidLocation`] on truncation, an unknown
    /// version or an oversized ISP name.
    pub fn unmarshal_binary(data: &[u8]) -> Result<Self, PacketError> {
        let mut cursor = LeCursor { data, index: 0 };

        let version = cursor.u32().ok_or(PacketError::InvalidLocation("version"))?;
        if version != LOCATION_VERSION {
            return Err(PacketError::InvalidLocation("unknown version"));
        }

        let latitude = cursor.f32().ok_or(PacketError::InvalidLocation("latitude"))?;
        let longitude = cursor.f32().ok_or(PacketError::InvalidLocation("longitude"))?;

        let isp_len = cursor.u32().ok_or(PacketError::InvalidLocation("isp"))? as usize;
        if isp_len > MAX_ISP_NAME_LENGTH {
            return Err(PacketError::InvalidLocation("isp too long"));
        }
        let isp = cursor
            .take(isp_len)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .ok_or(PacketError::InvalidLocation("isp"))?
            .to_string();

        let asn = cursor.u32().ok_or(PacketError::InvalidLocation("asn"))?;

        Ok(Self {
            latitude,
            longitude,
            isp,
            asn,
        })
    }
}

struct LeCursor<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> LeCursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.index.checked_add(len)?;
        let bytes = self.data.get(self.index..end)?;
        self.index = end;
        Some(bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    fn f32(&mut self) -> Option<f32> {
        self.u32().map(f32::from_bits)
    }
}

/// Read-only configuration snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    /// When the snapshot was produced
    pub creation_time: String,
    /// Buyers by id
    pub buyers: HashMap<u64, Buyer>,
    /// Sellers by id
    pub sellers: HashMap<u64, Seller>,
    /// Datacenters by id
    pub datacenters: HashMap<u64, Datacenter>,
    /// Datacenter aliases by buyer id
    pub datacenter_maps: HashMap<u64, Vec<DatacenterMap>>,
    /// Relays by id
    pub relays: HashMap<u64, Relay>,
}

impl Database {
    /// Parse a JSON snapshot.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] for malformed input.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`].
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
