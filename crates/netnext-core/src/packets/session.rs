//! Session update request and response packets.
//!
//! Both layouts are gated on the SDK version; older SDKs omit fields that
//! newer ones send. The response carries no version on the wire, so callers
//! set [`SessionResponsePacket::version`] to the requesting SDK's version
//! before marshaling and pass it explicitly when decoding.

use std::net::SocketAddr;

use super::{Packet, PacketType, SdkVersion};
use crate::encoding::{ReadStream, WriteStream};
use crate::error::PacketError;
use crate::routing::RouteType;
use crate::{
    ENCRYPTED_CONTINUE_TOKEN_SIZE, ENCRYPTED_ROUTE_TOKEN_SIZE, MAX_DEBUG_LENGTH, MAX_NEAR_RELAYS,
    MAX_SESSION_DATA_SIZE, MAX_SESSION_UPDATE_RETRIES, MAX_TAGS, MAX_TOKENS,
};

/// Highest connection type value
pub const CONNECTION_TYPE_MAX: i32 = 3;

/// Highest platform type for SDK 4.0.4 and older
pub const PLATFORM_TYPE_MAX_404: i32 = 7;

/// Highest platform type for SDK 4.0.5 through 4.0.9
pub const PLATFORM_TYPE_MAX_405: i32 = 9;

/// Highest platform type for SDK 4.0.10 and newer
pub const PLATFORM_TYPE_MAX_410: i32 = 10;

const FALLBACK_FLAGS_COUNT_400: u32 = 11;
const FALLBACK_FLAGS_COUNT_401: u32 = 12;

/// Reasons an SDK reports for falling back to direct
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackFlags(pub u32);

impl FallbackFlags {
    /// Route token failed to decrypt
    pub const BAD_ROUTE_TOKEN: u32 = 1 << 0;
    /// Continue requested with no route held
    pub const NO_NEXT_ROUTE_TO_CONTINUE: u32 = 1 << 1;
    /// Previous update never answered
    pub const PREVIOUS_UPDATE_STILL_PENDING: u32 = 1 << 2;
    /// Continue token failed to decrypt
    pub const BAD_CONTINUE_TOKEN: u32 = 1 << 3;
    /// Route expired before renewal
    pub const ROUTE_EXPIRED: u32 = 1 << 4;
    /// Route request went unanswered
    pub const ROUTE_REQUEST_TIMED_OUT: u32 = 1 << 5;
    /// Continue request went unanswered
    pub const CONTINUE_REQUEST_TIMED_OUT: u32 = 1 << 6;
    /// Client stopped responding
    pub const CLIENT_TIMED_OUT: u32 = 1 << 7;
    /// Upgrade response went unanswered
    pub const UPGRADE_RESPONSE_TIMED_OUT: u32 = 1 << 8;
    /// Route update went unanswered
    pub const ROUTE_UPDATE_TIMED_OUT: u32 = 1 << 9;
    /// Direct pong went unanswered
    pub const DIRECT_PONG_TIMED_OUT: u32 = 1 << 10;
    /// Next pong went unanswered
    pub const NEXT_PONG_TIMED_OUT: u32 = 1 << 11;

    /// Check whether `flag` is set
    #[must_use]
    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    /// Whether no known flag is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 & ((1 << FALLBACK_FLAGS_COUNT_401) - 1) == 0
    }
}

/// Per-slice update sent by a game server for one client session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUpdatePacket {
    /// SDK version of the server
    pub version: SdkVersion,
    /// Buyer (customer) id
    pub buyer_id: u64,
    /// Datacenter id
    pub datacenter_id: u64,
    /// Session id
    pub session_id: u64,
    /// Slice number; zero for a new session
    pub slice_number: u32,
    /// Resend counter for this slice
    pub retry_number: i32,
    /// Session data returned in the previous response
    pub session_data: Vec<u8>,
    /// Client address
    pub client_address: Option<SocketAddr>,
    /// Server address
    pub server_address: Option<SocketAddr>,
    /// Client route public key
    pub client_route_public_key: [u8; 32],
    /// Server route public key
    pub server_route_public_key: [u8; 32],
    /// Hashed user id
    pub user_hash: u64,
    /// Platform type
    pub platform_type: i32,
    /// Connection type
    pub connection_type: i32,
    /// Session is currently on a network next route
    pub next: bool,
    /// Session committed to its route
    pub committed: bool,
    /// Player reported a problem
    pub reported: bool,
    /// SDK fell back to direct
    pub fallback_to_direct: bool,
    /// Client exceeded its bandwidth envelope
    pub client_bandwidth_over_limit: bool,
    /// Server exceeded its bandwidth envelope
    pub server_bandwidth_over_limit: bool,
    /// Server lost contact with the client
    pub client_ping_timed_out: bool,
    /// Number of valid entries in `tags`
    pub num_tags: usize,
    /// Session tags (FNV-1a hashes)
    pub tags: [u64; MAX_TAGS],
    /// Fallback reason bits
    pub flags: u32,
    /// Buyer-defined flags
    pub user_flags: u64,
    /// Direct route round trip time (ms)
    pub direct_rtt: f32,
    /// Direct route jitter (ms)
    pub direct_jitter: f32,
    /// Direct route packet loss (%)
    pub direct_packet_loss: f32,
    /// Next route round trip time (ms)
    pub next_rtt: f32,
    /// Next route jitter (ms)
    pub next_jitter: f32,
    /// Next route packet loss (%)
    pub next_packet_loss: f32,
    /// Number of valid near relay entries
    pub num_near_relays: usize,
    /// Near relay ids
    pub near_relay_ids: [u64; MAX_NEAR_RELAYS],
    /// Near relay round trip times
    pub near_relay_rtt: [i32; MAX_NEAR_RELAYS],
    /// Near relay jitter
    pub near_relay_jitter: [i32; MAX_NEAR_RELAYS],
    /// Near relay packet loss
    pub near_relay_packet_loss: [i32; MAX_NEAR_RELAYS],
    /// Next route bandwidth up (kbps)
    pub next_kbps_up: u32,
    /// Next route bandwidth down (kbps)
    pub next_kbps_down: u32,
    /// Cumulative packets sent client to server
    pub packets_sent_client_to_server: u64,
    /// Cumulative packets sent server to client
    pub packets_sent_server_to_client: u64,
    /// Cumulative packets lost client to server
    pub packets_lost_client_to_server: u64,
    /// Cumulative packets lost server to client
    pub packets_lost_server_to_client: u64,
    /// Cumulative out of order packets client to server
    pub packets_out_of_order_client_to_server: u64,
    /// Cumulative out of order packets server to client
    pub packets_out_of_order_server_to_client: u64,
    /// Jitter client to server (ms)
    pub jitter_client_to_server: f32,
    /// Jitter server to client (ms)
    pub jitter_server_to_client: f32,
}

impl SessionUpdatePacket {
    /// Valid tags
    #[must_use]
    pub fn tags(&self) -> &[u64] {
        &self.tags[..self.num_tags.min(MAX_TAGS)]
    }

    /// Valid near relay ids
    #[must_use]
    pub fn near_relay_ids(&self) -> &[u64] {
        &self.near_relay_ids[..self.num_near_relays.min(MAX_NEAR_RELAYS)]
    }

    /// Fallback reason bits as flags
    #[must_use]
    pub fn fallback_flags(&self) -> FallbackFlags {
        FallbackFlags(self.flags)
    }

    fn platform_type_max(version: SdkVersion) -> i32 {
        if version.at_least(4, 0, 10) {
            PLATFORM_TYPE_MAX_410
        } else if version.at_least(4, 0, 5) {
            PLATFORM_TYPE_MAX_405
        } else {
            PLATFORM_TYPE_MAX_404
        }
    }

    fn flag_bits(version: SdkVersion) -> u32 {
        if version.at_least(4, 0, 1) {
            FALLBACK_FLAGS_COUNT_401
        } else {
            FALLBACK_FLAGS_COUNT_400
        }
    }

    /// Decode an update body.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] on truncated or out-of-range input.
    pub fn unmarshal(data: &[u8]) -> Result<Self, PacketError> {
        let mut stream = ReadStream::new(data);
        let mut packet = Self {
            version: SdkVersion::read(&mut stream)?,
            ..Default::default()
        };
        let version = packet.version;

        packet.buyer_id = stream.read_u64()?;
        packet.datacenter_id = stream.read_u64()?;
        packet.session_id = stream.read_u64()?;
        packet.slice_number = stream.read_u32()?;
        packet.retry_number = stream.read_integer(0, MAX_SESSION_UPDATE_RETRIES)?;

        let session_data_bytes = stream.read_count(MAX_SESSION_DATA_SIZE)?;
        if session_data_bytes > 0 {
            packet.session_data = stream.read_bytes(session_data_bytes)?.to_vec();
        }

        packet.client_address = stream.read_address()?;
        packet.server_address = stream.read_address()?;
        packet.client_route_public_key = stream.read_array::<32>()?;
        packet.server_route_public_key = stream.read_array::<32>()?;
        packet.user_hash = stream.read_u64()?;

        packet.platform_type = stream.read_integer(0, Self::platform_type_max(version))?;
        packet.connection_type = stream.read_integer(0, CONNECTION_TYPE_MAX)?;

        packet.next = stream.read_bool()?;
        packet.committed = stream.read_bool()?;
        packet.reported = stream.read_bool()?;
        packet.fallback_to_direct = stream.read_bool()?;
        packet.client_bandwidth_over_limit = stream.read_bool()?;
        packet.server_bandwidth_over_limit = stream.read_bool()?;
        if version.at_least(4, 0, 2) {
            packet.client_ping_timed_out = stream.read_bool()?;
        }

        let has_tags = stream.read_bool()?;
        let has_flags = stream.read_bool()?;
        let has_user_flags = stream.read_bool()?;
        let has_lost_packets = stream.read_bool()?;
        let has_out_of_order_packets = stream.read_bool()?;

        if has_tags {
            if version.at_least(4, 0, 3) {
                packet.num_tags = stream.read_count(MAX_TAGS)?;
                for tag in &mut packet.tags[..packet.num_tags] {
                    *tag = stream.read_u64()?;
                }
            } else {
                packet.tags[0] = stream.read_u64()?;
                packet.num_tags = 1;
            }
        }

        if has_flags {
            packet.flags = stream.read_bits(Self::flag_bits(version))?;
        }

        if has_user_flags {
            packet.user_flags = stream.read_u64()?;
        }

        packet.direct_rtt = stream.read_f32()?;
        packet.direct_jitter = stream.read_f32()?;
        packet.direct_packet_loss = stream.read_f32()?;

        if packet.next {
            packet.next_rtt = stream.read_f32()?;
            packet.next_jitter = stream.read_f32()?;
            packet.next_packet_loss = stream.read_f32()?;
        }

        packet.num_near_relays = stream.read_count(MAX_NEAR_RELAYS)?;
        for i in 0..packet.num_near_relays {
            packet.near_relay_ids[i] = stream.read_u64()?;
            if version.at_least(4, 0, 4) {
                packet.near_relay_rtt[i] = stream.read_integer(0, 255)?;
                packet.near_relay_jitter[i] = stream.read_integer(0, 255)?;
                packet.near_relay_packet_loss[i] = stream.read_integer(0, 100)?;
            } else {
                let rtt = stream.read_f32()?;
                let jitter = stream.read_f32()?;
                let packet_loss = stream.read_f32()?;
                packet.near_relay_rtt[i] = f64::from(rtt).ceil() as i32;
                packet.near_relay_jitter[i] = f64::from(jitter).ceil() as i32;
                packet.near_relay_packet_loss[i] = f64::from(packet_loss + 0.5).floor() as i32;
            }
        }

        if packet.next {
            packet.next_kbps_up = stream.read_u32()?;
            packet.next_kbps_down = stream.read_u32()?;
        }

        packet.packets_sent_client_to_server = stream.read_u64()?;
        packet.packets_sent_server_to_client = stream.read_u64()?;

        if has_lost_packets {
            packet.packets_lost_client_to_server = stream.read_u64()?;
            packet.packets_lost_server_to_client = stream.read_u64()?;
        }

        if has_out_of_order_packets {
            packet.packets_out_of_order_client_to_server = stream.read_u64()?;
            packet.packets_out_of_order_server_to_client = stream.read_u64()?;
        }

        packet.jitter_client_to_server = stream.read_f32()?;
        packet.jitter_server_to_client = stream.read_f32()?;

        Ok(packet)
    }
}

impl Packet for SessionUpdatePacket {
    const PACKET_TYPE: PacketType = PacketType::SessionUpdate;

    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        let version = self.version;
        self.version.write(stream)?;

        stream.write_u64(self.buyer_id)?;
        stream.write_u64(self.datacenter_id)?;
        stream.write_u64(self.session_id)?;
        stream.write_u32(self.slice_number)?;
        stream.write_integer(self.retry_number, 0, MAX_SESSION_UPDATE_RETRIES)?;

        if self.session_data.len() > MAX_SESSION_DATA_SIZE {
            return Err(PacketError::FieldTooLarge {
                field: "session_data",
                len: self.session_data.len(),
                max: MAX_SESSION_DATA_SIZE,
            });
        }
        stream.write_count(self.session_data.len(), MAX_SESSION_DATA_SIZE)?;
        if !self.session_data.is_empty() {
            stream.write_bytes(&self.session_data)?;
        }

        stream.write_address(self.client_address.as_ref())?;
        stream.write_address(self.server_address.as_ref())?;
        stream.write_bytes(&self.client_route_public_key)?;
        stream.write_bytes(&self.server_route_public_key)?;
        stream.write_u64(self.user_hash)?;

        stream.write_integer(self.platform_type, 0, Self::platform_type_max(version))?;
        stream.write_integer(self.connection_type, 0, CONNECTION_TYPE_MAX)?;

        stream.write_bool(self.next)?;
        stream.write_bool(self.committed)?;
        stream.write_bool(self.reported)?;
        stream.write_bool(self.fallback_to_direct)?;
        stream.write_bool(self.client_bandwidth_over_limit)?;
        stream.write_bool(self.server_bandwidth_over_limit)?;
        if version.at_least(4, 0, 2) {
            stream.write_bool(self.client_ping_timed_out)?;
        }

        let has_tags = self.num_tags > 0;
        let has_flags = self.flags != 0;
        let has_user_flags = self.user_flags != 0;
        let has_lost_packets =
            self.packets_lost_client_to_server != 0 || self.packets_lost_server_to_client != 0;
        let has_out_of_order_packets = self.packets_out_of_order_client_to_server != 0
            || self.packets_out_of_order_server_to_client != 0;

        stream.write_bool(has_tags)?;
        stream.write_bool(has_flags)?;
        stream.write_bool(has_user_flags)?;
        stream.write_bool(has_lost_packets)?;
        stream.write_bool(has_out_of_order_packets)?;

        if has_tags {
            if version.at_least(4, 0, 3) {
                stream.write_count(self.num_tags, MAX_TAGS)?;
                for tag in self.tags() {
                    stream.write_u64(*tag)?;
                }
            } else {
                stream.write_u64(self.tags[0])?;
            }
        }

        if has_flags {
            stream.write_bits(self.flags, Self::flag_bits(version))?;
        }

        if has_user_flags {
            stream.write_u64(self.user_flags)?;
        }

        stream.write_f32(self.direct_rtt)?;
        stream.write_f32(self.direct_jitter)?;
        stream.write_f32(self.direct_packet_loss)?;

        if self.next {
            stream.write_f32(self.next_rtt)?;
            stream.write_f32(self.next_jitter)?;
            stream.write_f32(self.next_packet_loss)?;
        }

        stream.write_count(self.num_near_relays, MAX_NEAR_RELAYS)?;
        for i in 0..self.num_near_relays {
            stream.write_u64(self.near_relay_ids[i])?;
            if version.at_least(4, 0, 4) {
                stream.write_integer(self.near_relay_rtt[i], 0, 255)?;
                stream.write_integer(self.near_relay_jitter[i], 0, 255)?;
                stream.write_integer(self.near_relay_packet_loss[i], 0, 100)?;
            } else {
                stream.write_f32(self.near_relay_rtt[i] as f32)?;
                stream.write_f32(self.near_relay_jitter[i] as f32)?;
                stream.write_f32(self.near_relay_packet_loss[i] as f32)?;
            }
        }

        if self.next {
            stream.write_u32(self.next_kbps_up)?;
            stream.write_u32(self.next_kbps_down)?;
        }

        stream.write_u64(self.packets_sent_client_to_server)?;
        stream.write_u64(self.packets_sent_server_to_client)?;

        if has_lost_packets {
            stream.write_u64(self.packets_lost_client_to_server)?;
            stream.write_u64(self.packets_lost_server_to_client)?;
        }

        if has_out_of_order_packets {
            stream.write_u64(self.packets_out_of_order_client_to_server)?;
            stream.write_u64(self.packets_out_of_order_server_to_client)?;
        }

        stream.write_f32(self.jitter_client_to_server)?;
        stream.write_f32(self.jitter_server_to_client)?;
        Ok(())
    }
}

/// Backend answer to a session update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionResponsePacket {
    /// SDK version of the requester; gates the layout, not serialized
    pub version: SdkVersion,
    /// Session id
    pub session_id: u64,
    /// Slice number echoed from the request
    pub slice_number: u32,
    /// Updated session data for the next slice
    pub session_data: Vec<u8>,
    /// Route the session should take
    pub route_type: RouteType,
    /// Whether the near relay list below replaces the SDK's list
    pub near_relays_changed: bool,
    /// Number of valid near relay entries
    pub num_near_relays: usize,
    /// Near relay ids to ping
    pub near_relay_ids: [u64; MAX_NEAR_RELAYS],
    /// Near relay addresses to ping
    pub near_relay_addresses: [Option<SocketAddr>; MAX_NEAR_RELAYS],
    /// Number of tokens in `tokens`
    pub num_tokens: usize,
    /// Encrypted token chain
    pub tokens: Vec<u8>,
    /// Send over direct and next simultaneously
    pub multipath: bool,
    /// Route committed
    pub committed: bool,
    /// Whether `debug` carries text
    pub has_debug: bool,
    /// Buyer-scoped diagnostic text
    pub debug: String,
    /// Whether `near_relay_excluded` is meaningful
    pub exclude_near_relays: bool,
    /// Near relays the SDK should stop pinging
    pub near_relay_excluded: [bool; MAX_NEAR_RELAYS],
    /// Ping near relays at the high rate
    pub high_frequency_pings: bool,
}

impl SessionResponsePacket {
    fn token_size(route_type: RouteType) -> usize {
        match route_type {
            RouteType::Direct => 0,
            RouteType::New => ENCRYPTED_ROUTE_TOKEN_SIZE,
            RouteType::Continue => ENCRYPTED_CONTINUE_TOKEN_SIZE,
        }
    }

    /// Decode a response body written for an SDK at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] on truncated or out-of-range input.
    pub fn unmarshal(data: &[u8], version: SdkVersion) -> Result<Self, PacketError> {
        let mut stream = ReadStream::new(data);
        let mut packet = Self {
            version,
            ..Default::default()
        };

        packet.session_id = stream.read_u64()?;
        packet.slice_number = stream.read_u32()?;

        let session_data_bytes = stream.read_count(MAX_SESSION_DATA_SIZE)?;
        if session_data_bytes > 0 {
            packet.session_data = stream.read_bytes(session_data_bytes)?.to_vec();
        }

        packet.route_type = RouteType::try_from(stream.read_integer(0, RouteType::Continue as i32)?)?;

        packet.near_relays_changed = if version.at_least(4, 0, 4) {
            stream.read_bool()?
        } else {
            true
        };

        if packet.near_relays_changed {
            packet.num_near_relays = stream.read_count(MAX_NEAR_RELAYS)?;
            for i in 0..packet.num_near_relays {
                packet.near_relay_ids[i] = stream.read_u64()?;
                packet.near_relay_addresses[i] = stream.read_address()?;
            }
        }

        if packet.route_type != RouteType::Direct {
            packet.multipath = stream.read_bool()?;
            packet.committed = stream.read_bool()?;
            packet.num_tokens = stream.read_count(MAX_TOKENS)?;
            let len = packet.num_tokens * Self::token_size(packet.route_type);
            packet.tokens = stream.read_bytes(len)?.to_vec();
        }

        if version.at_least(4, 0, 4) {
            packet.has_debug = stream.read_bool()?;
            packet.debug = stream.read_string(MAX_DEBUG_LENGTH)?;
        }

        if version.at_least(4, 0, 5) {
            packet.exclude_near_relays = stream.read_bool()?;
            if packet.exclude_near_relays {
                for excluded in &mut packet.near_relay_excluded {
                    *excluded = stream.read_bool()?;
                }
            }
        }

        if version.at_least(4, 0, 6) {
            packet.high_frequency_pings = stream.read_bool()?;
        }

        Ok(packet)
    }
}

impl Packet for SessionResponsePacket {
    const PACKET_TYPE: PacketType = PacketType::SessionResponse;

    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        let version = self.version;

        stream.write_u64(self.session_id)?;
        stream.write_u32(self.slice_number)?;

        if self.session_data.len() > MAX_SESSION_DATA_SIZE {
            return Err(PacketError::FieldTooLarge {
                field: "session_data",
                len: self.session_data.len(),
                max: MAX_SESSION_DATA_SIZE,
            });
        }
        stream.write_count(self.session_data.len(), MAX_SESSION_DATA_SIZE)?;
        if !self.session_data.is_empty() {
            stream.write_bytes(&self.session_data)?;
        }

        stream.write_integer(self.route_type as i32, 0, RouteType::Continue as i32)?;

        let near_relays_changed = if version.at_least(4, 0, 4) {
            stream.write_bool(self.near_relays_changed)?;
            self.near_relays_changed
        } else {
            true
        };

        if near_relays_changed {
            stream.write_count(self.num_near_relays, MAX_NEAR_RELAYS)?;
            for i in 0..self.num_near_relays {
                stream.write_u64(self.near_relay_ids[i])?;
                stream.write_address(self.near_relay_addresses[i].as_ref())?;
            }
        }

        if self.route_type != RouteType::Direct {
            stream.write_bool(self.multipath)?;
            stream.write_bool(self.committed)?;
            stream.write_count(self.num_tokens, MAX_TOKENS)?;

            let expected = self.num_tokens * Self::token_size(self.route_type);
            if self.tokens.len() != expected {
                return Err(PacketError::FieldTooLarge {
                    field: "tokens",
                    len: self.tokens.len(),
                    max: expected,
                });
            }
            stream.write_bytes(&self.tokens)?;
        }

        if version.at_least(4, 0, 4) {
            stream.write_bool(self.has_debug)?;
            stream.write_string(&self.debug, MAX_DEBUG_LENGTH)?;
        }

        if version.at_least(4, 0, 5) {
            stream.write_bool(self.exclude_near_relays)?;
            if self.exclude_near_relays {
                for excluded in self.near_relay_excluded {
                    stream.write_bool(excluded)?;
                }
            }
        }

        if version.at_least(4, 0, 6) {
            stream.write_bool(self.high_frequency_pings)?;
        }

        Ok(())
    }
}
