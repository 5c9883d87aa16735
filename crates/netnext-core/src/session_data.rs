//! Per-session state round-tripped through the SDK.
//!
//! The backend keeps no session store. Each response carries a
//! [`SessionData`] blob that the SDK echoes on the next slice. The layout is
//! append-only: fields added by later layout versions are read only when the
//! blob's version says they are present.

use crate::encoding::{ReadStream, WriteStream};
use crate::error::PacketError;
use crate::routing::{Location, RouteState};
use crate::{
    INVALID_ROUTE_VALUE, MAX_NEAR_RELAYS, MAX_RELAYS_PER_ROUTE, MAX_SESSION_DATA_SIZE,
    SESSION_DATA_VERSION,
};

/// Oldest layout version still accepted
pub const MIN_SESSION_DATA_VERSION: u32 = 8;

const BYTE_MAX: i32 = 255;

/// Session state carried between slices
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionData {
    /// Layout version; zero is stamped with the current version on marshal
    pub version: u32,
    /// Session id, fixed for the session's lifetime
    pub session_id: u64,
    /// Bumped whenever a new route token chain is issued
    pub session_version: u8,
    /// Slice number the SDK must send next
    pub slice_number: u32,
    /// Unix seconds at which the current tokens expire
    pub expire_timestamp: u64,
    /// Tokens issued this slice are double length
    pub initial: bool,
    /// Client location resolved on slice 0
    pub location: Location,
    /// Route relays differ from the previous slice
    pub route_changed: bool,
    /// Relays on the current route
    pub route_num_relays: usize,
    /// Predicted RTT of the current route
    pub route_cost: i32,
    /// Relay ids on the current route
    pub route_relay_ids: [u64; MAX_RELAYS_PER_ROUTE],
    /// Routing decision state
    pub route_state: RouteState,
    /// Session has been on a relay route at least once
    pub ever_on_next: bool,
    /// SDK fallback to direct has been recorded
    pub fell_back_to_direct: bool,
    /// Cumulative client to server packets sent at the previous slice
    pub prev_packets_sent_client_to_server: u64,
    /// Cumulative server to client packets sent at the previous slice
    pub prev_packets_sent_server_to_client: u64,
    /// Cumulative client to server packets lost at the previous slice
    pub prev_packets_lost_client_to_server: u64,
    /// Cumulative server to client packets lost at the previous slice
    pub prev_packets_lost_server_to_client: u64,
    /// Near relay set is frozen
    pub hold_near_relays: bool,
    /// Near relay RTTs captured when the set was frozen
    pub hold_near_relay_rtt: [i32; MAX_NEAR_RELAYS],
    /// Session summary already emitted
    pub wrote_summary: bool,
}

impl SessionData {
    /// Relay ids on the current route
    #[must_use]
    pub fn route_relay_ids(&self) -> &[u64] {
        &self.route_relay_ids[..self.route_num_relays.min(MAX_RELAYS_PER_ROUTE)]
    }

    /// Replace the current route relays.
    pub fn set_route(&mut self, relay_ids: &[u64], cost: i32) {
        let count = relay_ids.len().min(MAX_RELAYS_PER_ROUTE);
        self.route_relay_ids = [0; MAX_RELAYS_PER_ROUTE];
        self.route_relay_ids[..count].copy_from_slice(&relay_ids[..count]);
        self.route_num_relays = count;
        self.route_cost = cost.min(INVALID_ROUTE_VALUE);
    }

    /// Encode the blob, stamping the current version if none is set.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if a field is out of range or the blob would
    /// exceed [`MAX_SESSION_DATA_SIZE`].
    pub fn marshal(&mut self) -> Result<Vec<u8>, PacketError> {
        if self.version == 0 {
            self.version = SESSION_DATA_VERSION;
        }
        let mut stream = WriteStream::new(MAX_SESSION_DATA_SIZE);
        self.write(&mut stream)?;
        Ok(stream.finish())
    }

    /// Decode a blob echoed by the SDK.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::InvalidSessionDataVersion`] for layouts older
    /// than [`MIN_SESSION_DATA_VERSION`] and [`PacketError`] on truncated or
    /// out-of-range input.
    pub fn unmarshal(data: &[u8]) -> Result<Self, PacketError> {
        let mut stream = ReadStream::new(data);
        let mut data = Self {
            version: stream.read_bits(8)?,
            ..Self::default()
        };
        if data.version < MIN_SESSION_DATA_VERSION {
            return Err(PacketError::InvalidSessionDataVersion(data.version));
        }

        data.session_id = stream.read_u64()?;
        data.session_version = stream.read_bits(8)? as u8;
        data.slice_number = stream.read_u32()?;
        data.expire_timestamp = stream.read_u64()?;
        data.initial = stream.read_bool()?;

        let location_size = stream.read_u32()? as usize;
        if location_size > MAX_SESSION_DATA_SIZE {
            return Err(PacketError::InvalidLocation("location size"));
        }
        data.location = Location::unmarshal_binary(stream.read_bytes(location_size)?)?;

        data.route_changed = stream.read_bool()?;
        let has_route = stream.read_bool()?;
        data.route_cost = stream.read_integer(0, INVALID_ROUTE_VALUE)?;
        if has_route {
            data.route_num_relays = stream.read_count(MAX_RELAYS_PER_ROUTE)?;
            for i in 0..data.route_num_relays {
                data.route_relay_ids[i] = stream.read_u64()?;
            }
        }

        let state = &mut data.route_state;
        state.user_id = stream.read_u64()?;
        state.next = stream.read_bool()?;
        state.veto = stream.read_bool()?;
        state.banned = stream.read_bool()?;
        state.disabled = stream.read_bool()?;
        state.not_selected = stream.read_bool()?;
        state.ab_test = stream.read_bool()?;
        state.a = stream.read_bool()?;
        state.b = stream.read_bool()?;
        state.forced_next = stream.read_bool()?;
        state.reduce_latency = stream.read_bool()?;
        state.reduce_packet_loss = stream.read_bool()?;
        state.pro_mode = stream.read_bool()?;
        state.multipath = stream.read_bool()?;
        state.committed = stream.read_bool()?;
        state.commit_veto = stream.read_bool()?;
        state.commit_counter = stream.read_integer(0, 4)?;
        state.latency_worse = stream.read_bool()?;
        state.multipath_overload = stream.read_bool()?;
        state.no_route = stream.read_bool()?;
        state.next_latency_too_high = stream.read_bool()?;
        state.mispredict = stream.read_bool()?;
        data.ever_on_next = stream.read_bool()?;
        data.fell_back_to_direct = stream.read_bool()?;

        let state = &mut data.route_state;
        state.num_near_relays = stream.read_count(MAX_NEAR_RELAYS)?;
        for i in 0..state.num_near_relays {
            state.near_relay_rtt[i] = stream.read_integer(0, BYTE_MAX)?;
            state.near_relay_jitter[i] = stream.read_integer(0, BYTE_MAX)?;
            state.near_relay_pl_history[i] = stream.read_integer(0, BYTE_MAX)? as u32;
        }
        state.direct_pl_history = stream.read_integer(0, BYTE_MAX)? as u32;
        state.pl_history_index = stream.read_integer(0, 7)?;
        state.pl_history_samples = stream.read_integer(0, 8)?;

        state.relay_went_away = stream.read_bool()?;
        state.route_lost = stream.read_bool()?;
        state.direct_jitter = stream.read_integer(0, BYTE_MAX)?;
        state.direct_pl_count = stream.read_u32()?;
        for i in 0..state.num_near_relays {
            state.near_relay_pl_count[i] = stream.read_u32()?;
        }

        state.lack_of_diversity = stream.read_bool()?;
        state.mispredict_counter = stream.read_bits(2)?;
        state.latency_worse_counter = stream.read_bits(2)?;

        if data.version >= 9 {
            data.route_state.multipath_restricted = stream.read_bool()?;
            data.prev_packets_sent_client_to_server = stream.read_u64()?;
            data.prev_packets_sent_server_to_client = stream.read_u64()?;
            data.prev_packets_lost_client_to_server = stream.read_u64()?;
            data.prev_packets_lost_server_to_client = stream.read_u64()?;
        }

        if data.version >= 10 {
            data.route_state.location_veto = stream.read_bool()?;
        }

        if data.version >= 11 {
            data.hold_near_relays = stream.read_bool()?;
            if data.hold_near_relays {
                for rtt in &mut data.hold_near_relay_rtt {
                    *rtt = stream.read_integer(0, BYTE_MAX)?;
                }
            }
        }

        if data.version >= 12 {
            data.route_state.pl_sustained_counter = stream.read_integer(0, 3)?;
        }

        if data.version >= 13 {
            data.wrote_summary = stream.read_bool()?;
        }

        Ok(data)
    }

    fn write(&self, stream: &mut WriteStream) -> Result<(), PacketError> {
        if self.version < MIN_SESSION_DATA_VERSION {
            return Err(PacketError::InvalidSessionDataVersion(self.version));
        }
        stream.write_bits(self.version, 8)?;

        stream.write_u64(self.session_id)?;
        stream.write_bits(u32::from(self.session_version), 8)?;
        stream.write_u32(self.slice_number)?;
        stream.write_u64(self.expire_timestamp)?;
        stream.write_bool(self.initial)?;

        let location = self.location.marshal_binary();
        stream.write_u32(location.len() as u32)?;
        stream.write_bytes(&location)?;

        stream.write_bool(self.route_changed)?;
        let has_route = self.route_num_relays > 0;
        stream.write_bool(has_route)?;
        stream.write_integer(self.route_cost, 0, INVALID_ROUTE_VALUE)?;
        if has_route {
            stream.write_count(self.route_num_relays, MAX_RELAYS_PER_ROUTE)?;
            for id in self.route_relay_ids() {
                stream.write_u64(*id)?;
            }
        }

        let state = &self.route_state;
        stream.write_u64(state.user_id)?;
        for flag in [
            state.next,
            state.veto,
            state.banned,
            state.disabled,
            state.not_selected,
            state.ab_test,
            state.a,
            state.b,
            state.forced_next,
            state.reduce_latency,
            state.reduce_packet_loss,
            state.pro_mode,
            state.multipath,
            state.committed,
            state.commit_veto,
        ] {
            stream.write_bool(flag)?;
        }
        stream.write_integer(state.commit_counter, 0, 4)?;
        for flag in [
            state.latency_worse,
            state.multipath_overload,
            state.no_route,
            state.next_latency_too_high,
            state.mispredict,
            self.ever_on_next,
            self.fell_back_to_direct,
        ] {
            stream.write_bool(flag)?;
        }

        stream.write_count(state.num_near_relays, MAX_NEAR_RELAYS)?;
        let near = state.num_near_relays.min(MAX_NEAR_RELAYS);
        for i in 0..near {
            stream.write_integer(state.near_relay_rtt[i], 0, BYTE_MAX)?;
            stream.write_integer(state.near_relay_jitter[i], 0, BYTE_MAX)?;
            stream.write_integer(state.near_relay_pl_history[i] as i32, 0, BYTE_MAX)?;
        }
        stream.write_integer(state.direct_pl_history as i32, 0, BYTE_MAX)?;
        stream.write_integer(state.pl_history_index, 0, 7)?;
        stream.write_integer(state.pl_history_samples, 0, 8)?;

        stream.write_bool(state.relay_went_away)?;
        stream.write_bool(state.route_lost)?;
        stream.write_integer(state.direct_jitter, 0, BYTE_MAX)?;
        stream.write_u32(state.direct_pl_count)?;
        for count in &state.near_relay_pl_count[..near] {
            stream.write_u32(*count)?;
        }

        stream.write_bool(state.lack_of_diversity)?;
        stream.write_bits(state.mispredict_counter, 2)?;
        stream.write_bits(state.latency_worse_counter, 2)?;

        if self.version >= 9 {
            stream.write_bool(state.multipath_restricted)?;
            stream.write_u64(self.prev_packets_sent_client_to_server)?;
            stream.write_u64(self.prev_packets_sent_server_to_client)?;
            stream.write_u64(self.prev_packets_lost_client_to_server)?;
            stream.write_u64(self.prev_packets_lost_server_to_client)?;
        }

        if self.version >= 10 {
            stream.write_bool(state.location_veto)?;
        }

        if self.version >= 11 {
            stream.write_bool(self.hold_near_relays)?;
            if self.hold_near_relays {
                for rtt in &self.hold_near_relay_rtt {
                    stream.write_integer(*rtt, 0, BYTE_MAX)?;
                }
            }
        }

        if self.version >= 12 {
            stream.write_integer(state.pl_sustained_counter, 0, 3)?;
        }

        if self.version >= 13 {
            stream.write_bool(self.wrote_summary)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EncodingError;

    fn populated() -> SessionData {
        let mut data = SessionData {
            session_id: 0x1122_3344_5566_7788,
            session_version: 3,
            slice_number: 42,
            expire_timestamp: 1_700_000_020,
            initial: true,
            location: Location {
                latitude: 43.6,
                longitude: -79.4,
                isp: "Rogers".into(),
                asn: 812,
            },
            route_changed: true,
            ever_on_next: true,
            prev_packets_sent_client_to_server: 6000,
            prev_packets_lost_server_to_client: 12,
            hold_near_relays: true,
            wrote_summary: true,
            ..SessionData::default()
        };
        data.set_route(&[7, 8, 9], 41);
        data.hold_near_relay_rtt[5] = 17;

        let state = &mut data.route_state;
        state.user_id = 99;
        state.next = true;
        state.committed = true;
        state.multipath = true;
        state.commit_counter = 2;
        state.num_near_relays = 2;
        state.near_relay_rtt[..2].copy_from_slice(&[10, 200]);
        state.near_relay_jitter[..2].copy_from_slice(&[1, 2]);
        state.near_relay_pl_history[..2].copy_from_slice(&[0, 255]);
        state.near_relay_pl_count[..2].copy_from_slice(&[0, 70_000]);
        state.pl_history_index = 7;
        state.pl_history_samples = 8;
        state.direct_jitter = 14;
        state.mispredict_counter = 3;
        state.latency_worse_counter = 1;
        state.multipath_restricted = true;
        state.location_veto = true;
        state.pl_sustained_counter = 3;
        data
    }

    #[test]
    fn test_session_data_roundtrip() {
        let mut data = populated();
        let bytes = data.marshal().unwrap();
        assert_eq!(data.version, SESSION_DATA_VERSION);
        assert!(bytes.len() <= MAX_SESSION_DATA_SIZE);

        let decoded = SessionData::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, data);
        assert_eq!(decoded.route_relay_ids(), &[7, 8, 9]);
    }

    #[test]
    fn test_session_data_rejects_old_version() {
        let bytes = [7u8; 64];
        assert_eq!(
            SessionData::unmarshal(&bytes),
            Err(PacketError::InvalidSessionDataVersion(7))
        );
    }

    #[test]
    fn test_session_data_older_layout_skips_new_fields() {
        let mut data = populated();
        data.version = 10;
        let bytes = data.marshal().unwrap();
        let decoded = SessionData::unmarshal(&bytes).unwrap();

        assert_eq!(decoded.version, 10);
        assert!(decoded.route_state.location_veto);
        assert!(!decoded.hold_near_relays);
        assert!(!decoded.wrote_summary);
        assert_eq!(decoded.route_state.pl_sustained_counter, 0);
    }

    #[test]
    fn test_session_data_truncated() {
        let mut data = populated();
        let bytes = data.marshal().unwrap();
        let err = SessionData::unmarshal(&bytes[..bytes.len() / 2]).unwrap_err();
        assert_eq!(err, PacketError::Encoding(EncodingError::ReadPastEnd));
    }

    #[test]
    fn test_session_data_out_of_range_field() {
        let mut data = populated();
        data.route_state.near_relay_rtt[0] = 300;
        assert!(matches!(
            data.marshal(),
            Err(PacketError::Encoding(EncodingError::ValueOutOfRange { .. }))
        ));
    }

    #[test]
    fn test_session_data_route_cost_clamped() {
        let mut data = SessionData::default();
        data.set_route(&[1], i32::MAX);
        assert_eq!(data.route_cost, INVALID_ROUTE_VALUE);
    }
}
