//! Session update pipeline.
//!
//! Every slice the SDK reports its measurements together with the session
//! data blob handed out on the previous slice. The pipeline authenticates
//! the packet, advances the blob, decides the route for the next slice and
//! answers with the new blob. Any stage may end the slice early with a
//! [`ShortCircuit`]; the session then goes direct and the response carries
//! the state as of that stage.

use std::sync::Arc;

use netnext_crypto::{hash_id, verify_packet};
use tracing::{debug, warn};

use super::{DatacenterError, HandlerContext, resolve_datacenter, unix_now};
use crate::billing::{
    BILLING_ENTRY_VERSION, BillingEntry2, envelope_bytes, relay_egress_price, route_relay_prices,
    split_packet_loss, total_price, truncate_utf8,
};
use crate::error::{LocateError, PacketError, TokenError};
use crate::metrics::{Counter, SessionUpdateMetrics};
use crate::packets::{FallbackFlags, Packet, SessionResponsePacket, SessionUpdatePacket};
use crate::portal::{
    NearRelayPortalData, PathStats, RelayHop, SESSION_PORTAL_DATA_VERSION, SessionMapPoint,
    SessionMeta, SessionPortalData, SessionSlice,
};
use crate::routing::{
    Buyer, Datacenter, Location, Nibblin, RouteInputs, RouteMatrix, RouteSelection, RouteType,
    StayDecision, TakeDecision, near_relay_cost, reframe_near_relays,
};
use crate::session_data::SessionData;
use crate::tokens::{
    RouteEndpoints, RouteHops, build_continue_tokens, build_next_tokens,
    route_addresses_and_public_keys,
};
use crate::{
    BILLING_SLICE_SECONDS, INVALID_ROUTE_VALUE, MAX_DEBUG_LENGTH, MAX_NEAR_RELAYS,
    SESSION_DATA_VERSION,
};

/// Slice number from which large customers stop pinging near relays
const HOLD_NEAR_RELAYS_SLICE: u32 = 4;

/// Real jitter ceiling in milliseconds
const MAX_REAL_JITTER: f32 = 1000.0;

/// Why a slice ended before a route decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortCircuit {
    /// Buyer id unknown; no response
    BuyerNotFound,
    /// Packet signature did not verify; no response
    SignatureCheckFailed,
    /// Buyer is not live
    BuyerNotLive,
    /// The client stopped answering pings; this is the session's last slice
    ClientPingTimedOut,
    /// Route matrix is older than the configured maximum age
    StaleRouteMatrix,
    /// Datacenter id unknown
    UnknownDatacenter,
    /// Buyer alias resolves to a datacenter that does not exist
    DatacenterMisconfiguredAlias,
    /// Buyer may not use this datacenter
    DatacenterNotEnabled,
    /// Client could not be located
    ClientLocateFailure,
    /// Session data blob did not decode
    ReadSessionDataFailure,
    /// Blob belongs to another session
    BadSessionId,
    /// Blob belongs to another slice
    BadSliceNumber,
    /// SDK fell back to direct
    FallbackToDirect,
    /// Destination datacenter has no relays
    NoRelaysInDatacenter,
}

impl ShortCircuit {
    /// Whether the sender gets a response
    #[must_use]
    pub fn responds(self) -> bool {
        !matches!(self, Self::BuyerNotFound | Self::SignatureCheckFailed)
    }

    fn record(self, metrics: &SessionUpdateMetrics, flags: FallbackFlags) {
        let counter = match self {
            Self::BuyerNotFound => &metrics.buyer_not_found,
            Self::SignatureCheckFailed => &metrics.signature_check_failed,
            Self::BuyerNotLive => &metrics.buyer_not_live,
            Self::ClientPingTimedOut => &metrics.client_ping_timed_out,
            Self::StaleRouteMatrix => &metrics.stale_route_matrix,
            Self::UnknownDatacenter => &metrics.unknown_datacenter,
            Self::DatacenterMisconfiguredAlias => &metrics.datacenter_misconfigured_alias,
            Self::DatacenterNotEnabled => &metrics.datacenter_not_enabled,
            Self::ClientLocateFailure => &metrics.client_locate_failure,
            Self::ReadSessionDataFailure => &metrics.read_session_data_failure,
            Self::BadSessionId => &metrics.bad_session_id,
            Self::BadSliceNumber => &metrics.bad_slice_number,
            Self::NoRelaysInDatacenter => &metrics.no_relays_in_datacenter,
            Self::FallbackToDirect => {
                let mut reported = false;
                for (flag, counter) in fallback_counters(metrics) {
                    if flags.contains(flag) {
                        counter.inc();
                        reported = true;
                    }
                }
                if !reported {
                    metrics.fallback_unknown_reason.inc();
                }
                return;
            }
        };
        counter.inc();
    }
}

fn fallback_counters(metrics: &SessionUpdateMetrics) -> [(u32, &Counter); 12] {
    [
        (FallbackFlags::BAD_ROUTE_TOKEN, &metrics.fallback_bad_route_token),
        (
            FallbackFlags::NO_NEXT_ROUTE_TO_CONTINUE,
            &metrics.fallback_no_next_route_to_continue,
        ),
        (
            FallbackFlags::PREVIOUS_UPDATE_STILL_PENDING,
            &metrics.fallback_previous_update_still_pending,
        ),
        (FallbackFlags::BAD_CONTINUE_TOKEN, &metrics.fallback_bad_continue_token),
        (FallbackFlags::ROUTE_EXPIRED, &metrics.fallback_route_expired),
        (
            FallbackFlags::ROUTE_REQUEST_TIMED_OUT,
            &metrics.fallback_route_request_timed_out,
        ),
        (
            FallbackFlags::CONTINUE_REQUEST_TIMED_OUT,
            &metrics.fallback_continue_request_timed_out,
        ),
        (FallbackFlags::CLIENT_TIMED_OUT, &metrics.fallback_client_timed_out),
        (
            FallbackFlags::UPGRADE_RESPONSE_TIMED_OUT,
            &metrics.fallback_upgrade_response_timed_out,
        ),
        (
            FallbackFlags::ROUTE_UPDATE_TIMED_OUT,
            &metrics.fallback_route_update_timed_out,
        ),
        (FallbackFlags::DIRECT_PONG_TIMED_OUT, &metrics.fallback_direct_pong_timed_out),
        (FallbackFlags::NEXT_PONG_TIMED_OUT, &metrics.fallback_next_pong_timed_out),
    ]
}

/// Handle a session update.
///
/// Returns the framed session response, or `None` when the packet does not
/// decode, the buyer is unknown, the signature fails or the response could
/// not be written.
pub fn handle_session_update(ctx: &HandlerContext, payload: &[u8]) -> Option<Vec<u8>> {
    let metrics = &ctx.metrics.session_update;
    metrics.invocations.inc();

    let packet = match SessionUpdatePacket::unmarshal(payload) {
        Ok(packet) => packet,
        Err(err) => {
            debug!(%err, "could not read session update");
            metrics.read_packet_failure.inc();
            return None;
        }
    };

    debug!(
        buyer_id = format_args!("{:016x}", packet.buyer_id),
        session_id = format_args!("{:016x}", packet.session_id),
        slice = packet.slice_number,
        retry = packet.retry_number,
        "session update"
    );

    let Some(buyer) = ctx.storer.buyer(packet.buyer_id) else {
        ShortCircuit::BuyerNotFound.record(metrics, packet.fallback_flags());
        return None;
    };

    let mut update = SessionUpdate::new(ctx, payload, packet, buyer);
    let outcome = update.run();
    update.finish(outcome)
}

/// How the slice will be carried
enum RoutePlan {
    Direct,
    /// First route after direct
    New(RouteSelection),
    /// Routed session moving to a better route
    Switch(RouteSelection),
    Continue(RouteSelection),
}

/// Per-packet pipeline state
struct SessionUpdate<'a> {
    ctx: &'a HandlerContext,
    payload: &'a [u8],
    packet: SessionUpdatePacket,
    /// Per-slice copy; tags may switch on pro mode
    buyer: Buyer,
    matrix: Arc<RouteMatrix>,
    now: u64,
    datacenter: Datacenter,
    input: SessionData,
    input_error: Option<PacketError>,
    output: SessionData,
    response: SessionResponsePacket,
    debug: Option<String>,
    real_packet_loss: f32,
    real_packet_loss_client_to_server: f32,
    real_packet_loss_server_to_client: f32,
    real_jitter: f32,
    buyer_not_live: bool,
    stale_route_matrix: bool,
    unknown_datacenter: bool,
    datacenter_not_enabled: bool,
}

impl<'a> SessionUpdate<'a> {
    fn new(
        ctx: &'a HandlerContext,
        payload: &'a [u8],
        packet: SessionUpdatePacket,
        buyer: Buyer,
    ) -> Self {
        let (input, input_error) = if packet.slice_number == 0 {
            (SessionData::default(), None)
        } else {
            match SessionData::unmarshal(&packet.session_data) {
                Ok(data) => (data, None),
                Err(err) => (SessionData::default(), Some(err)),
            }
        };

        let response = SessionResponsePacket {
            version: packet.version,
            session_id: packet.session_id,
            slice_number: packet.slice_number,
            route_type: RouteType::Direct,
            ..SessionResponsePacket::default()
        };

        Self {
            ctx,
            payload,
            buyer,
            matrix: ctx.route_matrix(),
            now: unix_now(),
            datacenter: Datacenter::default(),
            output: input.clone(),
            input,
            input_error,
            response,
            debug: None,
            real_packet_loss: 0.0,
            real_packet_loss_client_to_server: 0.0,
            real_packet_loss_server_to_client: 0.0,
            real_jitter: 0.0,
            buyer_not_live: false,
            stale_route_matrix: false,
            unknown_datacenter: false,
            datacenter_not_enabled: false,
            packet,
        }
    }

    fn metrics(&self) -> &'a SessionUpdateMetrics {
        &self.ctx.metrics.session_update
    }

    fn run(&mut self) -> Result<(), ShortCircuit> {
        self.authenticate()?;
        self.check_session_alive()?;
        self.check_datacenter()?;
        self.apply_buyer_options();

        if self.packet.slice_number == 0 {
            self.start_session()?;
        } else {
            self.continue_session()?;
        }

        self.check_fallback()?;
        let dest_relays = self.destination_relays()?;

        if self.packet.slice_number == 0 {
            self.assign_near_relays();
        } else {
            self.make_route_decision(&dest_relays);
        }
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), ShortCircuit> {
        if !self.buyer.live {
            self.buyer_not_live = true;
            return Err(ShortCircuit::BuyerNotLive);
        }
        if !verify_packet(&self.buyer.public_key, self.payload) {
            return Err(ShortCircuit::SignatureCheckFailed);
        }
        Ok(())
    }

    fn check_session_alive(&mut self) -> Result<(), ShortCircuit> {
        if self.packet.client_ping_timed_out {
            return Err(ShortCircuit::ClientPingTimedOut);
        }
        if self
            .matrix
            .is_stale(self.ctx.config.route_matrix_max_age_secs, self.now)
        {
            self.stale_route_matrix = true;
            return Err(ShortCircuit::StaleRouteMatrix);
        }
        Ok(())
    }

    fn check_datacenter(&mut self) -> Result<(), ShortCircuit> {
        match resolve_datacenter(
            self.ctx.storer.as_ref(),
            self.buyer.id,
            self.packet.datacenter_id,
        ) {
            Ok(datacenter) => {
                self.datacenter = datacenter;
                Ok(())
            }
            Err(DatacenterError::Unknown) => {
                self.unknown_datacenter = true;
                Err(ShortCircuit::UnknownDatacenter)
            }
            Err(DatacenterError::MisconfiguredAlias) => {
                Err(ShortCircuit::DatacenterMisconfiguredAlias)
            }
            Err(DatacenterError::NotEnabled) => {
                self.datacenter_not_enabled = true;
                Err(ShortCircuit::DatacenterNotEnabled)
            }
        }
    }

    fn apply_buyer_options(&mut self) {
        if self.buyer.debug {
            self.debug = Some(String::new());
        }
        let pro = hash_id("pro");
        if self.packet.tags().contains(&pro) {
            self.buyer.route_shader.pro_mode = true;
        }
    }

    fn start_session(&mut self) -> Result<(), ShortCircuit> {
        self.output = SessionData {
            version: SESSION_DATA_VERSION,
            session_id: self.packet.session_id,
            slice_number: self.packet.slice_number.saturating_add(1),
            expire_timestamp: self.now + BILLING_SLICE_SECONDS,
            ..SessionData::default()
        };
        self.output.route_state.user_id = self.packet.user_hash;
        self.output.route_state.ab_test = self.buyer.route_shader.ab_test;

        let located = match self.packet.client_address {
            Some(addr) => self.ctx.locator.locate(addr.ip()),
            None => Err(LocateError::Unavailable("no client address".into())),
        };
        match located {
            Ok(location) if !location.is_null_island() => {
                self.output.location = location;
                Ok(())
            }
            Ok(_) => {
                debug!("client located at null island");
                self.output.route_state.location_veto = true;
                Err(ShortCircuit::ClientLocateFailure)
            }
            Err(err) => {
                debug!(%err, "could not locate client");
                self.output.route_state.location_veto = true;
                Err(ShortCircuit::ClientLocateFailure)
            }
        }
    }

    fn continue_session(&mut self) -> Result<(), ShortCircuit> {
        if let Some(err) = &self.input_error {
            warn!(
                buyer_id = format_args!("{:016x}", self.buyer.id),
                %err,
                "could not read session data"
            );
            self.output = SessionData::default();
            return Err(ShortCircuit::ReadSessionDataFailure);
        }
        if self.input.session_id != self.packet.session_id {
            return Err(ShortCircuit::BadSessionId);
        }
        if self.input.slice_number != self.packet.slice_number {
            return Err(ShortCircuit::BadSliceNumber);
        }

        self.output = self.input.clone();
        self.output.initial = false;
        self.output.slice_number = self.output.slice_number.saturating_add(1);
        self.output.expire_timestamp += BILLING_SLICE_SECONDS;

        let packet = &self.packet;
        self.real_packet_loss_client_to_server = real_packet_loss(
            packet.packets_sent_client_to_server,
            self.input.prev_packets_sent_client_to_server,
            packet.packets_lost_client_to_server,
            self.input.prev_packets_lost_client_to_server,
        );
        self.real_packet_loss_server_to_client = real_packet_loss(
            packet.packets_sent_server_to_client,
            self.input.prev_packets_sent_server_to_client,
            packet.packets_lost_server_to_client,
            self.input.prev_packets_lost_server_to_client,
        );
        self.real_packet_loss = self
            .real_packet_loss_client_to_server
            .max(self.real_packet_loss_server_to_client);

        self.real_jitter = packet
            .jitter_client_to_server
            .min(MAX_REAL_JITTER)
            .max(packet.jitter_server_to_client.min(MAX_REAL_JITTER));
        Ok(())
    }

    fn check_fallback(&mut self) -> Result<(), ShortCircuit> {
        if self.packet.fallback_to_direct && !self.output.fell_back_to_direct {
            self.output.fell_back_to_direct = true;
            return Err(ShortCircuit::FallbackToDirect);
        }
        Ok(())
    }

    fn destination_relays(&self) -> Result<Vec<i32>, ShortCircuit> {
        let relays: Vec<i32> = self
            .matrix
            .datacenter_relays(self.datacenter.id)
            .iter()
            .filter_map(|id| self.matrix.relay_index(*id))
            .collect();
        if relays.is_empty() {
            return Err(ShortCircuit::NoRelaysInDatacenter);
        }
        Ok(relays)
    }

    /// Slice 0: hand out the near relays the SDK pings for the whole session.
    fn assign_near_relays(&mut self) {
        let location = &self.output.location;
        let max = self.ctx.config.max_near_relays.min(MAX_NEAR_RELAYS);
        let near = self.matrix.near_relays(
            self.packet.direct_rtt,
            (location.latitude, location.longitude),
            (self.datacenter.latitude, self.datacenter.longitude),
            max,
        );
        if near.is_empty() {
            debug!("no near relays");
            self.metrics().near_relays_locate_failure.inc();
            return;
        }

        for (i, (id, addr)) in near.iter().enumerate() {
            self.response.near_relay_ids[i] = *id;
            self.response.near_relay_addresses[i] = Some(*addr);
        }
        self.response.num_near_relays = near.len();
        self.response.near_relays_changed = true;

        let internal = &self.buyer.internal_config;
        self.response.high_frequency_pings =
            internal.high_frequency_pings && !internal.large_customer;
        self.output.route_state.num_near_relays = near.len();
    }

    /// Large customers ping near relays for a few slices, then freeze them.
    fn hold_near_relays(&mut self, relay_rtt: &[i32], relay_packet_loss: &[i32]) {
        if !self.buyer.internal_config.large_customer
            || self.packet.slice_number < HOLD_NEAR_RELAYS_SLICE
        {
            return;
        }

        if !self.input.hold_near_relays {
            debug!("holding near relays");
            self.output.hold_near_relays = true;
            for (i, (rtt, packet_loss)) in relay_rtt.iter().zip(relay_packet_loss).enumerate() {
                self.output.hold_near_relay_rtt[i] = near_relay_cost(*rtt, *packet_loss);
            }
        }

        self.response.exclude_near_relays = true;
        self.response.near_relay_excluded = [true; MAX_NEAR_RELAYS];
    }

    fn make_route_decision(&mut self, dest_relays: &[i32]) {
        let metrics = self.metrics();

        if self.output.route_state.next && self.input.route_num_relays == 0 {
            debug!("on network next without route relays");
            self.output.route_state.next = false;
            self.output.route_state.veto = true;
            metrics.next_without_route_relays.inc();
            self.clear_route();
            return;
        }

        let relay_ids = self.packet.near_relay_ids().to_vec();
        let count = relay_ids.len();
        let (relay_rtt, relay_packet_loss) = if self.input.hold_near_relays {
            (self.input.hold_near_relay_rtt[..count].to_vec(), vec![0; count])
        } else {
            (
                self.packet.near_relay_rtt[..count].to_vec(),
                self.packet.near_relay_packet_loss[..count].to_vec(),
            )
        };
        self.hold_near_relays(&relay_rtt, &relay_packet_loss);

        let matrix = Arc::clone(&self.matrix);
        let (source_relays, source_relay_cost) =
            reframe_near_relays(&matrix, &relay_ids, &relay_rtt, &relay_packet_loss);

        let multipath_vetoed = self
            .ctx
            .multipath_veto
            .map_copy(&self.buyer.company_code)
            .contains(&self.packet.user_hash);

        let route_shader = self.buyer.route_shader.clone();
        let internal = self.buyer.internal_config.clone();
        let inputs = RouteInputs {
            matrix: &matrix,
            route_shader: &route_shader,
            internal: &internal,
            multipath_vetoed,
            direct_latency: f64::from(self.packet.direct_rtt).ceil() as i32,
            next_latency: f64::from(self.packet.next_rtt).ceil() as i32,
            predicted_latency: self.input.route_cost,
            direct_packet_loss: self.real_packet_loss,
            next_packet_loss: self.packet.next_packet_loss,
            source_relays: &source_relays,
            source_relay_cost: &source_relay_cost,
            dest_relays,
        };

        let decider = Arc::clone(&self.ctx.decider);
        let state = &mut self.output.route_state;

        let plan = if !state.next {
            match decider.take_network_next(&inputs, state, &mut self.debug) {
                TakeDecision::Take(route) => RoutePlan::New(route),
                TakeDecision::Direct => RoutePlan::Direct,
            }
        } else if !self.packet.next {
            debug!("sdk aborted the relay route");
            state.next = false;
            state.veto = true;
            metrics.sdk_aborted.inc();
            RoutePlan::Direct
        } else {
            let current = match decider.reframe_route(state, &matrix, self.input.route_relay_ids()) {
                Some(route) => RouteSelection::new(self.input.route_cost, route.relays()),
                None => {
                    debug!("route relays left the route matrix");
                    metrics.route_does_not_exist.inc();
                    RouteSelection::new(self.input.route_cost, &[])
                }
            };

            match decider.stay_on_network_next(&inputs, &current, state, &mut self.debug) {
                StayDecision::Hold(route) => RoutePlan::Continue(route),
                StayDecision::Switch(route) => {
                    metrics.route_switched.inc();
                    RoutePlan::Switch(route)
                }
                StayDecision::Leave => {
                    let reason = if state.no_route {
                        Some(&metrics.no_route)
                    } else if state.multipath_overload {
                        Some(&metrics.multipath_overload)
                    } else if state.mispredict {
                        Some(&metrics.mispredict_veto)
                    } else if state.latency_worse {
                        Some(&metrics.latency_worse)
                    } else {
                        None
                    };
                    if let Some(counter) = reason {
                        counter.inc();
                    }
                    RoutePlan::Direct
                }
            }
        };

        match plan {
            RoutePlan::Direct => self.clear_route(),
            RoutePlan::New(route) => self.issue_tokens(&route, true, false),
            RoutePlan::Switch(route) => self.issue_tokens(&route, true, true),
            RoutePlan::Continue(route) => self.issue_tokens(&route, false, false),
        }

        self.response.committed = self.output.route_state.committed;
        self.response.multipath = self.output.route_state.multipath;
    }

    fn clear_route(&mut self) {
        self.output.set_route(&[], 0);
        self.output.route_changed = false;
        self.response.route_type = RouteType::Direct;
        self.response.num_tokens = 0;
        self.response.tokens.clear();
    }

    fn route_hops(&self, relay_ids: &[u64]) -> Result<RouteHops, TokenError> {
        let (Some(client_address), Some(server_address)) =
            (self.packet.client_address, self.packet.server_address)
        else {
            return Err(TokenError::MissingAddress);
        };
        let endpoints = RouteEndpoints {
            client_address,
            client_public_key: &self.packet.client_route_public_key,
            server_address,
            server_public_key: &self.packet.server_route_public_key,
        };
        route_addresses_and_public_keys(
            &endpoints,
            relay_ids,
            self.ctx.storer.as_ref(),
            self.ctx.config.enable_internal_ips,
        )
    }

    fn issue_tokens(&mut self, route: &RouteSelection, new_route: bool, switched: bool) {
        let relay_ids: Option<Vec<u64>> = route
            .relays()
            .iter()
            .map(|index| {
                usize::try_from(*index)
                    .ok()
                    .and_then(|index| self.matrix.relay_ids().get(index).copied())
            })
            .collect();
        let Some(relay_ids) = relay_ids else {
            debug!(relays = ?route.relays(), "route index outside the route matrix");
            self.metrics().route_does_not_exist.inc();
            self.output.route_state.next = false;
            self.clear_route();
            return;
        };

        let built = self.route_hops(&relay_ids).and_then(|hops| {
            let tokens = if new_route {
                build_next_tokens(
                    &mut self.output,
                    &hops,
                    self.buyer.route_shader.bandwidth_envelope_up_kbps,
                    self.buyer.route_shader.bandwidth_envelope_down_kbps,
                    &self.ctx.router_private_key,
                )?
            } else {
                build_continue_tokens(&self.output, &hops, &self.ctx.router_private_key)?
            };
            Ok((tokens, hops.num_nodes()))
        });

        match built {
            Ok((tokens, num_tokens)) => {
                self.output.set_route(&relay_ids, route.cost);
                self.output.route_changed = switched;
                self.response.route_type = if new_route {
                    RouteType::New
                } else {
                    RouteType::Continue
                };
                self.response.num_tokens = num_tokens;
                self.response.tokens = tokens;
                if let Some(debug) = self.debug.as_mut() {
                    let names: Vec<&str> = route
                        .relays()
                        .iter()
                        .filter_map(|index| self.matrix.relay_names().get(*index as usize))
                        .map(String::as_str)
                        .collect();
                    debug.push_str("route relays: ");
                    debug.push_str(&names.join(" - "));
                    debug.push('\n');
                }
            }
            Err(err) => {
                debug!(%err, "could not build route tokens");
                self.metrics().route_does_not_exist.inc();
                self.output.route_state.next = false;
                self.clear_route();
            }
        }
    }

    /// Location as of the start of this slice
    fn location(&self) -> &Location {
        if self.packet.slice_number == 0 {
            &self.output.location
        } else {
            &self.input.location
        }
    }

    fn finish(mut self, outcome: Result<(), ShortCircuit>) -> Option<Vec<u8>> {
        let metrics = self.metrics();

        if let Err(short_circuit) = outcome {
            short_circuit.record(metrics, self.packet.fallback_flags());
            debug!(?short_circuit, "session update short-circuited");
            if !short_circuit.responds() {
                return None;
            }
        }

        if self.response.route_type == RouteType::Direct {
            metrics.direct_slices.inc();
        } else {
            metrics.next_slices.inc();
        }

        if self.packet.next {
            self.output.ever_on_next = true;
        }

        self.output.prev_packets_sent_client_to_server = self.packet.packets_sent_client_to_server;
        self.output.prev_packets_sent_server_to_client = self.packet.packets_sent_server_to_client;
        self.output.prev_packets_lost_client_to_server = self.packet.packets_lost_client_to_server;
        self.output.prev_packets_lost_server_to_client = self.packet.packets_lost_server_to_client;

        if self.packet.client_ping_timed_out {
            self.output.wrote_summary = true;
        }

        if let Some(debug) = self.debug.as_mut() {
            truncate_utf8(debug, MAX_DEBUG_LENGTH - 1);
            self.response.has_debug = !debug.is_empty();
            self.response.debug = debug.clone();
        }

        self.response.session_data = match self.output.marshal() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "could not write session data");
                metrics.write_session_data_failure.inc();
                return None;
            }
        };

        let bytes = match self.response.marshal_framed() {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(%err, "could not write session response");
                metrics.write_response_failure.inc();
                return None;
            }
        };

        if self.packet.next && self.output.route_state.multipath_overload {
            self.ctx
                .multipath_veto
                .mark_vetoed(&self.buyer.company_code, self.packet.user_hash);
        }

        if !self.input.wrote_summary {
            let entry = self.billing_entry();
            self.ctx.post_session.send_billing_entry(entry);
        }

        if !self.packet.client_ping_timed_out {
            let portal = self.portal_data();
            if portal.meta.next_rtt > 0.0 || portal.meta.direct_rtt > 0.0 {
                self.ctx.post_session.send_portal_data(portal);
            }
        }

        Some(bytes)
    }

    fn route_relay_prices(&self) -> Vec<Nibblin> {
        self.input
            .route_relay_ids()
            .iter()
            .map(|id| {
                self.ctx.storer.relay(*id).map_or(0, |relay| {
                    let seller = self.ctx.storer.seller(relay.seller_id);
                    relay_egress_price(&relay, seller.as_ref())
                })
            })
            .collect()
    }

    fn billing_entry(&self) -> BillingEntry2 {
        let packet = &self.packet;
        let input = &self.input;
        let state = &input.route_state;
        let shader = &self.buyer.route_shader;
        let summary = self.output.wrote_summary;

        let mut slice_seconds = BILLING_SLICE_SECONDS;
        if input.initial && !(summary && input.route_changed) {
            slice_seconds *= 2;
        }

        let (envelope_bytes_up, envelope_bytes_down) = envelope_bytes(
            u64::from(shader.bandwidth_envelope_up_kbps),
            u64::from(shader.bandwidth_envelope_down_kbps),
            slice_seconds,
        );
        let (next_bytes_up, next_bytes_down) = envelope_bytes(
            u64::from(packet.next_kbps_up),
            u64::from(packet.next_kbps_down),
            slice_seconds,
        );

        let relay_prices = self.route_relay_prices();
        let (real_packet_loss, real_packet_loss_frac) = split_packet_loss(self.real_packet_loss);

        let near_relay_rtt = input
            .route_relay_ids()
            .first()
            .and_then(|first| packet.near_relay_ids().iter().position(|id| id == first))
            .map_or(0, |i| packet.near_relay_rtt[i]);

        let session_duration = if summary && packet.slice_number != 0 {
            packet.slice_number.saturating_mul(BILLING_SLICE_SECONDS as u32)
        } else {
            0
        };

        let location = self.location();
        let mut entry = BillingEntry2 {
            version: BILLING_ENTRY_VERSION,
            timestamp: self.now as u32,
            session_id: packet.session_id,
            slice_number: packet.slice_number,
            direct_rtt: packet.direct_rtt as i32,
            direct_jitter: packet.direct_jitter as i32,
            direct_packet_loss: packet.direct_packet_loss as i32,
            real_packet_loss,
            real_packet_loss_frac,
            real_jitter: self.real_jitter as u32,
            next: packet.next,
            flagged: packet.reported,
            summary,
            use_debug: self.buyer.debug,
            debug: self.debug.clone().unwrap_or_default(),
            user_flags: packet.user_flags,
            datacenter_id: packet.datacenter_id,
            buyer_id: packet.buyer_id,
            user_hash: packet.user_hash,
            envelope_bytes_up,
            envelope_bytes_down,
            latitude: location.latitude,
            longitude: location.longitude,
            client_address: packet.client_address.map(|a| a.to_string()).unwrap_or_default(),
            server_address: packet.server_address.map(|a| a.to_string()).unwrap_or_default(),
            isp: location.isp.clone(),
            connection_type: packet.connection_type,
            platform_type: packet.platform_type,
            sdk_version: packet.version.to_string(),
            num_tags: packet.num_tags as i32,
            tags: packet.tags,
            ab_test: state.ab_test,
            pro: shader.pro_mode && !state.multipath_restricted,
            client_to_server_packets_sent: packet.packets_sent_client_to_server,
            server_to_client_packets_sent: packet.packets_sent_server_to_client,
            client_to_server_packets_lost: packet.packets_lost_client_to_server,
            server_to_client_packets_lost: packet.packets_lost_server_to_client,
            client_to_server_packets_out_of_order: packet.packets_out_of_order_client_to_server,
            server_to_client_packets_out_of_order: packet.packets_out_of_order_server_to_client,
            num_near_relays: packet.num_near_relays as i32,
            near_relay_ids: packet.near_relay_ids,
            near_relay_rtts: packet.near_relay_rtt,
            near_relay_jitters: packet.near_relay_jitter,
            near_relay_packet_losses: packet.near_relay_packet_loss,
            ever_on_next: input.ever_on_next,
            session_duration,
            next_rtt: packet.next_rtt as i32,
            next_jitter: packet.next_jitter as i32,
            next_packet_loss: packet.next_packet_loss as i32,
            predicted_next_rtt: input.route_cost,
            near_relay_rtt,
            num_next_relays: input.route_num_relays as i32,
            next_relays: input.route_relay_ids,
            next_relay_price: route_relay_prices(&relay_prices, envelope_bytes_up, envelope_bytes_down),
            total_price: total_price(&relay_prices, envelope_bytes_up, envelope_bytes_down),
            uncommitted: !packet.committed,
            multipath: state.multipath,
            rtt_reduction: state.reduce_latency,
            packet_loss_reduction: state.reduce_packet_loss,
            route_changed: input.route_changed,
            next_bytes_up,
            next_bytes_down,
            fallback_to_direct: packet.fallback_to_direct,
            multipath_vetoed: state.multipath_overload,
            mispredicted: state.mispredict,
            vetoed: state.veto,
            latency_worse: state.latency_worse,
            no_route: state.no_route,
            next_latency_too_high: state.next_latency_too_high,
            commit_veto: state.commit_veto,
            unknown_datacenter: self.unknown_datacenter,
            datacenter_not_enabled: self.datacenter_not_enabled,
            buyer_not_live: self.buyer_not_live,
            stale_route_matrix: self.stale_route_matrix,
            ..BillingEntry2::default()
        };
        entry.clamp();
        entry
    }

    fn portal_data(&self) -> SessionPortalData {
        let packet = &self.packet;
        let input = &self.input;

        let hops = input
            .route_relay_ids()
            .iter()
            .map(|id| RelayHop {
                id: *id,
                name: self
                    .ctx
                    .storer
                    .relay(*id)
                    .map(|relay| relay.name)
                    .unwrap_or_default(),
            })
            .collect();

        let nearby_relays = packet
            .near_relay_ids()
            .iter()
            .enumerate()
            .filter_map(|(i, id)| {
                let index = self.matrix.relay_index(*id)?;
                Some(NearRelayPortalData {
                    id: *id,
                    name: self
                        .matrix
                        .relay_names()
                        .get(index as usize)
                        .cloned()
                        .unwrap_or_default(),
                    client_stats: PathStats {
                        rtt: f64::from(packet.near_relay_rtt[i]),
                        jitter: f64::from(packet.near_relay_jitter[i]),
                        packet_loss: f64::from(packet.near_relay_packet_loss[i]),
                    },
                })
            })
            .collect();

        let on_faster_route =
            packet.next && packet.next_rtt != 0.0 && packet.direct_rtt >= packet.next_rtt;
        let delta_rtt = if on_faster_route {
            f64::from(packet.direct_rtt - packet.next_rtt)
        } else {
            0.0
        };

        let predicted_rtt = if input.route_cost >= INVALID_ROUTE_VALUE {
            0.0
        } else {
            f64::from(input.route_cost)
        };

        let location = self.location().clone();
        let point = SessionMapPoint {
            latitude: f64::from(location.latitude),
            longitude: f64::from(location.longitude),
            session_id: packet.session_id,
        };

        SessionPortalData {
            version: SESSION_PORTAL_DATA_VERSION,
            meta: SessionMeta {
                id: packet.session_id,
                user_hash: packet.user_hash,
                datacenter_name: self.datacenter.name.clone(),
                datacenter_alias: self.datacenter.alias_name.clone(),
                on_network_next: packet.next,
                next_rtt: f64::from(packet.next_rtt),
                direct_rtt: f64::from(packet.direct_rtt),
                delta_rtt,
                location,
                client_addr: packet.client_address.map(|a| a.to_string()).unwrap_or_default(),
                server_addr: packet.server_address.map(|a| a.to_string()).unwrap_or_default(),
                hops,
                sdk: packet.version.to_string(),
                connection: packet.connection_type as u8,
                nearby_relays,
                platform: packet.platform_type as u8,
                buyer_id: packet.buyer_id,
            },
            slice: SessionSlice {
                timestamp: self.now,
                next: PathStats {
                    rtt: f64::from(packet.next_rtt),
                    jitter: f64::from(packet.next_jitter),
                    packet_loss: f64::from(packet.next_packet_loss),
                },
                direct: PathStats {
                    rtt: f64::from(packet.direct_rtt),
                    jitter: f64::from(packet.direct_jitter),
                    packet_loss: f64::from(packet.direct_packet_loss),
                },
                predicted: PathStats {
                    rtt: predicted_rtt,
                    ..PathStats::default()
                },
                client_to_server: PathStats {
                    jitter: f64::from(packet.jitter_client_to_server),
                    packet_loss: f64::from(self.real_packet_loss_client_to_server),
                    ..PathStats::default()
                },
                server_to_client: PathStats {
                    jitter: f64::from(packet.jitter_server_to_client),
                    packet_loss: f64::from(self.real_packet_loss_server_to_client),
                    ..PathStats::default()
                },
                route_diversity: 0,
                envelope_up_kbps: i64::from(packet.next_kbps_up),
                envelope_down_kbps: i64::from(packet.next_kbps_down),
                is_multipath: input.route_state.multipath,
                is_try_before_you_buy: !input.route_state.committed,
                on_network_next: packet.next,
            },
            point,
            large_customer: self.buyer.internal_config.large_customer,
            ever_on_next: input.ever_on_next,
        }
    }
}

/// Loss percentage over one slice from cumulative counters.
fn real_packet_loss(sent: u64, prev_sent: u64, lost: u64, prev_lost: u64) -> f32 {
    let sent = sent.saturating_sub(prev_sent);
    let lost = lost.saturating_sub(prev_lost);
    if sent == 0 {
        return 0.0;
    }
    (lost as f64 / sent as f64 * 100.0) as f32
}
