//! Server heartbeats.

use std::net::SocketAddr;

use netnext_crypto::{hash_id, verify_packet};
use tracing::debug;

use super::{HandlerContext, resolve_datacenter};
use crate::packets::ServerUpdatePacket;
use crate::portal::{SESSION_COUNT_DATA_VERSION, SessionCountData};

/// Name recorded for servers updating from an unknown datacenter
pub const UNKNOWN_UPDATE_DATACENTER: &str = "unknown_update";

/// Handle a server update. Never produces a response.
pub fn handle_server_update(
    ctx: &HandlerContext,
    from: SocketAddr,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let metrics = &ctx.metrics.server_update;
    metrics.invocations.inc();

    let packet = match ServerUpdatePacket::unmarshal(payload) {
        Ok(packet) => packet,
        Err(err) => {
            debug!(%from, %err, "could not read server update");
            metrics.read_packet_failure.inc();
            return None;
        }
    };

    let Some(buyer) = ctx.storer.buyer(packet.buyer_id) else {
        metrics.buyer_not_found.inc();
        return None;
    };

    if !buyer.live {
        metrics.buyer_not_live.inc();
        return None;
    }

    if !verify_packet(&buyer.public_key, payload) {
        metrics.signature_check_failed.inc();
        return None;
    }

    if !buyer.debug && packet.version < ctx.config.min_sdk_version {
        metrics.sdk_too_old.inc();
        return None;
    }

    let server_address = packet.server_address.unwrap_or(from);
    ctx.post_session.send_portal_counts(SessionCountData {
        version: SESSION_COUNT_DATA_VERSION,
        server_id: hash_id(&server_address.to_string()),
        buyer_id: buyer.id,
        num_sessions: packet.num_sessions,
    });

    let datacenter_name = match resolve_datacenter(ctx.storer.as_ref(), buyer.id, packet.datacenter_id) {
        Ok(datacenter) => datacenter.name,
        Err(_) => {
            metrics.datacenter_not_found.inc();
            UNKNOWN_UPDATE_DATACENTER.to_string()
        }
    };

    ctx.servers.add(from, buyer.id, &datacenter_name);
    debug!(%from, num_sessions = packet.num_sessions, "server update");
    None
}
