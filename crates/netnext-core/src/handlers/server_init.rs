//! Game server registration.

use std::net::SocketAddr;

use netnext_crypto::verify_packet;
use tracing::{debug, warn};

use super::{DatacenterError, HandlerContext, resolve_datacenter};
use crate::packets::{InitResponseCode, Packet, ServerInitRequestPacket, ServerInitResponsePacket};

/// Name recorded for servers registering from an unknown datacenter
pub const UNKNOWN_INIT_DATACENTER: &str = "unknown_init";

/// Handle a server init request.
///
/// Every request that decodes gets a response carrying its request id; only
/// undecodable packets are dropped silently.
pub fn handle_server_init(
    ctx: &HandlerContext,
    from: SocketAddr,
    payload: &[u8],
) -> Option<Vec<u8>> {
    let metrics = &ctx.metrics.server_init;
    metrics.invocations.inc();

    let packet = match ServerInitRequestPacket::unmarshal(payload) {
        Ok(packet) => packet,
        Err(err) => {
            debug!(%from, %err, "could not read server init request");
            metrics.read_packet_failure.inc();
            return None;
        }
    };

    let response = check_server_init(ctx, from, &packet, payload);
    debug!(
        %from,
        buyer_id = format_args!("{:016x}", packet.buyer_id),
        request_id = packet.request_id,
        ?response,
        "server init"
    );

    let reply = ServerInitResponsePacket {
        request_id: packet.request_id,
        response,
    };
    match reply.marshal_framed() {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(%from, %err, "could not write server init response");
            None
        }
    }
}

fn check_server_init(
    ctx: &HandlerContext,
    from: SocketAddr,
    packet: &ServerInitRequestPacket,
    payload: &[u8],
) -> InitResponseCode {
    let metrics = &ctx.metrics.server_init;

    let Some(buyer) = ctx.storer.buyer(packet.buyer_id) else {
        metrics.buyer_not_found.inc();
        return InitResponseCode::UnknownBuyer;
    };

    if !buyer.live {
        metrics.buyer_not_active.inc();
        return InitResponseCode::BuyerNotActive;
    }

    if packet.version < ctx.config.min_sdk_version {
        metrics.old_sdk_version.inc();
        return InitResponseCode::OldSdkVersion;
    }

    if !verify_packet(&buyer.public_key, payload) {
        metrics.signature_check_failed.inc();
        return InitResponseCode::SignatureCheckFailed;
    }

    let datacenter_name =
        match resolve_datacenter(ctx.storer.as_ref(), buyer.id, packet.datacenter_id) {
            Ok(datacenter) => datacenter.name,
            Err(DatacenterError::NotEnabled) => {
                metrics.datacenter_not_enabled.inc();
                return InitResponseCode::DatacenterNotEnabled;
            }
            Err(_) => {
                // servers may come up before their datacenter is configured
                metrics.datacenter_not_found.inc();
                warn!(
                    %from,
                    datacenter_id = format_args!("{:016x}", packet.datacenter_id),
                    datacenter_name = %packet.datacenter_name,
                    "server registered from unknown datacenter"
                );
                UNKNOWN_INIT_DATACENTER.to_string()
            }
        };

    ctx.servers.add(from, buyer.id, &datacenter_name);
    InitResponseCode::Ok
}
