//! Shared handler test fixture: one live buyer, one datacenter and two
//! relays with a single route between them.

use std::net::SocketAddr;
use std::sync::Arc;

use netnext_crypto::sign_packet;
use netnext_crypto::signatures::SigningKey;
use netnext_crypto::x25519::PrivateKey;
use rand_core::OsRng;
use tokio_util::sync::CancellationToken;

use super::{HandlerContext, handle_session_update, unix_now};
use crate::billing::LocalBiller;
use crate::locator::StaticIpLocator;
use crate::match_data::LocalMatcher;
use crate::metrics::Metrics;
use crate::packets::{PACKET_HEADER_SIZE, Packet, SdkVersion, SessionResponsePacket, SessionUpdatePacket};
use crate::portal::LocalPublisher;
use crate::post_session::{PostSessionConfig, PostSessionHandler, PostSessionSinks};
use crate::routing::matrix::MatrixRelay;
use crate::routing::{
    Buyer, Database, Datacenter, DatacenterMap, Location, LowestCostDecider, Relay, RouteMatrix,
    Seller,
};
use crate::storage::InMemoryStorer;

pub(crate) const BUYER_ID: u64 = 0x1111_2222_3333_4444;
pub(crate) const DATACENTER_ID: u64 = 0x0d0c_0000_0000_0001;
pub(crate) const SELLER_ID: u64 = 0x5e11;
/// Relay next to the client
pub(crate) const RELAY_NEAR: u64 = 0xaaaa;
/// Relay inside the destination datacenter
pub(crate) const RELAY_DEST: u64 = 0xbbbb;

const LATITUDE: f32 = 40.7;
const LONGITUDE: f32 = -74.0;

pub(crate) struct Fixture {
    pub ctx: HandlerContext,
    pub signing_key: SigningKey,
    pub server_addr: SocketAddr,
    pub client_addr: SocketAddr,
    client_route_key: [u8; 32],
    server_route_key: [u8; 32],
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_database(|_| {})
    }

    /// Build the fixture after `edit` has adjusted the configuration.
    pub fn with_database(edit: impl FnOnce(&mut Database)) -> Self {
        Self::build(edit, unix_now())
    }

    /// Fixture whose route matrix was built at the unix epoch.
    pub fn with_stale_matrix() -> Self {
        Self::build(|_| {}, 0)
    }

    fn build(edit: impl FnOnce(&mut Database), matrix_created_at: u64) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut db = Database::default();

        db.buyers.insert(
            BUYER_ID,
            Buyer {
                id: BUYER_ID,
                name: "Test Buyer".into(),
                company_code: "test".into(),
                live: true,
                public_key: signing_key.verifying_key().to_bytes().to_vec(),
                ..Buyer::default()
            },
        );
        db.datacenters.insert(
            DATACENTER_ID,
            Datacenter {
                id: DATACENTER_ID,
                name: "local".into(),
                latitude: LATITUDE,
                longitude: LONGITUDE,
                ..Datacenter::default()
            },
        );
        db.datacenter_maps.insert(
            BUYER_ID,
            vec![DatacenterMap {
                buyer_id: BUYER_ID,
                datacenter_id: DATACENTER_ID,
                alias: "local".into(),
            }],
        );
        db.sellers.insert(
            SELLER_ID,
            Seller {
                id: SELLER_ID,
                name: "seller".into(),
                egress_price_nibblins_per_gb: 100,
            },
        );

        let mut matrix_relays = Vec::new();
        for (i, id) in [RELAY_NEAR, RELAY_DEST].into_iter().enumerate() {
            let addr = SocketAddr::from(([10, 0, 0, i as u8 + 1], 40000));
            let name = format!("local.{}", i + 1);
            let datacenter_id = if id == RELAY_DEST { DATACENTER_ID } else { 0 };
            db.relays.insert(
                id,
                Relay {
                    id,
                    name: name.clone(),
                    addr,
                    internal_addr: None,
                    internal_address_client_routable: false,
                    public_key: PrivateKey::generate(&mut OsRng).public_key().to_bytes().to_vec(),
                    seller_id: SELLER_ID,
                    datacenter_id,
                    egress_price_override: 0,
                },
            );
            matrix_relays.push(MatrixRelay {
                id,
                addr,
                name,
                latitude: LATITUDE,
                longitude: LONGITUDE,
                datacenter_id,
            });
        }
        edit(&mut db);

        let mut matrix = RouteMatrix::new(matrix_relays, matrix_created_at);
        matrix.add_route(20, &[0, 1]);
        let matrix = Arc::new(matrix);

        let metrics = Arc::new(Metrics::default());
        let post_session = PostSessionHandler::new(
            &PostSessionConfig::default(),
            PostSessionSinks {
                biller: Arc::new(LocalBiller::new()),
                matcher: Arc::new(LocalMatcher::new()),
                publishers: vec![Arc::new(LocalPublisher::new())],
            },
            Arc::clone(&metrics.post_session),
            CancellationToken::new(),
        );

        let locator = StaticIpLocator::with_fallback(Location {
            latitude: LATITUDE,
            longitude: LONGITUDE,
            isp: "Test ISP".into(),
            asn: 64500,
        });

        let ctx = HandlerContext::new(
            Arc::new(InMemoryStorer::new(db)),
            Arc::new(move || Arc::clone(&matrix)),
            Arc::new(locator),
            Arc::new(LowestCostDecider::new()),
            Arc::new(post_session),
            metrics,
            PrivateKey::generate(&mut OsRng),
        );

        Self {
            ctx,
            signing_key,
            server_addr: "203.0.113.10:40000".parse().unwrap(),
            client_addr: "198.51.100.4:50000".parse().unwrap(),
            client_route_key: PrivateKey::generate(&mut OsRng).public_key().to_bytes(),
            server_route_key: PrivateKey::generate(&mut OsRng).public_key().to_bytes(),
        }
    }

    pub fn sign(&self, body: &[u8]) -> Vec<u8> {
        sign_packet(&self.signing_key, body)
    }

    /// A direct session update for `slice` with 100ms direct latency.
    pub fn session_update(&self, slice: u32) -> SessionUpdatePacket {
        SessionUpdatePacket {
            version: SdkVersion::new(4, 0, 6),
            buyer_id: BUYER_ID,
            datacenter_id: DATACENTER_ID,
            session_id: 0x5e55_0000_0000_0001,
            slice_number: slice,
            client_address: Some(self.client_addr),
            server_address: Some(self.server_addr),
            client_route_public_key: self.client_route_key,
            server_route_public_key: self.server_route_key,
            user_hash: 0x0123_4567,
            platform_type: 1,
            connection_type: 1,
            committed: true,
            direct_rtt: 100.0,
            direct_jitter: 2.0,
            packets_sent_client_to_server: u64::from(slice) * 600,
            packets_sent_server_to_client: u64::from(slice) * 600,
            ..SessionUpdatePacket::default()
        }
    }

    /// Report `rtt` to every near relay handed out in `first`.
    pub fn report_near_relays(
        &self,
        packet: &mut SessionUpdatePacket,
        first: &SessionResponsePacket,
        rtt: i32,
    ) {
        packet.num_near_relays = first.num_near_relays;
        for i in 0..first.num_near_relays {
            packet.near_relay_ids[i] = first.near_relay_ids[i];
            packet.near_relay_rtt[i] = rtt;
        }
    }

    /// Sign and handle `packet`, decoding the response if any.
    pub fn send(&self, packet: &SessionUpdatePacket) -> Option<SessionResponsePacket> {
        let payload = self.sign(&packet.marshal().ok()?);
        let bytes = handle_session_update(&self.ctx, &payload)?;
        SessionResponsePacket::unmarshal(&bytes[PACKET_HEADER_SIZE..], packet.version).ok()
    }
}
