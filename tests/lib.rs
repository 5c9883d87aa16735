//! Shared fixtures for the netnext integration tests.
//!
//! [`Harness`] builds a complete [`HandlerContext`] over one live buyer with
//! one enabled datacenter and a two-relay route matrix. Route decisions can
//! be scripted with [`ScriptedDecider`], and the post-session sinks are
//! in-memory recorders.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use netnext_core::HandlerContext;
use netnext_core::billing::{Biller, BillingEntry2};
use netnext_core::error::{PublishError, SinkError};
use netnext_core::handlers::handle_session_update;
use netnext_core::locator::StaticIpLocator;
use netnext_core::match_data::{MatchDataEntry, Matcher};
use netnext_core::metrics::Metrics;
use netnext_core::packets::{
    PACKET_HEADER_SIZE, SdkVersion, SessionResponsePacket, SessionUpdatePacket,
};
use netnext_core::portal::Publisher;
use netnext_core::post_session::{PostSessionConfig, PostSessionHandler, PostSessionSinks};
use netnext_core::routing::{
    Buyer, Database, Datacenter, DatacenterMap, Location, LowestCostDecider, MatrixRelay, Relay,
    RouteDecider, RouteInputs, RouteMatrix, RouteSelection, RouteState, Seller, StayDecision,
    TakeDecision,
};
use netnext_core::storage::InMemoryStorer;
use netnext_core::{Packet, RouteType};
use netnext_crypto::sign_packet;
use netnext_crypto::signatures::SigningKey;
use netnext_crypto::x25519::PrivateKey;
use rand_core::OsRng;
use tokio_util::sync::CancellationToken;

/// Buyer every harness registers
pub const BUYER_ID: u64 = 0x1111_2222_3333_4444;
/// Datacenter the game server runs in
pub const DATACENTER_ID: u64 = 0x0d0c_0000_0000_0001;
/// Seller owning both relays
pub const SELLER_ID: u64 = 0x5e11;
/// Relay next to the client, matrix index 0
pub const RELAY_NEAR: u64 = 0xaaaa;
/// Relay inside the destination datacenter, matrix index 1
pub const RELAY_DEST: u64 = 0xbbbb;
/// Session id used by [`Harness::session_update`]
pub const SESSION_ID: u64 = 0x5e55_0000_0000_0001;

const LATITUDE: f32 = 40.7;
const LONGITUDE: f32 = -74.0;

/// Current unix time in seconds
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Route Decisions
// ============================================================================

/// What [`ScriptedDecider`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Direct sessions stay direct; routed sessions leave
    Direct,
    /// Direct sessions without a veto take `NEAR -> DEST` at the given cost
    Take(i32),
    /// Direct sessions without a veto take a route over these matrix indices
    TakeOver(&'static [i32]),
    /// Routed sessions keep their current route
    Stay,
    /// Routed sessions move to `NEAR -> DEST` at the given cost
    Switch(i32),
}

/// Route decider that answers from a script instead of the matrix costs
#[derive(Debug)]
pub struct ScriptedDecider {
    script: Mutex<Script>,
    take_calls: AtomicUsize,
    stay_calls: AtomicUsize,
}

impl ScriptedDecider {
    /// Decider following `script`
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            take_calls: AtomicUsize::new(0),
            stay_calls: AtomicUsize::new(0),
        }
    }

    /// Change the answer for later slices
    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    /// Calls to `take_network_next`
    #[must_use]
    pub fn take_calls(&self) -> usize {
        self.take_calls.load(Ordering::Relaxed)
    }

    /// Calls to `stay_on_network_next`
    #[must_use]
    pub fn stay_calls(&self) -> usize {
        self.stay_calls.load(Ordering::Relaxed)
    }

    fn script(&self) -> Script {
        *self.script.lock().unwrap()
    }
}

impl RouteDecider for ScriptedDecider {
    fn take_network_next(
        &self,
        _inputs: &RouteInputs<'_>,
        state: &mut RouteState,
        _debug: &mut Option<String>,
    ) -> TakeDecision {
        self.take_calls.fetch_add(1, Ordering::Relaxed);
        match self.script() {
            Script::Take(cost) if !state.veto => {
                state.next = true;
                state.committed = true;
                TakeDecision::Take(RouteSelection::new(cost, &[0, 1]))
            }
            Script::TakeOver(relays) if !state.veto => {
                state.next = true;
                state.committed = true;
                TakeDecision::Take(RouteSelection::new(33, relays))
            }
            _ => TakeDecision::Direct,
        }
    }

    fn stay_on_network_next(
        &self,
        _inputs: &RouteInputs<'_>,
        current: &RouteSelection,
        state: &mut RouteState,
        _debug: &mut Option<String>,
    ) -> StayDecision {
        self.stay_calls.fetch_add(1, Ordering::Relaxed);
        match self.script() {
            Script::Stay | Script::Take(_) | Script::TakeOver(_) => StayDecision::Hold(*current),
            Script::Switch(cost) => StayDecision::Switch(RouteSelection::new(cost, &[0, 1])),
            Script::Direct => {
                state.next = false;
                state.veto = true;
                state.no_route = true;
                StayDecision::Leave
            }
        }
    }
}

// ============================================================================
// Post-Session Sinks
// ============================================================================

/// Biller keeping every entry
#[derive(Debug, Default)]
pub struct RecordingBiller {
    entries: Mutex<Vec<BillingEntry2>>,
    closed: AtomicUsize,
}

impl RecordingBiller {
    /// Entries billed so far
    #[must_use]
    pub fn entries(&self) -> Vec<BillingEntry2> {
        self.entries.lock().unwrap().clone()
    }

    /// Times `close` was called
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Biller for RecordingBiller {
    async fn bill(&self, entry: &BillingEntry2) -> Result<(), SinkError> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Matcher keeping every entry
#[derive(Debug, Default)]
pub struct RecordingMatcher {
    entries: Mutex<Vec<MatchDataEntry>>,
}

impl RecordingMatcher {
    /// Entries submitted so far
    #[must_use]
    pub fn entries(&self) -> Vec<MatchDataEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Matcher for RecordingMatcher {
    async fn submit(&self, entry: &MatchDataEntry) -> Result<(), SinkError> {
        self.entries.lock().unwrap().push(entry.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// How a [`ScriptedPublisher`] answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Every publish succeeds
    Accept,
    /// Every publish fails with a retryable error
    AlwaysRetry,
    /// The first `n` publishes fail with a retryable error
    RetryFirst(usize),
}

/// Publisher counting attempts and answering per [`PublishMode`]
#[derive(Debug)]
pub struct ScriptedPublisher {
    mode: PublishMode,
    attempts: AtomicUsize,
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl ScriptedPublisher {
    /// Publisher in `mode`
    #[must_use]
    pub fn new(mode: PublishMode) -> Self {
        Self {
            mode,
            attempts: AtomicUsize::new(0),
            published: Mutex::new(Vec::new()),
        }
    }

    /// Publish calls so far, failed ones included
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Topics and payloads accepted
    #[must_use]
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<usize, PublishError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        let fail = match self.mode {
            PublishMode::Accept => false,
            PublishMode::AlwaysRetry => true,
            PublishMode::RetryFirst(n) => attempt < n,
        };
        if fail {
            return Err(PublishError::Retryable("broker busy".into()));
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), data.to_vec()));
        Ok(data.len())
    }
}

/// Post-session handler over recording sinks, not started
#[must_use]
pub fn post_session_handler(
    config: &PostSessionConfig,
    biller: Arc<RecordingBiller>,
    matcher: Arc<RecordingMatcher>,
    publishers: Vec<Arc<dyn Publisher>>,
    metrics: &Metrics,
) -> PostSessionHandler {
    PostSessionHandler::new(
        config,
        PostSessionSinks {
            biller,
            matcher,
            publishers,
        },
        Arc::clone(&metrics.post_session),
        CancellationToken::new(),
    )
}

// ============================================================================
// Handler Harness
// ============================================================================

/// One live buyer, one datacenter and a `NEAR -> DEST` route
pub struct Harness {
    /// Handler context under test
    pub ctx: HandlerContext,
    /// Key the buyer signs packets with
    pub signing_key: SigningKey,
    /// Game server address
    pub server_addr: SocketAddr,
    /// Client address
    pub client_addr: SocketAddr,
    /// Billing sink
    pub biller: Arc<RecordingBiller>,
    client_route_key: [u8; 32],
    server_route_key: [u8; 32],
}

/// Harness construction options
pub struct HarnessBuilder {
    decider: Arc<dyn RouteDecider>,
    locator: StaticIpLocator,
    edit: Box<dyn FnOnce(&mut Database)>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            decider: Arc::new(LowestCostDecider::new()),
            locator: StaticIpLocator::with_fallback(Location {
                latitude: LATITUDE,
                longitude: LONGITUDE,
                isp: "Test ISP".into(),
                asn: 64500,
            }),
            edit: Box::new(|_| {}),
        }
    }
}

impl HarnessBuilder {
    /// Decide routes with `decider`
    #[must_use]
    pub fn decider(mut self, decider: Arc<dyn RouteDecider>) -> Self {
        self.decider = decider;
        self
    }

    /// Locator that places nobody
    #[must_use]
    pub fn unlocatable(mut self) -> Self {
        self.locator = StaticIpLocator::new();
        self
    }

    /// Adjust the database before it is frozen
    #[must_use]
    pub fn database(mut self, edit: impl FnOnce(&mut Database) + 'static) -> Self {
        self.edit = Box::new(edit);
        self
    }

    /// Build the harness
    #[must_use]
    pub fn build(self) -> Harness {
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
        (self.edit)(&mut db);

        let mut matrix = RouteMatrix::new(matrix_relays, unix_now());
        matrix.add_route(20, &[0, 1]);
        let matrix = Arc::new(matrix);

        let metrics = Arc::new(Metrics::default());
        let biller = Arc::new(RecordingBiller::default());
        let post_session = post_session_handler(
            &PostSessionConfig::default(),
            Arc::clone(&biller),
            Arc::new(RecordingMatcher::default()),
            Vec::new(),
            &metrics,
        );

        let ctx = HandlerContext::new(
            Arc::new(InMemoryStorer::new(db)),
            Arc::new(move || Arc::clone(&matrix)),
            Arc::new(self.locator),
            self.decider,
            Arc::new(post_session),
            metrics,
            PrivateKey::generate(&mut OsRng),
        );

        Harness {
            ctx,
            signing_key,
            server_addr: "203.0.113.10:40000".parse().unwrap(),
            client_addr: "198.51.100.4:50000".parse().unwrap(),
            biller,
            client_route_key: PrivateKey::generate(&mut OsRng).public_key().to_bytes(),
            server_route_key: PrivateKey::generate(&mut OsRng).public_key().to_bytes(),
        }
    }
}

impl Harness {
    /// Harness with the stock decider
    #[must_use]
    pub fn new() -> Self {
        HarnessBuilder::default().build()
    }

    /// Start configuring a harness
    #[must_use]
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Sign `body` with the buyer key
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> Vec<u8> {
        sign_packet(&self.signing_key, body)
    }

    /// A committed session update for `slice` with 100ms direct latency
    #[must_use]
    pub fn session_update(&self, slice: u32) -> SessionUpdatePacket {
        SessionUpdatePacket {
            version: SdkVersion::new(4, 0, 6),
            buyer_id: BUYER_ID,
            datacenter_id: DATACENTER_ID,
            session_id: SESSION_ID,
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

    /// The update the SDK sends after `previous`: next slice, echoed blob,
    /// near relays from `first` reported at `rtt`
    #[must_use]
    pub fn follow_up(
        &self,
        previous: &SessionResponsePacket,
        first: &SessionResponsePacket,
        rtt: i32,
    ) -> SessionUpdatePacket {
        let mut packet = self.session_update(previous.slice_number + 1);
        packet.session_data = previous.session_data.clone();
        packet.next = previous.route_type != RouteType::Direct;
        if packet.next {
            packet.next_rtt = 40.0;
        }
        packet.num_near_relays = first.num_near_relays;
        for i in 0..first.num_near_relays {
            packet.near_relay_ids[i] = first.near_relay_ids[i];
            packet.near_relay_rtt[i] = rtt;
        }
        packet
    }

    /// Sign and handle `packet`, decoding the response if any
    #[must_use]
    pub fn send(&self, packet: &SessionUpdatePacket) -> Option<SessionResponsePacket> {
        let payload = self.sign(&packet.marshal().ok()?);
        let bytes = handle_session_update(&self.ctx, &payload)?;
        SessionResponsePacket::unmarshal(&bytes[PACKET_HEADER_SIZE..], packet.version).ok()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
