//! Synchronous packet handlers.
//!
//! Each handler takes one datagram payload and returns the framed response
//! to send back, or `None` when nothing should be sent. Handlers never block:
//! everything slow is handed to the [`PostSessionHandler`].

pub mod server_init;
pub mod server_update;
pub mod session_update;

#[cfg(test)]
pub(crate) mod testing;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use netnext_crypto::hash_id;
use netnext_crypto::x25519::PrivateKey;
use tracing::debug;

use crate::locator::IpLocator;
use crate::metrics::Metrics;
use crate::packets::{PacketType, SdkVersion, read_frame};
use crate::post_session::PostSessionHandler;
use crate::routing::{Datacenter, RouteDecider, RouteMatrix};
use crate::storage::{InMemoryMultipathVetoStore, MultipathVetoStore, ServerTracker, Storer};

pub use server_init::handle_server_init;
pub use server_update::handle_server_update;
pub use session_update::{ShortCircuit, handle_session_update};

/// Supplies the current route matrix snapshot
pub type RouteMatrixProvider = Arc<dyn Fn() -> Arc<RouteMatrix> + Send + Sync>;

/// Handler tuning knobs
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Oldest SDK allowed to register or update
    pub min_sdk_version: SdkVersion,
    /// Route matrix age beyond which sessions go direct
    pub route_matrix_max_age_secs: u64,
    /// Near relays handed to a new session
    pub max_near_relays: usize,
    /// Prefer relay internal addresses between relays of one seller
    pub enable_internal_ips: bool,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            min_sdk_version: SdkVersion::new(4, 0, 0),
            route_matrix_max_age_secs: 20,
            max_near_relays: crate::MAX_NEAR_RELAYS,
            enable_internal_ips: false,
        }
    }
}

/// Everything a handler reads or feeds
pub struct HandlerContext {
    /// Buyer, datacenter, relay and seller lookups
    pub storer: Arc<dyn Storer>,
    /// Current route matrix
    pub route_matrix: RouteMatrixProvider,
    /// Client geolocation
    pub locator: Arc<dyn IpLocator>,
    /// Route decisions
    pub decider: Arc<dyn RouteDecider>,
    /// Users barred from multipath
    pub multipath_veto: Arc<dyn MultipathVetoStore>,
    /// Billing, portal and match data fan-out
    pub post_session: Arc<PostSessionHandler>,
    /// Game servers seen
    pub servers: Arc<ServerTracker>,
    /// Counters
    pub metrics: Arc<Metrics>,
    /// Key route tokens are sealed with
    pub router_private_key: PrivateKey,
    /// Tuning
    pub config: HandlerConfig,
}

impl HandlerContext {
    /// Create a context with default tuning, counters and stores.
    ///
    /// `metrics` should be the same set the post-session handler reports to.
    #[must_use]
    pub fn new(
        storer: Arc<dyn Storer>,
        route_matrix: RouteMatrixProvider,
        locator: Arc<dyn IpLocator>,
        decider: Arc<dyn RouteDecider>,
        post_session: Arc<PostSessionHandler>,
        metrics: Arc<Metrics>,
        router_private_key: PrivateKey,
    ) -> Self {
        Self {
            storer,
            route_matrix,
            locator,
            decider,
            multipath_veto: Arc::new(InMemoryMultipathVetoStore::new()),
            post_session,
            servers: Arc::new(ServerTracker::new()),
            metrics,
            router_private_key,
            config: HandlerConfig::default(),
        }
    }

    /// Replace the tuning knobs
    #[must_use]
    pub fn with_config(mut self, config: HandlerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the multipath veto store
    #[must_use]
    pub fn with_multipath_veto(mut self, store: Arc<dyn MultipathVetoStore>) -> Self {
        self.multipath_veto = store;
        self
    }

    /// Share a server tracker
    #[must_use]
    pub fn with_server_tracker(mut self, servers: Arc<ServerTracker>) -> Self {
        self.servers = servers;
        self
    }

    /// Snapshot of the route matrix
    #[must_use]
    pub fn route_matrix(&self) -> Arc<RouteMatrix> {
        (self.route_matrix)()
    }
}

/// Dispatch a raw datagram to its handler.
///
/// Returns the framed response, if any.
pub fn handle_datagram(ctx: &HandlerContext, from: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
    let (packet_type, payload) = match read_frame(datagram) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(%from, %err, "dropping datagram");
            return None;
        }
    };

    match packet_type {
        PacketType::ServerInitRequest => handle_server_init(ctx, from, payload),
        PacketType::ServerUpdate => handle_server_update(ctx, from, payload),
        PacketType::SessionUpdate => handle_session_update(ctx, payload),
        PacketType::ServerInitResponse | PacketType::SessionResponse => {
            debug!(%from, ?packet_type, "ignoring backend-bound response packet");
            None
        }
    }
}

/// Why a datacenter could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatacenterError {
    /// No such datacenter
    Unknown,
    /// Buyer alias points at a datacenter that does not exist
    MisconfiguredAlias,
    /// Datacenter is not on the buyer's datacenter list
    NotEnabled,
}

/// Resolve the datacenter a buyer's packet names.
///
/// The id may be the hash of one of the buyer's datacenter aliases, in which
/// case it resolves to the aliased datacenter. Otherwise the datacenter
/// must appear in the buyer's datacenter maps; a buyer with no maps has no
/// datacenter enabled.
///
/// # Errors
///
/// Returns the [`DatacenterError`] describing why the datacenter is unusable.
pub fn resolve_datacenter(
    storer: &dyn Storer,
    buyer_id: u64,
    datacenter_id: u64,
) -> Result<Datacenter, DatacenterError> {
    let maps = storer.datacenter_maps(buyer_id);

    if let Some(map) = maps.iter().find(|map| hash_id(&map.alias) == datacenter_id) {
        return storer
            .datacenter(map.datacenter_id)
            .ok_or(DatacenterError::MisconfiguredAlias);
    }

    let datacenter = storer
        .datacenter(datacenter_id)
        .ok_or(DatacenterError::Unknown)?;

    if !maps.iter().any(|map| map.datacenter_id == datacenter.id) {
        return Err(DatacenterError::NotEnabled);
    }

    Ok(datacenter)
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}
