//! Configuration lookups and small shared stores.
//!
//! - [`Storer`] is the read-only view of buyers, datacenters, relays and
//!   sellers. [`Database`] implements it directly; [`InMemoryStorer`] wraps a
//!   swappable snapshot.
//! - [`ServerTracker`] remembers which game servers reported in.
//! - [`MultipathVetoStore`] records users barred from multipath.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::routing::{Buyer, Database, Datacenter, DatacenterMap, Relay, Seller};

/// Read-only configuration lookups
pub trait Storer: Send + Sync {
    /// Buyer by id
    fn buyer(&self, id: u64) -> Option<Buyer>;

    /// Datacenter by id
    fn datacenter(&self, id: u64) -> Option<Datacenter>;

    /// Datacenter aliases and enablement configured for a buyer
    fn datacenter_maps(&self, buyer_id: u64) -> Vec<DatacenterMap>;

    /// Relay by id
    fn relay(&self, id: u64) -> Option<Relay>;

    /// Seller by id
    fn seller(&self, id: u64) -> Option<Seller>;
}

impl Storer for Database {
    fn buyer(&self, id: u64) -> Option<Buyer> {
        self.buyers.get(&id).cloned()
    }

    fn datacenter(&self, id: u64) -> Option<Datacenter> {
        self.datacenters.get(&id).cloned()
    }

    fn datacenter_maps(&self, buyer_id: u64) -> Vec<DatacenterMap> {
        self.datacenter_maps.get(&buyer_id).cloned().unwrap_or_default()
    }

    fn relay(&self, id: u64) -> Option<Relay> {
        self.relays.get(&id).cloned()
    }

    fn seller(&self, id: u64) -> Option<Seller> {
        self.sellers.get(&id).cloned()
    }
}

/// [`Storer`] over a database snapshot that can be replaced at runtime
#[derive(Debug, Default)]
pub struct InMemoryStorer {
    database: RwLock<Arc<Database>>,
}

impl InMemoryStorer {
    /// Wrap a database
    #[must_use]
    pub fn new(database: Database) -> Self {
        Self {
            database: RwLock::new(Arc::new(database)),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Database> {
        Arc::clone(&self.database.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a new snapshot; readers holding the old one keep it.
    pub fn replace(&self, database: Database) {
        *self.database.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(database);
    }
}

impl Storer for InMemoryStorer {
    fn buyer(&self, id: u64) -> Option<Buyer> {
        self.snapshot().buyer(id)
    }

    fn datacenter(&self, id: u64) -> Option<Datacenter> {
        self.snapshot().datacenter(id)
    }

    fn datacenter_maps(&self, buyer_id: u64) -> Vec<DatacenterMap> {
        self.snapshot().datacenter_maps(buyer_id)
    }

    fn relay(&self, id: u64) -> Option<Relay> {
        self.snapshot().relay(id)
    }

    fn seller(&self, id: u64) -> Option<Seller> {
        self.snapshot().seller(id)
    }
}

/// A game server seen by the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedServer {
    /// Owning buyer
    pub buyer_id: u64,
    /// Datacenter name, or a placeholder when it was unknown
    pub datacenter_name: String,
    /// Last init or update
    pub last_seen: Instant,
}

/// Game servers keyed by address
#[derive(Debug, Default)]
pub struct ServerTracker {
    servers: DashMap<SocketAddr, TrackedServer>,
}

impl ServerTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `addr` reported in.
    pub fn add(&self, addr: SocketAddr, buyer_id: u64, datacenter_name: &str) {
        self.servers.insert(
            addr,
            TrackedServer {
                buyer_id,
                datacenter_name: datacenter_name.to_string(),
                last_seen: Instant::now(),
            },
        );
    }

    /// Entry for a server
    #[must_use]
    pub fn get(&self, addr: &SocketAddr) -> Option<TrackedServer> {
        self.servers.get(addr).map(|entry| entry.value().clone())
    }

    /// Number of tracked servers
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether no servers are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Drop servers not seen for `older_than`; returns how many were removed.
    pub fn prune(&self, older_than: Duration) -> usize {
        let before = self.servers.len();
        self.servers
            .retain(|_, server| server.last_seen.elapsed() <= older_than);
        before.saturating_sub(self.servers.len())
    }
}

/// Users barred from multipath, grouped by buyer company code
pub trait MultipathVetoStore: Send + Sync {
    /// Copy of the vetoed user hashes for a company
    fn map_copy(&self, company_code: &str) -> HashSet<u64>;

    /// Bar a user from multipath
    fn mark_vetoed(&self, company_code: &str, user_hash: u64);
}

/// [`MultipathVetoStore`] held in process memory
#[derive(Debug, Default)]
pub struct InMemoryMultipathVetoStore {
    users: DashMap<String, HashSet<u64>>,
}

impl InMemoryMultipathVetoStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. from a saved file
    #[must_use]
    pub fn with_users(users: HashMap<String, HashSet<u64>>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

impl MultipathVetoStore for InMemoryMultipathVetoStore {
    fn map_copy(&self, company_code: &str) -> HashSet<u64> {
        self.users
            .get(company_code)
            .map(|users| users.value().clone())
            .unwrap_or_default()
    }

    fn mark_vetoed(&self, company_code: &str, user_hash: u64) {
        self.users
            .entry(company_code.to_string())
            .or_default()
            .insert(user_hash);
    }
}
