//! Route matrix snapshot.
//!
//! The matrix indexes relays densely and stores, for every unordered relay
//! pair, up to [`MAX_ROUTES_PER_ENTRY`] candidate routes sorted by cost.
//! Pairs live in a lower-triangular array addressed by
//! [`tri_matrix_index`]. Routes in an entry run from the higher relay index
//! to the lower one.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::MAX_ROUTES_PER_ENTRY;
use crate::MAX_RELAYS_PER_ROUTE;

const EARTH_RADIUS_KM: f64 = 6371.0;
const SPEED_OF_LIGHT_KM_PER_SEC: f64 = 299_792.458;

/// Near relays further than this from the client are not considered
const NEAR_RELAY_DISTANCE_KM: i64 = 2500;

/// Slack added to direct latency when admitting a near relay
const NEAR_RELAY_LATENCY_MS: f32 = 30.0;

/// Great-circle distance in kilometers
#[must_use]
pub fn haversine_distance(lat1: f64, long1: f64, lat2: f64, long2: f64) -> f64 {
    let lat1 = lat1.to_radians();
    let lat2 = lat2.to_radians();
    let delta_lat = lat2 - lat1;
    let delta_long = (long2 - long1).to_radians();
    let lat_sine = (delta_lat / 2.0).sin();
    let long_sine = (delta_long / 2.0).sin();
    let a = lat_sine * lat_sine + lat1.cos() * lat2.cos() * long_sine * long_sine;
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// Light travel time from `a` through `b` to `c`, in milliseconds
#[must_use]
pub fn speed_of_light_time_ms(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    let km = haversine_distance(a.0, a.1, b.0, b.1) + haversine_distance(b.0, b.1, c.0, c.1);
    km / SPEED_OF_LIGHT_KM_PER_SEC * 1000.0
}

/// Index of the unordered pair `(i, j)` in a lower-triangular array
#[must_use]
pub fn tri_matrix_index(i: usize, j: usize) -> usize {
    if i > j {
        i * (i + 1) / 2 - i + j
    } else {
        j * (j + 1) / 2 - j + i
    }
}

/// Length of a lower-triangular array over `size` relays
#[must_use]
pub fn tri_matrix_length(size: usize) -> usize {
    size * size.saturating_sub(1) / 2
}

/// FNV-1a over the big-endian bytes of each relay index
#[must_use]
pub fn route_hash(relays: &[i32]) -> u32 {
    const PRIME: u32 = 16_777_619;
    let mut hash = 0u32;
    for relay in relays {
        for byte in relay.to_be_bytes() {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// Candidate routes between one relay pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Cost of the direct relay-to-relay link
    pub direct_cost: i32,
    /// Valid routes in this entry
    pub num_routes: usize,
    /// Route cost, ascending
    pub route_cost: [i32; MAX_ROUTES_PER_ENTRY],
    /// Relay count per route
    pub route_num_relays: [usize; MAX_ROUTES_PER_ENTRY],
    /// Relay indices per route
    pub route_relays: [[i32; MAX_RELAYS_PER_ROUTE]; MAX_ROUTES_PER_ENTRY],
    /// [`route_hash`] per route
    pub route_hash: [u32; MAX_ROUTES_PER_ENTRY],
}

impl RouteEntry {
    /// Relays of route `k`
    #[must_use]
    pub fn relays(&self, k: usize) -> &[i32] {
        &self.route_relays[k][..self.route_num_relays[k]]
    }

    /// Insert a route keeping the entry sorted by cost.
    ///
    /// Duplicate routes, routes with loops and routes costlier than a full
    /// entry's worst are ignored.
    pub fn add_route(&mut self, cost: i32, relays: &[i32]) {
        if relays.is_empty() || relays.len() > MAX_RELAYS_PER_ROUTE {
            return;
        }
        for (i, relay) in relays.iter().enumerate() {
            if relays[i + 1..].contains(relay) {
                return;
            }
        }

        let hash = route_hash(relays);
        if self.route_hash[..self.num_routes].contains(&hash) {
            return;
        }

        if self.num_routes == MAX_ROUTES_PER_ENTRY {
            if cost >= self.route_cost[MAX_ROUTES_PER_ENTRY - 1] {
                return;
            }
            self.num_routes -= 1;
        }

        let insert = self.route_cost[..self.num_routes].partition_point(|c| *c <= cost);
        for k in (insert..self.num_routes).rev() {
            self.route_cost[k + 1] = self.route_cost[k];
            self.route_hash[k + 1] = self.route_hash[k];
            self.route_num_relays[k + 1] = self.route_num_relays[k];
            self.route_relays[k + 1] = self.route_relays[k];
        }

        self.route_cost[insert] = cost;
        self.route_hash[insert] = hash;
        self.route_num_relays[insert] = relays.len();
        self.route_relays[insert] = [0; MAX_RELAYS_PER_ROUTE];
        self.route_relays[insert][..relays.len()].copy_from_slice(relays);
        self.num_routes += 1;
    }
}

/// Relay topology and route costs at one point in time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMatrix {
    relay_ids: Vec<u64>,
    relay_addresses: Vec<SocketAddr>,
    relay_names: Vec<String>,
    relay_latitudes: Vec<f32>,
    relay_longitudes: Vec<f32>,
    relay_datacenter_ids: Vec<u64>,
    route_entries: Vec<RouteEntry>,
    created_at: u64,
    #[serde(skip)]
    relay_id_to_index: HashMap<u64, i32>,
}

/// One relay row used to build a [`RouteMatrix`]
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixRelay {
    /// Relay id
    pub id: u64,
    /// Public address
    pub addr: SocketAddr,
    /// Display name
    pub name: String,
    /// Latitude in degrees
    pub latitude: f32,
    /// Longitude in degrees
    pub longitude: f32,
    /// Hosting datacenter
    pub datacenter_id: u64,
}

impl RouteMatrix {
    /// Build an empty-cost matrix over `relays`.
    #[must_use]
    pub fn new(relays: Vec<MatrixRelay>, created_at: u64) -> Self {
        let mut matrix = Self {
            route_entries: vec![RouteEntry::default(); tri_matrix_length(relays.len())],
            created_at,
            ..Self::default()
        };
        for relay in relays {
            matrix.relay_ids.push(relay.id);
            matrix.relay_addresses.push(relay.addr);
            matrix.relay_names.push(relay.name);
            matrix.relay_latitudes.push(relay.latitude);
            matrix.relay_longitudes.push(relay.longitude);
            matrix.relay_datacenter_ids.push(relay.datacenter_id);
        }
        matrix.rebuild_index();
        matrix
    }

    /// Parse a JSON snapshot.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`] for malformed input.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let mut matrix: Self = serde_json::from_str(json)?;
        let expected = tri_matrix_length(matrix.relay_ids.len());
        if matrix.route_entries.len() < expected {
            matrix.route_entries.resize(expected, RouteEntry::default());
        }
        matrix.rebuild_index();
        Ok(matrix)
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`serde_json::Error`].
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn rebuild_index(&mut self) {
        self.relay_id_to_index = self
            .relay_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as i32))
            .collect();
    }

    /// Add a route between the first and last relay of `relays`.
    ///
    /// Routes are stored oriented from the higher relay index to the lower.
    pub fn add_route(&mut self, cost: i32, relays: &[i32]) {
        let (Some(first), Some(last)) = (relays.first(), relays.last()) else {
            return;
        };
        if first == last || relays.iter().any(|r| *r < 0 || *r as usize >= self.relay_ids.len()) {
            return;
        }
        let index = tri_matrix_index(*first as usize, *last as usize);
        if first < last {
            let reversed: Vec<i32> = relays.iter().rev().copied().collect();
            self.route_entries[index].add_route(cost, &reversed);
        } else {
            self.route_entries[index].add_route(cost, relays);
        }
    }

    /// Dense index of a relay id
    #[must_use]
    pub fn relay_index(&self, relay_id: u64) -> Option<i32> {
        self.relay_id_to_index.get(&relay_id).copied()
    }

    /// Relay ids by index
    #[must_use]
    pub fn relay_ids(&self) -> &[u64] {
        &self.relay_ids
    }

    /// Relay public addresses by index
    #[must_use]
    pub fn relay_addresses(&self) -> &[SocketAddr] {
        &self.relay_addresses
    }

    /// Relay names by index
    #[must_use]
    pub fn relay_names(&self) -> &[String] {
        &self.relay_names
    }

    /// Latitude and longitude of the relay at `index`
    #[must_use]
    pub fn relay_lat_long(&self, index: usize) -> Option<(f32, f32)> {
        Some((*self.relay_latitudes.get(index)?, *self.relay_longitudes.get(index)?))
    }

    /// Number of relays
    #[must_use]
    pub fn num_relays(&self) -> usize {
        self.relay_ids.len()
    }

    /// Ids of the relays located in a datacenter
    #[must_use]
    pub fn datacenter_relays(&self, datacenter_id: u64) -> Vec<u64> {
        self.relay_datacenter_ids
            .iter()
            .zip(&self.relay_ids)
            .filter(|(dc, _)| **dc == datacenter_id)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Unix seconds at which the matrix was produced
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether the matrix is older than `max_age_secs` at `now`
    #[must_use]
    pub fn is_stale(&self, max_age_secs: u64, now: u64) -> bool {
        self.created_at.saturating_add(max_age_secs) < now
    }

    /// Route cost entries in triangular order
    #[must_use]
    pub fn route_entries(&self) -> &[RouteEntry] {
        &self.route_entries
    }

    /// Entry for the pair `(i, j)`
    #[must_use]
    pub fn entry(&self, i: i32, j: i32) -> Option<&RouteEntry> {
        if i < 0 || j < 0 || i == j {
            return None;
        }
        self.route_entries.get(tri_matrix_index(i as usize, j as usize))
    }

    /// Pick up to `max` relays for a new session to ping.
    ///
    /// Relays are taken nearest-first around the client, then around the
    /// destination, skipping any whose light-speed detour through the relay
    /// exceeds the direct latency plus a fixed slack. Coordinates are
    /// truncated to whole degrees. Unknown direct latency (`<= 0`) is
    /// approximated by twice the light-speed time between the endpoints.
    #[must_use]
    pub fn near_relays(
        &self,
        direct_latency: f32,
        source: (f32, f32),
        dest: (f32, f32),
        max: usize,
    ) -> Vec<(u64, SocketAddr)> {
        let quantize = |v: f32| f64::from(v).trunc();
        let source = (quantize(source.0), quantize(source.1));
        let dest = (quantize(dest.0), quantize(dest.1));

        let direct_latency = if direct_latency <= 0.0 {
            let km = haversine_distance(source.0, source.1, dest.0, dest.1);
            (km / SPEED_OF_LIGHT_KM_PER_SEC * 1000.0) as f32 * 2.0
        } else {
            direct_latency
        };

        let positions: Vec<(f64, f64)> = self
            .relay_latitudes
            .iter()
            .zip(&self.relay_longitudes)
            .map(|(lat, long)| (quantize(*lat), quantize(*long)))
            .collect();

        let admits = |index: usize| {
            let latency = 1.5 * speed_of_light_time_ms(source, positions[index], dest) as f32;
            latency <= direct_latency + NEAR_RELAY_LATENCY_MS
        };

        let by_distance_from = |origin: (f64, f64)| {
            let mut order: Vec<(usize, i64)> = positions
                .iter()
                .enumerate()
                .map(|(i, p)| (i, haversine_distance(origin.0, origin.1, p.0, p.1) as i64))
                .collect();
            order.sort_by_key(|(_, distance)| *distance);
            order
        };

        let mut selected: Vec<usize> = Vec::with_capacity(max);

        for (index, distance) in by_distance_from(source) {
            if selected.len() == max || distance > NEAR_RELAY_DISTANCE_KM {
                break;
            }
            if admits(index) {
                selected.push(index);
            }
        }

        if selected.len() < max {
            for (index, _) in by_distance_from(dest) {
                if selected.len() == max {
                    break;
                }
                if !selected.contains(&index) && admits(index) {
                    selected.push(index);
                }
            }
        }

        selected
            .into_iter()
            .map(|i| (self.relay_ids[i], self.relay_addresses[i]))
            .collect()
    }
}
