//! Route token chains.
//!
//! A route is a chain of nodes: client, up to five relays, server. Each node
//! gets one token sealed to its own route public key with the router private
//! key, so only that node can read it. New route tokens tell each node where
//! to forward; continue tokens only extend the expiry of a route already in
//! place.
//!
//! ```text
//! token i:  nonce(24) | tag(16) | sealed plaintext
//! chain:    [client][relay 0]...[relay n-1][server]
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use netnext_crypto::random::random_32;
use netnext_crypto::sealed::{open, seal_into};
use netnext_crypto::x25519::{PrivateKey, PublicKey};

use crate::error::TokenError;
use crate::session_data::SessionData;
use crate::storage::Storer;
use crate::{
    BILLING_SLICE_SECONDS, CONTINUE_TOKEN_SIZE, ENCRYPTED_CONTINUE_TOKEN_SIZE,
    ENCRYPTED_ROUTE_TOKEN_SIZE, MAX_NODES, ROUTE_TOKEN_SIZE,
};

/// Bytes a next-hop address takes inside a route token
pub const NEXT_ADDRESS_SIZE: usize = 19;

const ADDRESS_NONE: u8 = 0;
const ADDRESS_IPV4: u8 = 1;
const ADDRESS_IPV6: u8 = 2;

const NEXT_ADDRESS_OFFSET: usize = 8 + 8 + 1 + 4 + 4;
const PRIVATE_KEY_OFFSET: usize = NEXT_ADDRESS_OFFSET + NEXT_ADDRESS_SIZE;

fn write_address(out: &mut [u8; NEXT_ADDRESS_SIZE], addr: Option<&SocketAddr>) {
    *out = [0; NEXT_ADDRESS_SIZE];
    match addr.map(|a| (a.ip(), a.port())) {
        None => out[0] = ADDRESS_NONE,
        Some((IpAddr::V4(ip), port)) => {
            out[0] = ADDRESS_IPV4;
            out[1..5].copy_from_slice(&ip.octets());
            out[5..7].copy_from_slice(&port.to_le_bytes());
        }
        Some((IpAddr::V6(ip), port)) => {
            out[0] = ADDRESS_IPV6;
            out[1..17].copy_from_slice(&ip.octets());
            out[17..19].copy_from_slice(&port.to_le_bytes());
        }
    }
}

fn read_address(data: &[u8; NEXT_ADDRESS_SIZE]) -> Option<SocketAddr> {
    match data[0] {
        ADDRESS_IPV4 => {
            let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
            Some(SocketAddr::new(ip.into(), u16::from_le_bytes([data[5], data[6]])))
        }
        ADDRESS_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            let ip = Ipv6Addr::from(octets);
            Some(SocketAddr::new(ip.into(), u16::from_le_bytes([data[17], data[18]])))
        }
        _ => None,
    }
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(bytes)
}

/// Plaintext of a new route token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteToken {
    /// Unix seconds after which the route is dead
    pub expire_timestamp: u64,
    /// Session id
    pub session_id: u64,
    /// Session version the route belongs to
    pub session_version: u8,
    /// Upstream bandwidth envelope
    pub kbps_up: u32,
    /// Downstream bandwidth envelope
    pub kbps_down: u32,
    /// Where this node forwards; `None` for the server
    pub next_address: Option<SocketAddr>,
    /// Route private key shared by every node on the chain
    pub private_key: [u8; 32],
}

impl RouteToken {
    /// Fixed little-endian layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ROUTE_TOKEN_SIZE] {
        let mut out = [0u8; ROUTE_TOKEN_SIZE];
        out[0..8].copy_from_slice(&self.expire_timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.session_id.to_le_bytes());
        out[16] = self.session_version;
        out[17..21].copy_from_slice(&self.kbps_up.to_le_bytes());
        out[21..25].copy_from_slice(&self.kbps_down.to_le_bytes());
        let mut address = [0u8; NEXT_ADDRESS_SIZE];
        write_address(&mut address, self.next_address.as_ref());
        out[NEXT_ADDRESS_OFFSET..PRIVATE_KEY_OFFSET].copy_from_slice(&address);
        out[PRIVATE_KEY_OFFSET..].copy_from_slice(&self.private_key);
        out
    }

    /// Parse the fixed layout.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::BufferSize`] if `data` is too short.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TokenError> {
        if data.len() < ROUTE_TOKEN_SIZE {
            return Err(TokenError::BufferSize {
                expected: ROUTE_TOKEN_SIZE,
                actual: data.len(),
            });
        }
        let mut address = [0u8; NEXT_ADDRESS_SIZE];
        address.copy_from_slice(&data[NEXT_ADDRESS_OFFSET..PRIVATE_KEY_OFFSET]);
        let mut private_key = [0u8; 32];
        private_key.copy_from_slice(&data[PRIVATE_KEY_OFFSET..ROUTE_TOKEN_SIZE]);
        Ok(Self {
            expire_timestamp: le_u64(data, 0),
            session_id: le_u64(data, 8),
            session_version: data[16],
            kbps_up: le_u32(data, 17),
            kbps_down: le_u32(data, 21),
            next_address: read_address(&address),
            private_key,
        })
    }

    /// Open a sealed route token addressed to `receiver`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Crypto`] if the token does not authenticate.
    pub fn open(
        sealed: &[u8],
        router_public: &PublicKey,
        receiver: &PrivateKey,
    ) -> Result<Self, TokenError> {
        Self::from_bytes(&open(receiver, router_public, sealed)?)
    }
}

/// Plaintext of a continue token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueToken {
    /// Unix seconds after which the route is dead
    pub expire_timestamp: u64,
    /// Session id
    pub session_id: u64,
    /// Session version the route belongs to
    pub session_version: u8,
}

impl ContinueToken {
    /// Fixed little-endian layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CONTINUE_TOKEN_SIZE] {
        let mut out = [0u8; CONTINUE_TOKEN_SIZE];
        out[0..8].copy_from_slice(&self.expire_timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.session_id.to_le_bytes());
        out[16] = self.session_version;
        out
    }

    /// Parse the fixed layout.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::BufferSize`] if `data` is too short.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TokenError> {
        if data.len() < CONTINUE_TOKEN_SIZE {
            return Err(TokenError::BufferSize {
                expected: CONTINUE_TOKEN_SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            expire_timestamp: le_u64(data, 0),
            session_id: le_u64(data, 8),
            session_version: data[16],
        })
    }

    /// Open a sealed continue token addressed to `receiver`.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Crypto`] if the token does not authenticate.
    pub fn open(
        sealed: &[u8],
        router_public: &PublicKey,
        receiver: &PrivateKey,
    ) -> Result<Self, TokenError> {
        Self::from_bytes(&open(receiver, router_public, sealed)?)
    }
}

fn check_chain(out: &[u8], num_nodes: usize, token_size: usize) -> Result<(), TokenError> {
    if num_nodes > MAX_NODES {
        return Err(TokenError::TooManyNodes(num_nodes));
    }
    if out.len() != num_nodes * token_size {
        return Err(TokenError::BufferSize {
            expected: num_nodes * token_size,
            actual: out.len(),
        });
    }
    Ok(())
}

/// Seal one new route token per node into `out`.
///
/// Token `i` carries `addresses[i + 1]` as its next hop; the last token has
/// none. Every token carries the same freshly generated route private key.
///
/// # Errors
///
/// Returns [`TokenError`] if the chain is too long, `out` is not sized for
/// `public_keys.len()` tokens, or sealing fails.
#[allow(clippy::too_many_arguments)]
pub fn write_route_tokens(
    out: &mut [u8],
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
    kbps_up: u32,
    kbps_down: u32,
    addresses: &[SocketAddr],
    public_keys: &[PublicKey],
    router: &PrivateKey,
) -> Result<(), TokenError> {
    let num_nodes = public_keys.len();
    check_chain(out, num_nodes, ENCRYPTED_ROUTE_TOKEN_SIZE)?;

    let private_key = random_32()?;
    for (i, (public_key, sealed)) in public_keys
        .iter()
        .zip(out.chunks_exact_mut(ENCRYPTED_ROUTE_TOKEN_SIZE))
        .enumerate()
    {
        let token = RouteToken {
            expire_timestamp,
            session_id,
            session_version,
            kbps_up,
            kbps_down,
            next_address: if i + 1 < num_nodes {
                addresses.get(i + 1).copied()
            } else {
                None
            },
            private_key,
        };
        seal_into(router, public_key, &token.to_bytes(), sealed)?;
    }
    Ok(())
}

/// Seal one continue token per node into `out`.
///
/// # Errors
///
/// Returns [`TokenError`] if the chain is too long, `out` is not sized for
/// `public_keys.len()` tokens, or sealing fails.
pub fn write_continue_tokens(
    out: &mut [u8],
    expire_timestamp: u64,
    session_id: u64,
    session_version: u8,
    public_keys: &[PublicKey],
    router: &PrivateKey,
) -> Result<(), TokenError> {
    check_chain(out, public_keys.len(), ENCRYPTED_CONTINUE_TOKEN_SIZE)?;

    let token = ContinueToken {
        expire_timestamp,
        session_id,
        session_version,
    }
    .to_bytes();
    for (public_key, sealed) in public_keys
        .iter()
        .zip(out.chunks_exact_mut(ENCRYPTED_CONTINUE_TOKEN_SIZE))
    {
        seal_into(router, public_key, &token, sealed)?;
    }
    Ok(())
}

/// Addresses and route keys of every node on a route
#[derive(Debug, Clone)]
pub struct RouteHops {
    /// Address each node is reached at
    pub addresses: Vec<SocketAddr>,
    /// Route public key of each node
    pub public_keys: Vec<PublicKey>,
}

impl RouteHops {
    /// Nodes on the route, client and server included
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.public_keys.len()
    }
}

/// Endpoints of a route outside the relay network
#[derive(Debug, Clone, Copy)]
pub struct RouteEndpoints<'a> {
    /// Client address
    pub client_address: SocketAddr,
    /// Client route public key
    pub client_public_key: &'a [u8; 32],
    /// Server address
    pub server_address: SocketAddr,
    /// Server route public key
    pub server_public_key: &'a [u8; 32],
}

/// Resolve the address and key of every node on a relay route.
///
/// Relay addresses default to the public address. The first relay uses its
/// internal address when that address is marked client routable. Later
/// relays use their internal address when `enable_internal_ips` is set,
/// the previous relay has the same seller and both have internal addresses.
///
/// # Errors
///
/// Returns [`TokenError::RelayNotFound`] if a relay is missing from the
/// configuration, [`TokenError::InvalidRelayKey`] if its key is malformed and
/// [`TokenError::TooManyNodes`] for routes longer than the wire allows.
pub fn route_addresses_and_public_keys(
    endpoints: &RouteEndpoints<'_>,
    route_relay_ids: &[u64],
    storer: &dyn Storer,
    enable_internal_ips: bool,
) -> Result<RouteHops, TokenError> {
    let num_nodes = route_relay_ids.len() + 2;
    if num_nodes > MAX_NODES {
        return Err(TokenError::TooManyNodes(num_nodes));
    }

    let mut addresses = Vec::with_capacity(num_nodes);
    let mut public_keys = Vec::with_capacity(num_nodes);

    addresses.push(endpoints.client_address);
    public_keys.push(PublicKey::from_bytes(*endpoints.client_public_key));

    let mut previous: Option<crate::routing::Relay> = None;
    for (i, relay_id) in route_relay_ids.iter().enumerate() {
        let relay = storer
            .relay(*relay_id)
            .ok_or(TokenError::RelayNotFound(*relay_id))?;
        let public_key = PublicKey::from_slice(&relay.public_key)
            .map_err(|_| TokenError::InvalidRelayKey(*relay_id))?;

        let address = match (relay.internal_addr, previous.as_ref()) {
            (Some(internal), _) if i == 0 && relay.internal_address_client_routable => internal,
            (Some(internal), Some(prev))
                if enable_internal_ips
                    && prev.seller_id == relay.seller_id
                    && prev.internal_addr.is_some() =>
            {
                internal
            }
            _ => relay.addr,
        };

        addresses.push(address);
        public_keys.push(public_key);
        previous = Some(relay);
    }

    addresses.push(endpoints.server_address);
    public_keys.push(PublicKey::from_bytes(*endpoints.server_public_key));

    Ok(RouteHops {
        addresses,
        public_keys,
    })
}

/// Issue a new token chain for `hops`.
///
/// Buys one extra slice ahead, bumps the session version and marks the
/// session initial so the next slice extends expiry by two slices.
///
/// # Errors
///
/// Propagates [`write_route_tokens`] failures; `session_data` is left
/// untouched on error.
pub fn build_next_tokens(
    session_data: &mut SessionData,
    hops: &RouteHops,
    kbps_up: u32,
    kbps_down: u32,
    router: &PrivateKey,
) -> Result<Vec<u8>, TokenError> {
    let expire_timestamp = session_data.expire_timestamp + BILLING_SLICE_SECONDS;
    let session_version = session_data.session_version.wrapping_add(1);

    let mut tokens = vec![0u8; hops.num_nodes() * ENCRYPTED_ROUTE_TOKEN_SIZE];
    write_route_tokens(
        &mut tokens,
        expire_timestamp,
        session_data.session_id,
        session_version,
        kbps_up,
        kbps_down,
        &hops.addresses,
        &hops.public_keys,
        router,
    )?;

    session_data.expire_timestamp = expire_timestamp;
    session_data.session_version = session_version;
    session_data.initial = true;
    Ok(tokens)
}

/// Issue continue tokens extending the current route.
///
/// # Errors
///
/// Propagates [`write_continue_tokens`] failures.
pub fn build_continue_tokens(
    session_data: &SessionData,
    hops: &RouteHops,
    router: &PrivateKey,
) -> Result<Vec<u8>, TokenError> {
    let mut tokens = vec![0u8; hops.num_nodes() * ENCRYPTED_CONTINUE_TOKEN_SIZE];
    write_continue_tokens(
        &mut tokens,
        session_data.expire_timestamp,
        session_data.session_id,
        session_data.session_version,
        &hops.public_keys,
        router,
    )?;
    Ok(tokens)
}
