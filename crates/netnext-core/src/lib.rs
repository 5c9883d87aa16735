//! # netnext Core
//!
//! Session routing core of the netnext relay backend.
//!
//! This crate provides:
//! - Bit-packed stream encoding shared with the SDK
//! - Wire packets for server init, server update and session update
//! - The `SessionData` blob round-tripped through the SDK every slice
//! - Route token chains sealed per hop
//! - The routing data model, route matrix snapshot and route decisions
//! - Synchronous packet handlers and the post-session fan-out
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Handlers                                  │
//! │   (server init, server update, session update pipeline)         │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │   Route decision + tokens     │   Post-session fan-out           │
//! │   (matrix, decider, sealing)  │   (billing, portal, match data)  │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                  Packets + SessionData                           │
//! │   (bit-packed wire formats, version gated)                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod billing;
pub mod encoding;
pub mod error;
pub mod handlers;
pub mod locator;
pub mod match_data;
pub mod metrics;
pub mod packets;
pub mod portal;
pub mod post_session;
pub mod routing;
pub mod session_data;
pub mod storage;
pub mod tokens;

pub use error::{EncodingError, Error, PacketError, PublishError, Result, TokenError};
pub use handlers::HandlerContext;
pub use packets::{Packet, PacketType, SdkVersion};
pub use post_session::PostSessionHandler;
pub use routing::{RouteDecider, RouteMatrix, RouteType};
pub use session_data::SessionData;

/// Maximum near relays a session pings
pub const MAX_NEAR_RELAYS: usize = 32;

/// Maximum relays on one route
pub const MAX_RELAYS_PER_ROUTE: usize = 5;

/// Maximum nodes on a route: client, relays, server
pub const MAX_NODES: usize = MAX_RELAYS_PER_ROUTE + 2;

/// Maximum tokens in one response
pub const MAX_TOKENS: usize = MAX_NODES;

/// Wire ceiling for the session data blob
pub const MAX_SESSION_DATA_SIZE: usize = 511;

/// Maximum tags on a session update
pub const MAX_TAGS: usize = 8;

/// Maximum datacenter name length (exclusive)
pub const MAX_DATACENTER_NAME_LENGTH: usize = 256;

/// Maximum debug string length (exclusive)
pub const MAX_DEBUG_LENGTH: usize = 1024;

/// Maximum retries the SDK reports for a slice
pub const MAX_SESSION_UPDATE_RETRIES: i32 = 10;

/// Packet hash placeholder size
pub const PACKET_HASH_SIZE: usize = netnext_crypto::PACKET_HASH_SIZE;

/// Packet signature size
pub const SIGNATURE_SIZE: usize = netnext_crypto::ED25519_SIGNATURE_SIZE;

/// Route token plaintext size
pub const ROUTE_TOKEN_SIZE: usize = 76;

/// Sealed route token size
pub const ENCRYPTED_ROUTE_TOKEN_SIZE: usize = ROUTE_TOKEN_SIZE + netnext_crypto::SEALED_OVERHEAD;

/// Continue token plaintext size
pub const CONTINUE_TOKEN_SIZE: usize = 17;

/// Sealed continue token size
pub const ENCRYPTED_CONTINUE_TOKEN_SIZE: usize =
    CONTINUE_TOKEN_SIZE + netnext_crypto::SEALED_OVERHEAD;

/// Length of one slice in seconds
pub const BILLING_SLICE_SECONDS: u64 = 10;

/// Route cost ceiling; also marks "no route"
pub const INVALID_ROUTE_VALUE: i32 = 10000;

/// Cost added to every next route so ties favor direct
pub const COST_BIAS: i32 = 3;

/// Current session data layout version
pub const SESSION_DATA_VERSION: u32 = 13;

/// Largest datagram the backend reads or writes
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4096;
