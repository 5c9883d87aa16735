//! # netnext Transport
//!
//! UDP front end of the netnext backend.
//!
//! This crate provides:
//! - A [`Transport`] trait over datagram sockets
//! - [`AsyncUdpTransport`], a tokio socket with tuned kernel buffers
//! - [`PacketServer`], which hands every datagram to the core handlers on
//!   its own task and sends back whatever they return

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod server;
pub mod transport;
pub mod udp_async;

pub use server::{PacketServer, ServerStats, ServerStatsSnapshot};
pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp_async::AsyncUdpTransport;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Kernel receive buffer size
    pub recv_buffer_size: usize,
    /// Kernel send buffer size
    pub send_buffer_size: usize,
    /// Largest datagram accepted; longer ones are dropped
    pub max_packet_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            max_packet_size: netnext_core::DEFAULT_MAX_PACKET_SIZE,
        }
    }
}
