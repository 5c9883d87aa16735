//! Transport trait abstraction.
//!
//! The packet server only needs datagram send and receive, so it is written
//! against [`Transport`] and tests can swap in any implementation.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram transport.
///
/// # Examples
///
/// ```no_run
/// use netnext_transport::transport::Transport;
/// use netnext_transport::udp_async::AsyncUdpTransport;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:40000".parse()?;
/// let transport = AsyncUdpTransport::bind(addr).await?;
///
/// let mut buf = vec![0u8; 4096];
/// let (size, from) = transport.recv_from(&mut buf).await?;
/// transport.send_to(&buf[..size], from).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] after [`close`](Self::close), or the
    /// underlying I/O error.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram into `buf`, returning its size and sender.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] after [`close`](Self::close), or the
    /// underlying I/O error.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Get the local address this transport is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the transport. Later operations return [`TransportError::Closed`].
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Byte and packet counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}
