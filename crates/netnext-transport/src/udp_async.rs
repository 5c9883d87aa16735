//! Async UDP transport.
//!
//! A tokio socket built through `socket2` so the kernel buffers can be sized
//! before binding.

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;

/// Async UDP transport using Tokio.
///
/// Clones share the socket and counters.
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    recv_errors: Arc<AtomicU64>,
}

impl AsyncUdpTransport {
    /// Bind with the default socket buffer sizes.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the socket cannot be created
    /// or bound.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_config(addr, &TransportConfig::default()).await
    }

    /// Bind with explicit socket buffer sizes.
    ///
    /// # Errors
    /// Returns [`TransportError::BindFailed`] if the socket cannot be created,
    /// tuned or bound.
    pub async fn bind_with_config<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let addr = addr.into();
        let bind_failed = |e: std::io::Error| TransportError::BindFailed(e.to_string());

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(bind_failed)?;

        socket2
            .set_recv_buffer_size(config.recv_buffer_size)
            .map_err(bind_failed)?;
        socket2
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_failed)?;

        socket2.bind(&addr.into()).map_err(bind_failed)?;

        socket2.set_nonblocking(true).map_err(bind_failed)?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;

        Ok(Self::from_socket(socket))
    }

    /// Wrap an already-bound Tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received: Arc::new(AtomicU64::new(0)),
            send_errors: Arc::new(AtomicU64::new(0)),
            recv_errors: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        match self.socket.recv_from(buf).await {
            Ok((size, addr)) => {
                self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                Ok((size, addr))
            }
            Err(e) => {
                self.recv_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn pair() -> (AsyncUdpTransport, AsyncUdpTransport) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = AsyncUdpTransport::bind(addr).await.unwrap();
        let client = AsyncUdpTransport::bind(addr).await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_udp_bind() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport = AsyncUdpTransport::bind(addr).await.unwrap();
        let bound_addr = transport.local_addr().unwrap();
        assert_ne!(bound_addr.port(), 0);
        assert!(bound_addr.is_ipv4());
    }

    #[tokio::test]
    async fn test_udp_bind_with_small_buffers() {
        let config = TransportConfig {
            recv_buffer_size: 64 * 1024,
            send_buffer_size: 64 * 1024,
            ..TransportConfig::default()
        };
        let transport = AsyncUdpTransport::bind_with_config(([127, 0, 0, 1], 0), &config)
            .await
            .unwrap();
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_udp_send_recv_and_stats() {
        let (server, client) = pair().await;
        let server_addr = server.local_addr().unwrap();

        let sent = client.send_to(b"session update", server_addr).await.unwrap();
        assert_eq!(sent, 14);

        let mut buf = vec![0u8; 4096];
        let (size, from) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();

        assert_eq!(&buf[..size], b"session update");
        assert_eq!(from, client.local_addr().unwrap());

        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(client.stats().bytes_sent, 14);
        assert_eq!(server.stats().packets_received, 1);
        assert_eq!(server.stats().bytes_received, 14);
    }

    #[tokio::test]
    async fn test_udp_max_packet() {
        let (server, client) = pair().await;
        let server_addr = server.local_addr().unwrap();

        let large = vec![0xAA; netnext_core::DEFAULT_MAX_PACKET_SIZE];
        client.send_to(&large, server_addr).await.unwrap();

        let mut buf = vec![0u8; netnext_core::DEFAULT_MAX_PACKET_SIZE + 1];
        let (size, _) = timeout(Duration::from_secs(1), server.recv_from(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(size, large.len());
    }

    #[tokio::test]
    async fn test_udp_close() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let transport = AsyncUdpTransport::bind(addr).await.unwrap();

        transport.close().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_to(b"test", "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));

        let mut buf = vec![0u8; 64];
        let result = transport.recv_from(&mut buf).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_udp_ipv6() {
        let addr: SocketAddr = "[::1]:0".parse().unwrap();
        let transport = AsyncUdpTransport::bind(addr).await.unwrap();
        assert!(transport.local_addr().unwrap().is_ipv6());
    }

    #[tokio::test]
    async fn test_udp_clones_share_counters() {
        let (server, client) = pair().await;
        let server_addr = server.local_addr().unwrap();

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let client = client.clone();
                tokio::spawn(async move {
                    client.send_to(format!("slice {i}").as_bytes(), server_addr).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(client.stats().packets_sent, 5);
    }
}
