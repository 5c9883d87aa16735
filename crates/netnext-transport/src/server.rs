//! Packet server loop.
//!
//! Reads datagrams off a [`Transport`] and runs each one through
//! [`handle_datagram`] on its own tokio task. Handlers are synchronous and
//! never block, so the task only exists to keep the receive loop free while
//! the response is sent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use netnext_core::HandlerContext;
use netnext_core::handlers::handle_datagram;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult};

/// Packet server counters
#[derive(Debug, Default)]
pub struct ServerStats {
    datagrams_received: AtomicU64,
    oversized_dropped: AtomicU64,
    responses_sent: AtomicU64,
    no_response: AtomicU64,
    send_failures: AtomicU64,
    recv_failures: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    /// Datagrams read off the socket
    pub datagrams_received: u64,
    /// Datagrams over the size limit
    pub oversized_dropped: u64,
    /// Responses written back
    pub responses_sent: u64,
    /// Datagrams the handlers answered with nothing
    pub no_response: u64,
    /// Response sends that failed
    pub send_failures: u64,
    /// Receive errors that did not stop the loop
    pub recv_failures: u64,
}

impl ServerStats {
    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            oversized_dropped: self.oversized_dropped.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            no_response: self.no_response.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            recv_failures: self.recv_failures.load(Ordering::Relaxed),
        }
    }
}

/// UDP dispatch loop in front of the handlers
pub struct PacketServer {
    transport: Arc<dyn Transport>,
    ctx: Arc<HandlerContext>,
    max_packet_size: usize,
    cancel: CancellationToken,
    stats: Arc<ServerStats>,
}

impl PacketServer {
    /// Create a server over `transport`. Nothing is read until [`run`](Self::run).
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        ctx: Arc<HandlerContext>,
        config: &TransportConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            ctx,
            max_packet_size: config.max_packet_size,
            cancel,
            stats: Arc::new(ServerStats::default()),
        }
    }

    /// Server counters
    #[must_use]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Address the transport is bound to
    ///
    /// # Errors
    /// Returns the transport's error if the address is unavailable.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.transport.local_addr()
    }

    /// Receive and dispatch until cancelled, then wait for in-flight
    /// datagrams to finish.
    ///
    /// # Errors
    /// Returns [`TransportError::Closed`] if the transport was closed under
    /// the loop. Other receive errors are counted and skipped.
    pub async fn run(&self) -> TransportResult<()> {
        // one extra byte so oversized datagrams are detectable
        let mut buf = vec![0u8; self.max_packet_size + 1];
        let mut tasks = JoinSet::new();

        info!(addr = ?self.transport.local_addr().ok(), "packet server running");

        let result = loop {
            tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!(%err, "datagram task failed");
                    }
                }
                received = self.transport.recv_from(&mut buf) => match received {
                    Ok((size, from)) => self.dispatch(&mut tasks, &buf[..size], from),
                    Err(TransportError::Closed) => break Err(TransportError::Closed),
                    Err(err) => {
                        self.stats.recv_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(%err, "receive failed");
                    }
                },
            }
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(%err, "datagram task failed");
            }
        }
        info!(stats = ?self.stats.snapshot(), "packet server stopped");
        result
    }

    fn dispatch(&self, tasks: &mut JoinSet<()>, datagram: &[u8], from: SocketAddr) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);

        if datagram.len() > self.max_packet_size {
            self.stats.oversized_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%from, size = datagram.len(), "dropping oversized datagram");
            return;
        }

        let datagram = datagram.to_vec();
        let ctx = Arc::clone(&self.ctx);
        let transport = Arc::clone(&self.transport);
        let stats = Arc::clone(&self.stats);

        tasks.spawn(async move {
            let Some(response) = handle_datagram(&ctx, from, &datagram) else {
                stats.no_response.fetch_add(1, Ordering::Relaxed);
                return;
            };
            match transport.send_to(&response, from).await {
                Ok(_) => {
                    stats.responses_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%from, %err, "could not send response");
                }
            }
        });
    }
}
