//! Backend wiring.
//!
//! Loads the database and route matrix snapshots, builds the handler context
//! and post-session fan-out, and runs the packet server until ctrl-c.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use netnext_core::HandlerContext;
use netnext_core::billing::LocalBiller;
use netnext_core::handlers::RouteMatrixProvider;
use netnext_core::locator::StaticIpLocator;
use netnext_core::match_data::LocalMatcher;
use netnext_core::metrics::Metrics;
use netnext_core::portal::LocalPublisher;
use netnext_core::post_session::{PostSessionHandler, PostSessionSinks};
use netnext_core::routing::{Database, LowestCostDecider, RouteMatrix};
use netnext_core::storage::InMemoryStorer;
use netnext_crypto::x25519::PrivateKey;
use netnext_transport::{AsyncUdpTransport, PacketServer};
use rand_core::OsRng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DataConfig};

/// Database and route matrix snapshots, swapped in place on reload
pub struct Snapshots {
    storer: Arc<InMemoryStorer>,
    matrix: Arc<RwLock<Arc<RouteMatrix>>>,
    database_path: Option<PathBuf>,
    route_matrix_path: Option<PathBuf>,
}

impl Snapshots {
    /// Read both snapshots. A missing path means an empty snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured file cannot be read or parsed.
    pub fn load(data: &DataConfig) -> anyhow::Result<Self> {
        let database = match &data.database_path {
            Some(path) => read_database(path)?,
            None => {
                warn!("no database_path configured, every buyer is unknown");
                Database::default()
            }
        };
        let matrix = match &data.route_matrix_path {
            Some(path) => read_route_matrix(path)?,
            None => {
                warn!("no route_matrix_path configured, sessions stay direct");
                RouteMatrix::default()
            }
        };

        info!(
            buyers = database.buyers.len(),
            relays = matrix.relay_ids().len(),
            "snapshots loaded"
        );

        Ok(Self {
            storer: Arc::new(InMemoryStorer::new(database)),
            matrix: Arc::new(RwLock::new(Arc::new(matrix))),
            database_path: data.database_path.clone(),
            route_matrix_path: data.route_matrix_path.clone(),
        })
    }

    /// Re-read the configured files. On error the previous snapshots stay.
    ///
    /// # Errors
    ///
    /// Returns the first read or parse failure.
    pub fn reload(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.database_path {
            self.storer.replace(read_database(path)?);
        }
        if let Some(path) = &self.route_matrix_path {
            let matrix = read_route_matrix(path)?;
            *self.matrix.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(matrix);
        }
        Ok(())
    }

    /// Buyer and relay lookups
    #[must_use]
    pub fn storer(&self) -> Arc<InMemoryStorer> {
        Arc::clone(&self.storer)
    }

    /// Accessor for the current route matrix
    #[must_use]
    pub fn route_matrix_provider(&self) -> RouteMatrixProvider {
        let matrix = Arc::clone(&self.matrix);
        Arc::new(move || Arc::clone(&matrix.read().unwrap_or_else(PoisonError::into_inner)))
    }
}

fn read_database(path: &Path) -> anyhow::Result<Database> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("reading database {}", path.display()))?;
    Database::from_json(&json).with_context(|| format!("parsing database {}", path.display()))
}

fn read_route_matrix(path: &Path) -> anyhow::Result<RouteMatrix> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("reading route matrix {}", path.display()))?;
    RouteMatrix::from_json(&json)
        .with_context(|| format!("parsing route matrix {}", path.display()))
}

/// Run the backend until ctrl-c.
///
/// # Errors
///
/// Returns an error if the configuration is unusable, the snapshots cannot
/// be loaded, or the socket cannot be bound.
pub async fn serve(config: &Config) -> anyhow::Result<()> {
    let addr = config.parse_listen_addr()?;
    let snapshots = Arc::new(Snapshots::load(&config.data)?);

    let router_key = match config.router_private_key()? {
        Some(key) => key,
        None => {
            warn!("no router_private_key configured, using an ephemeral key");
            PrivateKey::generate(&mut OsRng)
        }
    };
    info!(
        router_public_key = %STANDARD.encode(router_key.public_key().to_bytes()),
        "router key loaded"
    );

    let metrics = Arc::new(Metrics::default());
    let post_session = Arc::new(PostSessionHandler::new(
        &config.post_session_config(),
        PostSessionSinks {
            biller: Arc::new(LocalBiller::new()),
            matcher: Arc::new(LocalMatcher::new()),
            publishers: vec![Arc::new(LocalPublisher::new())],
        },
        Arc::clone(&metrics.post_session),
        CancellationToken::new(),
    ));
    post_session.start();

    let locator = match &config.routing.fallback_location {
        Some(location) => StaticIpLocator::with_fallback(location.clone()),
        None => StaticIpLocator::new(),
    };

    let ctx = HandlerContext::new(
        snapshots.storer(),
        snapshots.route_matrix_provider(),
        Arc::new(locator),
        Arc::new(LowestCostDecider::new()),
        Arc::clone(&post_session),
        Arc::clone(&metrics),
        router_key,
    )
    .with_config(config.handler_config()?);

    let transport_config = config.transport_config();
    let transport = AsyncUdpTransport::bind_with_config(addr, &transport_config)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let cancel = CancellationToken::new();
    let server = PacketServer::new(
        Arc::new(transport),
        Arc::new(ctx),
        &transport_config,
        cancel.clone(),
    );

    if let Some(interval) = config.reload_interval() {
        let snapshots = Arc::clone(&snapshots);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = snapshots.reload() {
                            warn!(error = %format!("{err:#}"), "snapshot reload failed");
                        }
                    }
                }
            }
        });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutting down");
                shutdown.cancel();
            }
            Err(err) => error!(%err, "cannot listen for ctrl-c"),
        }
    });

    let result = server.run().await;
    cancel.cancel();

    post_session.shutdown().await;
    log_counters(&metrics);

    result.context("packet server failed")
}

fn log_counters(metrics: &Metrics) {
    let groups = [
        ("session_update", metrics.session_update.snapshot()),
        ("server_init", metrics.server_init.snapshot()),
        ("server_update", metrics.server_update.snapshot()),
        ("post_session", metrics.post_session.snapshot()),
    ];
    for (group, counters) in groups {
        for (name, value) in counters.into_iter().filter(|(_, value)| *value > 0) {
            info!(group, counter = name, value, "final count");
        }
    }
}
