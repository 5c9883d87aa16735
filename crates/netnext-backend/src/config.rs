//! Configuration system for the netnext backend.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use netnext_core::SdkVersion;
use netnext_core::handlers::HandlerConfig;
use netnext_core::post_session::PostSessionConfig;
use netnext_core::routing::Location;
use netnext_crypto::x25519::PrivateKey;
use netnext_transport::TransportConfig;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Backend configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// UDP listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Route decision tuning
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Billing and portal fan-out
    #[serde(default)]
    pub post_session: PostSessionSection,
    /// Key material
    #[serde(default)]
    pub keys: KeysConfig,
    /// Snapshot files
    #[serde(default)]
    pub data: DataConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// UDP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Largest datagram accepted
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Kernel send and receive buffer size
    #[serde(default = "default_socket_buffer_size")]
    pub socket_buffer_size: usize,
}

/// Route decision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Route matrix age beyond which sessions go direct
    #[serde(default = "default_route_matrix_max_age_secs")]
    pub route_matrix_max_age_secs: u64,
    /// Oldest SDK accepted, dotted
    #[serde(default = "default_min_sdk_version")]
    pub min_sdk_version: String,
    /// Near relays handed to a new session
    #[serde(default = "default_max_near_relays")]
    pub max_near_relays: usize,
    /// Use relay internal addresses between relays of one seller
    #[serde(default)]
    pub enable_internal_ips: bool,
    /// Location given to clients the locator cannot place
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_location: Option<Location>,
}

/// Post-session fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSessionSection {
    /// Workers per queue
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Capacity of each queue
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    /// Portal retries after the first attempt
    #[serde(default = "default_portal_max_retries")]
    pub portal_max_retries: usize,
}

/// Key configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeysConfig {
    /// Router X25519 private key, base64
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub router_private_key: String,
}

/// Snapshot file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Database JSON snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Route matrix JSON snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_matrix_path: Option<PathBuf>,
    /// How often snapshots are re-read, 0 disables reloading
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:40000".to_string()
}

fn default_max_packet_size() -> usize {
    netnext_core::DEFAULT_MAX_PACKET_SIZE
}

fn default_socket_buffer_size() -> usize {
    2 * 1024 * 1024
}

fn default_route_matrix_max_age_secs() -> u64 {
    20
}

fn default_min_sdk_version() -> String {
    "4.0.0".to_string()
}

fn default_max_near_relays() -> usize {
    netnext_core::MAX_NEAR_RELAYS
}

fn default_worker_count() -> usize {
    4
}

fn default_channel_size() -> usize {
    1024
}

fn default_portal_max_retries() -> usize {
    3
}

fn default_reload_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_packet_size: default_max_packet_size(),
            socket_buffer_size: default_socket_buffer_size(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            route_matrix_max_age_secs: default_route_matrix_max_age_secs(),
            min_sdk_version: default_min_sdk_version(),
            max_near_relays: default_max_near_relays(),
            enable_internal_ips: false,
            fallback_location: None,
        }
    }
}

impl Default for PostSessionSection {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            channel_size: default_channel_size(),
            portal_max_retries: default_portal_max_retries(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            route_matrix_path: None,
            reload_interval_secs: default_reload_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = self.to_toml()?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", self.server.listen_addr))
    }

    /// Parse the minimum SDK version
    ///
    /// # Errors
    ///
    /// Returns an error if the version is not `major.minor.patch`.
    pub fn parse_min_sdk_version(&self) -> anyhow::Result<SdkVersion> {
        Ok(self.routing.min_sdk_version.parse()?)
    }

    /// Decode the router private key, if one is configured
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not base64 or not 32 bytes.
    pub fn router_private_key(&self) -> anyhow::Result<Option<PrivateKey>> {
        if self.keys.router_private_key.is_empty() {
            return Ok(None);
        }
        let bytes = Zeroizing::new(
            STANDARD
                .decode(self.keys.router_private_key.trim())
                .context("router_private_key is not base64")?,
        );
        let key = PrivateKey::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("router_private_key: {e}"))?;
        Ok(Some(key))
    }

    /// Handler tuning derived from `[routing]`
    ///
    /// # Errors
    ///
    /// Returns an error if the minimum SDK version is malformed.
    pub fn handler_config(&self) -> anyhow::Result<HandlerConfig> {
        Ok(HandlerConfig {
            min_sdk_version: self.parse_min_sdk_version()?,
            route_matrix_max_age_secs: self.routing.route_matrix_max_age_secs,
            max_near_relays: self.routing.max_near_relays,
            enable_internal_ips: self.routing.enable_internal_ips,
        })
    }

    /// Fan-out tuning derived from `[post_session]`
    #[must_use]
    pub fn post_session_config(&self) -> PostSessionConfig {
        PostSessionConfig {
            worker_count: self.post_session.worker_count,
            channel_size: self.post_session.channel_size,
            portal_max_retries: self.post_session.portal_max_retries,
            ..PostSessionConfig::default()
        }
    }

    /// Socket tuning derived from `[server]`
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            recv_buffer_size: self.server.socket_buffer_size,
            send_buffer_size: self.server.socket_buffer_size,
            max_packet_size: self.server.max_packet_size,
        }
    }

    /// Snapshot reload period, `None` when disabled
    #[must_use]
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.data.reload_interval_secs > 0)
            .then(|| Duration::from_secs(self.data.reload_interval_secs))
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;
        self.parse_min_sdk_version()?;
        self.router_private_key()?;

        let max = netnext_core::DEFAULT_MAX_PACKET_SIZE;
        if self.server.max_packet_size < netnext_core::packets::PACKET_HEADER_SIZE
            || self.server.max_packet_size > 16 * max
        {
            anyhow::bail!("max_packet_size must be between 9 and {}", 16 * max);
        }

        if self.server.socket_buffer_size == 0 {
            anyhow::bail!("socket_buffer_size must be positive");
        }

        if self.routing.max_near_relays == 0
            || self.routing.max_near_relays > netnext_core::MAX_NEAR_RELAYS
        {
            anyhow::bail!(
                "max_near_relays must be between 1 and {}",
                netnext_core::MAX_NEAR_RELAYS
            );
        }

        if self.post_session.worker_count == 0 || self.post_session.worker_count > 256 {
            anyhow::bail!("worker_count must be between 1 and 256");
        }

        if self.post_session.channel_size == 0 {
            anyhow::bail!("channel_size must be positive");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:40000");
        assert_eq!(config.server.max_packet_size, 4096);
        assert_eq!(config.routing.route_matrix_max_age_secs, 20);
        assert_eq!(config.post_session.worker_count, 4);
        assert_eq!(config.post_session.channel_size, 1024);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.routing.min_sdk_version = "4.0".to_string();
        assert!(config.validate().is_err());

        config.routing.min_sdk_version = "4.0.2".to_string();
        config.routing.max_near_relays = 33;
        assert!(config.validate().is_err());

        config.routing.max_near_relays = 10;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.keys.router_private_key = "not base64!".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "127.0.0.1:50000"

            [routing]
            enable_internal_ips = true

            [routing.fallback_location]
            latitude = 40.7
            longitude = -74.0
            "#,
        )
        .unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:50000");
        assert_eq!(config.server.socket_buffer_size, 2 * 1024 * 1024);
        assert!(config.routing.enable_internal_ips);
        let location = config.routing.fallback_location.unwrap();
        assert_eq!(location.latitude, 40.7);
        assert!(location.isp.is_empty());
        assert_eq!(config.routing.max_near_relays, 32);
        assert_eq!(config.post_session.portal_max_retries, 3);
        assert!(config.data.database_path.is_none());
    }

    #[test]
    fn test_router_key_round_trip() {
        let key = PrivateKey::generate(&mut OsRng);
        let mut config = Config::default();
        assert!(config.router_private_key().unwrap().is_none());

        config.keys.router_private_key = STANDARD.encode(key.to_bytes());
        let decoded = config.router_private_key().unwrap().unwrap();
        assert_eq!(decoded.public_key().to_bytes(), key.public_key().to_bytes());

        config.keys.router_private_key = STANDARD.encode([1u8; 16]);
        assert!(config.router_private_key().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let mut config = Config::default();
        config.routing.min_sdk_version = "4.0.4".to_string();
        config.server.socket_buffer_size = 65536;
        config.data.reload_interval_secs = 0;

        let handler = config.handler_config().unwrap();
        assert_eq!(handler.min_sdk_version, SdkVersion::new(4, 0, 4));
        assert_eq!(config.transport_config().recv_buffer_size, 65536);
        assert_eq!(config.post_session_config().worker_count, 4);
        assert!(config.reload_interval().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/netnext.toml");

        let mut config = Config::default();
        config.data.database_path = Some(PathBuf::from("/var/lib/netnext/database.json"));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.data.database_path, config.data.database_path);
        assert_eq!(loaded.server.listen_addr, config.server.listen_addr);
    }
}
