//! Node configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (COMET_NODE, COMET_ADMIN_ADDR)
//! - TOML configuration file
//! - `--config <path>` on the command line

use anyhow::{bail, Context, Result};
use comet_core::{Protocol, RegistryConfig, DEFAULT_VNODES, MAX_VNODES};
use comet_transport::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name of this node on the migration ring.
    #[serde(default = "default_node")]
    pub node: String,

    /// RPC control surface.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// WebSocket and admin HTTP listener.
    #[serde(default)]
    pub http: HttpConfig,

    /// Subscriber transports.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Channel registry.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Startup migration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// RPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Address of the RPC listener.
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

/// HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address of the WebSocket and admin listener.
    #[serde(default = "default_http_addr")]
    pub addr: String,

    /// Path of the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable WebSocket subscribers.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Enable raw TCP subscribers.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Address of the raw TCP listener.
    #[serde(default = "default_tcp_addr")]
    pub tcp_addr: String,

    /// Upper bound on one subscriber write, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Channel registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Protocol of channels created over RPC.
    #[serde(default)]
    pub protocol: Protocol,

    /// Maximum subscriber connections per key.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers_per_key: usize,

    /// Expiry applied when a publish does not ask for one, in seconds.
    #[serde(default = "default_message_expire")]
    pub message_expire_sec: i64,

    /// Number of registry shards.
    #[serde(default = "default_shards")]
    pub shards: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Default heartbeat interval in seconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// Longest heartbeat interval a subscriber may request, in seconds.
    #[serde(default = "default_max_heartbeat_interval")]
    pub max_interval_secs: u64,
}

/// Migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Cluster node set; a migration pass runs at startup when non-empty.
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Virtual nodes per node.
    #[serde(default = "default_vnodes")]
    pub vnodes: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_node() -> String {
    std::env::var("COMET_NODE").unwrap_or_else(|_| "node1".to_string())
}

fn default_admin_addr() -> String {
    std::env::var("COMET_ADMIN_ADDR").unwrap_or_else(|_| "127.0.0.1:8070".to_string())
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ws_path() -> String {
    "/sub".to_string()
}

fn default_tcp_addr() -> String {
    "127.0.0.1:8090".to_string()
}

fn default_true() -> bool {
    true
}

fn default_write_timeout() -> u64 {
    5_000
}

fn default_max_subscribers() -> usize {
    comet_core::registry::DEFAULT_MAX_SUBSCRIBERS_PER_KEY
}

fn default_message_expire() -> i64 {
    30 * 24 * 3600 // 30 days
}

fn default_shards() -> usize {
    comet_core::registry::DEFAULT_SHARDS
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_heartbeat_interval() -> u64 {
    600
}

fn default_vnodes() -> usize {
    DEFAULT_VNODES
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: default_node(),
            rpc: RpcConfig::default(),
            http: HttpConfig::default(),
            transport: TransportConfig::default(),
            channel: ChannelConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            migration: MigrationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: default_http_addr(),
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket: true,
            tcp: true,
            tcp_addr: default_tcp_addr(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            max_subscribers_per_key: default_max_subscribers(),
            message_expire_sec: default_message_expire(),
            shards: default_shards(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
            max_interval_secs: default_max_heartbeat_interval(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            vnodes: default_vnodes(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "comet.toml",
            "/etc/comet/comet.toml",
            "~/.config/comet/comet.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check values that deserialize fine but cannot run.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.node.trim().is_empty() {
            bail!("node must not be empty");
        }
        if self.channel.shards == 0 {
            bail!("channel.shards must be positive");
        }
        if self.channel.max_subscribers_per_key == 0 {
            bail!("channel.max_subscribers_per_key must be positive");
        }
        if self.migration.vnodes == 0 || self.migration.vnodes > MAX_VNODES {
            bail!("migration.vnodes must be between 1 and {}", MAX_VNODES);
        }
        if self.heartbeat.interval_secs == 0 {
            bail!("heartbeat.interval_secs must be positive");
        }
        if self.heartbeat.max_interval_secs < self.heartbeat.interval_secs {
            bail!("heartbeat.max_interval_secs must not be below heartbeat.interval_secs");
        }
        if !self.http.websocket_path.starts_with('/') {
            bail!("http.websocket_path must start with '/'");
        }
        self.admin_addr()?;
        self.http_addr()?;
        self.tcp_addr()?;
        Ok(())
    }

    /// Address of the RPC listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn admin_addr(&self) -> Result<SocketAddr> {
        parse_addr("rpc.admin_addr", &self.rpc.admin_addr)
    }

    /// Address of the WebSocket and admin HTTP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        parse_addr("http.addr", &self.http.addr)
    }

    /// Address of the raw TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address does not parse.
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        parse_addr("transport.tcp_addr", &self.transport.tcp_addr)
    }

    /// Registry settings.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            shards: self.channel.shards,
            max_subscribers_per_key: self.channel.max_subscribers_per_key,
            protocol: self.channel.protocol,
        }
    }

    /// Subscriber session timing.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat: Duration::from_secs(self.heartbeat.interval_secs),
            max_heartbeat: Duration::from_secs(self.heartbeat.max_interval_secs),
            write_timeout: Duration::from_millis(self.transport.write_timeout_ms),
            ..SessionConfig::default()
        }
    }
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("Invalid {}: {}", name, value))
}
