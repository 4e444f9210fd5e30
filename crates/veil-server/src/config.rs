//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (VEIL_*, REDIS_URL, TELEGRAM_*)
//! - TOML configuration file

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use veil_core::{HubConfig, PresenceConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Deployment environment (`development` or `production`).
    #[serde(default = "default_env")]
    pub env: String,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Room lifetimes.
    #[serde(default)]
    pub rooms: RoomsConfig,

    /// Shared store connection.
    #[serde(default)]
    pub store: StoreConfig,

    /// External relay.
    #[serde(default)]
    pub relay: RelayConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections on this instance.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum participants per room.
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Unanswered pings before the connection is closed.
    #[serde(default = "default_missed_pongs")]
    pub missed_pongs: u32,
}

/// Room lifetime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomsConfig {
    /// Seconds an empty room survives before expiring.
    #[serde(default = "default_empty_room_ttl")]
    pub empty_room_ttl_secs: u64,

    /// Seconds an unacknowledged message stays tracked.
    #[serde(default = "default_pending_ttl")]
    pub pending_ttl_secs: u64,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key and channel.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Connectivity check interval in milliseconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
}

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Bot API base URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Bot token.
    #[serde(default = "default_bot_token")]
    pub bot_token: String,

    /// Chat holding relayed messages for every room.
    #[serde(default = "default_chat_id")]
    pub chat_id: String,

    /// Public webhook URL registered at startup, if any.
    #[serde(default = "default_webhook_url")]
    pub webhook_url: String,

    /// Secret the relay sends with every webhook call.
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret: String,
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

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

// Default value functions
fn default_env() -> String {
    env_or("VEIL_ENV", "development")
}

fn default_host() -> String {
    env_or("VEIL_HOST", "0.0.0.0")
}

fn default_port() -> u16 {
    std::env::var("VEIL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3001)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_frame_size() -> usize {
    veil_protocol::codec::MAX_FRAME_SIZE
}

fn default_max_participants() -> usize {
    50
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_missed_pongs() -> u32 {
    2
}

fn default_empty_room_ttl() -> u64 {
    300
}

fn default_pending_ttl() -> u64 {
    60
}

fn default_redis_url() -> String {
    env_or("REDIS_URL", "redis://localhost:6379")
}

fn default_key_prefix() -> String {
    "veil:".to_string()
}

fn default_health_check_interval() -> u64 {
    5_000
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_bot_token() -> String {
    env_or("TELEGRAM_BOT_TOKEN", "")
}

fn default_chat_id() -> String {
    env_or("TELEGRAM_CHAT_ID", "")
}

fn default_webhook_url() -> String {
    env_or("TELEGRAM_WEBHOOK_URL", "")
}

fn default_webhook_secret() -> String {
    env_or("TELEGRAM_WEBHOOK_SECRET", "")
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: default_env(),
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rooms: RoomsConfig::default(),
            store: StoreConfig::default(),
            relay: RelayConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_participants: default_max_participants(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            missed_pongs: default_missed_pongs(),
        }
    }
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            empty_room_ttl_secs: default_empty_room_ttl(),
            pending_ttl_secs: default_pending_ttl(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            health_check_interval_ms: default_health_check_interval(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            bot_token: default_bot_token(),
            chat_id: default_chat_id(),
            webhook_url: default_webhook_url(),
            webhook_secret: default_webhook_secret(),
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
            "veil.toml",
            "/etc/veil/veil.toml",
            "~/.config/veil/veil.toml",
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

    /// Whether this is a production deployment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.env == "production"
    }

    /// Check the configuration for fatal mistakes.
    ///
    /// # Errors
    ///
    /// Returns an error listing every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.bind_addr() {
            errors.push(e.to_string());
        }
        for (name, value) in [
            ("heartbeat.interval_ms", self.heartbeat.interval_ms),
            ("heartbeat.missed_pongs", u64::from(self.heartbeat.missed_pongs)),
            ("store.health_check_interval_ms", self.store.health_check_interval_ms),
            ("rooms.empty_room_ttl_secs", self.rooms.empty_room_ttl_secs),
            ("rooms.pending_ttl_secs", self.rooms.pending_ttl_secs),
            ("limits.max_participants", self.limits.max_participants as u64),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }
        if self.is_production() {
            if self.relay.bot_token.is_empty() {
                errors.push("TELEGRAM_BOT_TOKEN is required in production".to_string());
            }
            if self.relay.webhook_secret.is_empty() {
                errors.push("TELEGRAM_WEBHOOK_SECRET is required in production".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!("Invalid configuration: {}", errors.join("; "))
        }
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Heartbeat ping interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Store health check interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.store.health_check_interval_ms)
    }

    /// Build the hub configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            presence: PresenceConfig {
                empty_room_ttl: Duration::from_secs(self.rooms.empty_room_ttl_secs),
                pending_ttl: Duration::from_secs(self.rooms.pending_ttl_secs),
                max_participants: self.limits.max_participants,
            },
            max_frame_size: self.limits.max_frame_size,
            missed_pongs: self.heartbeat.missed_pongs,
            // Survives two missed health checks.
            instance_ttl: self.health_check_interval() * 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_default_limits() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.limits.max_participants, 50);
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert_eq!(config.heartbeat.missed_pongs, 2);
        assert_eq!(config.rooms.empty_room_ttl_secs, 300);
        assert_eq!(config.rooms.pending_ttl_secs, 60);
        assert_eq!(config.store.key_prefix, "veil:");
        assert_eq!(config.relay.api_base, "https://api.telegram.org");
    }

    #[test]
    fn test_config_from_toml() {
        let config = parse(
            r#"
            host = "127.0.0.1"
            port = 9000

            [limits]
            max_participants = 8

            [store]
            url = "redis://cache:6379"
        "#,
        );
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_participants, 8);
        assert_eq!(config.store.url, "redis://cache:6379");
        assert_eq!(config.bind_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_invalid_bind_addr() {
        let config = parse(
            r#"
            host = "not a host"
            port = 80
        "#,
        );
        assert!(config.bind_addr().is_err());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_requires_relay_secrets() {
        let config = parse(
            r#"
            env = "production"
            host = "0.0.0.0"

            [relay]
            bot_token = ""
            webhook_secret = ""
        "#,
        );
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("TELEGRAM_BOT_TOKEN"));
        assert!(err.contains("TELEGRAM_WEBHOOK_SECRET"));

        let config = parse(
            r#"
            env = "production"
            host = "0.0.0.0"

            [relay]
            bot_token = "123:abc"
            webhook_secret = "s3cret"
        "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_allows_missing_relay() {
        let config = parse(
            r#"
            env = "development"
            host = "0.0.0.0"

            [relay]
            bot_token = ""
        "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hub_config() {
        let config = parse(
            r#"
            [limits]
            max_participants = 12
            max_frame_size = 2048

            [heartbeat]
            missed_pongs = 3

            [rooms]
            empty_room_ttl_secs = 10
            pending_ttl_secs = 5
        "#,
        );
        let hub = config.hub_config();
        assert_eq!(hub.presence.max_participants, 12);
        assert_eq!(hub.presence.empty_room_ttl, Duration::from_secs(10));
        assert_eq!(hub.presence.pending_ttl, Duration::from_secs(5));
        assert_eq!(hub.max_frame_size, 2048);
        assert_eq!(hub.missed_pongs, 3);
        assert_eq!(hub.instance_ttl, Duration::from_secs(15));
    }

    #[test]
    fn test_zero_intervals_rejected() {
        for section in [
            "[heartbeat]\ninterval_ms = 0",
            "[heartbeat]\nmissed_pongs = 0",
            "[store]\nhealth_check_interval_ms = 0",
            "[rooms]\npending_ttl_secs = 0",
            "[limits]\nmax_participants = 0",
        ] {
            let config = parse(&format!("host = \"0.0.0.0\"\nenv = \"development\"\n{section}"));
            let err = config.validate().unwrap_err().to_string();
            assert!(err.contains("must be greater than zero"), "{section}: {err}");
        }

        let mut config = parse("host = \"0.0.0.0\"\nenv = \"development\"");
        assert!(config.validate().is_ok());
        config.heartbeat.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
