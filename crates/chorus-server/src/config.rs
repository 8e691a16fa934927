//! Server configuration.
//!
//! Configuration is layered through the `config` crate:
//! - TOML file (`--config`, or the first of `chorus.toml`,
//!   `/etc/chorus/chorus.toml`, `~/.config/chorus/chorus.toml`)
//! - Environment variables (`CHORUS__PORT`, `CHORUS__LIMITS__MAX_CONNECTIONS`, ...)
//!
//! Every field has a default, so an empty file (or none at all) is valid.

use anyhow::{bail, Context, Result};
use chorus_core::{HubConfig, InMemoryDirectory};
use chorus_protocol::Encoding;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "chorus.toml",
    "/etc/chorus/chorus.toml",
    "~/.config/chorus/chorus.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// `development` or `production`. Production logs JSON.
    #[serde(default = "default_environment")]
    pub environment: String,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Outbound queue and writer behaviour.
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub presence: PresenceConfig,

    #[serde(default)]
    pub calls: CallsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Built-in token and channel directory.
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Encoding used when the client does not ask for one (`json` or `msgpack`).
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live sessions.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum joined channels per session.
    #[serde(default = "default_max_channels_per_session")]
    pub max_channels_per_session: usize,

    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum chat message length in bytes.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Messages kept per channel by the in-memory history; older ones are evicted.
    #[serde(default = "default_max_history_per_channel")]
    pub max_history_per_channel: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval announced to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Silence after which a connection is closed, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Outbound queue capacity per session.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Coordinator intake capacity.
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// Attempts to resend an event after a transient failure.
    #[serde(default = "default_send_retries")]
    pub send_retries: u32,

    /// Backoff between resend attempts, multiplied by the attempt number.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Lifetime of a typing indicator without renewal, in milliseconds.
    #[serde(default = "default_typing_window")]
    pub typing_window_ms: u64,

    /// Interval between presence sweeps, in milliseconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Idle time before a user is marked away. Unset disables auto-away.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallsConfig {
    /// Number of ended call ids remembered for `CallEnded` replies.
    #[serde(default = "default_ended_retention")]
    pub ended_retention: usize,
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

    /// Interval between hub gauge samples, in milliseconds.
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

/// Static identities and channel rosters for development and tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Let any authenticated user join channels without a roster.
    #[serde(default = "default_true")]
    pub open_channels: bool,

    #[serde(default)]
    pub users: Vec<UserEntry>,

    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: String,
    #[serde(default)]
    pub members: Vec<String>,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_encoding() -> String {
    "json".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_channels_per_session() -> usize {
    100
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_content_length() -> usize {
    4_000
}

fn default_max_history_per_channel() -> usize {
    1_000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_queue_capacity() -> usize {
    256
}

fn default_intake_capacity() -> usize {
    4_096
}

fn default_send_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_typing_window() -> u64 {
    5_000
}

fn default_sweep_interval() -> u64 {
    1_000
}

fn default_ended_retention() -> usize {
    1_024
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_sample_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            presence: PresenceConfig::default(),
            calls: CallsConfig::default(),
            metrics: MetricsConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            encoding: default_encoding(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_channels_per_session: default_max_channels_per_session(),
            max_message_size: default_max_message_size(),
            max_content_length: default_max_content_length(),
            max_history_per_channel: default_max_history_per_channel(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            intake_capacity: default_intake_capacity(),
            send_retries: default_send_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            typing_window_ms: default_typing_window(),
            sweep_interval_ms: default_sweep_interval(),
            away_after_ms: None,
        }
    }
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            ended_retention: default_ended_retention(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            sample_interval_ms: default_sample_interval(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first default path that
    /// exists, then apply `CHORUS__*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, if a file or an
    /// override cannot be parsed, or if the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_default_file(),
        };

        let mut builder = ::config::Config::builder();
        if let Some(file) = &file {
            builder = builder.add_source(
                ::config::File::from(file.as_path()).format(::config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("CHORUS")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(::config::Config::try_deserialize)
            .with_context(|| match &file {
                Some(file) => format!("Failed to load config file: {}", file.display()),
                None => "Failed to load configuration from environment".to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        self.encoding()?;
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        if self.heartbeat.timeout_ms == 0 {
            bail!("heartbeat.timeout_ms must be positive");
        }
        if self.queue.capacity == 0 {
            bail!("queue.capacity must be positive");
        }
        if self.limits.max_history_per_channel == 0 {
            bail!("limits.max_history_per_channel must be positive");
        }
        if self.presence.sweep_interval_ms == 0 {
            bail!("presence.sweep_interval_ms must be positive");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Default outbound encoding.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown encoding name.
    pub fn encoding(&self) -> Result<Encoding> {
        match Encoding::from_name(&self.transport.encoding) {
            Some(encoding) => Ok(encoding),
            None => bail!("Unknown transport.encoding: {}", self.transport.encoding),
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat.timeout_ms)
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.queue.capacity,
            max_sessions: self.limits.max_connections,
            max_channels_per_session: self.limits.max_channels_per_session,
            max_content_length: self.limits.max_content_length,
            typing_window: Duration::from_millis(self.presence.typing_window_ms),
            sweep_interval: Duration::from_millis(self.presence.sweep_interval_ms),
            away_after: self.presence.away_after_ms.map(Duration::from_millis),
            heartbeat_interval: Duration::from_millis(self.heartbeat.interval_ms),
            ended_call_retention: self.calls.ended_retention,
            intake_capacity: self.queue.intake_capacity,
            ..HubConfig::default()
        }
    }

    /// Build the in-memory directory described by the `directory` section.
    #[must_use]
    pub fn directory(&self) -> InMemoryDirectory {
        let directory = InMemoryDirectory::new(self.directory.open_channels);
        for user in &self.directory.users {
            directory.add_token(user.token.clone(), user.user_id.clone());
        }
        for channel in &self.directory.channels {
            directory.set_members(channel.id.clone(), channel.members.iter().cloned().collect());
        }
        directory
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{IdentityResolver, MembershipAuthority};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/ws");
        assert!(!config.is_production());
        assert!(config.directory.open_channels);
        assert_eq!(config.limits.max_history_per_channel, 1_000);
        config.validate().unwrap();

        let mut unbounded = Config::default();
        unbounded.limits.max_history_per_channel = 0;
        assert!(unbounded.validate().is_err());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            environment = "production"

            [limits]
            max_connections = 50000
            max_history_per_channel = 250

            [presence]
            away_after_ms = 300000

            [[directory.users]]
            token = "alice-token"
            user_id = "alice"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.is_production());
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_channels_per_session, 100);
        assert_eq!(config.limits.max_history_per_channel, 250);
        assert_eq!(config.presence.away_after_ms, Some(300_000));
        assert_eq!(config.directory.users[0].user_id, "alice");
    }

    #[test]
    fn test_unknown_encoding_is_rejected() {
        let mut config = Config::default();
        config.transport.encoding = "msgpack".into();
        assert_eq!(config.encoding().unwrap(), Encoding::MessagePack);

        config.transport.encoding = "xml".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_hub_config_mapping() {
        let mut config = Config::default();
        config.queue.capacity = 8;
        config.limits.max_connections = 10;
        config.presence.typing_window_ms = 2_000;
        config.presence.away_after_ms = Some(60_000);

        let hub = config.hub_config();
        assert_eq!(hub.queue_capacity, 8);
        assert_eq!(hub.max_sessions, 10);
        assert_eq!(hub.typing_window, Duration::from_secs(2));
        assert_eq!(hub.away_after, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_directory_from_config() {
        let mut config = Config::default();
        config.directory.open_channels = false;
        config.directory.users.push(UserEntry {
            token: "bob-token".into(),
            user_id: "bob".into(),
        });
        config.directory.channels.push(ChannelEntry {
            id: "ops".into(),
            members: vec!["bob".into()],
        });

        let directory = config.directory();
        assert_eq!(directory.resolve("bob-token").await.unwrap(), "bob");
        assert!(directory.may_join("bob", "ops").await.unwrap());
        assert!(!directory.may_join("bob", "general").await.unwrap());
    }

    #[test]
    fn test_load_file_with_environment_override() {
        let path = std::env::temp_dir().join(format!("chorus-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "port = 9100\n[heartbeat]\ninterval_ms = 10000\ntimeout_ms = 20000\n",
        )
        .unwrap();
        std::env::set_var("CHORUS__HEARTBEAT__TIMEOUT_MS", "45000");

        let config = Config::load(Some(&path)).unwrap();
        std::env::remove_var("CHORUS__HEARTBEAT__TIMEOUT_MS");
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.port, 9100);
        assert_eq!(config.heartbeat.interval_ms, 10_000);
        assert_eq!(config.heartbeat.timeout_ms, 45_000);
        assert_eq!(config.queue.capacity, 256);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let path = Path::new("/nonexistent/chorus.toml");
        assert!(Config::load(Some(path)).is_err());
    }

    #[test]
    fn test_render_round_trips() {
        let rendered = Config::default().to_toml().unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.port, 8080);
        assert_eq!(parsed.presence.away_after_ms, None);
    }
}
