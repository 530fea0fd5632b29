//! Router configuration.
//!
//! Loaded from a YAML file (`router.yaml`). Every section is optional; a
//! missing file at the default location means "run with defaults".

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::discovery::DiscoverySettings;
use crate::errors::RouterError;
use crate::protocol::{ClientSettings, HandshakeInfo};
use crate::router::ServerRecord;
use crate::transport::SocketTransportConfig;

/// Environment variable holding an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "MCP_ROUTER_CONFIG";

/// File name looked up in the data directory.
pub const CONFIG_FILE_NAME: &str = "router.yaml";

// ─── Config Types ────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Servers registered at start, before discovery runs.
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default = "default_true")]
    pub connect_on_start: bool,
}

/// Identity the router presents in every handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_name")]
    pub name: String,
    #[serde(default = "default_client_version")]
    pub version: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
    /// Zero waits indefinitely.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Socket transport behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Container discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_discovery_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_docker_endpoint")]
    pub docker_endpoint: String,
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_protocol")]
    pub default_protocol: String,
    #[serde(default = "default_host")]
    pub default_host: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Write to a rotated `router.log` in the data dir instead of stdout.
    #[serde(default)]
    pub to_file: bool,
}

fn default_true() -> bool {
    true
}

fn default_client_name() -> String {
    "mcp-router".into()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_capabilities() -> Vec<String> {
    vec!["tools".into()]
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_interval_ms() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_discovery_interval_secs() -> u64 {
    30
}

fn default_docker_endpoint() -> String {
    "http://localhost:2375".into()
}

fn default_label() -> String {
    "mcp.server".into()
}

fn default_port() -> u16 {
    8080
}

fn default_protocol() -> String {
    "http".into()
}

fn default_host() -> String {
    "localhost".into()
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            transport: TransportConfig::default(),
            discovery: DiscoveryConfig::default(),
            logging: LoggingConfig::default(),
            servers: Vec::new(),
            connect_on_start: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
            capabilities: default_capabilities(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_discovery_interval_secs(),
            docker_endpoint: default_docker_endpoint(),
            label: default_label(),
            default_port: default_port(),
            default_protocol: default_protocol(),
            default_host: default_host(),
        }
    }
}

// ─── Conversions ─────────────────────────────────────────────────────────────

impl RouterConfig {
    /// Reject values the router cannot run with.
    pub fn validate(&self) -> Result<(), RouterError> {
        let fail = |reason: String| -> Result<(), RouterError> {
            Err(RouterError::ConfigError { reason })
        };

        if self.client.name.trim().is_empty() || self.client.version.trim().is_empty() {
            return fail("client.name and client.version must be non-empty".into());
        }
        if self.client.capabilities.is_empty() {
            return fail("client.capabilities must list at least one capability".into());
        }
        if self.transport.reconnect_interval_ms == 0 {
            return fail("transport.reconnect_interval_ms must be greater than zero".into());
        }
        if self.transport.max_message_size == 0 {
            return fail("transport.max_message_size must be greater than zero".into());
        }
        if self.discovery.enabled && self.discovery.interval_secs == 0 {
            return fail("discovery.interval_secs must be greater than zero".into());
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            server.validate().map_err(|e| RouterError::ConfigError {
                reason: format!("invalid server entry: {e}"),
            })?;
            if !seen.insert(server.id.as_str()) {
                return fail(format!("duplicate server id '{}'", server.id));
            }
        }
        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        let capabilities: Vec<&str> = self.client.capabilities.iter().map(String::as_str).collect();
        ClientSettings {
            info: HandshakeInfo::new(&self.client.name, &self.client.version, &capabilities),
            request_timeout_ms: self.client.request_timeout_ms,
        }
    }

    pub fn socket_config(&self) -> SocketTransportConfig {
        SocketTransportConfig {
            auto_reconnect: self.transport.auto_reconnect,
            reconnect_interval: Duration::from_millis(self.transport.reconnect_interval_ms),
            max_reconnect_attempts: self.transport.max_reconnect_attempts,
            max_message_size: self.transport.max_message_size,
        }
    }

    pub fn discovery_settings(&self) -> DiscoverySettings {
        DiscoverySettings {
            interval: Duration::from_secs(self.discovery.interval_secs),
            label: self.discovery.label.clone(),
            default_port: self.discovery.default_port,
            default_protocol: self.discovery.default_protocol.clone(),
            default_host: self.discovery.default_host.clone(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to read.
///
/// Order: `explicit`, then `MCP_ROUTER_CONFIG`, then `<data dir>/router.yaml`.
/// An explicitly named file must exist; a missing default file yields `None`.
pub fn find_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>, RouterError> {
    resolve_config_path(
        explicit,
        std::env::var(CONFIG_ENV_VAR).ok(),
        &crate::data_dir(),
    )
}

fn resolve_config_path(
    explicit: Option<&Path>,
    env_value: Option<String>,
    data_dir: &Path,
) -> Result<Option<PathBuf>, RouterError> {
    let named = explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value.filter(|v| !v.trim().is_empty()).map(PathBuf::from));

    if let Some(path) = named {
        if !path.exists() {
            return Err(RouterError::ConfigError {
                reason: format!("config file {} does not exist", path.display()),
            });
        }
        return Ok(Some(path));
    }

    let candidate = data_dir.join(CONFIG_FILE_NAME);
    Ok(candidate.exists().then_some(candidate))
}

/// Load, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<RouterConfig, RouterError> {
    let raw = std::fs::read_to_string(path).map_err(|e| RouterError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse and validate YAML text. Empty text yields the defaults.
pub fn parse_config(raw: &str) -> Result<RouterConfig, RouterError> {
    let config: RouterConfig = if raw.trim().is_empty() {
        RouterConfig::default()
    } else {
        serde_yaml::from_str(raw).map_err(|e| RouterError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Find and load the configuration, falling back to defaults when no file
/// is present at the default location.
pub fn load_or_default(explicit: Option<&Path>) -> Result<(RouterConfig, Option<PathBuf>), RouterError> {
    match find_config_path(explicit)? {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((RouterConfig::default(), None)),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
