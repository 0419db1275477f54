//! Connector configuration loading (spec.md §6, "Configuration keys
//! consumed").
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/vigilo-connector/connector.toml`.
//!
//! # Required fields
//! - `bus.service`
//! - `connector.socket_send` and `connector.socket_recv`
//!
//! Everything else has a documented default.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub bus: BusConfig,
    pub publications: HashMap<String, String>,
    pub connector: ConnectorSettings,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Pubsub service address (XMPP) or broker identity.
    pub service: String,
    /// Upper bound passed to `session::effective_max_in_flight`.
    pub max_send_simult: usize,
    /// `batch_size` for `perf` aggregation.
    pub batch_send_perf: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// `Q_max`; `0` means unbounded.
    pub max_queue_size: usize,
    /// RetryStore database path; `:memory:` is accepted but not durable
    /// across restarts (kept only for parity with the configuration key).
    pub backup_file: String,
    pub backup_table_to_bus: String,
    pub backup_table_from_bus: String,
    pub socket_send: String,
    pub socket_recv: String,
}

/// Destination exchanges defaulted when `[publications]` omits them
/// (spec.md §6, AMQP wire form).
const DEFAULT_PUBLICATIONS: &[(&str, &str)] =
    &[("aggr", "correlation"), ("delaggr", "correlation"), ("correvent", "correlation")];

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bus: Option<RawBusConfig>,
    publications: Option<HashMap<String, String>>,
    connector: Option<RawConnectorConfig>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    service: Option<String>,
    max_send_simult: Option<usize>,
    batch_send_perf: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawConnectorConfig {
    max_queue_size: Option<usize>,
    backup_file: Option<String>,
    backup_table_to_bus: Option<String>,
    backup_table_from_bus: Option<String>,
    socket_send: Option<String>,
    socket_recv: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load connector config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ConnectorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load connector config from the default path
/// `/etc/vigilo-connector/connector.toml`.
pub fn load_config() -> Result<ConnectorConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/vigilo-connector/connector.toml"))
}

/// Load connector config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ConnectorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_bus = raw.bus.ok_or_else(|| ConfigError::MissingField("bus".to_owned()))?;
    let service = raw_bus
        .service
        .ok_or_else(|| ConfigError::MissingField("bus.service".to_owned()))?;
    let max_send_simult = raw_bus.max_send_simult.unwrap_or(1000);
    let batch_send_perf = raw_bus.batch_send_perf.unwrap_or(1);

    let mut publications: HashMap<String, String> =
        DEFAULT_PUBLICATIONS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    if let Some(overrides) = raw.publications {
        publications.extend(overrides);
    }

    let raw_connector = raw.connector.unwrap_or(RawConnectorConfig {
        max_queue_size: None,
        backup_file: None,
        backup_table_to_bus: None,
        backup_table_from_bus: None,
        socket_send: None,
        socket_recv: None,
    });
    let socket_send = raw_connector
        .socket_send
        .ok_or_else(|| ConfigError::MissingField("connector.socket_send".to_owned()))?;
    let socket_recv = raw_connector
        .socket_recv
        .ok_or_else(|| ConfigError::MissingField("connector.socket_recv".to_owned()))?;

    Ok(ConnectorConfig {
        bus: BusConfig { service, max_send_simult, batch_send_perf },
        publications,
        connector: ConnectorSettings {
            max_queue_size: raw_connector.max_queue_size.unwrap_or(0),
            backup_file: raw_connector.backup_file.unwrap_or_else(|| "/var/lib/vigilo-connector/retry.sqlite3".to_owned()),
            backup_table_to_bus: raw_connector.backup_table_to_bus.unwrap_or_else(|| "retry_to_bus".to_owned()),
            backup_table_from_bus: raw_connector.backup_table_from_bus.unwrap_or_else(|| "retry_from_bus".to_owned()),
            socket_send,
            socket_recv,
        },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Fatal configuration error (spec.md §7, "Fatal configuration" — surfaced
/// at startup, process exits non-zero).
#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "missing required field: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
