use anyhow::{Context, Result, bail};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::history::DEFAULT_HISTORY_CAPACITY;

// =============================================================================
// File config (figment-deserialized from defaults / chat-relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   chat-relay.toml:  [server]
//                     port = 9000
//
//   env var:          CHAT_RELAY_SERVER__PORT=9000   (double underscore = nesting)
//
//   (single underscore stays within field names: CHAT_RELAY_SERVER__HISTORY_CAPACITY)

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "chat-relay.toml";

const ENV_PREFIX: &str = "CHAT_RELAY_";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub peer: PeerFileConfig,
}

/// Relay tunables (lives under `[server]` in chat-relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Frames queued per session before the session counts as unreachable.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// 0 disables the write timeout.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_max_string_bytes")]
    pub max_string_bytes: usize,
    /// strftime pattern used when the relay stamps a message.
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_server_port(),
            history_capacity: default_history_capacity(),
            outbound_queue: default_outbound_queue(),
            write_timeout_secs: default_write_timeout_secs(),
            max_string_bytes: default_max_string_bytes(),
            time_format: default_time_format(),
        }
    }
}

/// UDP peer tunables (lives under `[peer]` in chat-relay.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerFileConfig {
    #[serde(default = "default_peer_port")]
    pub port: u16,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for PeerFileConfig {
    fn default() -> Self {
        Self {
            port: default_peer_port(),
            broadcast_addr: default_broadcast_addr(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    42069
}
fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}
fn default_outbound_queue() -> usize {
    64
}
fn default_write_timeout_secs() -> u64 {
    30
}
fn default_max_string_bytes() -> usize {
    chat_wire::DEFAULT_MAX_STRING_BYTES
}
fn default_time_format() -> String {
    "%H:%M:%S".to_string()
}
fn default_peer_port() -> u16 {
    5238
}
fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}

/// Build a figment that layers: defaults → config file → CHAT_RELAY_* env vars.
///
/// An explicit `path` must exist; the default `chat-relay.toml` is optional.
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let file = match path {
        Some(path) => Toml::file_exact(path),
        None => Toml::file(DEFAULT_CONFIG_FILE),
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(file)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

impl FileConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        load_config(path)
            .extract()
            .context("failed to load configuration")
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Relay configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub history_capacity: usize,
    pub outbound_queue: usize,
    pub write_timeout: Option<Duration>,
    pub max_string_bytes: usize,
    pub time_format: String,
}

impl RelayConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Result<Self> {
        validate_time_format(&fc.time_format)?;
        if fc.history_capacity > chat_wire::MAX_HISTORY_ENTRIES {
            bail!(
                "server.history_capacity {} exceeds the replay limit of {}",
                fc.history_capacity,
                chat_wire::MAX_HISTORY_ENTRIES
            );
        }
        Ok(Self {
            host: fc.host.clone(),
            port: fc.port,
            history_capacity: fc.history_capacity,
            // Admission reply and history replay are queued together.
            outbound_queue: fc.outbound_queue.max(2),
            write_timeout: if fc.write_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.write_timeout_secs))
            },
            max_string_bytes: fc.max_string_bytes,
            time_format: fc.time_format.clone(),
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let fc = ServerFileConfig::default();
        Self {
            host: fc.host,
            port: fc.port,
            history_capacity: fc.history_capacity,
            outbound_queue: fc.outbound_queue,
            write_timeout: Some(Duration::from_secs(fc.write_timeout_secs)),
            max_string_bytes: fc.max_string_bytes,
            time_format: fc.time_format,
        }
    }
}

/// UDP peer configuration (runtime view).
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub port: u16,
    pub broadcast_addr: IpAddr,
    pub history_capacity: usize,
}

impl PeerConfig {
    pub fn from_file(fc: &PeerFileConfig) -> Result<Self> {
        let broadcast_addr = fc
            .broadcast_addr
            .parse()
            .with_context(|| format!("invalid peer.broadcast_addr {:?}", fc.broadcast_addr))?;
        Ok(Self {
            port: fc.port,
            broadcast_addr,
            history_capacity: fc.history_capacity,
        })
    }
}

/// chrono renders bad specifiers as a formatting error, which would panic
/// inside `to_string()`; reject them up front.
fn validate_time_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        bail!("invalid server.time_format {format:?}");
    }
    Ok(())
}

/// Resolve the config file path shown in logs.
pub fn describe_source(path: Option<&Path>) -> PathBuf {
    path.map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}
