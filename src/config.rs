//! Configuration loading and validation.
//!
//! `config.toml` holds non-secret settings; secrets (the bridge token) live
//! in `.env` next to it and are loaded by [`crate::credentials`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::gateway::reconnect::ReconnectPolicy;
use crate::protocol::bridge::{
    BridgeSettings, DEFAULT_BRIDGE_URL, DEFAULT_MAX_STREAM_FAILURES,
};

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Sidecar bridge connection.
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Lifecycle tuning.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Sidecar bridge settings.
#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    /// Base URL of the bridge.
    #[serde(default = "default_bridge_url")]
    pub url: String,

    /// Name of the credential holding the bridge bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Long-poll timeout for the event stream, in seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Consecutive failed polls before the session is treated as closed.
    #[serde(default = "default_max_stream_failures")]
    pub max_stream_failures: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            token_env: default_token_env(),
            poll_timeout_secs: default_poll_timeout_secs(),
            max_stream_failures: default_max_stream_failures(),
        }
    }
}

/// Lifecycle settings.
#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// Delay before reconnecting after a closure, in milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Per-session event buffer and broadcast capacity.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Default, Deserialize)]
pub struct StorageConfig {
    /// Database file. Defaults to `gateway.db` in the config directory.
    pub database: Option<PathBuf>,
}

// Default value functions for serde

fn default_bridge_url() -> String {
    DEFAULT_BRIDGE_URL.to_owned()
}
fn default_token_env() -> String {
    "WAGATE_BRIDGE_TOKEN".to_owned()
}
fn default_poll_timeout_secs() -> u64 {
    60
}
fn default_max_stream_failures() -> u32 {
    DEFAULT_MAX_STREAM_FAILURES
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_event_channel_capacity() -> usize {
    256
}

impl Config {
    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed bridge URL or a zero poll timeout,
    /// failure limit, or capacity.
    pub fn validate(&self) -> anyhow::Result<()> {
        let url = url::Url::parse(&self.bridge.url)
            .map_err(|e| anyhow::anyhow!("invalid bridge.url {:?}: {e}", self.bridge.url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!(
                "bridge.url must be http or https, got {}",
                url.scheme()
            ));
        }
        // A zero long-poll timeout turns the event stream into a busy loop.
        if self.bridge.poll_timeout_secs == 0 {
            return Err(anyhow::anyhow!(
                "bridge.poll_timeout_secs must be greater than zero"
            ));
        }
        if self.bridge.max_stream_failures == 0 {
            return Err(anyhow::anyhow!(
                "bridge.max_stream_failures must be greater than zero"
            ));
        }
        if self.gateway.event_channel_capacity == 0 {
            return Err(anyhow::anyhow!(
                "gateway.event_channel_capacity must be greater than zero"
            ));
        }
        Ok(())
    }

    /// Reconnect policy from `[gateway]`.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(self.gateway.reconnect_delay_ms))
    }

    /// Bridge client settings with the resolved token.
    pub fn bridge_settings(&self, token: Option<String>) -> BridgeSettings {
        BridgeSettings {
            base_url: self.bridge.url.clone(),
            token,
            poll_timeout: Duration::from_secs(self.bridge.poll_timeout_secs),
            event_capacity: self.gateway.event_channel_capacity,
            max_stream_failures: self.bridge.max_stream_failures,
        }
    }

    /// Database path, falling back to the runtime default.
    pub fn database_path(&self, paths: &RuntimePaths) -> PathBuf {
        self.storage
            .database
            .clone()
            .unwrap_or_else(|| paths.database.clone())
    }
}

/// Load and validate the config from a TOML file.
///
/// A missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str::<Config>(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no config file found, using defaults");
            Config::default()
        }
        Err(e) => {
            return Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            ))
        }
    };
    config.validate()?;
    Ok(config)
}

/// Resolve the default config directory (`~/.wagate/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".wagate"))
}

/// Well-known files under the config directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Config directory.
    pub root: PathBuf,
    /// `config.toml`.
    pub config_toml: PathBuf,
    /// `.env` secrets file.
    pub env_file: PathBuf,
    /// Default database file.
    pub database: PathBuf,
    /// Log directory.
    pub logs_dir: PathBuf,
}

impl RuntimePaths {
    /// Paths rooted at `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config_toml: root.join("config.toml"),
            env_file: root.join(".env"),
            database: root.join("gateway.db"),
            logs_dir: root.join("logs"),
        }
    }
}

/// Paths rooted at [`config_dir`].
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::under(&config_dir()?))
}
