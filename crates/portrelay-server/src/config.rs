//! Relay configuration: YAML or TOML file + CLI overrides.
//!
//! The document carries the port mappings and an optional `relay` section:
//!
//! ```yaml
//! port_mappings:
//!   "13306": "10.0.0.5:3306"
//! relay:
//!   connect_timeout_secs: 10
//! ```
//!
//! Files ending in `.toml` are parsed as TOML, everything else as YAML.

use portrelay_core::settings::{
    DEFAULT_BIND_ADDRESS, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT_SECS,
    DEFAULT_SHUTDOWN_GRACE_SECS,
};
use portrelay_core::{secs_or_disabled, MappingTable, RelayError, RelayResult, RelaySettings};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub port_mappings: BTreeMap<String, String>,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `relay` section of the config document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelaySection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub max_sessions_per_listener: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: 0,
            max_sessions_per_listener: 0,
            shutdown_grace_secs: default_shutdown_grace(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_bind_address() -> String {
    DEFAULT_BIND_ADDRESS.to_string()
}
fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_address: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_sessions_per_listener: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
}

/// Document syntax, picked from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

/// Resolved relay configuration (mappings validated, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub mappings: MappingTable,
    pub settings: RelaySettings,
}

impl RelayConfig {
    /// Load the config document at `path`, validate it, then apply CLI
    /// overrides.
    ///
    /// Unlike optional client settings, a missing file is an error: without
    /// mappings there is nothing to relay.
    pub fn load(path: &Path, overrides: &CliOverrides) -> RelayResult<Self> {
        let expanded = expand_tilde(path);
        info!(path = %expanded.display(), "loading config file");
        let content = std::fs::read_to_string(&expanded).map_err(|e| {
            RelayError::Config(format!("cannot read {}: {e}", expanded.display()))
        })?;
        Self::from_str(&content, ConfigFormat::from_path(&expanded), overrides)
    }

    /// Parse and validate a config document held in memory.
    pub fn from_str(
        content: &str,
        format: ConfigFormat,
        overrides: &CliOverrides,
    ) -> RelayResult<Self> {
        let file_config: ConfigFile = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?,
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?,
        };

        let mappings = MappingTable::from_raw(&file_config.port_mappings)?;
        let relay = file_config.relay;

        // Merge CLI overrides
        let bind_address = overrides
            .bind_address
            .clone()
            .unwrap_or(relay.bind_address);
        let connect_timeout = overrides
            .connect_timeout_secs
            .unwrap_or(relay.connect_timeout_secs);
        let idle_timeout = overrides
            .idle_timeout_secs
            .unwrap_or(relay.idle_timeout_secs);
        let max_sessions = overrides
            .max_sessions_per_listener
            .unwrap_or(relay.max_sessions_per_listener);
        let shutdown_grace = overrides
            .shutdown_grace_secs
            .unwrap_or(relay.shutdown_grace_secs);

        if relay.buffer_size == 0 {
            return Err(RelayError::Config("buffer_size must be positive".to_string()));
        }

        Ok(Self {
            mappings,
            settings: RelaySettings {
                bind_address,
                connect_timeout: secs_or_disabled(connect_timeout),
                idle_timeout: secs_or_disabled(idle_timeout),
                max_sessions_per_listener: max_sessions,
                shutdown_grace: Duration::from_secs(shutdown_grace),
                buffer_size: relay.buffer_size,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
