//! TOML-based configuration for the WCP server.
//!
//! Reads `ServerConfig` from an explicit path or from the platform-appropriate
//! config file:
//! - Windows:  `%APPDATA%\WCP\server.toml`
//! - Linux:    `$XDG_CONFIG_HOME/wcp/server.toml` (or `~/.config/wcp/server.toml`)
//! - macOS:    `~/Library/Application Support/WCP/server.toml`
//!
//! Example:
//!
//! ```toml
//! [server]
//! bind_address = "127.0.0.1"
//! port = 54321
//! log_level = "debug"
//!
//! [protocol]
//! commands = ["get_item_list", "add_variables", "load"]
//!
//! [viewer]
//! viewports = 2
//! initial_source = "counter.vcd"
//!
//! [[viewer.sources]]
//! name = "counter.vcd"
//! variables = ["top.clk", "top.rst", "top.counter.value"]
//! ```
//!
//! Every field has a `#[serde(default = "...")]`, so a partial file (or no
//! file at all) still yields a complete configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use wcp_core::protocol::DEFAULT_MAX_FRAME_BYTES;

use crate::application::dispatch::{CommandRegistry, UnknownCommandName};
use crate::infrastructure::viewer::memory::DEFAULT_EVENT_BUFFER;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The `[protocol] commands` allowlist names a command that does not exist.
    #[error(transparent)]
    UnknownCommand(#[from] UnknownCommandName),

    /// The file parsed but its values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub viewer: ViewerConfig,
}

/// Listener and transport settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// IP address to listen on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Largest accepted frame in bytes.  Larger frames close the connection.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Capacity of the state-change broadcast channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

/// Protocol settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProtocolConfig {
    /// Allowlist of enabled commands.  Absent means every command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<Vec<String>>,
}

/// In-memory viewer settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewerConfig {
    /// Number of viewports.
    #[serde(default = "default_viewports")]
    pub viewports: usize,
    /// Source loaded at startup, if any.  Must name an entry of `sources`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_source: Option<String>,
    /// Loadable sources.
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceEntry>,
}

/// One loadable waveform source and the variables it contains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceEntry {
    pub name: String,
    /// Full hierarchical variable paths, `.` separated.
    #[serde(default)]
    pub variables: Vec<String>,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    54321
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}
fn default_viewports() -> usize {
    1
}
fn default_sources() -> Vec<SourceEntry> {
    vec![SourceEntry {
        name: "counter.vcd".to_string(),
        variables: [
            "top.clk",
            "top.rst",
            "top.counter.value",
            "top.counter.overflow",
        ]
        .into_iter()
        .map(str::to_string)
        .collect(),
    }]
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            log_level: default_log_level(),
            max_frame_bytes: default_max_frame_bytes(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            viewports: default_viewports(),
            initial_source: None,
            sources: default_sources(),
        }
    }
}

impl ServerConfig {
    /// `bind_address:port`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }

    /// Builds the dispatcher registry from the `[protocol]` allowlist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownCommand`] for a name that is not a
    /// protocol command.
    pub fn command_registry(&self) -> Result<CommandRegistry, ConfigError> {
        match &self.protocol.commands {
            Some(names) => Ok(CommandRegistry::from_names(names.as_slice())?),
            None => Ok(CommandRegistry::all()),
        }
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] or [`ConfigError::UnknownCommand`]
    /// describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid("server.max_frame_bytes must be > 0".into()));
        }
        if self.server.event_buffer == 0 {
            return Err(ConfigError::Invalid("server.event_buffer must be > 0".into()));
        }
        if self.viewer.viewports == 0 {
            return Err(ConfigError::Invalid("viewer.viewports must be > 0".into()));
        }
        if let Some(initial) = &self.viewer.initial_source {
            if !self.viewer.sources.iter().any(|s| &s.name == initial) {
                return Err(ConfigError::Invalid(format!(
                    "viewer.initial_source {initial:?} is not listed in viewer.sources"
                )));
            }
        }
        self.command_registry()?;
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("server.toml"))
}

/// Loads the config from the platform path, returning defaults if the file
/// does not exist yet.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads the config from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Resolves the platform config base directory including the `WCP`
/// subdirectory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("WCP"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("wcp"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("WCP")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
