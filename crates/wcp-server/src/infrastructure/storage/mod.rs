//! Storage infrastructure: configuration file loading.
//!
//! The `config` sub-module reads the server's TOML configuration from the
//! platform-appropriate directory (or an explicit path) and falls back to
//! defaults when no file exists yet.

pub mod config;
