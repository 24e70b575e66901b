//! Infrastructure layer of the WCP server.
//!
//! Contains the I/O-facing adapters: the TCP listener and per-connection
//! sessions, the in-memory viewer model, and TOML configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `wcp_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
pub mod viewer;
