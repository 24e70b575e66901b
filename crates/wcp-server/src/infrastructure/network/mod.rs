//! Network infrastructure for the WCP server.
//!
//! # Sub-modules
//!
//! - **`session`** – Runs one connection: reads NUL-delimited frames, drives
//!   the handshake and the dispatcher, and interleaves viewer events with
//!   replies on the same stream.  Generic over the byte stream so tests can
//!   use an in-memory duplex pipe.
//!
//! - **`server`** – The TCP accept loop (one task per connection) and the
//!   "initiate" mode in which the server dials a waiting client instead.

pub mod server;
pub mod session;

use thiserror::Error;
use wcp_core::ProtocolError;

/// Error type for server network operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A framing or encoding failure.  The connection cannot continue.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}
