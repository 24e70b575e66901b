//! The structured error payload carried by every `error` message.
//!
//! There is exactly one error shape in the protocol.  Every failure path on
//! the server (handshake, readiness, dispatch, argument validation, name
//! resolution) is converted into a [`WcpError`] and sent as
//! `ScMessage::Error`.  The client reuses the same type for the one failure
//! that never crosses the wire, `connection_closed`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::messages::{CommandKind, RequestId};
use crate::protocol::version::ProtocolVersion;

/// Enumerated error kinds.  Clients branch on this, never on `message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The greeting version is unparseable or has an unsupported major.
    VersionMismatch,
    /// A command arrived before a successful handshake.
    NotReady,
    /// The command tag is not in the dispatcher registry.
    UnknownCommand,
    /// The payload failed a handler precondition or could not be decoded.
    InvalidArguments,
    /// A named variable or scope could not be resolved in the loaded waveform.
    ResolutionFailed,
    /// Client-local: the transport closed while a call was pending.
    ConnectionClosed,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::VersionMismatch => "version_mismatch",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::UnknownCommand => "unknown_command",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::ResolutionFailed => "resolution_failed",
            ErrorKind::ConnectionClosed => "connection_closed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error: a kind tag, a human-readable message, and optional
/// string arguments (the offending names or ids).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error}: {message}")]
pub struct WcpError {
    pub error: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
    /// Request id of the command this error answers, when it carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl WcpError {
    pub fn new(error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
            arguments: Vec::new(),
            id: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_id(mut self, id: Option<RequestId>) -> Self {
        self.id = id;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error
    }

    // ── Constructors for each failure path ───────────────────────────────────

    pub fn version_mismatch(requested: &str, server: ProtocolVersion) -> Self {
        Self::new(
            ErrorKind::VersionMismatch,
            format!("server speaks WCP {server}, client requested {requested:?}"),
        )
        .with_arguments(vec![requested.to_string()])
    }

    pub fn not_ready() -> Self {
        Self::new(
            ErrorKind::NotReady,
            "handshake has not completed; send a greeting first",
        )
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::new(
            ErrorKind::UnknownCommand,
            format!("command {name:?} is not supported"),
        )
        .with_arguments(vec![name.to_string()])
    }

    pub fn invalid_arguments(command: Option<CommandKind>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match command {
            Some(kind) => Self::new(ErrorKind::InvalidArguments, format!("{kind}: {reason}"))
                .with_arguments(vec![kind.to_string()]),
            None => Self::new(ErrorKind::InvalidArguments, reason),
        }
    }

    pub fn resolution_failed(message: impl Into<String>, unresolved: Vec<String>) -> Self {
        Self::new(ErrorKind::ResolutionFailed, message).with_arguments(unresolved)
    }

    pub fn connection_closed() -> Self {
        Self::new(
            ErrorKind::ConnectionClosed,
            "connection closed before a reply arrived",
        )
    }
}
