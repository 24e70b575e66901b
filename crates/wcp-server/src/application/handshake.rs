//! Per-connection handshake state machine.
//!
//! ```text
//!  Disconnected ──greeting (compatible)──▶ Greeted ──reply written──▶ Ready
//!       │                                                            │
//!       └─greeting (bad version)─▶ error, stays Disconnected         └─greeting─▶ same reply
//! ```
//!
//! The server is authoritative: its reply always carries its own version and
//! the command names its dispatcher accepts.  A client may only rely on the
//! names listed there.  Until the state reaches `Ready`, every command is
//! answered with `not_ready`.

use tracing::{debug, warn};

use wcp_core::{ProtocolVersion, ScMessage, WcpError};

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport open, no valid greeting received yet.
    Disconnected,
    /// Client greeting accepted; server greeting not yet on the wire.
    Greeted,
    /// Handshake complete.  Commands are processed and events delivered.
    Ready,
}

/// Handshake negotiator for one connection.
#[derive(Debug)]
pub struct Handshake {
    state: SessionState,
    server_version: ProtocolVersion,
    commands: Vec<String>,
}

impl Handshake {
    /// `commands` is the ordered list of enabled command names advertised in
    /// the server greeting.
    pub fn new(server_version: ProtocolVersion, commands: Vec<String>) -> Self {
        Self {
            state: SessionState::Disconnected,
            server_version,
            commands,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Handles a client greeting and returns the server greeting to send.
    ///
    /// # Errors
    ///
    /// Returns a `version_mismatch` error when `version` cannot be parsed or
    /// names a different major version.  The state is left unchanged.
    pub fn negotiate(
        &mut self,
        version: &str,
        client_commands: &[String],
    ) -> Result<ScMessage, WcpError> {
        if self.state == SessionState::Ready {
            debug!("repeated greeting on a ready session");
            return Ok(self.server_greeting());
        }

        let requested: ProtocolVersion = match version.parse() {
            Ok(v) => v,
            Err(e) => {
                warn!(version, "rejecting greeting: {e}");
                return Err(WcpError::version_mismatch(version, self.server_version));
            }
        };
        if !self.server_version.is_compatible_with(&requested) {
            warn!(%requested, server = %self.server_version, "rejecting greeting: major version differs");
            return Err(WcpError::version_mismatch(version, self.server_version));
        }

        let unsupported: Vec<&str> = client_commands
            .iter()
            .map(String::as_str)
            .filter(|name| !self.commands.iter().any(|c| c == name))
            .collect();
        if !unsupported.is_empty() {
            debug!(?unsupported, "client announced commands this server does not accept");
        }

        self.state = SessionState::Greeted;
        Ok(self.server_greeting())
    }

    /// Error for a greeting whose `version` field is missing or not a
    /// string.  `version` is the raw field as received.
    pub fn reject_greeting(&self, version: &str) -> WcpError {
        warn!(version, "rejecting greeting: version is not a string");
        WcpError::version_mismatch(version, self.server_version)
    }

    /// Marks the server greeting as written.  Only then does the session
    /// become `Ready`.
    pub fn complete(&mut self) {
        if self.state == SessionState::Greeted {
            self.state = SessionState::Ready;
        }
    }

    /// Gate applied to every command.
    ///
    /// # Errors
    ///
    /// Returns `not_ready` unless the handshake has completed.
    pub fn check_ready(&self) -> Result<(), WcpError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(WcpError::not_ready())
        }
    }

    fn server_greeting(&self) -> ScMessage {
        ScMessage::greeting(self.server_version, self.commands.clone())
    }
}
