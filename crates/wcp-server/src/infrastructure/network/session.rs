//! One WCP connection, from first byte to close.
//!
//! # Loop structure
//!
//! ```text
//! loop {
//!     for each complete frame in the buffer:
//!         decode → handshake / dispatch → write exactly one reply
//!     select! {
//!         bytes from the peer      → append to the frame buffer
//!         viewer state change      → write an `event` (unless we caused it)
//!     }
//! }
//! ```
//!
//! Frames are handled strictly one after another, so replies leave in the
//! order commands arrived.  State changes raised while a command runs wait in
//! the broadcast channel and are written after that command's reply.
//!
//! Events are only delivered once the handshake is complete: the session
//! subscribes to the viewer when it accepts the client greeting, and the
//! first event can only be written after the server greeting.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use wcp_core::protocol::{decode_cs_message, encode_message, FrameBuffer};
use wcp_core::{CommandKind, CsMessage, ProtocolError, ScMessage, WcpError, PROTOCOL_VERSION};

use crate::application::dispatch::Dispatcher;
use crate::application::handshake::Handshake;
use crate::application::viewer::{SessionId, StateChange};
use crate::infrastructure::network::ServerError;

/// Size of a single socket read.
const READ_CHUNK: usize = 8 * 1024;

/// How a session ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the transport.
    PeerClosed,
    /// The peer sent `shutdown`; the ack was written and the transport closed.
    Shutdown,
}

/// What the session does after writing a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum After {
    Continue,
    /// The reply was the server greeting.
    Greeted,
    Close,
}

struct Reply {
    message: ScMessage,
    after: After,
}

impl Reply {
    fn error(err: WcpError) -> Self {
        Self {
            message: ScMessage::Error(err),
            after: After::Continue,
        }
    }
}

/// Per-connection protocol state.
pub struct Session {
    id: SessionId,
    dispatcher: Arc<Dispatcher>,
    handshake: Handshake,
    events: Option<broadcast::Receiver<StateChange>>,
}

impl Session {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let commands = dispatcher.registry().names();
        Self {
            id: Uuid::new_v4(),
            dispatcher,
            handshake: Handshake::new(PROTOCOL_VERSION, commands),
            events: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Serves the connection until the peer closes it or sends `shutdown`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] on transport failure and
    /// [`ServerError::Protocol`] when a frame exceeds `max_frame_bytes`.
    pub async fn run<S>(mut self, stream: S, max_frame_bytes: usize) -> Result<SessionEnd, ServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut frames = FrameBuffer::new(max_frame_bytes);
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            while let Some(frame) = frames.next_frame()? {
                let reply = self.handle_frame(&frame).await;
                write_message(&mut writer, &reply.message).await?;

                match reply.after {
                    After::Continue => {}
                    After::Greeted => self.on_greeting_written(),
                    After::Close => {
                        info!(session = %self.id, "shutdown requested by peer");
                        writer.shutdown().await?;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }

            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!(session = %self.id, pending = frames.pending(), "peer closed the connection");
                        return Ok(SessionEnd::PeerClosed);
                    }
                    frames.extend(&buf[..n]);
                }
                change = next_change(&mut self.events) => {
                    self.forward_change(change, &mut writer).await?;
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: &[u8]) -> Reply {
        let message = match decode_cs_message(frame) {
            Ok(message) => message,
            Err(e) => return Reply::error(self.decode_failure(e)),
        };

        match message {
            CsMessage::Greeting { version, commands } => {
                match self.handshake.negotiate(&version, &commands) {
                    Ok(greeting) => {
                        // Subscribe before the greeting leaves so no change
                        // made after the peer sees it can be missed.
                        if self.events.is_none() {
                            self.events = Some(self.dispatcher.subscribe());
                        }
                        Reply {
                            message: greeting,
                            after: After::Greeted,
                        }
                    }
                    Err(e) => Reply::error(e),
                }
            }
            CsMessage::Command { command, id } => {
                if let Err(e) = self.handshake.check_ready() {
                    debug!(session = %self.id, command = %command.kind(), "command before handshake");
                    return Reply::error(e.with_id(id));
                }

                let close = command.kind() == CommandKind::Shutdown;
                match self.dispatcher.dispatch(self.id, command).await {
                    Ok(response) => Reply {
                        message: ScMessage::response(response, id),
                        after: if close { After::Close } else { After::Continue },
                    },
                    Err(e) => {
                        debug!(session = %self.id, error = %e, "command failed");
                        Reply::error(e.with_id(id))
                    }
                }
            }
        }
    }

    /// Maps a decode failure to the error sent back.  A command that cannot
    /// be decoded before the handshake completes is still `not_ready`.
    fn decode_failure(&self, e: ProtocolError) -> WcpError {
        warn!(session = %self.id, "rejecting frame: {e}");
        if let ProtocolError::InvalidGreeting { version, .. } = &e {
            return self.handshake.reject_greeting(version);
        }
        let is_command = matches!(
            e,
            ProtocolError::UnknownCommand { .. } | ProtocolError::InvalidArguments { .. }
        );
        if is_command && !self.handshake.is_ready() {
            return WcpError::not_ready().with_id(e.request_id());
        }
        e.to_wcp_error()
            .unwrap_or_else(|| WcpError::invalid_arguments(None, e.to_string()))
    }

    fn on_greeting_written(&mut self) {
        if !self.handshake.is_ready() {
            self.handshake.complete();
            info!(session = %self.id, "handshake complete");
        }
    }

    async fn forward_change<W>(
        &mut self,
        change: Result<StateChange, RecvError>,
        writer: &mut W,
    ) -> Result<(), ServerError>
    where
        W: AsyncWrite + Unpin,
    {
        match change {
            Ok(change) if change.is_visible_to(self.id) => {
                debug!(session = %self.id, event = change.event.name(), "forwarding event");
                write_message(writer, &ScMessage::event(change.event)).await?;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(session = %self.id, skipped, "event subscriber lagged; oldest events dropped");
            }
            Err(RecvError::Closed) => {
                debug!(session = %self.id, "viewer event channel closed");
                self.events = None;
            }
        }
        Ok(())
    }
}

/// Resolves with the next state change, or never if not subscribed.
async fn next_change(
    events: &mut Option<broadcast::Receiver<StateChange>>,
) -> Result<StateChange, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_message<W>(writer: &mut W, message: &ScMessage) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_message(message)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
