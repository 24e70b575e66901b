//! Wire codec: NUL-delimited JSON frames.
//!
//! Wire format:
//! ```text
//! [json object (UTF-8)][0x00][json object][0x00]...
//! ```
//! JSON text never contains a raw NUL byte (serde_json escapes it as
//! `\u0000`), so the delimiter is unambiguous.
//!
//! Decoding is split in two stages for client→server traffic.  The frame is
//! first parsed into a generic JSON value so the command tag can be
//! inspected on its own; only then is the typed payload decoded.  This is
//! what lets the server answer an unrecognised tag with `unknown_command`
//! and a recognised tag with a bad payload with `invalid_arguments`, instead
//! of a single undifferentiated parse failure.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::protocol::error::WcpError;
use crate::protocol::messages::{CommandKind, CsMessage, RequestId, ScMessage};
use crate::protocol::version::PROTOCOL_VERSION;

/// Byte terminating every frame.
pub const FRAME_DELIMITER: u8 = 0x00;

/// Default upper bound on a single frame, delimiter excluded.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// No complete frame is buffered yet.
    #[error("insufficient data: no frame delimiter in {available} buffered bytes")]
    InsufficientData { available: usize },

    /// A frame (or the unterminated tail of the buffer) exceeds the limit.
    #[error("frame of at least {size} bytes exceeds the {limit}-byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// The `type` of a `command` is not a protocol command.
    #[error("unknown command type: {name:?}")]
    UnknownCommand {
        name: String,
        id: Option<RequestId>,
    },

    /// A known command whose payload does not match its schema.
    #[error("invalid arguments for {command}: {reason}")]
    InvalidArguments {
        command: CommandKind,
        reason: String,
        id: Option<RequestId>,
    },

    /// A `greeting` whose `version` field is missing or not a string.
    /// `version` holds the raw field as JSON text, empty when absent.
    #[error("invalid greeting version {version:?}: {reason}")]
    InvalidGreeting { version: String, reason: String },

    /// The frame is not a JSON object, lacks a `type`, or has an unknown
    /// envelope `type`.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        reason: String,
        id: Option<RequestId>,
    },

    /// A server `event` frame whose payload could not be decoded.  Unlike a
    /// malformed reply it answers no call.
    #[error("malformed event: {reason}")]
    MalformedEvent { reason: String },

    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

impl ProtocolError {
    /// Request id recovered from the offending frame, if it had one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ProtocolError::UnknownCommand { id, .. }
            | ProtocolError::InvalidArguments { id, .. }
            | ProtocolError::MalformedMessage { id, .. } => *id,
            _ => None,
        }
    }

    /// Converts a decode failure of a client frame into the error the server
    /// reports back.  Framing failures have no wire representation and
    /// return `None`; they end the connection instead.
    pub fn to_wcp_error(&self) -> Option<WcpError> {
        let err = match self {
            ProtocolError::UnknownCommand { name, .. } => WcpError::unknown_command(name),
            ProtocolError::InvalidArguments {
                command, reason, ..
            } => WcpError::invalid_arguments(Some(*command), reason.clone()),
            ProtocolError::InvalidGreeting { version, .. } => {
                WcpError::version_mismatch(version, PROTOCOL_VERSION)
            }
            ProtocolError::MalformedMessage { reason, .. } => {
                WcpError::invalid_arguments(None, format!("malformed message: {reason}"))
            }
            ProtocolError::InsufficientData { .. }
            | ProtocolError::FrameTooLarge { .. }
            | ProtocolError::MalformedEvent { .. }
            | ProtocolError::Serialize(_) => return None,
        };
        Some(err.with_id(self.request_id()))
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serializes `msg` as JSON and appends the frame delimiter.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if serde cannot encode the value.
///
/// # Examples
///
/// ```rust
/// use wcp_core::protocol::{decode_sc_message, encode_message, split_frame};
/// use wcp_core::protocol::messages::{Response, ScMessage};
///
/// let msg = ScMessage::response(Response::Ack, None);
/// let bytes = encode_message(&msg).unwrap();
/// let (frame, consumed) = split_frame(&bytes).unwrap();
/// assert_eq!(consumed, bytes.len());
/// assert_eq!(decode_sc_message(frame).unwrap(), msg);
/// ```
pub fn encode_message<M: Serialize>(msg: &M) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    buf.push(FRAME_DELIMITER);
    Ok(buf)
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Splits the first frame off the front of `bytes`.
///
/// Returns the frame body (delimiter excluded) and the number of bytes
/// consumed (delimiter included), so the caller can advance its cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when no delimiter is present.
pub fn split_frame(bytes: &[u8]) -> Result<(&[u8], usize), ProtocolError> {
    match bytes.iter().position(|&b| b == FRAME_DELIMITER) {
        Some(end) => Ok((&bytes[..end], end + 1)),
        None => Err(ProtocolError::InsufficientData {
            available: bytes.len(),
        }),
    }
}

/// Accumulates bytes from a stream and yields complete frames.
///
/// A single `read()` on a byte stream may deliver part of a frame or several
/// frames at once; this buffer absorbs both cases.  Empty and
/// whitespace-only frames (for example a stray delimiter) are skipped.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(8 * 1024),
            max_frame_bytes,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Pops the next complete frame, or `Ok(None)` if more data is needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] when a frame exceeds the
    /// limit.  The stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            let (len, consumed) = match split_frame(&self.buf) {
                Ok((frame, consumed)) => (frame.len(), consumed),
                Err(ProtocolError::InsufficientData { available }) => {
                    if available > self.max_frame_bytes {
                        return Err(ProtocolError::FrameTooLarge {
                            size: available,
                            limit: self.max_frame_bytes,
                        });
                    }
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            if len > self.max_frame_bytes {
                return Err(ProtocolError::FrameTooLarge {
                    size: len,
                    limit: self.max_frame_bytes,
                });
            }

            let mut frame: Vec<u8> = self.buf.drain(..consumed).collect();
            frame.pop(); // delimiter
            if frame.iter().all(u8::is_ascii_whitespace) {
                trace!(len = frame.len(), "skipping empty frame");
                continue;
            }
            return Ok(Some(frame));
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decodes one client→server frame body.
///
/// # Errors
///
/// - [`ProtocolError::UnknownCommand`] for a `command` whose tag is not a
///   protocol command.
/// - [`ProtocolError::InvalidArguments`] for a known command with a payload
///   that does not match its schema.
/// - [`ProtocolError::InvalidGreeting`] for a `greeting` without a string
///   `version`.
/// - [`ProtocolError::MalformedMessage`] for anything else that is not a
///   valid `CsMessage`.
pub fn decode_cs_message(frame: &[u8]) -> Result<CsMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(frame).map_err(|e| malformed(e.to_string(), None))?;

    let object = value
        .as_object()
        .ok_or_else(|| malformed("expected a JSON object", None))?;
    let id = object.get("id").and_then(Value::as_u64);

    let envelope = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("missing string field `type`", id))?;

    match envelope {
        "greeting" => serde_json::from_value(value.clone()).map_err(|e| {
            match object.get("version") {
                Some(Value::String(_)) => malformed(e.to_string(), id),
                Some(raw) => ProtocolError::InvalidGreeting {
                    version: raw.to_string(),
                    reason: e.to_string(),
                },
                None => ProtocolError::InvalidGreeting {
                    version: String::new(),
                    reason: e.to_string(),
                },
            }
        }),
        "command" => {
            let name = object
                .get("command")
                .and_then(|c| c.get("type"))
                .and_then(Value::as_str)
                .ok_or_else(|| malformed("missing `command.type`", id))?;

            let kind = CommandKind::try_from(name).map_err(|_| ProtocolError::UnknownCommand {
                name: name.to_string(),
                id,
            })?;

            serde_json::from_value(value.clone()).map_err(|e| ProtocolError::InvalidArguments {
                command: kind,
                reason: e.to_string(),
                id,
            })
        }
        other => Err(malformed(format!("unknown message type {other:?}"), id)),
    }
}

/// Decodes one server→client frame body.
///
/// # Errors
///
/// - [`ProtocolError::MalformedEvent`] for an `event` frame with a bad
///   payload.
/// - [`ProtocolError::MalformedMessage`] for any other frame that is not a
///   valid `ScMessage`.  The request id is recovered when the frame is still
///   a JSON object, so the failure can be routed to the call it answers.
pub fn decode_sc_message(frame: &[u8]) -> Result<ScMessage, ProtocolError> {
    serde_json::from_slice(frame).map_err(|e| {
        let value: Option<Value> = serde_json::from_slice(frame).ok();
        let object = value.as_ref().and_then(Value::as_object);
        let envelope = object.and_then(|o| o.get("type")).and_then(Value::as_str);
        if envelope == Some("event") {
            return ProtocolError::MalformedEvent {
                reason: e.to_string(),
            };
        }
        let id = object.and_then(|o| o.get("id")).and_then(Value::as_u64);
        malformed(e.to_string(), id)
    })
}

fn malformed(reason: impl Into<String>, id: Option<RequestId>) -> ProtocolError {
    ProtocolError::MalformedMessage {
        reason: reason.into(),
        id,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::error::ErrorKind;
    use crate::protocol::messages::{Command, Response};

    #[test]
    fn test_encode_appends_single_delimiter() {
        let bytes = encode_message(&CsMessage::command(Command::Clear)).unwrap();
        assert_eq!(bytes.last(), Some(&FRAME_DELIMITER));
        assert_eq!(bytes.iter().filter(|&&b| b == FRAME_DELIMITER).count(), 1);
    }

    #[test]
    fn test_nul_inside_string_does_not_split_frame() {
        // Arrange: a variable name containing a NUL character
        let msg = CsMessage::command(Command::AddVariables {
            names: vec!["weird\0name".to_string()],
        });

        // Act
        let bytes = encode_message(&msg).unwrap();
        let (frame, consumed) = split_frame(&bytes).unwrap();

        // Assert: the whole message is one frame
        assert_eq!(consumed, bytes.len());
        assert_eq!(decode_cs_message(frame).unwrap(), msg);
    }

    #[test]
    fn test_split_frame_without_delimiter_needs_more_data() {
        let result = split_frame(br#"{"type":"gre"#);
        assert_eq!(result, Err(ProtocolError::InsufficientData { available: 12 }));
    }

    #[test]
    fn test_frame_buffer_reassembles_partial_reads() {
        // Arrange
        let bytes = encode_message(&CsMessage::command(Command::GetItemList)).unwrap();
        let (head, tail) = bytes.split_at(5);
        let mut buffer = FrameBuffer::default();

        // Act / Assert: nothing until the delimiter arrives
        buffer.extend(head);
        assert_eq!(buffer.next_frame(), Ok(None));
        buffer.extend(tail);
        let frame = buffer.next_frame().unwrap().expect("complete frame");

        assert_eq!(
            decode_cs_message(&frame).unwrap(),
            CsMessage::command(Command::GetItemList)
        );
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_frame_buffer_yields_coalesced_frames_in_order() {
        let mut buffer = FrameBuffer::default();
        buffer.extend(&encode_message(&CsMessage::command(Command::Reload)).unwrap());
        buffer.extend(&encode_message(&CsMessage::command(Command::Clear)).unwrap());

        let first = buffer.next_frame().unwrap().unwrap();
        let second = buffer.next_frame().unwrap().unwrap();

        assert_eq!(decode_cs_message(&first).unwrap(), CsMessage::command(Command::Reload));
        assert_eq!(decode_cs_message(&second).unwrap(), CsMessage::command(Command::Clear));
        assert_eq!(buffer.next_frame(), Ok(None));
    }

    #[test]
    fn test_frame_buffer_skips_empty_frames() {
        let mut buffer = FrameBuffer::default();
        buffer.extend(b"\0\n\0");
        buffer.extend(&encode_message(&CsMessage::command(Command::Clear)).unwrap());

        let frame = buffer.next_frame().unwrap().unwrap();
        assert_eq!(decode_cs_message(&frame).unwrap(), CsMessage::command(Command::Clear));
    }

    #[test]
    fn test_frame_buffer_rejects_oversized_unterminated_data() {
        let mut buffer = FrameBuffer::new(16);
        buffer.extend(&[b'x'; 17]);
        assert_eq!(
            buffer.next_frame(),
            Err(ProtocolError::FrameTooLarge { size: 17, limit: 16 })
        );
    }

    #[test]
    fn test_frame_buffer_rejects_oversized_complete_frame() {
        let mut buffer = FrameBuffer::new(4);
        buffer.extend(b"12345\0");
        assert!(matches!(
            buffer.next_frame(),
            Err(ProtocolError::FrameTooLarge { size: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_unknown_command_tag_is_distinguished() {
        let frame = br#"{"type":"command","id":4,"command":{"type":"cursor_set","position":3}}"#;

        let err = decode_cs_message(frame).unwrap_err();

        assert_eq!(
            err,
            ProtocolError::UnknownCommand {
                name: "cursor_set".to_string(),
                id: Some(4),
            }
        );
        let reported = err.to_wcp_error().unwrap();
        assert_eq!(reported.kind(), ErrorKind::UnknownCommand);
        assert_eq!(reported.id, Some(4));
    }

    #[test]
    fn test_known_command_with_bad_payload_is_invalid_arguments() {
        let frame = br#"{"type":"command","command":{"type":"add_variables","names":"top.clk"}}"#;

        let err = decode_cs_message(frame).unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::InvalidArguments {
                command: CommandKind::AddVariables,
                ..
            }
        ));
        assert_eq!(err.to_wcp_error().unwrap().kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_greeting_with_numeric_version_is_version_mismatch() {
        // Arrange
        let frame = br#"{"type":"greeting","version":1,"commands":[]}"#;

        // Act
        let err = decode_cs_message(frame).unwrap_err();

        // Assert
        assert!(matches!(
            &err,
            ProtocolError::InvalidGreeting { version, .. } if version == "1"
        ));
        let reported = err.to_wcp_error().unwrap();
        assert_eq!(reported.kind(), ErrorKind::VersionMismatch);
        assert_eq!(reported.arguments, vec!["1".to_string()]);
    }

    #[test]
    fn test_greeting_with_null_or_missing_version_is_version_mismatch() {
        for frame in [
            &br#"{"type":"greeting","version":null,"commands":[]}"#[..],
            &br#"{"type":"greeting","commands":[]}"#[..],
        ] {
            let err = decode_cs_message(frame).unwrap_err();
            assert_eq!(
                err.to_wcp_error().map(|e| e.kind()),
                Some(ErrorKind::VersionMismatch),
                "frame {}",
                String::from_utf8_lossy(frame)
            );
        }
    }

    #[test]
    fn test_greeting_with_bad_commands_is_still_malformed() {
        let frame = br#"{"type":"greeting","version":"0.1","commands":"all"}"#;

        let err = decode_cs_message(frame).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage { .. }));
    }

    #[test]
    fn test_non_json_frame_is_malformed() {
        let err = decode_cs_message(b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage { .. }));
    }

    #[test]
    fn test_unknown_envelope_type_is_malformed() {
        let err = decode_cs_message(br#"{"type":"hello"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedMessage { .. }));
    }

    #[test]
    fn test_framing_errors_have_no_wire_representation() {
        let err = ProtocolError::FrameTooLarge { size: 10, limit: 1 };
        assert_eq!(err.to_wcp_error(), None);
    }

    #[test]
    fn test_bad_server_reply_keeps_its_request_id() {
        let frame = br#"{"type":"response","id":6,"response":{"type":"get_item_list"}}"#;

        let err = decode_sc_message(frame).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedMessage { id: Some(6), .. }));
    }

    #[test]
    fn test_bad_server_event_is_told_apart_from_bad_reply() {
        let frame = br#"{"type":"event","event":{"type":"items_added","ids":7}}"#;

        let err = decode_sc_message(frame).unwrap_err();

        assert!(matches!(err, ProtocolError::MalformedEvent { .. }));
        assert_eq!(err.request_id(), None);
    }

    #[test]
    fn test_decode_sc_message_response() {
        let frame = br#"{"type":"response","response":{"type":"get_item_list","item_list":["a","b"]}}"#;
        let msg = decode_sc_message(frame).unwrap();
        assert_eq!(
            msg,
            ScMessage::response(
                Response::GetItemList {
                    item_list: vec!["a".to_string(), "b".to_string()],
                },
                None
            )
        );
    }
}
