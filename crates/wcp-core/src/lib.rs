//! # wcp-core
//!
//! Shared library for the Waveform Control Protocol (WCP): the message
//! envelope, the structured error payload, protocol version handling and the
//! wire codec.
//!
//! This crate is used by both the server (embedded in a waveform viewer) and
//! the client.  It has no dependency on sockets, async runtimes or viewer
//! internals.
//!
//! # Architecture overview
//!
//! WCP lets an external program (an editor plugin, a test harness, a script)
//! drive a running waveform viewer: add signals to the display, move the
//! viewport, load a new dump file, and hear about changes the user makes.
//!
//! - **`protocol::messages`** – The typed message families.  Every message is
//!   a JSON object tagged by a `type` field.
//! - **`protocol::error`** – The one error shape every failure is reported in.
//! - **`protocol::version`** – `major.minor` versions and the compatibility
//!   rule used during the handshake.
//! - **`protocol::codec`** – Framing (one JSON object per NUL-terminated
//!   frame) and the two-stage decoder that tells unknown commands apart from
//!   bad arguments.

pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `wcp_core::CsMessage` instead of `wcp_core::protocol::messages::CsMessage`.
pub use protocol::codec::{decode_cs_message, decode_sc_message, encode_message, ProtocolError};
pub use protocol::error::{ErrorKind, WcpError};
pub use protocol::messages::{
    Command, CommandKind, CsMessage, DisplayedItemRef, Event, ItemInfo, RequestId, Response,
    ScMessage,
};
pub use protocol::version::{ProtocolVersion, PROTOCOL_VERSION};
