//! Protocol module: message types, error payload, version negotiation types
//! and the NUL-delimited JSON codec.

pub mod codec;
pub mod error;
pub mod messages;
pub mod sequence;
pub mod version;

pub use codec::{
    decode_cs_message, decode_sc_message, encode_message, split_frame, FrameBuffer,
    ProtocolError, DEFAULT_MAX_FRAME_BYTES, FRAME_DELIMITER,
};
pub use error::{ErrorKind, WcpError};
pub use messages::*;
pub use sequence::RequestIdCounter;
pub use version::{ProtocolVersion, VersionError, PROTOCOL_VERSION};
