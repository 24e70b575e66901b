//! Infrastructure layer for the WCP client.
//!
//! - `network`: connection set-up, handshake, the reader task and the typed
//!   command API.

pub mod network;
