//! Application layer for the WCP client.
//!
//! Contains the transport-independent part of the client: matching each
//! incoming reply to the call that is waiting for it.

pub mod correlator;
