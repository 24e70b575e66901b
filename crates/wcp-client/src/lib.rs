//! wcp-client library entry point.
//!
//! Re-exports the module tree shared by the `wcp-client` binary and the
//! integration tests in `tests/`.
//!
//! A WCP client opens a byte stream to a waveform viewer, exchanges
//! greetings, and then issues commands.  Replies come back in order on the
//! same stream, interleaved with unsolicited `event` messages.  The client
//! separates the two: replies complete the call that is waiting for them
//! (see [`application::correlator`]) and events go to an event channel the
//! caller reads at its own pace.

/// Application layer: reply correlation.
pub mod application;

/// Infrastructure layer: the connection to the server.
pub mod infrastructure;

pub use infrastructure::network::{ClientConfig, ClientError, WcpClient};
