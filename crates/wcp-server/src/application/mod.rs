//! Application layer of the WCP server.
//!
//! # What lives here?
//!
//! Everything that decides *what* a message means, with no sockets and no
//! file system access:
//!
//! - **`handshake`** – The per-connection state machine and the version
//!   negotiation performed on the client greeting.
//! - **`dispatch`** – The command registry and the dispatcher that turns a
//!   decoded [`Command`](wcp_core::Command) into a viewer call and a
//!   [`Response`](wcp_core::Response).
//! - **`viewer`** – The [`Viewer`](viewer::Viewer) trait the dispatcher
//!   drives.  The infrastructure layer supplies an implementation; unit tests
//!   supply a mock.

pub mod dispatch;
pub mod handshake;
pub mod viewer;
