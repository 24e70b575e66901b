//! Viewer implementations.
//!
//! - **`memory`** – [`InMemoryViewer`], a catalogue-backed model of the
//!   viewer state the protocol can observe.  Used by the server binary and
//!   the integration tests.

pub mod memory;

pub use memory::InMemoryViewer;
