//! TCP transport: accept loop and initiate mode.
//!
//! In the default mode the server binds a listener and serves each accepted
//! connection in its own Tokio task, so one slow client never delays another.
//! In initiate mode it dials a client that is already listening and serves
//! that single connection; this is how an editor can start the viewer and
//! wait for it to call back.
//!
//! Shutdown is driven by a shared `AtomicBool` (cleared by the Ctrl-C handler
//! in `main.rs`).  The accept loop uses a short timeout on `accept()` so it
//! notices the flag even when nobody is connecting.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::application::dispatch::Dispatcher;
use crate::infrastructure::network::session::{Session, SessionEnd};
use crate::infrastructure::network::ServerError;

/// How often the accept loop re-checks the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Serves WCP connections over TCP.
pub struct WcpServer {
    dispatcher: Arc<Dispatcher>,
    max_frame_bytes: usize,
}

impl WcpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, max_frame_bytes: usize) -> Self {
        Self {
            dispatcher,
            max_frame_bytes,
        }
    }

    /// Binds a listener on `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address is in use or invalid.
    pub async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })
    }

    /// Accepts connections on `listener` until `running` is cleared.
    ///
    /// Sessions already in progress keep running after the loop exits; they
    /// end when their peer disconnects or the runtime shuts down.
    pub async fn serve(&self, listener: TcpListener, running: Arc<AtomicBool>) {
        match listener.local_addr() {
            Ok(addr) => info!("WCP server listening on {addr}"),
            Err(e) => warn!("WCP server listening (local address unavailable: {e})"),
        }

        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    info!("new connection from {peer_addr}");
                    self.spawn_session(stream, peer_addr);
                }
                Ok(Err(e)) => {
                    // Transient accept failures (e.g. too many open files)
                    // must not take the server down.
                    error!("accept error: {e}");
                }
                Err(_) => {}
            }
        }
    }

    /// Connects to a client listening on `addr` and serves that one
    /// connection to completion.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Connect`] if the client cannot be reached, or
    /// the session's error if the connection fails.
    pub async fn initiate(&self, addr: &str) -> Result<SessionEnd, ServerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ServerError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        info!("connected to waiting client at {addr}");
        configure(&stream);

        let session = Session::new(Arc::clone(&self.dispatcher));
        session.run(stream, self.max_frame_bytes).await
    }

    fn spawn_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        configure(&stream);
        let session = Session::new(Arc::clone(&self.dispatcher));
        let session_id = session.id();
        let max_frame_bytes = self.max_frame_bytes;

        tokio::spawn(async move {
            match session.run(stream, max_frame_bytes).await {
                Ok(end) => info!(session = %session_id, ?end, "connection {peer_addr} closed"),
                Err(e) => warn!(session = %session_id, "connection {peer_addr} closed with error: {e}"),
            }
        });
    }
}

/// Replies are small and latency-bound; disable Nagle.
fn configure(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }
}
