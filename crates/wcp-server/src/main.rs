//! WCP server entry point.
//!
//! Loads the TOML configuration, builds the in-memory viewer and the command
//! dispatcher, then either listens for clients (default) or dials a client
//! that is waiting for the viewer to connect (`--initiate`).
//!
//! # Usage
//!
//! ```text
//! wcp-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Config file [env: WCP_CONFIG]
//!   --bind <ADDR>        Listen address [env: WCP_BIND]
//!   --port <PORT>        Listen port [env: WCP_PORT]
//!   --log-level <LEVEL>  Log level when RUST_LOG is unset [env: WCP_LOG_LEVEL]
//!   --load <SOURCE>      Source to load at startup
//!   --initiate <ADDR>    Connect to a waiting client instead of listening
//! ```
//!
//! # Architecture overview
//!
//! ```text
//! main()
//!  └─ ServerConfig        -- file + CLI overrides
//!  └─ InMemoryViewer      -- waveform model, state-change broadcast
//!  └─ Dispatcher          -- command registry + viewer
//!  └─ WcpServer
//!       ├─ serve()        -- accept loop, one Session task per connection
//!       └─ initiate()     -- single outbound Session
//! ```

use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wcp_server::application::dispatch::Dispatcher;
use wcp_server::application::viewer::Viewer;
use wcp_server::infrastructure::network::server::WcpServer;
use wcp_server::infrastructure::storage::config::{self, ServerConfig};
use wcp_server::infrastructure::viewer::InMemoryViewer;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Waveform Control Protocol server backed by an in-memory viewer.
#[derive(Debug, Parser)]
#[command(name = "wcp-server", about = "Waveform Control Protocol server", version)]
struct Cli {
    /// Path to the TOML config file.
    ///
    /// Defaults to `server.toml` in the platform config directory.  A missing
    /// file means built-in defaults.
    #[arg(long, env = "WCP_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on (overrides `server.bind_address`).
    #[arg(long, env = "WCP_BIND")]
    bind: Option<String>,

    /// TCP port to listen on (overrides `server.port`).
    #[arg(long, env = "WCP_PORT")]
    port: Option<u16>,

    /// Log level used when `RUST_LOG` is unset (overrides `server.log_level`).
    #[arg(long, env = "WCP_LOG_LEVEL")]
    log_level: Option<String>,

    /// Source to load at startup (overrides `viewer.initial_source`).
    #[arg(long)]
    load: Option<String>,

    /// Connect to a client listening at this address and serve that one
    /// connection, instead of listening.
    #[arg(long, value_name = "ADDR")]
    initiate: Option<String>,
}

impl Cli {
    /// Reads the config file and applies command-line overrides.
    fn into_config(self) -> anyhow::Result<(ServerConfig, Option<String>)> {
        let mut cfg = match &self.config {
            Some(path) => config::load_config_from(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => config::load_config().context("failed to load config")?,
        };

        if let Some(bind) = self.bind {
            cfg.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            cfg.server.port = port;
        }
        if let Some(level) = self.log_level {
            cfg.server.log_level = level;
        }
        if let Some(source) = self.load {
            cfg.viewer.initial_source = Some(source);
        }

        cfg.validate().context("invalid configuration")?;
        Ok((cfg, self.initiate))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (cfg, initiate) = Cli::parse().into_config()?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.server.log_level)),
        )
        .init();

    info!("WCP server starting");

    // ── Viewer and dispatcher ─────────────────────────────────────────────────
    let viewer = Arc::new(InMemoryViewer::from_config(&cfg.viewer, cfg.server.event_buffer));
    if let Some(source) = &cfg.viewer.initial_source {
        viewer
            .load(source)
            .await
            .with_context(|| format!("failed to load initial source {source:?}"))?;
        info!("loaded {source}");
    }

    let registry = cfg.command_registry().context("invalid command allowlist")?;
    info!("enabled commands: {}", registry.names().join(", "));
    let dispatcher = Arc::new(Dispatcher::new(viewer, registry));
    let server = WcpServer::new(dispatcher, cfg.server.max_frame_bytes);

    // ── Initiate mode ─────────────────────────────────────────────────────────
    if let Some(addr) = initiate {
        let end = server
            .initiate(&addr)
            .await
            .with_context(|| format!("session with {addr} failed"))?;
        info!(?end, "WCP server stopped");
        return Ok(());
    }

    // ── Listen mode ───────────────────────────────────────────────────────────
    let listen_address = cfg.listen_address();
    let listener = WcpServer::bind(&listen_address).await?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            running_clone.store(false, Ordering::Relaxed);
        }
    });

    info!("WCP server ready on {listen_address}.  Press Ctrl-C to exit.");
    server.serve(listener, running).await;

    info!("WCP server stopped");
    Ok(())
}
