//! WCP command-line client.
//!
//! Connects to a WCP server, performs the handshake, runs one command and
//! prints the result.  `watch` instead prints server events until the
//! connection closes or Ctrl-C is pressed.
//!
//! # Usage
//!
//! ```text
//! wcp-client [OPTIONS] <COMMAND>
//!
//! Commands:
//!   list          Names of the displayed items
//!   info          Name and colour of displayed items
//!   add           Add variables by full name
//!   add-scope     Add every variable directly inside a scope
//!   remove        Remove displayed items
//!   color         Set an item's colour
//!   focus         Focus an item
//!   clear         Remove every displayed item
//!   load          Load a waveform source
//!   reload        Reload the current waveform
//!   goto          Centre the primary viewport on a timestamp
//!   zoom-to-fit   Fit a viewport to the whole waveform
//!   watch         Print events as they arrive
//!   shutdown      Ask the server to close this connection
//!
//! Options:
//!   --server <ADDR>       Server address [env: WCP_SERVER] [default: 127.0.0.1:54321]
//!   --multiplex           Tag commands with request ids
//!   --timeout-ms <MS>     Per-command timeout [env: WCP_TIMEOUT_MS]
//!   --json                Print results as JSON
//! ```

use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use wcp_client::{ClientConfig, WcpClient};
use wcp_core::DisplayedItemRef;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Waveform Control Protocol client.
#[derive(Debug, Parser)]
#[command(name = "wcp-client", about = "Send commands to a WCP waveform viewer", version)]
struct Cli {
    /// `host:port` of the WCP server.
    #[arg(long, default_value = "127.0.0.1:54321", env = "WCP_SERVER")]
    server: String,

    /// Tag every command with a request id and match replies by id.
    #[arg(long)]
    multiplex: bool,

    /// Give up on a command after this many milliseconds.
    #[arg(long, env = "WCP_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Print results as JSON instead of plain text.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Names of the displayed items, in display order.
    List,
    /// Name and colour of the given items.
    Info { ids: Vec<String> },
    /// Add variables by full hierarchical name.
    Add { names: Vec<String> },
    /// Add every variable directly inside a scope.
    AddScope { scope: String },
    /// Remove displayed items.  Unknown ids are ignored.
    Remove { ids: Vec<String> },
    /// Set an item's colour.
    Color { id: String, color: String },
    /// Focus an item.
    Focus { id: String },
    /// Remove every displayed item.
    Clear,
    /// Load a waveform source.
    Load { source: String },
    /// Reload the current waveform.
    Reload,
    /// Centre the primary viewport on a timestamp.
    Goto { timestamp: u64 },
    /// Fit a viewport to the whole waveform.
    ZoomToFit {
        #[arg(default_value_t = 0)]
        viewport: usize,
    },
    /// Print events until the connection closes or Ctrl-C is pressed.
    Watch,
    /// Ask the server to close this connection.
    Shutdown,
}

impl Cli {
    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server_addr: self.server.clone(),
            multiplex: self.multiplex,
            timeout: self.timeout_ms.map(Duration::from_millis),
            ..Default::default()
        }
    }
}

fn refs(ids: Vec<String>) -> Vec<DisplayedItemRef> {
    ids.into_iter().map(DisplayedItemRef::from).collect()
}

/// Prints `value` as JSON, or each line of `lines` as text.
fn print<T: serde::Serialize>(json: bool, value: &T, lines: Vec<String>) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value).context("failed to serialise result")?);
    } else {
        for line in lines {
            println!("{line}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Level is overridden by `RUST_LOG`.  Logs go to stderr so stdout stays
    // clean for results.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.client_config();
    let (client, mut events) = WcpClient::connect(config)
        .await
        .with_context(|| format!("failed to open a WCP session with {}", cli.server))?;
    info!(version = %client.server().version, "session ready");

    let json = cli.json;
    match cli.command {
        Cmd::List => {
            let items = client.get_item_list().await.context("get_item_list failed")?;
            print(json, &items, items.clone())?;
        }
        Cmd::Info { ids } => {
            let infos = client.get_item_info(refs(ids)).await.context("get_item_info failed")?;
            let lines = infos
                .iter()
                .map(|i| match &i.color {
                    Some(color) => format!("{}\t{}\t{color}", i.id, i.name),
                    None => format!("{}\t{}", i.id, i.name),
                })
                .collect();
            print(json, &infos, lines)?;
        }
        Cmd::Add { names } => {
            let added = client.add_variables(names).await.context("add_variables failed")?;
            let lines = added.iter().map(ToString::to_string).collect();
            print(json, &added, lines)?;
        }
        Cmd::AddScope { scope } => {
            let added = client.add_scope(scope).await.context("add_scope failed")?;
            let lines = added.iter().map(ToString::to_string).collect();
            print(json, &added, lines)?;
        }
        Cmd::Remove { ids } => client.remove_items(refs(ids)).await.context("remove_items failed")?,
        Cmd::Color { id, color } => client
            .set_item_color(DisplayedItemRef::from(id), color)
            .await
            .context("set_item_color failed")?,
        Cmd::Focus { id } => client
            .focus_item(DisplayedItemRef::from(id))
            .await
            .context("focus_item failed")?,
        Cmd::Clear => client.clear().await.context("clear failed")?,
        Cmd::Load { source } => client.load(source).await.context("load failed")?,
        Cmd::Reload => client.reload().await.context("reload failed")?,
        Cmd::Goto { timestamp } => client
            .set_viewport_to(timestamp)
            .await
            .context("set_viewport_to failed")?,
        Cmd::ZoomToFit { viewport } => client
            .zoom_to_fit(viewport)
            .await
            .context("zoom_to_fit failed")?,
        Cmd::Watch => loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        let line = serde_json::to_string(&event).context("failed to serialise event")?;
                        println!("{line}");
                    }
                    None => {
                        info!("connection closed");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }
            }
        },
        Cmd::Shutdown => client.shutdown().await.context("shutdown failed")?,
    }

    client.close().await.ok();
    Ok(())
}
