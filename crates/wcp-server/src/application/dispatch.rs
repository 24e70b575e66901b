//! Command registry and dispatcher.
//!
//! The dispatcher is the only place that knows which viewer call a command
//! maps to.  It is shared by every session (`Arc<Dispatcher>`) and holds no
//! per-connection state; ordering within a connection comes from the session
//! awaiting each dispatch before reading the next frame.
//!
//! # Registry
//!
//! [`CommandRegistry`] is the ordered set of enabled command kinds.  It is
//! what the server advertises in its greeting, and a command whose kind is
//! not enabled is rejected with `unknown_command` exactly like a tag the
//! protocol does not define.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use wcp_core::{Command, CommandKind, Response, WcpError};

use crate::application::viewer::{SessionId, StateChange, Viewer, ViewerError};

/// An allowlist entry that is not a protocol command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command {0:?} in command allowlist")]
pub struct UnknownCommandName(pub String);

/// Ordered set of enabled command kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRegistry {
    enabled: Vec<CommandKind>,
}

impl CommandRegistry {
    /// Every command the protocol defines.
    pub fn all() -> Self {
        Self {
            enabled: CommandKind::ALL.to_vec(),
        }
    }

    /// Builds a registry from an allowlist of wire names.
    ///
    /// Duplicates are ignored.  The resulting order is the canonical
    /// [`CommandKind::ALL`] order, not the allowlist order.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownCommandName`] for the first name that is not a
    /// protocol command.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, UnknownCommandName> {
        let mut requested = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let kind = CommandKind::try_from(name)
                .map_err(|_| UnknownCommandName(name.to_string()))?;
            requested.push(kind);
        }
        let enabled = CommandKind::ALL
            .into_iter()
            .filter(|kind| requested.contains(kind))
            .collect();
        Ok(Self { enabled })
    }

    pub fn is_enabled(&self, kind: CommandKind) -> bool {
        self.enabled.contains(&kind)
    }

    /// Wire names of the enabled commands, in registry order.
    pub fn names(&self) -> Vec<String> {
        self.enabled.iter().map(|k| k.as_str().to_string()).collect()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::all()
    }
}

/// Routes commands to the viewer.
pub struct Dispatcher {
    viewer: Arc<dyn Viewer>,
    registry: CommandRegistry,
}

impl Dispatcher {
    pub fn new(viewer: Arc<dyn Viewer>, registry: CommandRegistry) -> Self {
        Self { viewer, registry }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Subscribes to viewer state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.viewer.subscribe()
    }

    /// Executes `command` on behalf of `origin` and produces exactly one
    /// response or error.
    ///
    /// # Errors
    ///
    /// - `unknown_command` if the command kind is disabled.
    /// - `invalid_arguments` if a handler precondition fails.
    /// - `resolution_failed` if a name cannot be resolved in the loaded
    ///   waveform.
    pub async fn dispatch(&self, origin: SessionId, command: Command) -> Result<Response, WcpError> {
        let kind = command.kind();
        if !self.registry.is_enabled(kind) {
            debug!(%origin, command = %kind, "rejecting disabled command");
            return Err(WcpError::unknown_command(kind.as_str()));
        }
        debug!(%origin, command = %kind, "dispatching");

        let viewer = &self.viewer;
        let into_wire = |e: ViewerError| e.into_wcp_error(kind);

        match command {
            Command::GetItemList => Ok(Response::GetItemList {
                item_list: viewer.list_items().await,
            }),
            Command::GetItemInfo { ids } => {
                let item_info = viewer.item_info(&ids).await.map_err(into_wire)?;
                Ok(Response::GetItemInfo { item_info })
            }
            Command::SetItemColor { id, color } => {
                if color.trim().is_empty() {
                    return Err(WcpError::invalid_arguments(Some(kind), "color must not be empty"));
                }
                viewer
                    .set_item_color(origin, &id, &color)
                    .await
                    .map_err(into_wire)?;
                Ok(Response::Ack)
            }
            Command::AddVariables { names } => {
                if names.is_empty() {
                    return Ok(Response::AddVariables {
                        added_items: Vec::new(),
                    });
                }
                let added_items = viewer
                    .add_variables(origin, &names)
                    .await
                    .map_err(into_wire)?;
                Ok(Response::AddVariables { added_items })
            }
            Command::AddScope { scope } => {
                if scope.trim().is_empty() {
                    return Err(WcpError::invalid_arguments(Some(kind), "scope must not be empty"));
                }
                let added_items = viewer.add_scope(origin, &scope).await.map_err(into_wire)?;
                Ok(Response::AddScope { added_items })
            }
            Command::Reload => {
                viewer.reload().await.map_err(into_wire)?;
                Ok(Response::Ack)
            }
            Command::SetViewportTo { timestamp } => {
                viewer
                    .set_viewport_to(origin, timestamp)
                    .await
                    .map_err(into_wire)?;
                Ok(Response::Ack)
            }
            Command::RemoveItems { ids } => {
                let removed = viewer.remove_items(origin, &ids).await;
                if removed.len() < ids.len() {
                    debug!(
                        requested = ids.len(),
                        removed = removed.len(),
                        "ignored unknown ids in remove_items"
                    );
                }
                Ok(Response::Ack)
            }
            Command::FocusItem { id } => {
                viewer.focus_item(origin, &id).await.map_err(into_wire)?;
                Ok(Response::Ack)
            }
            Command::Clear => {
                viewer.clear(origin).await;
                Ok(Response::Ack)
            }
            Command::Load { source } => {
                if source.trim().is_empty() {
                    return Err(WcpError::invalid_arguments(Some(kind), "source must not be empty"));
                }
                viewer.load(&source).await.map_err(into_wire)?;
                Ok(Response::Ack)
            }
            Command::ZoomToFit { viewport_idx } => {
                viewer
                    .zoom_to_fit(origin, viewport_idx)
                    .await
                    .map_err(into_wire)?;
                Ok(Response::Ack)
            }
            // The session closes the connection once this ack is written.
            Command::Shutdown => Ok(Response::Ack),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
