//! The viewer interface driven by the command dispatcher.
//!
//! The protocol layer never touches waveform data directly.  Every command
//! handler calls one method on [`Viewer`], and every state change the viewer
//! makes is published as a [`StateChange`] on a broadcast channel that each
//! connected session subscribes to.
//!
//! Mutating methods take the [`SessionId`] of the connection that asked for
//! the change.  The id travels with the resulting event so a session can skip
//! events it caused itself.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use wcp_core::{CommandKind, DisplayedItemRef, Event, ItemInfo, WcpError};

#[cfg(test)]
use mockall::automock;

/// Identifies one client connection for the lifetime of that connection.
pub type SessionId = Uuid;

/// A viewer state change, tagged with the session whose command caused it.
///
/// `origin` is `None` for changes that come from the viewer itself, such as
/// a waveform finishing loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub origin: Option<SessionId>,
    pub event: Event,
}

impl StateChange {
    pub fn caused_by(origin: SessionId, event: Event) -> Self {
        Self {
            origin: Some(origin),
            event,
        }
    }

    pub fn internal(event: Event) -> Self {
        Self {
            origin: None,
            event,
        }
    }

    /// `true` if this change should be delivered to `session`.
    pub fn is_visible_to(&self, session: SessionId) -> bool {
        self.origin != Some(session)
    }
}

/// Failures reported by a [`Viewer`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewerError {
    #[error("no waveform is loaded")]
    NoWaveformLoaded,

    #[error("{} variable(s) could not be resolved", .0.len())]
    UnresolvedVariables(Vec<String>),

    #[error("scope {0:?} does not exist in the loaded waveform")]
    UnknownScope(String),

    #[error("no displayed item with id {0}")]
    UnknownItem(DisplayedItemRef),

    #[error("unknown waveform source {0:?}")]
    UnknownSource(String),

    #[error("viewport index {index} is out of range ({count} viewport(s))")]
    ViewportOutOfRange { index: usize, count: usize },
}

impl ViewerError {
    /// Converts this failure into the wire error for `command`.
    pub fn into_wcp_error(self, command: CommandKind) -> WcpError {
        let message = format!("{command}: {self}");
        match self {
            ViewerError::NoWaveformLoaded => WcpError::resolution_failed(message, Vec::new()),
            ViewerError::UnresolvedVariables(names) => WcpError::resolution_failed(message, names),
            ViewerError::UnknownScope(scope) => WcpError::resolution_failed(message, vec![scope]),
            ViewerError::UnknownItem(id) => {
                WcpError::invalid_arguments(Some(command), format!("no displayed item with id {id}"))
                    .with_arguments(vec![id.to_string()])
            }
            ViewerError::UnknownSource(source) => {
                WcpError::invalid_arguments(Some(command), format!("unknown source {source:?}"))
                    .with_arguments(vec![source])
            }
            ViewerError::ViewportOutOfRange { index, count } => WcpError::invalid_arguments(
                Some(command),
                format!("viewport index {index} is out of range ({count} viewport(s))"),
            )
            .with_arguments(vec![index.to_string()]),
        }
    }
}

/// Operations the dispatcher needs from a waveform viewer.
///
/// Implementations must apply each call atomically: two concurrent
/// `add_variables` calls never interleave their items.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Viewer: Send + Sync {
    /// Display names of all displayed items, in display order.
    async fn list_items(&self) -> Vec<String>;

    /// Info for each id, in the same order.  Fails on the first unknown id.
    async fn item_info(&self, ids: &[DisplayedItemRef]) -> Result<Vec<ItemInfo>, ViewerError>;

    /// Adds one displayed item per name.  Either every name resolves and all
    /// items are added, or nothing changes.
    async fn add_variables(
        &self,
        origin: SessionId,
        names: &[String],
    ) -> Result<Vec<DisplayedItemRef>, ViewerError>;

    /// Adds every variable directly inside `scope`.
    async fn add_scope(
        &self,
        origin: SessionId,
        scope: &str,
    ) -> Result<Vec<DisplayedItemRef>, ViewerError>;

    /// Removes the given items and returns the ids actually removed.
    /// Unknown ids are ignored.
    async fn remove_items(
        &self,
        origin: SessionId,
        ids: &[DisplayedItemRef],
    ) -> Vec<DisplayedItemRef>;

    async fn set_item_color(
        &self,
        origin: SessionId,
        id: &DisplayedItemRef,
        color: &str,
    ) -> Result<(), ViewerError>;

    async fn focus_item(&self, origin: SessionId, id: &DisplayedItemRef)
        -> Result<(), ViewerError>;

    /// Removes every displayed item.
    async fn clear(&self, origin: SessionId);

    /// Replaces the loaded waveform.  Completion is published as
    /// `waveforms_loaded` with no origin, so every session hears about it.
    async fn load(&self, source: &str) -> Result<(), ViewerError>;

    /// Reloads the current waveform, keeping displayed items.
    async fn reload(&self) -> Result<(), ViewerError>;

    /// Centres the primary viewport on `timestamp`.
    async fn set_viewport_to(&self, origin: SessionId, timestamp: u64)
        -> Result<(), ViewerError>;

    async fn zoom_to_fit(&self, origin: SessionId, viewport_idx: usize)
        -> Result<(), ViewerError>;

    /// Registers for state-change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StateChange>;
}
