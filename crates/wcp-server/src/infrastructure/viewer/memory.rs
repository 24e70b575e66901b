//! In-memory viewer model.
//!
//! Stands in for a real waveform viewer.  It keeps only what the protocol can
//! observe: which source is loaded and which variables it contains, the
//! ordered list of displayed items, the focused item, and per-viewport
//! position.  Waveform data itself is never parsed; a "source" is a name in
//! the configured catalogue together with its variable paths.
//!
//! # Concurrency
//!
//! All state sits behind one `tokio::sync::Mutex`.  Every trait method takes
//! the lock once, performs its whole mutation, publishes its state change,
//! and releases the lock.  Two sessions adding variables at the same time
//! therefore never interleave their items, and events leave the viewer in
//! the order the mutations happened.
//!
//! # Item ids
//!
//! Ids come from a counter that only ever increases.  Removing an item never
//! frees its id, so a stale id held by a client can never start referring to
//! a different item.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use wcp_core::{DisplayedItemRef, Event, ItemInfo};

use crate::application::viewer::{SessionId, StateChange, Viewer, ViewerError};
use crate::infrastructure::storage::config::{SourceEntry, ViewerConfig};

/// Default capacity of the state-change broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct DisplayedItem {
    id: DisplayedItemRef,
    name: String,
    color: Option<String>,
}

#[derive(Debug)]
struct LoadedWaveform {
    source: String,
    variables: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Viewport {
    centre: Option<u64>,
    fitted: bool,
}

#[derive(Debug)]
struct ViewerState {
    loaded: Option<LoadedWaveform>,
    items: Vec<DisplayedItem>,
    focused: Option<DisplayedItemRef>,
    viewports: Vec<Viewport>,
    next_id: u64,
}

impl ViewerState {
    fn allocate_id(&mut self) -> DisplayedItemRef {
        let id = DisplayedItemRef::new(self.next_id.to_string());
        self.next_id += 1;
        id
    }

    fn push_items<'a>(&mut self, names: impl IntoIterator<Item = &'a String>) -> Vec<DisplayedItemRef> {
        let mut added = Vec::new();
        for name in names {
            let id = self.allocate_id();
            self.items.push(DisplayedItem {
                id: id.clone(),
                name: name.clone(),
                color: None,
            });
            added.push(id);
        }
        added
    }

    fn find_mut(&mut self, id: &DisplayedItemRef) -> Result<&mut DisplayedItem, ViewerError> {
        self.items
            .iter_mut()
            .find(|item| &item.id == id)
            .ok_or_else(|| ViewerError::UnknownItem(id.clone()))
    }

    fn remove_all(&mut self) -> Vec<DisplayedItemRef> {
        self.focused = None;
        self.items.drain(..).map(|item| item.id).collect()
    }

    fn viewport_mut(&mut self, index: usize) -> Result<&mut Viewport, ViewerError> {
        let count = self.viewports.len();
        self.viewports
            .get_mut(index)
            .ok_or(ViewerError::ViewportOutOfRange { index, count })
    }
}

/// [`Viewer`] implementation holding all state in memory.
pub struct InMemoryViewer {
    state: Mutex<ViewerState>,
    catalogue: HashMap<String, Vec<String>>,
    changes: broadcast::Sender<StateChange>,
}

impl InMemoryViewer {
    /// Creates a viewer with `viewports` viewports (at least one) that can
    /// load any of `sources`.  Nothing is loaded initially.
    pub fn new(sources: Vec<SourceEntry>, viewports: usize, event_buffer: usize) -> Self {
        let (changes, _) = broadcast::channel(event_buffer.max(1));
        let catalogue = sources
            .into_iter()
            .map(|s| (s.name, s.variables))
            .collect();
        Self {
            state: Mutex::new(ViewerState {
                loaded: None,
                items: Vec::new(),
                focused: None,
                viewports: vec![Viewport::default(); viewports.max(1)],
                next_id: 0,
            }),
            catalogue,
            changes,
        }
    }

    pub fn from_config(config: &ViewerConfig, event_buffer: usize) -> Self {
        Self::new(config.sources.clone(), config.viewports, event_buffer)
    }

    /// Name of the loaded source, if any.
    pub async fn loaded_source(&self) -> Option<String> {
        self.state.lock().await.loaded.as_ref().map(|w| w.source.clone())
    }

    /// Currently focused item, if any.
    pub async fn focused_item(&self) -> Option<DisplayedItemRef> {
        self.state.lock().await.focused.clone()
    }

    /// Centre timestamp of viewport `index`, if one was set.
    pub async fn viewport_centre(&self, index: usize) -> Option<u64> {
        self.state
            .lock()
            .await
            .viewports
            .get(index)
            .and_then(|v| v.centre)
    }

    fn publish(&self, change: StateChange) {
        debug!(event = change.event.name(), origin = ?change.origin, "state change");
        // No subscribers is not an error: nobody is connected.
        let _ = self.changes.send(change);
    }

    fn variables_of(&self, source: &str) -> Result<Vec<String>, ViewerError> {
        self.catalogue
            .get(source)
            .cloned()
            .ok_or_else(|| ViewerError::UnknownSource(source.to_string()))
    }
}

/// `true` if `path` is a variable directly inside `scope`.
fn is_direct_child(scope: &str, path: &str) -> bool {
    path.strip_prefix(scope)
        .and_then(|rest| rest.strip_prefix('.'))
        .is_some_and(|leaf| !leaf.is_empty() && !leaf.contains('.'))
}

/// `true` if `scope` names a hierarchy level of `path` (at any depth).
fn is_within(scope: &str, path: &str) -> bool {
    path.strip_prefix(scope)
        .is_some_and(|rest| rest.starts_with('.'))
}

#[async_trait]
impl Viewer for InMemoryViewer {
    async fn list_items(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.items.iter().map(|item| item.name.clone()).collect()
    }

    async fn item_info(&self, ids: &[DisplayedItemRef]) -> Result<Vec<ItemInfo>, ViewerError> {
        let state = self.state.lock().await;
        ids.iter()
            .map(|id| {
                state
                    .items
                    .iter()
                    .find(|item| &item.id == id)
                    .map(|item| ItemInfo {
                        id: item.id.clone(),
                        name: item.name.clone(),
                        color: item.color.clone(),
                    })
                    .ok_or_else(|| ViewerError::UnknownItem(id.clone()))
            })
            .collect()
    }

    async fn add_variables(
        &self,
        origin: SessionId,
        names: &[String],
    ) -> Result<Vec<DisplayedItemRef>, ViewerError> {
        let mut state = self.state.lock().await;
        let waveform = state.loaded.as_ref().ok_or(ViewerError::NoWaveformLoaded)?;

        let unresolved: Vec<String> = names
            .iter()
            .filter(|name| !waveform.variables.contains(name))
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            return Err(ViewerError::UnresolvedVariables(unresolved));
        }

        let added = state.push_items(names);
        if !added.is_empty() {
            self.publish(StateChange::caused_by(
                origin,
                Event::ItemsAdded { ids: added.clone() },
            ));
        }
        Ok(added)
    }

    async fn add_scope(
        &self,
        origin: SessionId,
        scope: &str,
    ) -> Result<Vec<DisplayedItemRef>, ViewerError> {
        let mut state = self.state.lock().await;
        let waveform = state.loaded.as_ref().ok_or(ViewerError::NoWaveformLoaded)?;

        if !waveform.variables.iter().any(|v| is_within(scope, v)) {
            return Err(ViewerError::UnknownScope(scope.to_string()));
        }
        let children: Vec<String> = waveform
            .variables
            .iter()
            .filter(|v| is_direct_child(scope, v))
            .cloned()
            .collect();

        let added = state.push_items(&children);
        if !added.is_empty() {
            self.publish(StateChange::caused_by(
                origin,
                Event::ItemsAdded { ids: added.clone() },
            ));
        }
        Ok(added)
    }

    async fn remove_items(
        &self,
        origin: SessionId,
        ids: &[DisplayedItemRef],
    ) -> Vec<DisplayedItemRef> {
        let mut state = self.state.lock().await;
        let mut removed = Vec::new();
        state.items.retain(|item| {
            if ids.contains(&item.id) {
                removed.push(item.id.clone());
                false
            } else {
                true
            }
        });
        if state.focused.as_ref().is_some_and(|f| removed.contains(f)) {
            state.focused = None;
        }
        if !removed.is_empty() {
            self.publish(StateChange::caused_by(
                origin,
                Event::ItemsRemoved {
                    ids: removed.clone(),
                },
            ));
        }
        removed
    }

    async fn set_item_color(
        &self,
        origin: SessionId,
        id: &DisplayedItemRef,
        color: &str,
    ) -> Result<(), ViewerError> {
        let mut state = self.state.lock().await;
        state.find_mut(id)?.color = Some(color.to_string());
        self.publish(StateChange::caused_by(
            origin,
            Event::ItemUpdated { id: id.clone() },
        ));
        Ok(())
    }

    async fn focus_item(
        &self,
        origin: SessionId,
        id: &DisplayedItemRef,
    ) -> Result<(), ViewerError> {
        let mut state = self.state.lock().await;
        state.find_mut(id)?;
        state.focused = Some(id.clone());
        self.publish(StateChange::caused_by(
            origin,
            Event::ItemUpdated { id: id.clone() },
        ));
        Ok(())
    }

    async fn clear(&self, origin: SessionId) {
        let mut state = self.state.lock().await;
        let removed = state.remove_all();
        if !removed.is_empty() {
            self.publish(StateChange::caused_by(
                origin,
                Event::ItemsRemoved { ids: removed },
            ));
        }
    }

    async fn load(&self, source: &str) -> Result<(), ViewerError> {
        let variables = self.variables_of(source)?;
        let mut state = self.state.lock().await;

        state.remove_all();
        state.loaded = Some(LoadedWaveform {
            source: source.to_string(),
            variables,
        });
        for viewport in &mut state.viewports {
            *viewport = Viewport::default();
        }
        info!(source, "waveform loaded");

        self.publish(StateChange::internal(Event::WaveformsLoaded {
            source: source.to_string(),
        }));
        Ok(())
    }

    async fn reload(&self) -> Result<(), ViewerError> {
        let mut state = self.state.lock().await;
        let source = state
            .loaded
            .as_ref()
            .map(|w| w.source.clone())
            .ok_or(ViewerError::NoWaveformLoaded)?;
        let variables = self.variables_of(&source)?;

        state.loaded = Some(LoadedWaveform {
            source: source.clone(),
            variables,
        });
        info!(source = %source, "waveform reloaded");

        self.publish(StateChange::internal(Event::WaveformsLoaded { source }));
        Ok(())
    }

    async fn set_viewport_to(&self, origin: SessionId, timestamp: u64) -> Result<(), ViewerError> {
        let mut state = self.state.lock().await;
        let viewport = state.viewport_mut(0)?;
        viewport.centre = Some(timestamp);
        viewport.fitted = false;
        self.publish(StateChange::caused_by(
            origin,
            Event::ViewportChanged { viewport_idx: 0 },
        ));
        Ok(())
    }

    async fn zoom_to_fit(&self, origin: SessionId, viewport_idx: usize) -> Result<(), ViewerError> {
        let mut state = self.state.lock().await;
        let viewport = state.viewport_mut(viewport_idx)?;
        viewport.fitted = true;
        viewport.centre = None;
        self.publish(StateChange::caused_by(
            origin,
            Event::ViewportChanged { viewport_idx },
        ));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
