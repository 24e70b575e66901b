//! All WCP message types.
//!
//! Every message on the wire is a JSON object whose `"type"` field selects the
//! variant.  The same convention is used at every nesting level: the envelope
//! (`CsMessage` / `ScMessage`), the command inside a `command` envelope, the
//! response inside a `response` envelope, and the event inside an `event`
//! envelope.
//!
//! ```json
//! {"type":"greeting","version":"0.1","commands":[]}
//! {"type":"command","command":{"type":"add_variables","names":["top.clk"]}}
//! {"type":"response","response":{"type":"add_variables","added_items":["1"]}}
//! {"type":"error","error":"not_ready","message":"handshake has not completed"}
//! {"type":"event","event":{"type":"waveforms_loaded","source":"counter.vcd"}}
//! ```
//!
//! # Why closed enums instead of records with optional fields?
//!
//! A record such as `{type, names?, ids?, scope?, ...}` can describe invalid
//! states (an `add_variables` command with no `names`).  Modelling each
//! message family as a Rust enum makes those states unrepresentable: serde
//! rejects a `command` envelope without a `command` payload at decode time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::error::WcpError;
use crate::protocol::version::ProtocolVersion;

/// Client-chosen identifier attached to a command when several logical
/// sessions share one transport.  Echoed by the server on the reply.
pub type RequestId = u64;

// ── Item references ───────────────────────────────────────────────────────────

/// Opaque identifier of one item currently displayed in the viewer.
///
/// Assigned by the server when the item is created.  Clients must not
/// interpret the contents; they only hand the value back in later commands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayedItemRef(pub String);

impl DisplayedItemRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisplayedItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DisplayedItemRef {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DisplayedItemRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Snapshot of a displayed item, returned by `get_item_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub id: DisplayedItemRef,
    /// Name shown in the viewer's item list.
    pub name: String,
    /// Color annotation, if one has been set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Discriminant of a [`Command`], used by the dispatcher registry and the
/// capability list exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    GetItemList,
    GetItemInfo,
    SetItemColor,
    AddVariables,
    AddScope,
    Reload,
    SetViewportTo,
    RemoveItems,
    FocusItem,
    Clear,
    Load,
    ZoomToFit,
    Shutdown,
}

impl CommandKind {
    /// Every command kind, in the order advertised to clients.
    pub const ALL: [CommandKind; 13] = [
        CommandKind::GetItemList,
        CommandKind::GetItemInfo,
        CommandKind::SetItemColor,
        CommandKind::AddVariables,
        CommandKind::AddScope,
        CommandKind::Reload,
        CommandKind::SetViewportTo,
        CommandKind::RemoveItems,
        CommandKind::FocusItem,
        CommandKind::Clear,
        CommandKind::Load,
        CommandKind::ZoomToFit,
        CommandKind::Shutdown,
    ];

    /// The wire tag of this command kind.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::GetItemList => "get_item_list",
            CommandKind::GetItemInfo => "get_item_info",
            CommandKind::SetItemColor => "set_item_color",
            CommandKind::AddVariables => "add_variables",
            CommandKind::AddScope => "add_scope",
            CommandKind::Reload => "reload",
            CommandKind::SetViewportTo => "set_viewport_to",
            CommandKind::RemoveItems => "remove_items",
            CommandKind::FocusItem => "focus_item",
            CommandKind::Clear => "clear",
            CommandKind::Load => "load",
            CommandKind::ZoomToFit => "zoom_to_fit",
            CommandKind::Shutdown => "shutdown",
        }
    }
}

impl TryFrom<&str> for CommandKind {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or(())
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request from the client to query or mutate viewer state.
///
/// Each kind has exactly one matching [`Response`] kind; commands with no
/// data result are answered with [`Response::Ack`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Names of all displayed items, in display order.
    GetItemList,
    /// Info for each id, in the same order.  Fails if any id is unknown.
    GetItemInfo { ids: Vec<DisplayedItemRef> },
    SetItemColor { id: DisplayedItemRef, color: String },
    /// Adds one display item per name.  Duplicates produce separate items.
    AddVariables { names: Vec<String> },
    /// Adds every variable directly inside `scope`.
    AddScope { scope: String },
    /// Reloads the current waveform.  Completion is reported as an event.
    Reload,
    /// Centres the primary viewport on `timestamp` without changing zoom.
    SetViewportTo { timestamp: u64 },
    /// Removes the given items.  Unknown ids are ignored.
    RemoveItems { ids: Vec<DisplayedItemRef> },
    FocusItem { id: DisplayedItemRef },
    /// Removes every displayed item.
    Clear,
    /// Loads a waveform.  Acknowledged immediately; a `waveforms_loaded`
    /// event follows once loading completes.
    Load { source: String },
    ZoomToFit { viewport_idx: usize },
    /// Closes this connection after the acknowledgement is sent.
    Shutdown,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::GetItemList => CommandKind::GetItemList,
            Command::GetItemInfo { .. } => CommandKind::GetItemInfo,
            Command::SetItemColor { .. } => CommandKind::SetItemColor,
            Command::AddVariables { .. } => CommandKind::AddVariables,
            Command::AddScope { .. } => CommandKind::AddScope,
            Command::Reload => CommandKind::Reload,
            Command::SetViewportTo { .. } => CommandKind::SetViewportTo,
            Command::RemoveItems { .. } => CommandKind::RemoveItems,
            Command::FocusItem { .. } => CommandKind::FocusItem,
            Command::Clear => CommandKind::Clear,
            Command::Load { .. } => CommandKind::Load,
            Command::ZoomToFit { .. } => CommandKind::ZoomToFit,
            Command::Shutdown => CommandKind::Shutdown,
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Successful result of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    GetItemList { item_list: Vec<String> },
    GetItemInfo { item_info: Vec<ItemInfo> },
    /// One reference per requested name, in request order.
    AddVariables { added_items: Vec<DisplayedItemRef> },
    AddScope { added_items: Vec<DisplayedItemRef> },
    Ack,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Unsolicited notification of a viewer state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    WaveformsLoaded { source: String },
    ItemsAdded { ids: Vec<DisplayedItemRef> },
    ItemsRemoved { ids: Vec<DisplayedItemRef> },
    /// Color or focus of an item changed.
    ItemUpdated { id: DisplayedItemRef },
    ViewportChanged { viewport_idx: usize },
}

impl Event {
    /// Short variant name for log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Event::WaveformsLoaded { .. } => "waveforms_loaded",
            Event::ItemsAdded { .. } => "items_added",
            Event::ItemsRemoved { .. } => "items_removed",
            Event::ItemUpdated { .. } => "item_updated",
            Event::ViewportChanged { .. } => "viewport_changed",
        }
    }
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// A message travelling client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CsMessage {
    /// Opens the session.  `commands` lists the command names the client
    /// intends to use; the server does not require it.
    Greeting {
        version: String,
        #[serde(default)]
        commands: Vec<String>,
    },
    Command {
        command: Command,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
    },
}

impl CsMessage {
    pub fn greeting(version: ProtocolVersion, commands: Vec<String>) -> Self {
        Self::Greeting {
            version: version.to_string(),
            commands,
        }
    }

    pub fn command(command: Command) -> Self {
        Self::Command { command, id: None }
    }

    pub fn command_with_id(command: Command, id: RequestId) -> Self {
        Self::Command {
            command,
            id: Some(id),
        }
    }
}

/// A message travelling server → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScMessage {
    /// Reply to the client greeting: the version the server will honour for
    /// the whole session and the commands its dispatcher accepts.
    Greeting {
        version: String,
        commands: Vec<String>,
    },
    Response {
        response: Response,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
    },
    /// The single error shape of the protocol; see [`WcpError`].
    Error(WcpError),
    Event { event: Event },
}

impl ScMessage {
    pub fn greeting(version: ProtocolVersion, commands: Vec<String>) -> Self {
        Self::Greeting {
            version: version.to_string(),
            commands,
        }
    }

    pub fn response(response: Response, id: Option<RequestId>) -> Self {
        Self::Response { response, id }
    }

    pub fn event(event: Event) -> Self {
        Self::Event { event }
    }

    /// Returns the request id echoed on a `response` or `error`.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ScMessage::Response { id, .. } => *id,
            ScMessage::Error(err) => err.id,
            ScMessage::Greeting { .. } | ScMessage::Event { .. } => None,
        }
    }

    /// `true` for the message kinds that answer an outstanding request.
    pub fn is_reply(&self) -> bool {
        !matches!(self, ScMessage::Event { .. })
    }
}

impl From<WcpError> for ScMessage {
    fn from(err: WcpError) -> Self {
        ScMessage::Error(err)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
