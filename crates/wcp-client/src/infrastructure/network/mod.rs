//! Client connection to a WCP server.
//!
//! Architecture:
//! - [`WcpClient::connect`] opens a TCP stream; [`WcpClient::handshake`] takes
//!   any duplex byte stream, exchanges greetings and then splits it.
//! - A reader task owns the read half.  Replies are handed to the
//!   [`Correlator`]; events are forwarded on an `mpsc` channel.
//! - Callers share the write half behind a `Mutex`.  A call registers with
//!   the correlator while holding that lock, so registration order always
//!   equals wire order.
//! - A reply frame that cannot be decoded fails the call it answers with
//!   [`ClientError::MalformedReply`]; a bad event frame is logged and
//!   skipped.
//! - When the reader sees EOF or a transport error it fails every pending
//!   call with `connection_closed` and drops the event sender.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wcp_core::protocol::{FrameBuffer, RequestIdCounter, DEFAULT_MAX_FRAME_BYTES};
use wcp_core::{
    decode_sc_message, encode_message, Command, CommandKind, CsMessage, DisplayedItemRef,
    ErrorKind, Event, ItemInfo, ProtocolError, ProtocolVersion, Response, ScMessage, WcpError,
    PROTOCOL_VERSION,
};

use crate::application::correlator::{CallFailure, Correlator, Reply};

/// Size of a single socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Errors returned by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// TCP connection to the server failed.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// An I/O error occurred on the established connection.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The server answered with an `error` message, or the connection closed
    /// while the call was pending (`connection_closed`).
    #[error("{0}")]
    Remote(WcpError),
    /// The server's first message was not a greeting.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The reply to this call arrived but could not be decoded.
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    /// The server replied with a response of the wrong kind.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: CommandKind, reply: String },
    /// No reply arrived within the allotted time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

impl ClientError {
    /// The protocol error kind, for errors that carry one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Remote(err) => Some(err.kind()),
            _ => None,
        }
    }
}

impl From<WcpError> for ClientError {
    fn from(err: WcpError) -> Self {
        ClientError::Remote(err)
    }
}

impl From<CallFailure> for ClientError {
    fn from(failure: CallFailure) -> Self {
        match failure {
            CallFailure::Remote(err) => ClientError::Remote(err),
            CallFailure::Malformed(reason) => ClientError::MalformedReply(reason),
        }
    }
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub server_addr: String,
    /// Version announced in the greeting.
    pub version: ProtocolVersion,
    /// Tag every command with a request id and correlate replies by id.
    pub multiplex: bool,
    /// Per-call timeout applied by the typed helpers.  `None` waits forever.
    pub timeout: Option<Duration>,
    /// Capacity of the event channel.  Events beyond it are dropped.
    pub event_buffer: usize,
    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:54321".to_string(),
            version: PROTOCOL_VERSION,
            multiplex: false,
            timeout: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Outcome of the greeting exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Version the server speaks for this session.
    pub version: String,
    /// Commands the server accepts, in its order.
    pub commands: Vec<String>,
}

impl ServerInfo {
    pub fn supports(&self, kind: CommandKind) -> bool {
        self.commands.iter().any(|c| c == kind.as_str())
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected, greeted WCP client.
///
/// Cheap to share behind an `Arc`; concurrent calls are allowed and each
/// receives its own reply.
pub struct WcpClient {
    writer: Mutex<Writer>,
    correlator: Arc<Mutex<Correlator>>,
    ids: RequestIdCounter,
    config: ClientConfig,
    server: ServerInfo,
    reader: JoinHandle<()>,
}

impl WcpClient {
    /// Connects over TCP to `config.server_addr` and performs the handshake.
    ///
    /// Returns the client and the receiver of server events.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connect`] if the server is unreachable, otherwise see
    /// [`handshake`](Self::handshake).
    pub async fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<Event>), ClientError> {
        let stream = TcpStream::connect(&config.server_addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: config.server_addr.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }
        info!("connected to {}", config.server_addr);
        Self::handshake(stream, config).await
    }

    /// Greets the server on `stream` and starts the reader task.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Remote`] if the server rejects the greeting (for
    ///   example `version_mismatch`).
    /// - [`ClientError::Handshake`] if the server closes the stream or sends
    ///   anything other than a greeting first.
    /// - [`ClientError::Io`] / [`ClientError::Protocol`] on transport faults.
    pub async fn handshake<S>(
        stream: S,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::Receiver<Event>), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut frames = FrameBuffer::new(config.max_frame_bytes);

        let commands = CommandKind::ALL.iter().map(|k| k.to_string()).collect();
        writer
            .write_all(&encode_message(&CsMessage::greeting(config.version, commands))?)
            .await?;

        let server = match read_message(&mut reader, &mut frames).await? {
            Some(ScMessage::Greeting { version, commands }) => ServerInfo { version, commands },
            Some(ScMessage::Error(err)) => return Err(ClientError::Remote(err)),
            Some(other) => {
                return Err(ClientError::Handshake(format!(
                    "expected greeting, got {other:?}"
                )))
            }
            None => {
                return Err(ClientError::Handshake(
                    "server closed the connection during the handshake".into(),
                ))
            }
        };
        info!(version = %server.version, commands = server.commands.len(), "handshake complete");

        let correlator = Arc::new(Mutex::new(Correlator::new()));
        let (events_tx, events_rx) = mpsc::channel(config.event_buffer.max(1));
        let reader = tokio::spawn(read_loop(
            reader,
            frames,
            Arc::clone(&correlator),
            events_tx,
        ));

        let client = Self {
            writer: Mutex::new(Box::new(writer)),
            correlator,
            ids: RequestIdCounter::new(),
            config,
            server,
            reader,
        };
        Ok((client, events_rx))
    }

    /// Version and command list from the server greeting.
    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    /// Sends `command` and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Remote`] for an `error` reply, or with
    ///   `connection_closed` when the transport closes (or cannot be
    ///   written) before the reply arrives.
    /// - [`ClientError::MalformedReply`] if the reply frame could not be
    ///   decoded.
    pub async fn send_and_wait(&self, command: Command) -> Result<Response, ClientError> {
        let rx = self.send(command).await?;
        wait_reply(rx).await
    }

    /// [`send_and_wait`](Self::send_and_wait) with a deadline on the reply.
    ///
    /// The command is always written in full first; only the wait for the
    /// reply is bounded.  On timeout the call is abandoned and its reply, if
    /// it ever arrives, is discarded.
    ///
    /// # Errors
    ///
    /// [`ClientError::Timeout`] if no reply arrived within `limit`.
    pub async fn send_and_wait_timeout(
        &self,
        command: Command,
        limit: Duration,
    ) -> Result<Response, ClientError> {
        let rx = self.send(command).await?;
        tokio::time::timeout(limit, wait_reply(rx))
            .await
            .map_err(|_| ClientError::Timeout(limit))?
    }

    /// Registers the call and writes the command.
    ///
    /// A write failure is not returned: it fails every pending call, this
    /// one included, so the receiver then yields `connection_closed`.
    async fn send(&self, command: Command) -> Result<oneshot::Receiver<Reply>, ClientError> {
        let kind = command.kind();
        let mut writer = self.writer.lock().await;
        let id = self.config.multiplex.then(|| self.ids.next());
        let rx = self.correlator.lock().await.register(id)?;

        debug!(command = %kind, ?id, "sending command");
        let bytes = encode_message(&CsMessage::Command { command, id })?;
        if let Err(e) = writer.write_all(&bytes).await {
            warn!(command = %kind, "write failed: {e}");
            self.correlator.lock().await.fail_all();
        }
        Ok(rx)
    }

    /// Closes the write half.  The server sees EOF and ends the session;
    /// pending calls then fail with `connection_closed`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Io`] if the shutdown fails.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    // ── Typed commands ────────────────────────────────────────────────────────

    pub async fn get_item_list(&self) -> Result<Vec<String>, ClientError> {
        match self.call(Command::GetItemList).await? {
            Response::GetItemList { item_list } => Ok(item_list),
            other => Err(unexpected(CommandKind::GetItemList, other)),
        }
    }

    pub async fn get_item_info(&self, ids: Vec<DisplayedItemRef>) -> Result<Vec<ItemInfo>, ClientError> {
        match self.call(Command::GetItemInfo { ids }).await? {
            Response::GetItemInfo { item_info } => Ok(item_info),
            other => Err(unexpected(CommandKind::GetItemInfo, other)),
        }
    }

    pub async fn add_variables(&self, names: Vec<String>) -> Result<Vec<DisplayedItemRef>, ClientError> {
        match self.call(Command::AddVariables { names }).await? {
            Response::AddVariables { added_items } => Ok(added_items),
            other => Err(unexpected(CommandKind::AddVariables, other)),
        }
    }

    pub async fn add_scope(&self, scope: impl Into<String>) -> Result<Vec<DisplayedItemRef>, ClientError> {
        let scope = scope.into();
        match self.call(Command::AddScope { scope }).await? {
            Response::AddScope { added_items } => Ok(added_items),
            other => Err(unexpected(CommandKind::AddScope, other)),
        }
    }

    pub async fn remove_items(&self, ids: Vec<DisplayedItemRef>) -> Result<(), ClientError> {
        self.ack(Command::RemoveItems { ids }).await
    }

    pub async fn set_item_color(
        &self,
        id: DisplayedItemRef,
        color: impl Into<String>,
    ) -> Result<(), ClientError> {
        let color = color.into();
        self.ack(Command::SetItemColor { id, color }).await
    }

    pub async fn focus_item(&self, id: DisplayedItemRef) -> Result<(), ClientError> {
        self.ack(Command::FocusItem { id }).await
    }

    pub async fn clear(&self) -> Result<(), ClientError> {
        self.ack(Command::Clear).await
    }

    /// Requests a load.  Completion arrives later as a `waveforms_loaded`
    /// event.
    pub async fn load(&self, source: impl Into<String>) -> Result<(), ClientError> {
        let source = source.into();
        self.ack(Command::Load { source }).await
    }

    pub async fn reload(&self) -> Result<(), ClientError> {
        self.ack(Command::Reload).await
    }

    pub async fn set_viewport_to(&self, timestamp: u64) -> Result<(), ClientError> {
        self.ack(Command::SetViewportTo { timestamp }).await
    }

    pub async fn zoom_to_fit(&self, viewport_idx: usize) -> Result<(), ClientError> {
        self.ack(Command::ZoomToFit { viewport_idx }).await
    }

    /// Asks the server to close this connection after acknowledging.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.ack(Command::Shutdown).await
    }

    async fn call(&self, command: Command) -> Result<Response, ClientError> {
        match self.config.timeout {
            Some(limit) => self.send_and_wait_timeout(command, limit).await,
            None => self.send_and_wait(command).await,
        }
    }

    async fn ack(&self, command: Command) -> Result<(), ClientError> {
        let kind = command.kind();
        match self.call(command).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(kind, other)),
        }
    }
}

impl Drop for WcpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn wait_reply(rx: oneshot::Receiver<Reply>) -> Result<Response, ClientError> {
    match rx.await {
        Ok(reply) => reply.map_err(ClientError::from),
        // Sender dropped without a reply: the reader is gone.
        Err(_) => Err(ClientError::Remote(WcpError::connection_closed())),
    }
}

fn unexpected(command: CommandKind, reply: Response) -> ClientError {
    ClientError::UnexpectedReply {
        command,
        reply: format!("{reply:?}"),
    }
}

/// Reads until one complete frame is available.  `Ok(None)` on EOF.
async fn read_frame<R>(reader: &mut R, frames: &mut FrameBuffer) -> Result<Option<Vec<u8>>, ClientError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if let Some(frame) = frames.next_frame()? {
            return Ok(Some(frame));
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        frames.extend(&buf[..n]);
    }
}

/// Reads and decodes one message.  `Ok(None)` on EOF.
async fn read_message<R>(
    reader: &mut R,
    frames: &mut FrameBuffer,
) -> Result<Option<ScMessage>, ClientError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader, frames).await? {
        Some(frame) => Ok(Some(decode_sc_message(&frame)?)),
        None => Ok(None),
    }
}

/// Owns the read half for the lifetime of the connection.
async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    mut frames: FrameBuffer,
    correlator: Arc<Mutex<Correlator>>,
    events: mpsc::Sender<Event>,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let frame = match read_frame(&mut reader, &mut frames).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("server closed the connection");
                break;
            }
            Err(e) => {
                warn!("connection lost: {e}");
                break;
            }
        };

        let message = match decode_sc_message(&frame) {
            Ok(message) => message,
            Err(ProtocolError::MalformedEvent { reason }) => {
                warn!("discarding undecodable event: {reason}");
                continue;
            }
            Err(e) => {
                // Anything that is not an event answers a call.  Failing
                // that call keeps later FIFO replies with their own callers.
                let id = e.request_id();
                if !correlator.lock().await.fail_next(id, e.to_string()) {
                    warn!(?id, "undecodable frame with no pending call: {e}");
                }
                continue;
            }
        };

        let unmatched = match correlator.lock().await.resolve(message) {
            Ok(()) => continue,
            Err(unmatched) => unmatched,
        };

        match unmatched {
            ScMessage::Event { event } => {
                debug!(event = event.name(), "event received");
                match events.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        warn!(event = event.name(), "event channel full; event dropped");
                    }
                    // Nobody is listening for events.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
            other => warn!("reply with no pending call: {other:?}"),
        }
    }

    let failed = correlator.lock().await.fail_all();
    if failed > 0 {
        info!(failed, "pending calls failed with connection_closed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
