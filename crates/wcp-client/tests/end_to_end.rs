//! End-to-end tests: `WcpClient` against an in-process `wcp-server` over TCP.
//!
//! # What is covered
//!
//! - Handshake: the server greeting lists the commands it supports.
//! - Ordering: replies complete calls in the order commands were sent, even
//!   when an event arrives between them.
//! - Item management: `add_variables` returns one reference per name, in
//!   order, and `get_item_list` sees them; an empty request is not an error.
//! - Error kinds: `not_ready` before the handshake, `unknown_command` for an
//!   unrecognised tag, `resolution_failed` for an unknown variable.
//! - Closing: a call pending when the transport closes fails with
//!   `connection_closed` instead of hanging.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use wcp_client::{ClientConfig, ClientError, WcpClient};
use wcp_core::protocol::FrameBuffer;
use wcp_core::{
    decode_sc_message, encode_message, Command, CsMessage, DisplayedItemRef, ErrorKind, Event,
    ScMessage, PROTOCOL_VERSION,
};
use wcp_server::application::dispatch::{CommandRegistry, Dispatcher};
use wcp_server::infrastructure::network::session::Session;
use wcp_server::infrastructure::storage::config::SourceEntry;
use wcp_server::infrastructure::viewer::InMemoryViewer;

const CALL_LIMIT: Duration = Duration::from_secs(5);

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Serves every accepted connection with a fresh session on a shared viewer.
async fn start_server() -> (String, JoinHandle<()>) {
    let viewer = InMemoryViewer::new(
        vec![SourceEntry {
            name: "abc.vcd".to_string(),
            variables: ["a", "b", "c", "top.x", "top.y", "top.sub.z"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }],
        2,
        64,
    );
    let dispatcher = Arc::new(Dispatcher::new(Arc::new(viewer), CommandRegistry::all()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let session = Session::new(Arc::clone(&dispatcher));
            tokio::spawn(session.run(stream, 1024 * 1024));
        }
    });
    (addr, task)
}

async fn connect(addr: &str) -> (WcpClient, tokio::sync::mpsc::Receiver<Event>) {
    let config = ClientConfig {
        server_addr: addr.to_string(),
        timeout: Some(CALL_LIMIT),
        ..Default::default()
    };
    WcpClient::connect(config).await.unwrap()
}

async fn loaded_client(addr: &str) -> (WcpClient, tokio::sync::mpsc::Receiver<Event>) {
    let (client, mut events) = connect(addr).await;
    client.load("abc.vcd").await.unwrap();
    assert_eq!(
        tokio::time::timeout(CALL_LIMIT, events.recv()).await.unwrap(),
        Some(Event::WaveformsLoaded {
            source: "abc.vcd".into()
        })
    );
    (client, events)
}

/// Reads one server message from a raw stream.
async fn read_raw(stream: &mut TcpStream, frames: &mut FrameBuffer) -> ScMessage {
    let mut buf = [0u8; 4096];
    loop {
        if let Some(frame) = frames.next_frame().unwrap() {
            return decode_sc_message(&frame).unwrap();
        }
        let n = tokio::time::timeout(CALL_LIMIT, stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "server closed the connection");
        frames.extend(&buf[..n]);
    }
}

// ── Handshake ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_handshake_lists_core_commands() {
    // Arrange
    let (addr, server) = start_server().await;

    // Act
    let (client, _events) = connect(&addr).await;

    // Assert
    let commands = &client.server().commands;
    assert!(!commands.is_empty());
    assert!(commands.iter().any(|c| c == "get_item_list"));
    assert!(commands.iter().any(|c| c == "add_variables"));
    assert_eq!(client.server().version, PROTOCOL_VERSION.to_string());
    server.abort();
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    // Arrange
    let (addr, server) = start_server().await;
    let config = ClientConfig {
        server_addr: addr,
        version: wcp_core::ProtocolVersion::new(7, 0),
        ..Default::default()
    };

    // Act
    let err = WcpClient::connect(config).await.err().unwrap();

    // Assert
    assert_eq!(err.kind(), Some(ErrorKind::VersionMismatch));
    server.abort();
}

// ── Ordering and items ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_calls_each_get_their_own_reply() {
    // Arrange
    let (addr, server) = start_server().await;
    let (client, mut events) = connect(&addr).await;

    // Act: three commands in flight at once.  Where the `load` event lands
    // relative to the replies depends on scheduling.
    let (r1, r2, r3) = tokio::join!(
        client.load("abc.vcd"),
        client.add_variables(vec!["a".into()]),
        client.get_item_list(),
    );

    // Assert
    r1.unwrap();
    assert_eq!(r2.unwrap(), vec![DisplayedItemRef::new("0")]);
    assert_eq!(r3.unwrap(), vec!["a"]);
    assert_eq!(
        events.recv().await,
        Some(Event::WaveformsLoaded {
            source: "abc.vcd".into()
        })
    );
    server.abort();
}

#[tokio::test]
async fn test_add_variables_then_item_list() {
    // Arrange
    let (addr, server) = start_server().await;
    let (client, _events) = loaded_client(&addr).await;

    // Act
    let added = client
        .add_variables(vec!["a".into(), "b".into(), "c".into()])
        .await
        .unwrap();
    let items = client.get_item_list().await.unwrap();

    // Assert
    assert_eq!(added.len(), 3);
    let mut ids = added.clone();
    ids.dedup();
    assert_eq!(ids.len(), 3, "references must be distinct");
    assert_eq!(items, vec!["a", "b", "c"]);
    server.abort();
}

#[tokio::test]
async fn test_add_variables_empty_is_not_an_error() {
    let (addr, server) = start_server().await;
    let (client, _events) = connect(&addr).await;

    let added = client.add_variables(Vec::new()).await.unwrap();

    assert!(added.is_empty());
    server.abort();
}

#[tokio::test]
async fn test_unknown_variable_fails_whole_command() {
    // Arrange
    let (addr, server) = start_server().await;
    let (client, _events) = loaded_client(&addr).await;

    // Act
    let err = client
        .add_variables(vec!["a".into(), "nope".into()])
        .await
        .unwrap_err();

    // Assert: nothing was added
    match &err {
        ClientError::Remote(e) => {
            assert_eq!(e.kind(), ErrorKind::ResolutionFailed);
            assert_eq!(e.arguments, vec!["nope"]);
        }
        other => panic!("expected resolution_failed, got {other:?}"),
    }
    assert!(client.get_item_list().await.unwrap().is_empty());
    server.abort();
}

#[tokio::test]
async fn test_item_commands_round_trip() {
    // Arrange
    let (addr, server) = start_server().await;
    let (client, _events) = loaded_client(&addr).await;
    let added = client.add_scope("top").await.unwrap();

    // Act
    client
        .set_item_color(added[0].clone(), "#ff0000")
        .await
        .unwrap();
    client.focus_item(added[1].clone()).await.unwrap();
    client.set_viewport_to(1_000).await.unwrap();
    client.zoom_to_fit(1).await.unwrap();
    let info = client.get_item_info(added.clone()).await.unwrap();
    client.remove_items(vec![added[0].clone()]).await.unwrap();
    let remaining = client.get_item_list().await.unwrap();

    // Assert
    assert_eq!(added.len(), 2, "only direct children of the scope");
    assert_eq!(info[0].name, "top.x");
    assert_eq!(info[0].color.as_deref(), Some("#ff0000"));
    assert_eq!(remaining, vec!["top.y"]);
    let err = client.zoom_to_fit(5).await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::InvalidArguments));
    server.abort();
}

#[tokio::test]
async fn test_other_session_sees_changes_as_events() {
    // Arrange
    let (addr, server) = start_server().await;
    let (editor, _editor_events) = loaded_client(&addr).await;
    let (_observer, mut observer_events) = connect(&addr).await;

    // Act
    let added = editor.add_variables(vec!["b".into()]).await.unwrap();
    editor.clear().await.unwrap();

    // Assert
    let first = tokio::time::timeout(CALL_LIMIT, observer_events.recv())
        .await
        .unwrap();
    let second = tokio::time::timeout(CALL_LIMIT, observer_events.recv())
        .await
        .unwrap();
    assert_eq!(first, Some(Event::ItemsAdded { ids: added.clone() }));
    assert_eq!(second, Some(Event::ItemsRemoved { ids: added }));
    server.abort();
}

#[tokio::test]
async fn test_multiplexed_client_correlates_concurrent_calls() {
    // Arrange
    let (addr, server) = start_server().await;
    let config = ClientConfig {
        server_addr: addr,
        multiplex: true,
        timeout: Some(CALL_LIMIT),
        ..Default::default()
    };
    let (client, _events) = WcpClient::connect(config).await.unwrap();
    client.load("abc.vcd").await.unwrap();
    let client = Arc::new(client);

    // Act
    let mut tasks = Vec::new();
    for name in ["a", "b", "c"] {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client.add_variables(vec![name.to_string()]).await
        }));
    }

    // Assert
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().len(), 1);
    }
    let mut items = client.get_item_list().await.unwrap();
    items.sort();
    assert_eq!(items, vec!["a", "b", "c"]);
    server.abort();
}

// ── Error kinds on the raw wire ───────────────────────────────────────────────

#[tokio::test]
async fn test_command_before_handshake_is_not_ready() {
    // Arrange
    let (addr, server) = start_server().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut frames = FrameBuffer::default();

    // Act
    stream
        .write_all(&encode_message(&CsMessage::command(Command::GetItemList)).unwrap())
        .await
        .unwrap();
    let reply = read_raw(&mut stream, &mut frames).await;

    // Assert
    match reply {
        ScMessage::Error(err) => assert_eq!(err.kind(), ErrorKind::NotReady),
        other => panic!("expected not_ready, got {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn test_unknown_command_tag_is_never_a_response() {
    // Arrange
    let (addr, server) = start_server().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    let mut frames = FrameBuffer::default();
    stream
        .write_all(&encode_message(&CsMessage::greeting(PROTOCOL_VERSION, vec![])).unwrap())
        .await
        .unwrap();
    assert!(matches!(
        read_raw(&mut stream, &mut frames).await,
        ScMessage::Greeting { .. }
    ));

    // Act
    stream
        .write_all(b"{\"type\":\"command\",\"command\":{\"type\":\"frobnicate\"},\"id\":4}\0")
        .await
        .unwrap();
    let reply = read_raw(&mut stream, &mut frames).await;

    // Assert
    match reply {
        ScMessage::Error(err) => {
            assert_eq!(err.kind(), ErrorKind::UnknownCommand);
            assert_eq!(err.id, Some(4));
        }
        other => panic!("expected unknown_command, got {other:?}"),
    }
    server.abort();
}

// ── Closing ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_close_while_pending_is_connection_closed() {
    // Arrange: a server that greets, reads one command, then hangs up
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = stream.read(&mut buf).await.unwrap();
        stream
            .write_all(&encode_message(&ScMessage::greeting(PROTOCOL_VERSION, vec![])).unwrap())
            .await
            .unwrap();
        let _ = stream.read(&mut buf).await.unwrap();
        drop(stream);
    });
    let config = ClientConfig {
        server_addr: addr,
        ..Default::default()
    };
    let (client, _events) = WcpClient::connect(config).await.unwrap();

    // Act
    let result = tokio::time::timeout(CALL_LIMIT, client.send_and_wait(Command::GetItemList))
        .await
        .expect("pending call must not hang");

    // Assert
    assert_eq!(
        result.unwrap_err().kind(),
        Some(ErrorKind::ConnectionClosed)
    );
    server.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_acks_then_later_calls_fail_closed() {
    // Arrange
    let (addr, server) = start_server().await;
    let (client, mut events) = connect(&addr).await;

    // Act
    client.shutdown().await.unwrap();
    let stream_end = tokio::time::timeout(CALL_LIMIT, events.recv()).await.unwrap();
    let after = client.get_item_list().await.unwrap_err();

    // Assert
    assert_eq!(stream_end, None, "event stream ends with the connection");
    assert_eq!(after.kind(), Some(ErrorKind::ConnectionClosed));
    server.abort();
}
