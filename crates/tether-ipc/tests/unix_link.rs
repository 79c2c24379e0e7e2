use std::{path::Path, sync::Arc, time::Duration};

use tempfile::tempdir;
use tether_core::{Direction, EndpointId};
use tether_ipc::{IpcError, MessageHandler, Relay, SocketState, Transport, UnixTransport, serve_unix};
use tokio::{sync::mpsc, time::timeout};

async fn start_relay(path: &Path) -> Arc<Relay> {
    let relay = Arc::new(Relay::new());
    let server_path = path.to_path_buf();
    let server_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        let _ = serve_unix(&server_path, server_relay).await;
    });
    while !path.exists() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    relay
}

fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |text| {
        let _ = tx.send(text);
    });
    (handler, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message in time")
        .expect("message")
}

#[tokio::test]
async fn messages_cross_the_daemon() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tetherd.sock");
    start_relay(&path).await;
    let transport = UnixTransport::new(&path);
    let endpoint = EndpointId::generate();
    let (handler, mut rx) = collector();

    let writer = transport
        .open(&endpoint, Direction::Write, None)
        .await
        .expect("writer");
    writer
        .send(r#"["message","queued"]"#.to_string())
        .expect("queued send");

    let reader = transport
        .open(&endpoint, Direction::Read, Some(handler))
        .await
        .expect("reader");
    assert_eq!(next(&mut rx).await, r#""queued""#);

    writer
        .send(r#"["message",[1,2]]"#.to_string())
        .expect("live send");
    assert_eq!(next(&mut rx).await, "[1,2]");

    writer.close(1000).await;
    reader.close(1000).await;
    assert_eq!(reader.state(), SocketState::Closed);
}

#[tokio::test]
async fn duplicate_reader_is_reported() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tetherd.sock");
    start_relay(&path).await;
    let transport = UnixTransport::new(&path);
    let endpoint = EndpointId::generate();
    let (handler, _rx) = collector();

    let _reader = transport
        .open(&endpoint, Direction::Read, Some(Arc::clone(&handler)))
        .await
        .expect("reader");
    let err = transport
        .open(&endpoint, Direction::Read, Some(handler))
        .await
        .expect_err("second reader");
    assert!(matches!(err, IpcError::DuplicateReader { .. }));
}

#[tokio::test]
async fn pause_closes_reader_and_queues_until_reconnect() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tetherd.sock");
    let relay = start_relay(&path).await;
    let transport = UnixTransport::new(&path);
    let endpoint = EndpointId::generate();
    let (handler, mut rx) = collector();

    let reader = transport
        .open(&endpoint, Direction::Read, Some(Arc::clone(&handler)))
        .await
        .expect("reader");
    let writer = transport
        .open(&endpoint, Direction::Write, None)
        .await
        .expect("writer");

    writer.send(r#"["pause",null]"#.to_string()).expect("pause");
    timeout(Duration::from_secs(2), reader.closed())
        .await
        .expect("reader closed by relay");

    writer
        .send(r#"["message","while paused"]"#.to_string())
        .expect("send while paused");
    while relay.queued(&endpoint) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(rx.try_recv().is_err());

    let _reader = transport
        .open(&endpoint, Direction::Read, Some(handler))
        .await
        .expect("reconnect");
    assert_eq!(next(&mut rx).await, r#""while paused""#);
}

#[tokio::test]
async fn undecodable_frames_close_the_write_link() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tetherd.sock");
    let relay = start_relay(&path).await;
    let transport = UnixTransport::new(&path);
    let endpoint = EndpointId::generate();

    let writer = transport
        .open(&endpoint, Direction::Write, None)
        .await
        .expect("writer");
    writer.send("not json".to_string()).expect("send");
    timeout(Duration::from_secs(2), writer.closed())
        .await
        .expect("writer closed by relay");
    assert_eq!(writer.state(), SocketState::Closed);
    assert_eq!(relay.queued(&endpoint), 0);
}

#[tokio::test]
async fn deeply_nested_bodies_cross_the_daemon() {
    const DEPTH: usize = 100_000;
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("tetherd.sock");
    start_relay(&path).await;
    let transport = UnixTransport::new(&path);
    let endpoint = EndpointId::generate();
    let (handler, mut rx) = collector();

    let _reader = transport
        .open(&endpoint, Direction::Read, Some(handler))
        .await
        .expect("reader");
    let writer = transport
        .open(&endpoint, Direction::Write, None)
        .await
        .expect("writer");
    let body = format!("{}{}", "[".repeat(DEPTH), "]".repeat(DEPTH));
    writer
        .send(format!(r#"["message",{body}]"#))
        .expect("deep send");

    assert_eq!(next(&mut rx).await, body);
}
