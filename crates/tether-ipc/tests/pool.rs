use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tether_core::{ControlFrame, Direction, EndpointId};
use tether_ipc::{
    ConnectionPool, IpcError, MemoryTransport, MessageHandler, Socket, SocketDriver, SocketState,
    Transport,
};
use tokio::{sync::mpsc, time::timeout};

const WAIT: Duration = Duration::from_secs(1);

/// Opens sockets whose close handshake never completes.
#[derive(Default)]
struct StallingTransport {
    drivers: Mutex<Vec<SocketDriver>>,
}

#[async_trait]
impl Transport for StallingTransport {
    async fn open(
        &self,
        endpoint: &EndpointId,
        direction: Direction,
        _on_message: Option<MessageHandler>,
    ) -> Result<Socket, IpcError> {
        let (socket, driver) = Socket::pair(endpoint.clone(), direction);
        driver.mark_open();
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(driver);
        Ok(socket)
    }
}

fn stalling_pool() -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(Arc::new(StallingTransport::default())))
}

fn pool() -> (ConnectionPool, MemoryTransport) {
    let transport = MemoryTransport::default();
    let shared: Arc<dyn Transport> = Arc::new(transport.clone());
    (ConnectionPool::new(shared), transport)
}

fn collector() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: MessageHandler = Arc::new(move |text| {
        let _ = tx.send(text);
    });
    (handler, rx)
}

#[tokio::test]
async fn write_sockets_are_shared_and_closed_on_last_release() {
    let (pool, _) = pool();
    let endpoint = EndpointId::generate();

    let first = pool
        .acquire(Direction::Write, &endpoint, None)
        .await
        .expect("first acquire");
    let second = pool
        .acquire(Direction::Write, &endpoint, None)
        .await
        .expect("second acquire");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.ref_count(Direction::Write, &endpoint).await, Some(2));

    pool.release(Direction::Write, &endpoint).await;
    assert!(first.is_live());
    assert_eq!(pool.ref_count(Direction::Write, &endpoint).await, Some(1));

    pool.release(Direction::Write, &endpoint).await;
    assert_eq!(first.state(), SocketState::Closed);
    assert!(!pool.contains(Direction::Write, &endpoint).await);
}

#[tokio::test]
async fn write_acquire_rejects_message_handler() {
    let (pool, _) = pool();
    let (handler, _rx) = collector();

    let err = pool
        .acquire(Direction::Write, &EndpointId::generate(), Some(handler))
        .await
        .expect_err("handler on write socket");
    assert!(matches!(err, IpcError::InvalidConfiguration(_)));
}

#[tokio::test]
async fn second_reader_is_rejected_until_release() {
    let (pool, _) = pool();
    let endpoint = EndpointId::generate();
    let (handler, _rx) = collector();

    pool.acquire(Direction::Read, &endpoint, Some(Arc::clone(&handler)))
        .await
        .expect("first reader");
    let err = pool
        .acquire(Direction::Read, &endpoint, Some(Arc::clone(&handler)))
        .await
        .expect_err("duplicate reader");
    assert!(matches!(err, IpcError::DuplicateReader { .. }));

    pool.release(Direction::Read, &endpoint).await;
    pool.acquire(Direction::Read, &endpoint, Some(handler))
        .await
        .expect("reader after release");
}

#[tokio::test]
async fn frames_flow_from_writer_to_reader() {
    let (pool, _) = pool();
    let endpoint = EndpointId::generate();
    let (handler, mut rx) = collector();

    pool.acquire(Direction::Read, &endpoint, Some(handler))
        .await
        .expect("reader");
    let writer = pool
        .acquire(Direction::Write, &endpoint, None)
        .await
        .expect("writer");
    writer
        .send(r#"["message",{"n":1}]"#.to_string())
        .expect("send");

    let text = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("message in time")
        .expect("message");
    assert_eq!(text, r#"{"n":1}"#);
}

#[tokio::test]
async fn paused_reader_is_evicted_and_can_reconnect() {
    let (pool, transport) = pool();
    let endpoint = EndpointId::generate();
    let (handler, _rx) = collector();

    let reader = pool
        .acquire(Direction::Read, &endpoint, Some(Arc::clone(&handler)))
        .await
        .expect("reader");
    transport.relay().apply(&endpoint, ControlFrame::Pause);
    timeout(Duration::from_secs(1), reader.closed())
        .await
        .expect("reader closes after pause");

    let again = pool
        .acquire(Direction::Read, &endpoint, Some(handler))
        .await
        .expect("reconnect after pause");
    assert!(!Arc::ptr_eq(&reader, &again));

    // Releasing the stale socket must not touch the new one.
    pool.release_socket(&reader).await;
    assert!(pool.contains(Direction::Read, &endpoint).await);
}

#[tokio::test]
async fn release_all_closes_everything() {
    let (pool, _) = pool();
    let (handler, _rx) = collector();
    let read = pool
        .acquire(Direction::Read, &EndpointId::generate(), Some(handler))
        .await
        .expect("reader");
    let write = pool
        .acquire(Direction::Write, &EndpointId::generate(), None)
        .await
        .expect("writer");

    pool.release_all().await;
    assert!(pool.is_empty().await);
    assert_eq!(read.state(), SocketState::Closed);
    assert_eq!(write.state(), SocketState::Closed);
}

#[tokio::test]
async fn releasing_unknown_key_is_a_no_op() {
    let (pool, _) = pool();
    pool.release(Direction::Write, &EndpointId::from("nobody")).await;
    assert!(pool.is_empty().await);
}

#[tokio::test]
async fn slow_close_does_not_block_other_endpoints() {
    let pool = stalling_pool();
    let stuck = EndpointId::generate();
    pool.acquire(Direction::Write, &stuck, None)
        .await
        .expect("stuck writer");

    let releasing = tokio::spawn({
        let pool = Arc::clone(&pool);
        let stuck = stuck.clone();
        async move { pool.release(Direction::Write, &stuck).await }
    });
    timeout(WAIT, async {
        while pool.contains(Direction::Write, &stuck).await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("claim dropped while the close is pending");

    let other = EndpointId::generate();
    timeout(WAIT, pool.acquire(Direction::Write, &other, None))
        .await
        .expect("acquire is not blocked by the pending close")
        .expect("other writer");
    assert!(!releasing.is_finished());
    releasing.abort();
}

#[tokio::test]
async fn slow_release_all_leaves_the_pool_usable() {
    let pool = stalling_pool();
    pool.acquire(Direction::Write, &EndpointId::generate(), None)
        .await
        .expect("writer");

    let releasing = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.release_all().await }
    });
    timeout(WAIT, async {
        while !pool.is_empty().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("pool drained while closes are pending");

    let endpoint = EndpointId::generate();
    timeout(WAIT, pool.acquire(Direction::Write, &endpoint, None))
        .await
        .expect("acquire is not blocked by release_all")
        .expect("writer after release_all");
    assert_eq!(pool.ref_count(Direction::Write, &endpoint).await, Some(1));
    releasing.abort();
}
