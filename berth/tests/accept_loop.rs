//! End-to-end accept loop tests over real loopback sockets.
//!
//! Each test runs a `TokioStack` against live TCP connections on a
//! current-thread runtime. Listener ports are OS-assigned unless the
//! scenario needs a specific one, so tests can run in parallel.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use berth::{
    Driver, DriverConfig, ListenerStatus, MemoryKind, NetworkStack, SlotId, TokioStack,
    TokioTaskProvider, TokioTimeProvider,
};

type LoopbackDriver = Driver<TokioStack<TokioTaskProvider>, TokioTimeProvider>;

/// Runs a future on a current-thread runtime inside a `LocalSet`, so
/// the driver's `spawn_local`-based tasks have a place to live.
fn run_local<F: Future<Output = ()>>(future: F) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .expect("Failed to build local runtime");
    tokio::task::LocalSet::new().block_on(&runtime, future);
}

fn fast_driver() -> (LoopbackDriver, TokioStack<TokioTaskProvider>) {
    let config = DriverConfig::fast_local();
    let stack = TokioStack::new(TokioTaskProvider, &config);
    let driver = Driver::new(stack.clone(), TokioTimeProvider::new(), config);
    (driver, stack)
}

fn track_accepts(driver: &LoopbackDriver, port: u16) -> Rc<RefCell<Vec<SlotId>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    driver
        .initialise_accept(port, move |slot| sink.borrow_mut().push(slot))
        .expect("listener should register");
    seen
}

fn spawn_driver_loop(driver: &LoopbackDriver) {
    let runner = driver.clone();
    tokio::task::spawn_local(async move { runner.run().await });
}

/// Polls a condition until it holds, panicking after a few seconds.
async fn wait_for<C: Fn() -> bool>(condition: C, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn wait_for_bound_port(stack: &TokioStack<TokioTaskProvider>, requested: u16) -> u16 {
    for _ in 0..500 {
        if let Some(ListenerStatus::Accepting { bound_port }) = stack.listener_status(requested) {
            return bound_port;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("listener on port {requested} never reached accepting state");
}

#[test]
fn test_accept_echo_roundtrip() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    run_local(async {
        let (driver, stack) = fast_driver();
        let seen = track_accepts(&driver, 0);
        spawn_driver_loop(&driver);

        let port = wait_for_bound_port(&stack, 0).await;
        let mut client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to bound port");
        wait_for(|| !seen.borrow().is_empty(), "connection adoption").await;
        let slot = seen.borrow()[0];

        client.write_all(b"ping").await.expect("client write");
        let mut request = Vec::new();
        while request.len() < 4 {
            wait_for(|| driver.raw_read_available(slot), "request bytes").await;
            let mut chunk = [0u8; 16];
            let got = driver.raw_read_data(slot, &mut chunk).expect("server read");
            request.extend_from_slice(&chunk[..got]);
        }
        assert_eq!(request, b"ping");

        driver
            .raw_write_data(slot, b"pong", MemoryKind::Ram, Duration::from_secs(1))
            .await
            .expect("server write");
        driver.raw_flush_all(slot).await.expect("server flush");

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.expect("client read");
        assert_eq!(&reply, b"pong");

        driver.close_socket(slot);
        let mut scratch = [0u8; 1];
        let eof = client.read(&mut scratch).await.expect("clean shutdown");
        assert_eq!(eof, 0);
    });
}

#[test]
fn test_peer_half_close_keeps_slot_writable() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    run_local(async {
        let (driver, stack) = fast_driver();
        let seen = track_accepts(&driver, 0);
        spawn_driver_loop(&driver);

        let port = wait_for_bound_port(&stack, 0).await;
        let mut client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to bound port");
        wait_for(|| !seen.borrow().is_empty(), "connection adoption").await;
        let slot = seen.borrow()[0];

        client.shutdown().await.expect("half-close write side");
        // several poll intervals pass while the reader observes end of stream
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            driver.raw_write_available(slot),
            "half-closed peer stays writable"
        );

        driver
            .raw_write_data(slot, b"bye", MemoryKind::Ram, Duration::from_secs(1))
            .await
            .expect("write after peer shutdown");
        driver
            .raw_flush_all(slot)
            .await
            .expect("flush after peer shutdown");

        let mut reply = [0u8; 3];
        client.read_exact(&mut reply).await.expect("read final bytes");
        assert_eq!(&reply, b"bye");
    });
}

#[test]
fn test_stale_peer_bytes_never_reach_reused_slot() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    run_local(async {
        let (driver, stack) = fast_driver();
        let seen = track_accepts(&driver, 0);
        spawn_driver_loop(&driver);

        let port = wait_for_bound_port(&stack, 0).await;
        let mut first = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("first connect");
        wait_for(|| seen.borrow().len() == 1, "first adoption").await;
        let slot = seen.borrow()[0];

        // let the first connection's reader park in its socket read
        tokio::time::sleep(Duration::from_millis(20)).await;
        driver.close_socket(slot);

        let mut second = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("second connect");
        wait_for(|| seen.borrow().len() == 2, "second adoption").await;
        assert_eq!(seen.borrow()[1], slot, "freed slot is reused");

        // the first peer keeps talking after the close; its reader wakes
        // from the parked read and must not feed the reused slot
        first.write_all(b"GHOST").await.expect("stale peer write");
        second.write_all(b"fresh").await.expect("new peer write");

        let mut received = Vec::new();
        while received.len() < 5 {
            wait_for(|| driver.raw_read_available(slot), "new peer bytes").await;
            let mut chunk = [0u8; 16];
            let got = driver.raw_read_data(slot, &mut chunk).expect("server read");
            received.extend_from_slice(&chunk[..got]);
        }
        assert_eq!(received, b"fresh", "only the live connection's bytes arrive");
    });
}

#[test]
fn test_listener_retries_until_port_frees() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    run_local(async {
        let blocker = std::net::TcpListener::bind(("0.0.0.0", 0)).expect("bind blocker");
        let port = blocker.local_addr().expect("blocker addr").port();

        let (driver, stack) = fast_driver();
        let seen = track_accepts(&driver, port);
        spawn_driver_loop(&driver);

        wait_for(
            || matches!(stack.listener_status(port), Some(ListenerStatus::Failed)),
            "bind failure on occupied port",
        )
        .await;
        assert!(seen.borrow().is_empty());

        drop(blocker);
        let bound = wait_for_bound_port(&stack, port).await;
        assert_eq!(bound, port);

        let _client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect after listener recovery");
        wait_for(|| !seen.borrow().is_empty(), "adoption after recovery").await;
    });
}

#[test]
fn test_reset_connection_is_reaped() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    run_local(async {
        let (driver, stack) = fast_driver();
        let seen = track_accepts(&driver, 0);
        spawn_driver_loop(&driver);

        let port = wait_for_bound_port(&stack, 0).await;
        let client = TcpStream::connect(("127.0.0.1", port))
            .await
            .expect("connect to bound port");
        wait_for(|| !seen.borrow().is_empty(), "connection adoption").await;
        let slot = seen.borrow()[0];
        assert_eq!(driver.connection_count(), 1);

        client
            .set_linger(Some(Duration::ZERO))
            .expect("arm reset on drop");
        drop(client);

        wait_for(|| driver.connection_count() == 0, "reap after reset").await;
        assert!(!driver.raw_write_available(slot));
        assert_eq!(driver.stats().connections_reaped, 1);
    });
}

#[test]
fn test_accept_burst_sheds_overflow_connections() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    run_local(async {
        let (driver, stack) = fast_driver();
        track_accepts(&driver, 0);
        // no driver loop here: the queue has to absorb the burst on its own

        let port = wait_for_bound_port(&stack, 0).await;
        let mut clients = Vec::new();
        for _ in 0..8 {
            clients.push(
                TcpStream::connect(("127.0.0.1", port))
                    .await
                    .expect("connect during burst"),
            );
        }
        wait_for(|| driver.accept_backlog(0) == 5, "queue to fill").await;

        let mut shed = 0;
        let mut held = 0;
        for client in &mut clients {
            let mut scratch = [0u8; 1];
            match tokio::time::timeout(Duration::from_millis(200), client.read(&mut scratch)).await
            {
                Ok(Ok(0)) => shed += 1,
                Ok(other) => panic!("unexpected read result: {other:?}"),
                Err(_) => held += 1,
            }
        }
        assert_eq!(shed, 3, "overflow connections are shed at the queue");
        assert_eq!(held, 5, "queued connections stay open for the next poll");
    });
}
