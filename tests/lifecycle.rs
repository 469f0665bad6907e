//! Lifecycle scenarios: tick cadence, thread affinity, disposal, misuse.


use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nulproxy::{EventLoop, ProxyConfig, ProxyError};

use harness::{start_proxy, wait_for, RecordedEvent, Recorder, SinkUpstream};

#[tokio::test]
async fn test_tick_cadence_and_monotonicity() {
    let recorder = Recorder::new();
    let config = ProxyConfig::default().with_tick_period(Duration::from_millis(10));
    let event_loop = EventLoop::new(&config, recorder.clone()).unwrap();

    assert!(wait_for(|| recorder.ticks().len() >= 10, Duration::from_secs(2)).await);
    event_loop.dispose();

    let ticks = recorder.ticks();
    assert!(ticks.len() >= 10);
    assert!(ticks.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_all_callbacks_run_on_the_worker_thread() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"A\0B\0").await.unwrap();
    assert!(wait_for(|| recorder.events().len() >= 3, Duration::from_secs(2)).await);

    let threads = recorder.event_threads();
    let worker = threads[0];
    assert!(threads.iter().all(|t| *t == worker));
    assert_ne!(worker, std::thread::current().id());

    event_loop.dispose();
}

#[tokio::test]
async fn test_dispose_from_foreign_thread_closes_everything() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"X\0").await.unwrap();
    assert!(wait_for(|| recorder.events().len() >= 2, Duration::from_secs(2)).await);

    // This test runs off the proxy's worker thread, so this is the
    // foreign-thread disposal path. It joins the worker before returning.
    event_loop.dispose();

    assert_eq!(recorder.disconnect_count(), 1);

    // Both sockets are closed: the client observes EOF or a reset.
    let mut buf = [0u8; 8];
    match tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected closed socket, got {:?}", other),
    }

    // No further callbacks fire after dispose.
    let count = recorder.events().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.events().len(), count);
}

#[tokio::test]
async fn test_send_from_foreign_thread_is_rejected() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let _client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| !recorder.sessions().is_empty(), Duration::from_secs(2)).await);

    let session = recorder.sessions().remove(0);
    let result = session.send_remote(b"nope").await;
    assert!(matches!(result, Err(ProxyError::WrongThread)));

    event_loop.dispose();
}

#[tokio::test]
async fn test_send_rejects_embedded_nul() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let _client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| !recorder.sessions().is_empty(), Duration::from_secs(2)).await);
    let session = recorder.sessions().remove(0);

    let (tx, rx) = std::sync::mpsc::channel();
    event_loop
        .schedule(move || {
            tokio::spawn(async move {
                let result = session.send_remote(b"has\0nul").await;
                let _ = tx.send(result);
            });
        })
        .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(result, Err(ProxyError::InvalidMessage)));

    event_loop.dispose();
}

#[tokio::test]
async fn test_injected_message_from_worker_reaches_client() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| !recorder.sessions().is_empty(), Duration::from_secs(2)).await);
    let session = recorder.sessions().remove(0);

    event_loop
        .schedule(move || {
            tokio::spawn(async move {
                session.send_local_text("HI").await.unwrap();
            });
        })
        .unwrap();

    let mut buf = [0u8; 3];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .expect("injected message timed out")
        .unwrap();
    assert_eq!(&buf, b"HI\0");

    event_loop.dispose();
}

#[tokio::test]
async fn test_client_disconnect_emits_single_disconnected() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    {
        let _client = TcpStream::connect(addr).await.unwrap();
        assert!(wait_for(|| !recorder.events().is_empty(), Duration::from_secs(2)).await);
    }

    assert!(wait_for(|| recorder.disconnect_count() == 1, Duration::from_secs(2)).await);
    // The disconnect stays a single event even after the other direction's
    // tasks observe the teardown.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.disconnect_count(), 1);

    let events = recorder.events();
    assert!(matches!(
        events.last(),
        Some(RecordedEvent::State {
            connected: false,
            ..
        })
    ));

    event_loop.dispose();
}

#[tokio::test]
async fn test_user_token_round_trip() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let _client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| !recorder.sessions().is_empty(), Duration::from_secs(2)).await);
    let session = recorder.sessions().remove(0);

    session.set_user_token(Some(Box::new(42u32)));
    let token = session.take_user_token().expect("token present");
    assert_eq!(token.downcast_ref::<u32>(), Some(&42));
    assert!(session.take_user_token().is_none());

    event_loop.dispose();
}

#[tokio::test]
async fn test_session_dispose_from_embedder() {
    let upstream = SinkUpstream::spawn(None).await.unwrap();
    let recorder = Recorder::new();
    let (event_loop, addr) = start_proxy(recorder.clone(), upstream.addr);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| !recorder.sessions().is_empty(), Duration::from_secs(2)).await);
    let session = recorder.sessions().remove(0);

    session.dispose();
    assert!(wait_for(|| recorder.disconnect_count() == 1, Duration::from_secs(2)).await);

    let mut buf = [0u8; 8];
    match tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected closed socket, got {:?}", other),
    }

    event_loop.dispose();
}
