//! Session handler behaviour over an in-memory control channel

use burrow_control::{
    CloseReason, DispatchError, Dispatcher, IncomingRequest, PendingRequests, SessionConfig,
    SessionHandler, SessionRegistry, SessionStatus,
};
use burrow_proto::{ControlMessage, RequestId, ResponseFrame};
use burrow_transport::{
    ControlTransport, FrameSink, FrameSource, MemorySink, MemorySource, MemoryTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    registry: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    handler: SessionHandler,
    shutdown: CancellationToken,
}

fn harness(config: SessionConfig) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let registry = Arc::new(SessionRegistry::new());
    let pending = PendingRequests::new();
    let shutdown = CancellationToken::new();

    Harness {
        dispatcher: Dispatcher::new(registry.clone(), pending.clone()),
        handler: SessionHandler::new(registry.clone(), pending, config, shutdown.clone()),
        registry,
        shutdown,
    }
}

struct Client {
    sink: MemorySink,
    source: MemorySource,
    session: JoinHandle<CloseReason>,
    subdomain: String,
}

/// Open a control channel and consume the `subdomain_assigned` announcement
async fn connect(h: &Harness, requested: Option<&str>) -> Client {
    let (relay_end, client_end) = MemoryTransport::pair();
    let handler = h.handler.clone();
    let requested = requested.map(str::to_string);

    let session =
        tokio::spawn(async move { handler.handle_connection(relay_end, None, requested).await });

    let (sink, mut source) = client_end.split();
    let subdomain = match source.recv_message().await.unwrap() {
        Some(ControlMessage::SubdomainAssigned { subdomain, .. }) => subdomain,
        other => panic!("Expected subdomain_assigned, got {:?}", other),
    };

    Client {
        sink,
        source,
        session,
        subdomain,
    }
}

fn get(path: &str) -> IncomingRequest {
    IncomingRequest {
        method: "GET".to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_handshake_registers_active_session() {
    let h = harness(SessionConfig::default());
    let client = connect(&h, None).await;

    assert_eq!(client.subdomain.len(), 8);
    let session = h.registry.lookup(&client.subdomain).unwrap();
    assert_eq!(session.status(), SessionStatus::Active);
    assert_eq!(h.registry.active_count(), 1);

    drop(client.sink);
    drop(client.source);
    assert_eq!(client.session.await.unwrap(), CloseReason::PeerClosed);

    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(h.registry.lookup(&client.subdomain).is_none());
    assert!(!h.registry.is_taken(&client.subdomain));
}

#[tokio::test]
async fn test_forwarded_request_round_trip() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, Some("abcd1234")).await;

    let dispatcher = h.dispatcher.clone();
    let call =
        tokio::spawn(async move { dispatcher.forward("abcd1234.example.com", get("/foo")).await });

    let frame = match client.source.recv_message().await.unwrap() {
        Some(ControlMessage::Request(frame)) => frame,
        other => panic!("Expected request, got {:?}", other),
    };
    assert_eq!(frame.method, "GET");
    assert_eq!(frame.path, "/foo");

    client
        .sink
        .send_message(&ControlMessage::Response(ResponseFrame::text(
            frame.id, 200, "ok",
        )))
        .await
        .unwrap();

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");
}

#[tokio::test]
async fn test_taken_subdomain_is_rejected_with_disconnect() {
    let h = harness(SessionConfig::default());
    let _first = connect(&h, Some("my-app")).await;

    let (relay_end, client_end) = MemoryTransport::pair();
    let reason = h
        .handler
        .handle_connection(relay_end, None, Some("my-app".to_string()))
        .await;
    assert!(matches!(reason, CloseReason::Rejected(_)));

    let (_sink, mut source) = client_end.split();
    match source.recv_message().await.unwrap() {
        Some(ControlMessage::Disconnect { reason }) => assert!(reason.contains("my-app")),
        other => panic!("Expected disconnect, got {:?}", other),
    }
    assert_eq!(source.recv_message().await.unwrap(), None);

    // The original holder is untouched
    assert!(h.registry.lookup("my-app").unwrap().is_active());
}

#[tokio::test]
async fn test_channel_loss_fails_all_pending_callers() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, Some("abcd1234")).await;

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let dispatcher = h.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .forward("abcd1234.example.com", get(&format!("/slow/{}", i)))
                    .await
            })
        })
        .collect();

    // All three are in flight once their frames reach the client
    for _ in 0..3 {
        assert!(matches!(
            client.source.recv_message().await.unwrap(),
            Some(ControlMessage::Request(_))
        ));
    }
    assert_eq!(h.dispatcher.pending_requests(), 3);

    drop(client.sink);
    drop(client.source);

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("caller must not block after channel loss")
            .unwrap();
        assert!(matches!(result, Err(DispatchError::ChannelClosed(_))));
    }

    assert_eq!(client.session.await.unwrap(), CloseReason::PeerClosed);
    assert_eq!(h.dispatcher.pending_requests(), 0);
    assert_eq!(h.dispatcher.pending().session_count(), 0);
    assert_eq!(h.registry.active_count(), 0);
}

#[tokio::test]
async fn test_client_heartbeat_is_acknowledged() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, None).await;

    client
        .sink
        .send_message(&ControlMessage::Heartbeat { timestamp: 42 })
        .await
        .unwrap();

    assert_eq!(
        client.source.recv_message().await.unwrap(),
        Some(ControlMessage::HeartbeatAck { timestamp: 42 })
    );
}

#[tokio::test]
async fn test_malformed_and_unexpected_frames_keep_session_alive() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, None).await;

    client.sink.send_raw("{\"type\":\"bogus\"}").await.unwrap();
    client.sink.send_raw("not even json").await.unwrap();
    client
        .sink
        .send_message(&ControlMessage::SubdomainAssigned {
            subdomain: "hijack".to_string(),
            public_url: None,
        })
        .await
        .unwrap();
    // Response for a request that was never sent
    client
        .sink
        .send_message(&ControlMessage::Response(ResponseFrame::text(
            RequestId(99),
            200,
            "stray",
        )))
        .await
        .unwrap();

    client
        .sink
        .send_message(&ControlMessage::Heartbeat { timestamp: 7 })
        .await
        .unwrap();
    assert_eq!(
        client.source.recv_message().await.unwrap(),
        Some(ControlMessage::HeartbeatAck { timestamp: 7 })
    );

    assert!(h.registry.lookup(&client.subdomain).unwrap().is_active());
    assert!(h.registry.lookup("hijack").is_none());
    assert_eq!(h.dispatcher.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_silent_client_is_closed_after_idle_timeout() {
    let h = harness(SessionConfig {
        heartbeat_interval: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    let mut client = connect(&h, None).await;

    // The relay keeps pinging; the client never answers
    let mut heartbeats = 0;
    while let Some(frame) = client.source.recv_message().await.unwrap() {
        match frame {
            ControlMessage::Heartbeat { .. } => heartbeats += 1,
            other => panic!("Unexpected frame {:?}", other),
        }
    }

    assert!(heartbeats >= 2, "saw {} heartbeats", heartbeats);
    assert_eq!(client.session.await.unwrap(), CloseReason::IdleTimeout);
    assert!(h.registry.lookup(&client.subdomain).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeats_keep_session_open() {
    let h = harness(SessionConfig {
        heartbeat_interval: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    let mut client = connect(&h, None).await;

    // Six heartbeats span a minute, twice the idle timeout
    for _ in 0..6 {
        match client.source.recv_message().await.unwrap() {
            Some(ControlMessage::Heartbeat { timestamp }) => client
                .sink
                .send_message(&ControlMessage::HeartbeatAck { timestamp })
                .await
                .unwrap(),
            other => panic!("Expected heartbeat, got {:?}", other),
        }
    }

    assert!(h.registry.lookup(&client.subdomain).unwrap().is_active());
}

#[tokio::test]
async fn test_client_disconnect_unregisters() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, Some("leaving")).await;

    client
        .sink
        .send_message(&ControlMessage::Disconnect {
            reason: "user quit".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        client.session.await.unwrap(),
        CloseReason::PeerDisconnect("user quit".to_string())
    );
    assert!(h.registry.lookup("leaving").is_none());

    // The name is free again
    let again = connect(&h, Some("leaving")).await;
    assert_eq!(again.subdomain, "leaving");
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_requests() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, Some("abcd1234")).await;

    let dispatcher = h.dispatcher.clone();
    let call =
        tokio::spawn(async move { dispatcher.forward("abcd1234.example.com", get("/")).await });

    let frame = match client.source.recv_message().await.unwrap() {
        Some(ControlMessage::Request(frame)) => frame,
        other => panic!("Expected request, got {:?}", other),
    };

    h.shutdown.cancel();

    match client.source.recv_message().await.unwrap() {
        Some(ControlMessage::Disconnect { reason }) => assert_eq!(reason, "relay shutting down"),
        other => panic!("Expected disconnect, got {:?}", other),
    }

    // New work is refused while draining
    let refused = h
        .dispatcher
        .forward("abcd1234.example.com", get("/late"))
        .await
        .unwrap_err();
    assert_eq!(
        refused,
        DispatchError::SessionUnavailable("abcd1234".to_string())
    );

    // The in-flight request still completes
    client
        .sink
        .send_message(&ControlMessage::Response(ResponseFrame::text(
            frame.id, 200, "done",
        )))
        .await
        .unwrap();

    assert_eq!(call.await.unwrap().unwrap().body, b"done");
    assert_eq!(client.session.await.unwrap(), CloseReason::Shutdown);
    assert_eq!(h.registry.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_client_is_closed_after_idle_timeout() {
    let h = harness(SessionConfig {
        heartbeat_interval: Duration::from_millis(1),
        idle_timeout: Duration::from_secs(1),
        outbound_queue: 1,
        ..Default::default()
    });
    // Connected, but never reads or writes again; heartbeats pile up until
    // both the transport and the outbound queue are full
    let client = connect(&h, Some("stalled")).await;

    let reason = tokio::time::timeout(Duration::from_secs(10), client.session)
        .await
        .expect("stalled session must still hit its idle timeout")
        .unwrap();
    assert_eq!(reason, CloseReason::IdleTimeout);
    assert!(h.registry.lookup("stalled").is_none());
    assert!(!h.registry.is_taken("stalled"));

    drop(client.sink);
    drop(client.source);
}

#[tokio::test(start_paused = true)]
async fn test_client_that_stops_reading_fails_the_writer() {
    let h = harness(SessionConfig {
        heartbeat_interval: Duration::from_millis(1),
        idle_timeout: Duration::from_secs(60),
        write_timeout: Duration::from_secs(2),
        outbound_queue: 1,
        ..Default::default()
    });
    let Client {
        mut sink,
        source,
        session,
        ..
    } = connect(&h, Some("deaf")).await;

    // Still talking, so the session never goes idle, but nothing is read
    let chatter = tokio::spawn(async move {
        let mut timestamp = 0;
        loop {
            timestamp += 1;
            let beat = ControlMessage::Heartbeat { timestamp };
            if sink.send_message(&beat).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let reason = tokio::time::timeout(Duration::from_secs(10), session)
        .await
        .expect("blocked writer must be detected")
        .unwrap();
    assert_eq!(reason, CloseReason::WriterFailed);
    assert!(h.registry.lookup("deaf").is_none());

    chatter.await.unwrap();
    drop(source);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_closes_stalled_client() {
    let h = harness(SessionConfig {
        heartbeat_interval: Duration::from_millis(1),
        idle_timeout: Duration::from_secs(60),
        drain_timeout: Duration::from_secs(1),
        outbound_queue: 1,
        ..Default::default()
    });
    let client = connect(&h, Some("stuck")).await;

    // Let the heartbeats fill every buffer first
    tokio::time::sleep(Duration::from_millis(500)).await;
    h.shutdown.cancel();

    let reason = tokio::time::timeout(Duration::from_secs(5), client.session)
        .await
        .expect("shutdown must not wait on a stalled client")
        .unwrap();
    assert_eq!(reason, CloseReason::Shutdown);
    assert_eq!(h.registry.active_count(), 0);

    drop(client.sink);
    drop(client.source);
}

#[tokio::test]
async fn test_unencodable_request_fails_alone() {
    let h = harness(SessionConfig::default());
    let mut client = connect(&h, Some("abcd1234")).await;

    // Base64 pushes this past the frame limit
    let oversized = IncomingRequest {
        method: "POST".to_string(),
        path: "/upload".to_string(),
        body: vec![0u8; 13 * 1024 * 1024],
        ..Default::default()
    };
    let response = tokio::time::timeout(
        Duration::from_secs(5),
        h.dispatcher.forward("abcd1234.example.com", oversized),
    )
    .await
    .expect("caller must be answered")
    .unwrap();
    assert_eq!(response.status, 502);
    assert_eq!(h.dispatcher.pending_requests(), 0);

    // The channel itself is still usable
    client
        .sink
        .send_message(&ControlMessage::Heartbeat { timestamp: 9 })
        .await
        .unwrap();
    assert_eq!(
        client.source.recv_message().await.unwrap(),
        Some(ControlMessage::HeartbeatAck { timestamp: 9 })
    );
    assert!(h.registry.lookup("abcd1234").unwrap().is_active());
}
