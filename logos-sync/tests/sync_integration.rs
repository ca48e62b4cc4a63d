//! Integration tests for the full client pipeline against a scripted relay.
//!
//! Each test starts a real WebSocket relay on a free port that answers the
//! join handshake, pages history, acknowledges operations, and can drop the
//! connection on demand to exercise reconnection.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use logos_sync::{
    CollabSession, LogicalTimestamp, ManualTimeSource, MemoryReplica, Message, Operation,
    OperationKind, PeerInfo, PropertyPath, Role, SequentialIdGenerator, SessionConfig,
    SessionEvent, SyncEvent,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Relay {
    port: u16,
    /// Every frame the relay received, tagged with the connection number.
    received: mpsc::UnboundedReceiver<(usize, Message)>,
    /// Close every open connection.
    kick: broadcast::Sender<()>,
}

impl Relay {
    fn url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.port)
    }

    async fn next_frame(&mut self) -> (usize, Message) {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("relay frame within timeout")
            .expect("relay running")
    }

    /// Skip keepalive and presence traffic.
    async fn next_protocol_frame(&mut self) -> (usize, Message) {
        loop {
            let (conn, msg) = self.next_frame().await;
            if !matches!(msg, Message::Ping { .. } | Message::Presence { .. }) {
                return (conn, msg);
            }
        }
    }
}

/// Answer one client frame the way the relay would.
fn respond(msg: &Message, history: &[Operation]) -> Vec<Message> {
    match msg {
        Message::Hello { client_id, .. } => vec![Message::HelloAck {
            clients: vec![
                PeerInfo::new(client_id.clone(), "Alice"),
                PeerInfo::new("peer-2", "Bob").with_color("#336699"),
            ],
        }],
        Message::SyncRequest { since: None } if history.len() > 1 => vec![Message::SyncResponse {
            operations: history[..1].to_vec(),
            complete: false,
            next_cursor: Some(history[0].timestamp().clone()),
        }],
        Message::SyncRequest { since } => {
            let rest = history
                .iter()
                .filter(|op| since.as_ref().map_or(true, |s| op.timestamp() > s))
                .cloned()
                .collect();
            vec![Message::SyncResponse {
                operations: rest,
                complete: true,
                next_cursor: None,
            }]
        }
        Message::Operation { operation } => vec![Message::OperationAck {
            operation_id: operation.id().to_string(),
            success: true,
            error: None,
        }],
        Message::Ping { timestamp } => vec![Message::pong(*timestamp)],
        _ => vec![],
    }
}

async fn start_relay(history: Vec<Operation>) -> Relay {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (kick, _) = broadcast::channel(4);
    let kicker = kick.clone();
    let history = Arc::new(history);

    tokio::spawn(async move {
        let mut conn = 0;
        while let Ok((stream, _)) = listener.accept().await {
            conn += 1;
            let received_tx = received_tx.clone();
            let mut kicked = kicker.subscribe();
            let history = history.clone();
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut sink, mut frames) = ws.split();
                loop {
                    tokio::select! {
                        frame = frames.next() => {
                            let Some(Ok(frame)) = frame else { break };
                            let WsMessage::Text(text) = frame else { continue };
                            let msg = Message::decode(text.as_str()).unwrap();
                            for reply in respond(&msg, &history) {
                                let frame = WsMessage::Text(reply.encode().unwrap().into());
                                if sink.send(frame).await.is_err() {
                                    return;
                                }
                            }
                            let _ = received_tx.send((conn, msg));
                        }
                        _ = kicked.recv() => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                    }
                }
            });
        }
    });

    Relay {
        port,
        received,
        kick,
    }
}

fn bob_op(id: &str, counter: u64, fill: &str) -> Operation {
    Operation::new(
        id,
        "bob",
        "doc-1",
        LogicalTimestamp::new(counter, "peer-2"),
        OperationKind::update("n1", PropertyPath::new(["fill"]), json!(null), json!(fill)),
    )
}

fn session(url: String) -> CollabSession<MemoryReplica> {
    let mut config = SessionConfig {
        user_id: "alice".into(),
        role: Role::Editor,
        ..SessionConfig::default()
    };
    config.transport.url = url;
    config.transport.reconnect_base_delay = Duration::from_millis(50);
    config.transport.reconnect_max_delay = Duration::from_millis(200);
    config.sync.document_id = "doc-1".into();
    config.sync.user_name = "Alice".into();
    config.sync.client_id = Some("client-a".into());

    let mut replica = MemoryReplica::new();
    replica.insert("root", "n1", json!({ "fill": "#000" }));
    CollabSession::with_sources(
        config,
        replica,
        Arc::new(SequentialIdGenerator::new("op")),
        Arc::new(ManualTimeSource::new(0)),
    )
}

async fn wait_for<E: Clone>(
    events: &mut logos_sync::Subscription<E>,
    mut pred: impl FnMut(&E) -> bool,
) -> E {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event within timeout")
}

fn fill(session: &CollabSession<MemoryReplica>) -> serde_json::Value {
    session
        .bridge()
        .with_replica(|r| r.node("n1").map(|n| n["fill"].clone()))
        .unwrap()
}

// ─── Handshake & history ─────────────────────────────────────────

#[tokio::test]
async fn test_join_replays_paginated_history() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut relay = start_relay(vec![bob_op("b1", 3, "#111"), bob_op("b2", 8, "#222")]).await;
    let session = session(relay.url());
    let mut events = session.subscribe();

    session.connect().await.unwrap();

    let synced = wait_for(&mut events, |e| matches!(e, SessionEvent::Synced { .. })).await;
    assert_eq!(
        synced,
        SessionEvent::Synced {
            cursor: Some(LogicalTimestamp::new(8, "peer-2"))
        }
    );
    assert_eq!(fill(&session), json!("#222"));
    assert_eq!(session.sync().clock().counter, 8);

    let bob = session.presence().remote("peer-2").unwrap();
    assert_eq!(bob.user_name, "Bob");
    assert_eq!(bob.color, "#336699");
    assert!(session.presence().remote("client-a").is_none());

    let (_, hello) = relay.next_protocol_frame().await;
    assert!(matches!(hello, Message::Hello { ref client_id, .. } if client_id == "client-a"));
    let (_, first) = relay.next_protocol_frame().await;
    assert_eq!(first, Message::sync_request(None));
    let (_, second) = relay.next_protocol_frame().await;
    assert_eq!(second, Message::sync_request(Some(LogicalTimestamp::new(3, "peer-2"))));
}

#[tokio::test]
async fn test_submitted_operation_is_acknowledged() {
    let relay = start_relay(vec![]).await;
    let session = session(relay.url());
    let mut events = session.subscribe();
    session.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::Synced { .. })).await;

    let waiter = session
        .submit(OperationKind::update(
            "n1",
            PropertyPath::new(["fill"]),
            json!("#000"),
            json!("#fff"),
        ))
        .unwrap();
    assert_eq!(fill(&session), json!("#fff"));

    waiter.wait_timeout(Duration::from_secs(5)).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while !session.pending().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_queued_operation_follows_hello() {
    let mut relay = start_relay(vec![]).await;
    let session = session(relay.url());

    let _waiter = session
        .submit(OperationKind::delete("n1"))
        .unwrap();
    assert_eq!(session.sync().transport().queued_len(), 1);

    session.connect().await.unwrap();

    let (_, first) = relay.next_protocol_frame().await;
    assert_eq!(first.type_name(), "HELLO");
    let (_, second) = relay.next_protocol_frame().await;
    assert!(matches!(second, Message::Operation { ref operation } if operation.id() == "op-1"));
}

// ─── Reconnection ────────────────────────────────────────────────

#[tokio::test]
async fn test_reconnects_and_resumes_from_cursor() {
    let mut relay = start_relay(vec![bob_op("b1", 3, "#111"), bob_op("b2", 8, "#222")]).await;
    let session = session(relay.url());
    let mut events = session.sync().subscribe();
    session.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncComplete { .. })).await;

    relay.kick.send(()).unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Disconnected { .. })).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;
    wait_for(&mut events, |e| matches!(e, SyncEvent::SyncComplete { .. })).await;
    assert_eq!(session.sync().transport().reconnect_attempts(), 0);

    let mut second_conn = Vec::new();
    while second_conn.len() < 2 {
        let (conn, msg) = relay.next_protocol_frame().await;
        if conn == 2 {
            second_conn.push(msg);
        }
    }
    assert_eq!(second_conn[0].type_name(), "HELLO");
    assert_eq!(
        second_conn[1],
        Message::sync_request(Some(LogicalTimestamp::new(8, "peer-2")))
    );
}

#[tokio::test]
async fn test_disconnect_does_not_reconnect() {
    let relay = start_relay(vec![]).await;
    let session = session(relay.url());
    let mut events = session.sync().subscribe();
    session.connect().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SyncEvent::Connected { .. })).await;

    session.disconnect();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!events
        .drain()
        .iter()
        .any(|e| matches!(e, SyncEvent::Connected { .. })));
    assert!(!session.sync().transport().is_connected());
}

#[tokio::test]
async fn test_connect_to_dead_port_fails_without_retry() {
    let port = free_port().await;
    let session = session(format!("ws://127.0.0.1:{port}"));
    assert!(session.connect().await.is_err());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.sync().transport().reconnect_attempts(), 0);
}
