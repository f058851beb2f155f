use std::{net::SocketAddr, time::Duration};

use beach_pier_core::{ErrorCode, Message, MessageType, ID_TAKEN_TEXT};
use beach_pier_server::{
    events::Disconnect, websocket::ID_TAKEN_GRACE, RelayState, ServerConfig,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{sleep, timeout, Instant},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEY: &str = "K";
const STEP: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn spawn_relay(limit: usize) -> (SocketAddr, RelayState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let state = RelayState::new(ServerConfig {
        listen_addr: addr,
        key: KEY.to_string(),
        concurrent_limit: limit,
        ..ServerConfig::default()
    });
    let serve_state = state.clone();
    tokio::spawn(async move {
        let _ = beach_pier_server::serve(listener, serve_state, std::future::pending()).await;
    });
    (addr, state)
}

async fn dial(addr: SocketAddr, query: &str) -> Ws {
    let url = format!("ws://{addr}/peerjs?{query}");
    let (ws, _) = timeout(STEP, connect_async(url))
        .await
        .expect("connect timed out")
        .expect("websocket connect");
    ws
}

async fn connect(addr: SocketAddr, id: &str, token: &str) -> Ws {
    dial(addr, &format!("id={id}&token={token}&key={KEY}")).await
}

/// Next text frame, or `None` once the server closes the socket.
async fn next_text(ws: &mut Ws) -> Option<String> {
    loop {
        match timeout(STEP, ws.next()).await.expect("timed out waiting for frame") {
            Some(Ok(WsMessage::Text(text))) => return Some(text),
            Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_message(ws: &mut Ws) -> Option<Message> {
    next_text(ws)
        .await
        .map(|text| Message::from_json(&text).expect("decode server frame"))
}

async fn expect_open(ws: &mut Ws) {
    let message = next_message(ws).await.expect("OPEN frame");
    assert_eq!(message.kind, MessageType::Open);
}

/// Asserts that no text frame arrives for a short while.
async fn expect_quiet(ws: &mut Ws) {
    let deadline = Instant::now() + QUIET;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(WsMessage::Text(text)))) => panic!("unexpected frame: {text}"),
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return,
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(WsMessage::Text(value.to_string()))
        .await
        .expect("send frame");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + STEP;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_client_receives_exactly_one_open() {
    let (addr, state) = spawn_relay(10).await;

    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;

    assert_eq!(state.registry.len(), 1);
    assert!(state.registry.get_by_id("a").is_some());
    expect_quiet(&mut a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offer_is_relayed_with_server_stamped_source() {
    let (addr, _state) = spawn_relay(10).await;
    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;
    let mut b = connect(addr, "b", "tb").await;
    expect_open(&mut b).await;

    send_json(
        &mut a,
        json!({"type": "offer", "src": "forged", "dst": "b", "payload": {"sdp": "x"}}),
    )
    .await;

    let received: Value =
        serde_json::from_str(&next_text(&mut b).await.expect("relayed frame")).unwrap();
    assert_eq!(
        received,
        json!({"type": "offer", "src": "a", "dst": "b", "payload": {"sdp": "x"}})
    );
    expect_quiet(&mut a).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_rejections_send_error_then_close() {
    let (addr, state) = spawn_relay(10).await;

    let cases = [
        ("id=a&key=K", ErrorCode::InvalidParameters),
        ("id=a&token=&key=K", ErrorCode::InvalidParameters),
        ("id=a&token=ta&key=wrong", ErrorCode::InvalidKey),
    ];
    for (query, code) in cases {
        let mut ws = dial(addr, query).await;
        let message = next_message(&mut ws).await.expect("ERROR frame");
        assert_eq!(message.kind, MessageType::Error, "query {query}");
        assert_eq!(message.payload_text().and_then(ErrorCode::from_text), Some(code));
        assert!(next_text(&mut ws).await.is_none(), "socket should close");
    }

    assert!(state.registry.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connection_limit_rejects_new_ids() {
    let (addr, state) = spawn_relay(1).await;
    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;

    let mut b = connect(addr, "b", "tb").await;
    let message = next_message(&mut b).await.expect("ERROR frame");
    assert_eq!(message.kind, MessageType::Error);
    assert_eq!(
        message.payload_text().and_then(ErrorCode::from_text),
        Some(ErrorCode::ConnectionLimitExceeded)
    );
    assert!(next_text(&mut b).await.is_none());

    assert_eq!(state.registry.list_ids(), vec!["a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mismatched_token_gets_id_taken_and_leaves_original_alone() {
    let (addr, state) = spawn_relay(10).await;
    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;
    let original = state
        .registry
        .get_by_id("a")
        .and_then(|c| c.connection_id())
        .expect("bound connection");

    let mut imposter = connect(addr, "a", "stolen").await;
    let message = next_message(&mut imposter).await.expect("ID-TAKEN frame");
    assert_eq!(message.kind, MessageType::IdTaken);
    assert_eq!(message.payload_text(), Some(ID_TAKEN_TEXT));
    let notified_at = Instant::now();
    assert!(next_text(&mut imposter).await.is_none(), "imposter should be closed");
    let grace = notified_at.elapsed();
    assert!(
        grace >= ID_TAKEN_GRACE - Duration::from_millis(20),
        "closed only {grace:?} after ID-TAKEN"
    );

    let client = state.registry.get_by_id("a").expect("original entry");
    assert!(client.token_matches("ta"));
    assert!(client.is_bound_to(original));
    assert_eq!(state.registry.len(), 1);

    let mut b = connect(addr, "b", "tb").await;
    expect_open(&mut b).await;
    send_json(&mut b, json!({"type": "ANSWER", "dst": "a", "payload": {"sdp": "y"}})).await;
    let relayed = next_message(&mut a).await.expect("relayed answer");
    assert_eq!(relayed.kind, MessageType::Answer);
    assert_eq!(relayed.src.as_deref(), Some("b"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnect_rebinds_without_resending_open() {
    let (addr, state) = spawn_relay(10).await;
    let (tx, mut disconnects) = mpsc::unbounded_channel::<Disconnect>();
    state
        .events
        .disconnected
        .subscribe(move |event: &Disconnect| {
            let _ = tx.send(event.clone());
        });

    let mut old = connect(addr, "a", "ta").await;
    expect_open(&mut old).await;
    let old_id = state
        .registry
        .get_by_id("a")
        .and_then(|c| c.connection_id())
        .expect("bound connection");

    // Reconnecting clients do not get a second OPEN. This mirrors the
    // established protocol; clients treat the absence of ERROR/ID-TAKEN as
    // success.
    let mut new = connect(addr, "a", "ta").await;
    let registry = state.registry.clone();
    wait_until(|| {
        registry
            .get_by_id("a")
            .and_then(|c| c.connection_id())
            .is_some_and(|id| id != old_id)
    })
    .await;
    expect_quiet(&mut new).await;

    let mut b = connect(addr, "b", "tb").await;
    expect_open(&mut b).await;
    send_json(&mut b, json!({"type": "CANDIDATE", "dst": "a", "payload": {"c": 1}})).await;
    let relayed = next_message(&mut new).await.expect("relayed to new connection");
    assert_eq!(relayed.kind, MessageType::Candidate);
    expect_quiet(&mut old).await;

    old.close(None).await.expect("close old connection");
    let event = timeout(STEP, disconnects.recv())
        .await
        .expect("disconnect event")
        .expect("event channel open");
    assert_eq!(event.connection, old_id);
    assert!(!event.evicted);
    assert_eq!(state.registry.list_ids(), vec!["a", "b"]);

    send_json(&mut b, json!({"type": "CANDIDATE", "dst": "a", "payload": {"c": 2}})).await;
    let relayed = next_message(&mut new).await.expect("still routed to new connection");
    assert_eq!(relayed.payload, json!({"c": 2}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_do_not_drop_the_connection() {
    let (addr, state) = spawn_relay(10).await;
    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;
    let mut b = connect(addr, "b", "tb").await;
    expect_open(&mut b).await;

    a.send(WsMessage::Text("{definitely not json".into()))
        .await
        .expect("send garbage");
    a.send(WsMessage::Binary(vec![0xff, 0x00]))
        .await
        .expect("send binary garbage");
    send_json(&mut a, json!({"type": "HEARTBEAT"})).await;
    send_json(&mut a, json!({"type": "OFFER", "dst": "b"})).await;

    let relayed = next_message(&mut b).await.expect("offer after garbage");
    assert_eq!(relayed.kind, MessageType::Offer);
    assert_eq!(state.registry.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_destination_is_dropped_quietly() {
    let (addr, state) = spawn_relay(10).await;
    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;

    send_json(&mut a, json!({"type": "OFFER", "dst": "nobody"})).await;
    send_json(&mut a, json!({"type": "OFFER"})).await;
    expect_quiet(&mut a).await;
    assert_eq!(state.registry.list_ids(), vec!["a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_removes_the_client() {
    let (addr, state) = spawn_relay(10).await;
    let mut a = connect(addr, "a", "ta").await;
    expect_open(&mut a).await;
    assert_eq!(state.registry.len(), 1);

    a.close(None).await.expect("close");
    let registry = state.registry.clone();
    wait_until(|| registry.is_empty()).await;

    // the id is free again
    let mut again = connect(addr, "a", "other-token").await;
    expect_open(&mut again).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_handshakes_for_one_id_admit_exactly_one() {
    let (addr, state) = spawn_relay(10).await;

    let attempts: Vec<_> = (0..8)
        .map(|n| {
            tokio::spawn(async move {
                let mut ws = connect(addr, "dup", &format!("token-{n}")).await;
                let kind = next_message(&mut ws).await.map(|m| m.kind);
                (kind, ws)
            })
        })
        .collect();

    let mut opens = 0;
    let mut taken = 0;
    let mut sockets = Vec::new();
    for attempt in attempts {
        let (kind, ws) = attempt.await.expect("join");
        match kind {
            Some(MessageType::Open) => opens += 1,
            Some(MessageType::IdTaken) => taken += 1,
            other => panic!("unexpected handshake result {other:?}"),
        }
        sockets.push(ws);
    }

    assert_eq!(opens, 1);
    assert_eq!(taken, 7);
    assert_eq!(state.registry.len(), 1);
}
