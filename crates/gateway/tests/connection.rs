//! End-to-end connection lifecycle tests against an in-process server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use {
    futures::{SinkExt, StreamExt},
    loon_gateway::{BackoffConfig, GatewayConfig, GatewayManager, GatewayState},
    serde_json::{json, Value},
    std::time::Duration,
    tokio::{
        net::{TcpListener, TcpStream},
        sync::watch,
        time::timeout,
    },
    tokio_tungstenite::{
        accept_async,
        tungstenite::{
            protocol::{frame::coding::CloseCode, CloseFrame},
            Message, Utf8Bytes,
        },
        WebSocketStream,
    },
};

type Ws = WebSocketStream<TcpStream>;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Ws {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .unwrap();
    accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Reads frames until one with the given opcode shows up; heartbeats and
/// other traffic in between are skipped.
async fn read_until_op(ws: &mut Ws, op: u64) -> Value {
    loop {
        let frame = next_json(ws).await;
        if frame["op"] == json!(op) {
            return frame;
        }
    }
}

async fn wait_for(rx: &mut watch::Receiver<GatewayState>, target: GatewayState) {
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
        .await
        .expect("timed out waiting for a state transition")
        .unwrap();
}

fn test_config(url: &str) -> GatewayConfig {
    GatewayConfig {
        gateway_url: url.to_string(),
        send_interval_ms: 5,
        ack_grace_ms: 30,
        ack_tolerance_ms: 20,
        backoff: BackoffConfig {
            coefficient: 0,
            min_backoff_ms: 0,
            ..BackoffConfig::default()
        },
        ..GatewayConfig::default()
    }
}

fn hello(interval_ms: u64) -> Value {
    json!({ "op": 10, "d": { "heartbeat_interval": interval_ms } })
}

#[tokio::test]
async fn hello_identify_ready_heartbeat() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-a", test_config(&url));
    let mut state = manager.state_watch();

    manager.connect();
    let mut ws = accept(&listener).await;
    wait_for(&mut state, GatewayState::Configured).await;

    send_json(&mut ws, hello(100)).await;
    let identify = read_until_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["token"], json!("token-a"));
    // The session is acknowledged only by a ready dispatch, not by identify.
    assert_eq!(manager.state(), GatewayState::Configured);

    send_json(
        &mut ws,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "abc" } }),
    )
    .await;
    wait_for(&mut state, GatewayState::Connected).await;

    // A heartbeat arrives within the announced interval; it carries the last
    // seen sequence, or null when it fired before the first dispatch.
    let heartbeat = timeout(Duration::from_millis(300), read_until_op(&mut ws, 1))
        .await
        .expect("no heartbeat within the interval");
    assert!(heartbeat["d"] == json!(1) || heartbeat["d"].is_null());
}

#[tokio::test]
async fn unacknowledged_heartbeats_force_a_reconnect() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-b", test_config(&url));

    manager.connect();
    let mut first = accept(&listener).await;
    send_json(&mut first, hello(50)).await;
    let _identify = read_until_op(&mut first, 2).await;

    // Never ack anything; the liveness monitor replaces the connection.
    let mut second = accept(&listener).await;
    send_json(&mut second, hello(50)).await;
    let identify = read_until_op(&mut second, 2).await;
    assert_eq!(identify["d"]["token"], json!("token-b"));
}

#[tokio::test]
async fn terminal_close_sticks_until_explicit_connect() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-c", test_config(&url));
    let mut state = manager.state_watch();

    manager.connect();
    let mut ws = accept(&listener).await;
    wait_for(&mut state, GatewayState::Configured).await;
    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4004),
        reason: Utf8Bytes::from_static("authentication failed"),
    })))
    .await
    .unwrap();

    wait_for(&mut state, GatewayState::Stopped).await;
    // No autonomous reconnection after a terminal close.
    assert!(
        timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err()
    );

    // An explicit connect starts over.
    manager.connect();
    let _ws = accept(&listener).await;
    wait_for(&mut state, GatewayState::Configured).await;
}

#[tokio::test]
async fn resume_is_preferred_after_a_recoverable_close() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-d", test_config(&url));
    let mut state = manager.state_watch();

    manager.connect();
    let mut first = accept(&listener).await;
    send_json(&mut first, hello(60_000)).await;
    let _identify = read_until_op(&mut first, 2).await;
    send_json(
        &mut first,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "abc" } }),
    )
    .await;
    wait_for(&mut state, GatewayState::Connected).await;

    first
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(1001),
            reason: Utf8Bytes::from_static("going away"),
        })))
        .await
        .unwrap();

    let mut second = accept(&listener).await;
    send_json(&mut second, hello(60_000)).await;
    let resume = read_until_op(&mut second, 6).await;
    assert_eq!(resume["d"]["session_id"], json!("abc"));
    assert_eq!(resume["d"]["seq"], json!(1));
    assert_eq!(resume["d"]["token"], json!("token-d"));

    send_json(&mut second, json!({ "op": 0, "t": "RESUMED", "s": 2 })).await;
    wait_for(&mut state, GatewayState::Connected).await;
}

#[tokio::test]
async fn non_resumable_invalid_session_falls_back_to_identify() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-e", test_config(&url));
    let mut state = manager.state_watch();

    manager.connect();
    let mut first = accept(&listener).await;
    send_json(&mut first, hello(60_000)).await;
    let _identify = read_until_op(&mut first, 2).await;
    send_json(
        &mut first,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "abc" } }),
    )
    .await;
    wait_for(&mut state, GatewayState::Connected).await;

    send_json(&mut first, json!({ "op": 9, "d": false })).await;

    // The replacement connection identifies from scratch.
    let mut second = accept(&listener).await;
    send_json(&mut second, hello(60_000)).await;
    loop {
        let frame = next_json(&mut second).await;
        if frame["op"] == json!(1) {
            continue;
        }
        assert_eq!(frame["op"], json!(2));
        break;
    }
}

#[tokio::test]
async fn connect_while_live_closes_the_previous_socket() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-h", test_config(&url));
    let mut state = manager.state_watch();

    manager.connect();
    let mut first = accept(&listener).await;
    send_json(&mut first, hello(60_000)).await;
    let _identify = read_until_op(&mut first, 2).await;
    send_json(
        &mut first,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "abc" } }),
    )
    .await;
    wait_for(&mut state, GatewayState::Connected).await;

    manager.connect();
    // The superseded socket gets a close frame instead of lingering until the
    // server times it out.
    let close = timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(frame))) => return frame,
                Some(Ok(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("previous socket never closed");
    assert_eq!(close.map(|f| u16::from(f.code)), Some(4000));

    // The replacement connection comes up on its own.
    let mut second = accept(&listener).await;
    send_json(&mut second, hello(60_000)).await;
    let resume = read_until_op(&mut second, 6).await;
    assert_eq!(resume["d"]["session_id"], json!("abc"));
}

#[tokio::test]
async fn subscribers_see_dispatches() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-f", test_config(&url));
    let mut events = manager.subscribe();
    let mut state = manager.state_watch();

    manager.connect();
    let mut ws = accept(&listener).await;
    send_json(&mut ws, hello(60_000)).await;
    let _identify = read_until_op(&mut ws, 2).await;
    send_json(
        &mut ws,
        json!({ "op": 0, "t": "READY", "s": 1, "d": { "session_id": "abc" } }),
    )
    .await;
    wait_for(&mut state, GatewayState::Connected).await;
    send_json(
        &mut ws,
        json!({ "op": 0, "t": "MESSAGE_CREATE", "s": 2, "d": { "content": "hi" } }),
    )
    .await;

    let dispatched = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.next().await.expect("event stream ended");
            if event.dispatch_name() == Some("MESSAGE_CREATE") {
                return event;
            }
        }
    })
    .await
    .expect("dispatch never reached subscribers");
    assert_eq!(dispatched.s, Some(2));
}

#[tokio::test]
async fn undecodable_frames_surface_out_of_band() {
    let (listener, url) = bind().await;
    let manager = GatewayManager::new("token-g", test_config(&url));
    let mut failures = manager.subscribe_decode_failures();
    let mut state = manager.state_watch();

    manager.connect();
    let mut ws = accept(&listener).await;
    wait_for(&mut state, GatewayState::Configured).await;
    ws.send(Message::text("{not json")).await.unwrap();

    let failure = timeout(Duration::from_secs(5), failures.next())
        .await
        .expect("decode failure never surfaced")
        .unwrap();
    assert_eq!(failure.raw, "{not json");

    // The connection survives the bad frame.
    send_json(&mut ws, hello(60_000)).await;
    let _identify = read_until_op(&mut ws, 2).await;
}
