//! Full scripted remote-auth handshake against an in-process server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use {
    async_trait::async_trait,
    base64::{
        engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
        Engine as _,
    },
    futures::{SinkExt, StreamExt},
    loon_gateway::{BackoffConfig, GatewayState},
    loon_protocol::RemoteAuthOp,
    loon_remote_auth::{ExchangeError, RemoteAuthConfig, RemoteAuthError, RemoteAuthManager, TicketExchanger},
    rand_core::OsRng,
    rsa::{pkcs8::DecodePublicKey, Oaep, RsaPublicKey},
    serde_json::{json, Value},
    sha2::Sha256,
    std::time::Duration,
    tokio::{
        net::{TcpListener, TcpStream},
        time::timeout,
    },
    tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream},
};

type Ws = WebSocketStream<TcpStream>;

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

async fn read_until_op(ws: &mut Ws, op: &str) -> Value {
    loop {
        let message = timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["op"] == json!(op) {
                return frame;
            }
        }
    }
}

fn test_config(url: &str) -> RemoteAuthConfig {
    RemoteAuthConfig {
        gateway_url: url.to_string(),
        send_interval_ms: 5,
        backoff: BackoffConfig {
            coefficient: 0,
            min_backoff_ms: 0,
            ..BackoffConfig::default()
        },
        ..RemoteAuthConfig::default()
    }
}

fn encrypt(public: &RsaPublicKey, plaintext: &[u8]) -> String {
    let ciphertext = public
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .unwrap();
    STANDARD.encode(ciphertext)
}

/// Runs the server side up to and including the nonce proof, returning the
/// client's public key.
async fn server_handshake(ws: &mut Ws) -> RsaPublicKey {
    send_json(
        ws,
        json!({ "op": "hello", "heartbeat_interval": 60_000, "timeout_ms": 300_000 }),
    )
    .await;

    let init = read_until_op(ws, "init").await;
    let spki = STANDARD
        .decode(init["encoded_public_key"].as_str().unwrap())
        .unwrap();
    let public = RsaPublicKey::from_public_key_der(&spki).unwrap();

    let nonce = b"nonce-challenge-bytes";
    send_json(
        ws,
        json!({ "op": "nonce_proof", "encrypted_nonce": encrypt(&public, nonce) }),
    )
    .await;
    let proof = read_until_op(ws, "nonce_proof").await;
    assert_eq!(
        proof["nonce"].as_str().unwrap(),
        URL_SAFE_NO_PAD.encode(nonce)
    );
    public
}

struct Scripted(String);

#[async_trait]
impl TicketExchanger for Scripted {
    async fn exchange(&self, ticket: &str) -> Result<String, ExchangeError> {
        assert_eq!(ticket, "the-ticket");
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn handshake_through_login_and_token_exchange() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let manager = RemoteAuthManager::new(test_config(&url));
    let mut events = manager.subscribe();
    let mut state = manager.state_watch();

    manager.connect();
    let mut ws = accept(&listener).await;
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == GatewayState::Connected),
    )
    .await
    .expect("never connected")
    .unwrap();

    let public = server_handshake(&mut ws).await;

    // Fingerprint reaches subscribers for QR rendering.
    send_json(&mut ws, json!({ "op": "pending_remote_init", "fingerprint": "fp-1" })).await;
    let frame = timeout(Duration::from_secs(5), async {
        loop {
            let frame = events.next().await.expect("event stream ended");
            if frame.op == RemoteAuthOp::PendingRemoteInit {
                return frame;
            }
        }
    })
    .await
    .expect("fingerprint never surfaced");
    assert_eq!(frame.fingerprint.as_deref(), Some("fp-1"));

    // The scan carries an encrypted user record; subscribers get it decrypted.
    send_json(
        &mut ws,
        json!({
            "op": "pending_ticket",
            "encrypted_user_payload": encrypt(&public, b"4212:0::sam"),
        }),
    )
    .await;
    let frame = timeout(Duration::from_secs(5), async {
        loop {
            let frame = events.next().await.expect("event stream ended");
            if frame.op == RemoteAuthOp::PendingTicket {
                return frame;
            }
        }
    })
    .await
    .expect("pending_ticket never surfaced");
    let user = frame.user_payload.expect("user payload not decrypted");
    assert_eq!(user.id, "4212");
    assert_eq!(user.username, "sam");
    assert!(user.avatar.is_none());

    send_json(&mut ws, json!({ "op": "pending_login", "ticket": "the-ticket" })).await;
    let ticket = manager
        .wait_for_login(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(ticket, "the-ticket");

    // Ticket exchange decrypts the final token with the same private key.
    let token = manager
        .exchange_ticket(&ticket, &Scripted(encrypt(&public, b"token-123\n")))
        .await
        .unwrap();
    assert_eq!(token, "token-123");

    // Exchange failures are per-call, typed, and do not touch the connection.
    let bad = manager
        .exchange_ticket(&ticket, &Scripted("not-base64!!".to_string()))
        .await;
    assert!(matches!(
        bad,
        Err(RemoteAuthError::Crypto(
            loon_remote_auth::CryptoError::InvalidBase64(_)
        ))
    ));
    let empty = manager
        .exchange_ticket(&ticket, &Scripted(encrypt(&public, b"  ")))
        .await;
    assert!(matches!(
        empty,
        Err(RemoteAuthError::Crypto(loon_remote_auth::CryptoError::EmptyToken))
    ));
    assert_eq!(manager.state(), GatewayState::Connected);
}

#[tokio::test]
async fn cancel_aborts_the_login_wait() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let manager = RemoteAuthManager::new(test_config(&url));

    manager.connect();
    let mut ws = accept(&listener).await;
    let _public = server_handshake(&mut ws).await;

    send_json(&mut ws, json!({ "op": "cancel" })).await;
    let result = manager.wait_for_login(Some(Duration::from_secs(5))).await;
    assert!(matches!(result, Err(RemoteAuthError::Cancelled)));
}

#[tokio::test]
async fn connect_while_live_closes_the_previous_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let manager = RemoteAuthManager::new(test_config(&url));

    manager.connect();
    let mut first = accept(&listener).await;
    let _public = server_handshake(&mut first).await;

    manager.connect();
    // The superseded socket gets a close frame instead of lingering.
    timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
                other => panic!("expected a close frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("previous socket never closed");

    // The replacement runs a fresh handshake with a new keypair.
    let mut second = accept(&listener).await;
    let _public = server_handshake(&mut second).await;
}

#[tokio::test]
async fn disconnect_drops_the_key_and_fails_waiters() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let manager = RemoteAuthManager::new(test_config(&url));

    manager.connect();
    let mut ws = accept(&listener).await;
    let public = server_handshake(&mut ws).await;

    manager.disconnect().await;
    assert_eq!(manager.state(), GatewayState::Stopped);

    let result = manager.wait_for_login(Some(Duration::from_secs(1))).await;
    assert!(matches!(result, Err(RemoteAuthError::ConnectionClosed)));

    // The private key went with the session.
    let exchange = manager
        .exchange_ticket("the-ticket", &Scripted(encrypt(&public, b"token")))
        .await;
    assert!(matches!(exchange, Err(RemoteAuthError::NoPrivateKey)));
}
