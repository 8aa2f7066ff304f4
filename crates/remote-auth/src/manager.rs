//! The remote-auth gateway manager.
//!
//! Drives the QR-code login handshake: a fresh RSA keypair per attempt, an
//! `init` announcing the public key, a nonce proof, and finally a login
//! ticket once the user approves on their other device. Connection
//! supervision (backoff, heartbeats, identity-based cancellation) reuses the
//! same building blocks as the primary gateway; the state machine here skips
//! `Configured` and counts the transport opening as `Connected`.

use {
    loon_gateway::{
        backoff::{Backoff, BackoffConfig},
        config::ReconnectPolicy,
        heartbeat::{self, HeartbeatTiming, Liveness, LivenessSignal},
        queue::{OutboundRequest, SendQueue},
        session::{
            self, CloseReason, ConnectOptions, DecodeFailure, EventStream, FrameKind,
            OutboundFrame, Protocol, SessionEvent, WriterSlot,
        },
        state::{GatewayState, SharedState, StateCallback},
    },
    loon_protocol::{RemoteAuthOp, RemoteAuthPayload, UserPayload},
    serde::{Deserialize, Serialize},
    std::future::Future,
    std::pin::Pin,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    std::time::Duration,
    tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as AsyncMutex},
    tracing::{debug, error, trace, warn},
};

use crate::{
    crypto::{CryptoError, DeviceKey},
    http::{ExchangeError, TicketExchanger},
};

use loon_gateway::manager::FrameDecodeFailure;

#[derive(Debug, thiserror::Error)]
pub enum RemoteAuthError {
    #[error("no private key for this handshake")]
    NoPrivateKey,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("login was cancelled from the other device")]
    Cancelled,
    #[error("timed out waiting for login approval")]
    Timeout,
    #[error("connection closed before login completed")]
    ConnectionClosed,
    #[error("another caller is already waiting for login")]
    AlreadyWaiting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteAuthConfig {
    pub gateway_url: String,
    /// Protocol version sent as the `v` query parameter.
    pub api_version: u8,
    pub send_interval_ms: u64,
    pub ack_grace_ms: u64,
    pub ack_tolerance_ms: u64,
    pub max_missed_heartbeats: u32,
    /// Fallback login wait when the server's hello carries no timeout.
    pub login_timeout_ms: u64,
    pub user_agent: String,
    pub origin: Option<String>,
    pub backoff: BackoffConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for RemoteAuthConfig {
    fn default() -> Self {
        Self {
            gateway_url: "wss://remote-auth.loon.chat".to_string(),
            api_version: 2,
            send_interval_ms: 500,
            ack_grace_ms: 10_000,
            ack_tolerance_ms: 5_000,
            max_missed_heartbeats: 3,
            login_timeout_ms: 300_000,
            user_agent: concat!("loon/", env!("CARGO_PKG_VERSION")).to_string(),
            origin: Some("https://loon.chat".to_string()),
            backoff: BackoffConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

type KeySlot = Arc<Mutex<Option<DeviceKey>>>;

/// Wire decoder. Frames carrying `encrypted_user_payload` are enriched with
/// the decrypted user record before subscribers see them; decryption or
/// parse failures log and leave the field unset, never fail the frame.
struct RemoteAuthWire {
    key: KeySlot,
}

impl Protocol for RemoteAuthWire {
    type Event = RemoteAuthPayload;

    fn decode(&self, text: &str) -> Result<RemoteAuthPayload, DecodeFailure> {
        let mut payload: RemoteAuthPayload = serde_json::from_str(text)?;
        if payload.user_payload.is_none() {
            if let Some(encrypted) = payload.encrypted_user_payload.clone() {
                payload.user_payload = self.decrypt_user_payload(&encrypted);
            }
        }
        Ok(payload)
    }
}

impl RemoteAuthWire {
    fn decrypt_user_payload(&self, encrypted: &str) -> Option<UserPayload> {
        let decrypted = self
            .key
            .lock()
            .ok()?
            .as_ref()?
            .decrypt_base64(encrypted)
            .map_err(|err| warn!(error = %err, "could not decrypt user payload"))
            .ok()?;
        let record = String::from_utf8(decrypted)
            .map_err(|_| warn!("user payload is not valid utf-8"))
            .ok()?;
        UserPayload::parse(&record)
            .map_err(|err| warn!(error = %err, "malformed user payload"))
            .ok()
    }
}

enum LoginSlot {
    Idle,
    Waiting(oneshot::Sender<Result<String, RemoteAuthError>>),
    /// The ticket (or a cancellation) arrived before anyone awaited it.
    Resolved(Result<String, RemoteAuthError>),
}

pub struct RemoteAuthManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: RemoteAuthConfig,
    state: SharedState,
    queue: SendQueue,
    writer: WriterSlot,
    live_connection: Arc<AtomicU64>,
    next_connection: AtomicU64,
    backoff: Mutex<Backoff>,
    liveness: Liveness,
    key: KeySlot,
    login: Mutex<LoginSlot>,
    /// `timeout_ms` from the server's hello; zero until one arrives.
    hello_timeout_ms: AtomicU64,
    protocol: Arc<RemoteAuthWire>,
    session_tx: mpsc::Sender<SessionEvent<RemoteAuthPayload>>,
    liveness_tx: mpsc::Sender<LivenessSignal>,
    events_tx: broadcast::Sender<RemoteAuthPayload>,
    failures_tx: broadcast::Sender<FrameDecodeFailure>,
}

impl RemoteAuthManager {
    pub fn new(config: RemoteAuthConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_state_callback(config: RemoteAuthConfig, callback: StateCallback) -> Self {
        Self::build(config, Some(callback))
    }

    fn build(config: RemoteAuthConfig, callback: Option<StateCallback>) -> Self {
        let state = SharedState::new(callback);
        let live_connection = Arc::new(AtomicU64::new(0));
        let writer: WriterSlot = Arc::new(AsyncMutex::new(None));
        let queue = SendQueue::new(
            Duration::from_millis(config.send_interval_ms),
            state.watch(),
            Arc::clone(&live_connection),
            Arc::clone(&writer),
        );
        let key: KeySlot = Arc::new(Mutex::new(None));
        let (session_tx, session_rx) = mpsc::channel(64);
        let (liveness_tx, liveness_rx) = mpsc::channel(8);
        let (events_tx, _) = broadcast::channel(64);
        let (failures_tx, _) = broadcast::channel(16);

        let inner = Arc::new(Inner {
            backoff: Mutex::new(Backoff::new(config.backoff.clone())),
            config,
            state,
            queue,
            writer,
            live_connection,
            next_connection: AtomicU64::new(0),
            liveness: Liveness::default(),
            protocol: Arc::new(RemoteAuthWire {
                key: Arc::clone(&key),
            }),
            key,
            login: Mutex::new(LoginSlot::Idle),
            hello_timeout_ms: AtomicU64::new(0),
            session_tx,
            liveness_tx,
            events_tx,
            failures_tx,
        });
        tokio::spawn(Inner::drive(Arc::downgrade(&inner), session_rx, liveness_rx));
        Self { inner }
    }

    /// Starts (or restarts) the handshake connection. Returns immediately.
    pub fn connect(&self) {
        tokio::spawn(Arc::clone(&self.inner).connect_task());
    }

    /// Tears everything down and drops the private key. Idempotent.
    pub async fn disconnect(&self) {
        self.inner.shutdown().await;
    }

    pub fn state(&self) -> GatewayState {
        self.inner.state.get()
    }

    pub fn state_watch(&self) -> watch::Receiver<GatewayState> {
        self.inner.state.watch()
    }

    /// Every inbound handshake frame, with user payloads already decrypted.
    pub fn subscribe(&self) -> EventStream<RemoteAuthPayload> {
        EventStream::new(self.inner.events_tx.subscribe())
    }

    pub fn subscribe_decode_failures(&self) -> EventStream<FrameDecodeFailure> {
        EventStream::new(self.inner.failures_tx.subscribe())
    }

    /// Waits for the user to approve the login on their other device.
    /// Resolves with the login ticket, a cancellation, or a timeout; the
    /// timeout defaults to the server's announced `timeout_ms`. Only one
    /// caller may wait at a time.
    pub async fn wait_for_login(
        &self,
        timeout: Option<Duration>,
    ) -> Result<String, RemoteAuthError> {
        let rx = {
            let Ok(mut slot) = self.inner.login.lock() else {
                return Err(RemoteAuthError::ConnectionClosed);
            };
            match std::mem::replace(&mut *slot, LoginSlot::Idle) {
                LoginSlot::Resolved(result) => return result,
                LoginSlot::Waiting(tx) => {
                    *slot = LoginSlot::Waiting(tx);
                    return Err(RemoteAuthError::AlreadyWaiting);
                }
                LoginSlot::Idle => {
                    let (tx, rx) = oneshot::channel();
                    *slot = LoginSlot::Waiting(tx);
                    rx
                }
            }
        };

        let duration = timeout.unwrap_or_else(|| {
            let from_hello = self.inner.hello_timeout_ms.load(Ordering::Relaxed);
            Duration::from_millis(if from_hello > 0 {
                from_hello
            } else {
                self.inner.config.login_timeout_ms
            })
        });
        match tokio::time::timeout(duration, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RemoteAuthError::ConnectionClosed),
            Err(_) => {
                if let Ok(mut slot) = self.inner.login.lock() {
                    *slot = LoginSlot::Idle;
                }
                Err(RemoteAuthError::Timeout)
            }
        }
    }

    /// Trades a login ticket for the auth token: HTTP exchange, then OAEP
    /// decryption with this handshake's private key. Failures here affect
    /// only this call, never the connection.
    pub async fn exchange_ticket(
        &self,
        ticket: &str,
        exchanger: &dyn TicketExchanger,
    ) -> Result<String, RemoteAuthError> {
        let encrypted = exchanger.exchange(ticket).await?;
        let Ok(guard) = self.inner.key.lock() else {
            return Err(RemoteAuthError::NoPrivateKey);
        };
        let key = guard.as_ref().ok_or(RemoteAuthError::NoPrivateKey)?;
        Ok(key.decrypt_token(&encrypted)?)
    }
}

impl std::fmt::Debug for RemoteAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAuthManager")
            .field("state", &self.inner.state.get())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Event loop. Holds only a weak handle so dropping the manager lets the
    /// channels close and the loop end.
    async fn drive(
        inner: Weak<Self>,
        mut session_rx: mpsc::Receiver<SessionEvent<RemoteAuthPayload>>,
        mut liveness_rx: mpsc::Receiver<LivenessSignal>,
    ) {
        loop {
            tokio::select! {
                event = session_rx.recv() => match (event, inner.upgrade()) {
                    (Some(event), Some(inner)) => inner.handle_session_event(event).await,
                    _ => break,
                },
                signal = liveness_rx.recv() => match (signal, inner.upgrade()) {
                    (Some(signal), Some(inner)) => inner.handle_liveness(signal).await,
                    _ => break,
                },
            }
        }
    }

    fn is_live(&self, connection_id: u64) -> bool {
        self.live_connection.load(Ordering::Relaxed) == connection_id
    }

    fn retire_live_connection(&self) {
        let next = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        self.live_connection.store(next, Ordering::Relaxed);
    }

    /// `run_connect` respawns itself after failures; boxing here keeps its
    /// future type from containing itself.
    fn connect_task(self: Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(self.run_connect())
    }

    async fn run_connect(self: Arc<Self>) {
        let connection_id = self.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        self.live_connection.store(connection_id, Ordering::Relaxed);
        self.state.set(GatewayState::Connecting);
        // connect() while a handshake is live replaces it; close the old
        // socket rather than leaving it to the server's idle timeout.
        self.close_writer(4000, "connection superseded").await;
        self.queue.reset();
        self.liveness.clear();
        // Each handshake attempt gets its own keypair.
        if let Ok(mut key) = self.key.lock() {
            *key = None;
        }

        let wait = self.backoff.lock().ok().and_then(|b| b.can_proceed_in());
        if let Some(wait) = wait {
            debug!(connection_id, ?wait, "throttling remote-auth connection attempt");
            tokio::time::sleep(wait).await;
        }
        if !self.is_live(connection_id) {
            trace!(connection_id, "connection attempt superseded before opening");
            return;
        }

        let url = format!(
            "{}/?v={}",
            self.config.gateway_url.trim_end_matches('/'),
            self.config.api_version
        );
        debug!(connection_id, %url, "opening remote-auth connection");
        let options = ConnectOptions {
            user_agent: self.config.user_agent.clone(),
            origin: self.config.origin.clone(),
        };
        let opened = session::open(
            &url,
            &options,
            Arc::clone(&self.protocol),
            connection_id,
            Arc::clone(&self.live_connection),
            Arc::clone(&self.writer),
            self.session_tx.clone(),
        )
        .await;

        if let Err(err) = opened {
            warn!(connection_id, error = %err, "remote-auth connection failed to open");
            if self.is_live(connection_id) {
                if let Ok(mut backoff) = self.backoff.lock() {
                    backoff.record_attempt();
                }
                self.state.set(GatewayState::NoConnection);
                tokio::spawn(Arc::clone(&self).connect_task());
            }
        }
    }

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent<RemoteAuthPayload>) {
        match event {
            SessionEvent::Opened { connection_id } => {
                if !self.is_live(connection_id) {
                    return;
                }
                debug!(connection_id, "remote-auth transport open");
                // No server-side session handshake to wait for here; open
                // means connected.
                self.state.set(GatewayState::Connected);
                if let Ok(mut backoff) = self.backoff.lock() {
                    backoff.reset();
                }
            }
            SessionEvent::Inbound {
                connection_id,
                event,
            } => {
                if !self.is_live(connection_id) {
                    return;
                }
                self.handle_inbound(connection_id, event).await;
            }
            SessionEvent::DecodeFailed {
                connection_id,
                error,
                raw,
            } => {
                if self.is_live(connection_id) {
                    let _ = self.failures_tx.send(FrameDecodeFailure { error, raw });
                }
            }
            SessionEvent::Ended {
                connection_id,
                reason,
            } => {
                if !self.is_live(connection_id) {
                    return;
                }
                self.handle_ended(connection_id, reason);
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, connection_id: u64, payload: RemoteAuthPayload) {
        match &payload.op {
            RemoteAuthOp::Hello => self.on_hello(connection_id, &payload).await,
            RemoteAuthOp::Heartbeat => {
                self.enqueue(connection_id, &RemoteAuthPayload::new(RemoteAuthOp::HeartbeatAck));
            }
            RemoteAuthOp::HeartbeatAck => self.liveness.record_ack(),
            RemoteAuthOp::NonceProof => self.on_nonce_challenge(connection_id, &payload),
            RemoteAuthOp::PendingLogin => {
                if let Some(ticket) = payload.ticket.clone() {
                    debug!(connection_id, "login approved, ticket received");
                    self.resolve_login(Ok(ticket));
                } else {
                    warn!(connection_id, "pending_login frame without a ticket");
                }
            }
            RemoteAuthOp::Cancel => {
                debug!(connection_id, "login cancelled from the other device");
                self.resolve_login(Err(RemoteAuthError::Cancelled));
            }
            RemoteAuthOp::PendingRemoteInit | RemoteAuthOp::PendingTicket => {}
            RemoteAuthOp::Unknown(op) => trace!(connection_id, op = %op, "unknown remote-auth op"),
            RemoteAuthOp::Init => {}
        }
        let _ = self.events_tx.send(payload);
    }

    async fn on_hello(self: &Arc<Self>, connection_id: u64, payload: &RemoteAuthPayload) {
        let interval_ms = payload.heartbeat_interval.unwrap_or(41_250);
        if let Some(timeout_ms) = payload.timeout_ms {
            self.hello_timeout_ms.store(timeout_ms, Ordering::Relaxed);
        }
        debug!(connection_id, interval_ms, "remote-auth hello");

        // Keygen is CPU-bound; keep it off the runtime threads.
        let generated = tokio::task::spawn_blocking(DeviceKey::generate).await;
        let key = match generated {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                error!(connection_id, error = %err, "keypair generation failed");
                return;
            }
            Err(err) => {
                error!(connection_id, error = %err, "keypair generation task failed");
                return;
            }
        };
        if !self.is_live(connection_id) {
            return;
        }
        let init = RemoteAuthPayload::init(key.encoded_public_key());
        if let Ok(mut slot) = self.key.lock() {
            *slot = Some(key);
        }
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.record_attempt();
        }
        self.enqueue(connection_id, &init);

        let timing = HeartbeatTiming {
            ack_grace: Duration::from_millis(self.config.ack_grace_ms),
            ack_tolerance: Duration::from_millis(self.config.ack_tolerance_ms),
            max_missed: self.config.max_missed_heartbeats,
        };
        let beater = Arc::downgrade(self);
        heartbeat::start(
            Duration::from_millis(interval_ms),
            timing,
            connection_id,
            Arc::clone(&self.live_connection),
            self.liveness.clone(),
            move || {
                if let Some(inner) = beater.upgrade() {
                    inner.enqueue(connection_id, &RemoteAuthPayload::heartbeat());
                }
            },
            self.liveness_tx.clone(),
        );
    }

    fn on_nonce_challenge(&self, connection_id: u64, payload: &RemoteAuthPayload) {
        let Some(encrypted) = payload.encrypted_nonce.as_deref() else {
            warn!(connection_id, "nonce challenge without a nonce");
            return;
        };
        let proof = {
            let Ok(guard) = self.key.lock() else { return };
            match guard.as_ref() {
                Some(key) => key.nonce_proof(encrypted),
                None => {
                    warn!(connection_id, "nonce challenge before key exchange");
                    return;
                }
            }
        };
        match proof {
            Ok(nonce) => self.enqueue(connection_id, &RemoteAuthPayload::nonce_proof(nonce)),
            Err(err) => warn!(connection_id, error = %err, "failed to prove nonce"),
        }
    }

    fn handle_ended(self: &Arc<Self>, connection_id: u64, reason: CloseReason) {
        let recoverable = match &reason {
            CloseReason::Closed(code) => self.config.reconnect.is_recoverable(*code),
            CloseReason::TransportError(_) | CloseReason::StreamEnded => true,
        };
        if recoverable {
            debug!(connection_id, ?reason, "remote-auth connection lost, reconnecting");
            self.state.set(GatewayState::NoConnection);
            tokio::spawn(Arc::clone(self).connect_task());
        } else {
            error!(connection_id, ?reason, "remote-auth gateway closed terminally");
            self.retire_live_connection();
            self.state.set(GatewayState::Stopped);
            self.resolve_login(Err(RemoteAuthError::ConnectionClosed));
        }
    }

    async fn handle_liveness(self: &Arc<Self>, signal: LivenessSignal) {
        let LivenessSignal::Unresponsive { connection_id } = signal;
        if !self.is_live(connection_id) {
            return;
        }
        warn!(connection_id, "remote-auth connection unresponsive, recycling");
        self.retire_live_connection();
        self.close_writer(4000, "unresponsive").await;
        self.state.set(GatewayState::NoConnection);
        tokio::spawn(Arc::clone(self).connect_task());
    }

    async fn shutdown(&self) {
        self.retire_live_connection();
        self.close_writer(1000, "disconnect requested").await;
        self.state.set(GatewayState::Stopped);
        self.queue.reset();
        self.liveness.clear();
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.reset();
        }
        if let Ok(mut key) = self.key.lock() {
            *key = None;
        }
        self.resolve_login(Err(RemoteAuthError::ConnectionClosed));
    }

    async fn close_writer(&self, code: u16, reason: &'static str) {
        let sender = { self.writer.lock().await.take() };
        if let Some(sender) = sender {
            let _ = sender.send(OutboundFrame::Close { code, reason }).await;
        }
    }

    /// Hands the result to the waiter, or parks it for the next
    /// `wait_for_login` call. A result that arrives while nothing waits and
    /// nothing is parked yet wins; later ones are dropped.
    fn resolve_login(&self, result: Result<String, RemoteAuthError>) {
        let Ok(mut slot) = self.login.lock() else {
            return;
        };
        match std::mem::replace(&mut *slot, LoginSlot::Idle) {
            LoginSlot::Waiting(tx) => {
                let _ = tx.send(result);
            }
            LoginSlot::Idle => *slot = LoginSlot::Resolved(result),
            LoginSlot::Resolved(first) => *slot = LoginSlot::Resolved(first),
        }
    }

    fn enqueue(&self, connection_id: u64, payload: &RemoteAuthPayload) {
        let label = match &payload.op {
            RemoteAuthOp::Init => "init",
            RemoteAuthOp::Heartbeat => "heartbeat",
            RemoteAuthOp::HeartbeatAck => "heartbeat_ack",
            RemoteAuthOp::NonceProof => "nonce_proof",
            _ => "frame",
        };
        match serde_json::to_string(payload) {
            Ok(body) => self.queue.enqueue(OutboundRequest {
                body,
                kind: FrameKind::Text,
                connection_id: Some(connection_id),
                bootstrap: payload.op.is_bootstrap(),
                label,
            }),
            Err(err) => warn!(op = label, error = %err, "failed to encode remote-auth frame"),
        }
    }
}
