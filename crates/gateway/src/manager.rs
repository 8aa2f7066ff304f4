//! The primary gateway manager: connection supervision, identify/resume,
//! heartbeating, and the subscriber event firehose.
//!
//! One manager owns at most one live connection at a time. Every `connect()`
//! mints a fresh connection identity from an atomic counter; timers, queued
//! sends, and session callbacks all carry the identity they were created
//! under and go inert the moment it stops being the live one. That single
//! rule replaces cancellation plumbing everywhere.

use {
    std::future::Future,
    std::pin::Pin,
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex},
    tracing::{debug, error, trace, warn},
};

use {
    crate::{
        backoff::Backoff,
        config::{GatewayConfig, ReconnectPolicy},
        error::GatewayError,
        heartbeat::{self, HeartbeatTiming, Liveness, LivenessSignal},
        queue::{OutboundRequest, SendQueue},
        session::{
            self, CloseReason, ConnectOptions, EventStream, FrameKind, OutboundFrame, Protocol,
            SessionEvent, WriterSlot,
        },
        state::{GatewayState, SharedState, StateCallback},
    },
    loon_protocol::{
        GatewayEvent, Identify, Opcode, Presence, RequestGuildMembers, Resume, VoiceStateUpdate,
    },
};

/// Close code sent when we abandon a connection we intend to resume.
const RECYCLE_CLOSE_CODE: u16 = 4000;

/// A frame the wire decoder rejected, surfaced on its own subscriber channel.
#[derive(Debug, Clone)]
pub struct FrameDecodeFailure {
    pub error: String,
    pub raw: String,
}

/// Resume coordinates retained from the last `READY`.
#[derive(Debug, Clone)]
struct ResumeState {
    session_id: String,
    resume_url: Option<String>,
}

struct PrimaryProtocol;

impl Protocol for PrimaryProtocol {
    type Event = GatewayEvent;

    fn decode(&self, text: &str) -> Result<GatewayEvent, session::DecodeFailure> {
        Ok(serde_json::from_str(text)?)
    }
}

pub struct GatewayManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayConfig,
    token: String,
    state: SharedState,
    queue: SendQueue,
    writer: WriterSlot,
    /// Identity of the connection currently allowed to act.
    live_connection: Arc<AtomicU64>,
    next_connection: AtomicU64,
    backoff: Mutex<Backoff>,
    liveness: Liveness,
    sequence: Mutex<Option<u64>>,
    resume: Mutex<Option<ResumeState>>,
    protocol: Arc<PrimaryProtocol>,
    session_tx: mpsc::Sender<SessionEvent<GatewayEvent>>,
    liveness_tx: mpsc::Sender<LivenessSignal>,
    events_tx: broadcast::Sender<GatewayEvent>,
    failures_tx: broadcast::Sender<FrameDecodeFailure>,
}

impl GatewayManager {
    pub fn new(token: impl Into<String>, config: GatewayConfig) -> Self {
        Self::build(token.into(), config, None)
    }

    /// Like [`new`](Self::new), with a synchronous callback invoked on every
    /// state transition.
    pub fn with_state_callback(
        token: impl Into<String>,
        config: GatewayConfig,
        callback: StateCallback,
    ) -> Self {
        Self::build(token.into(), config, Some(callback))
    }

    fn build(token: String, config: GatewayConfig, callback: Option<StateCallback>) -> Self {
        let state = SharedState::new(callback);
        let live_connection = Arc::new(AtomicU64::new(0));
        let writer: WriterSlot = Arc::new(AsyncMutex::new(None));
        let queue = SendQueue::new(
            config.send_interval(),
            state.watch(),
            Arc::clone(&live_connection),
            Arc::clone(&writer),
        );
        let (session_tx, session_rx) = mpsc::channel(64);
        let (liveness_tx, liveness_rx) = mpsc::channel(8);
        let (events_tx, _) = broadcast::channel(256);
        let (failures_tx, _) = broadcast::channel(64);

        let inner = Arc::new(Inner {
            backoff: Mutex::new(Backoff::new(config.backoff.clone())),
            config,
            token,
            state,
            queue,
            writer,
            live_connection,
            next_connection: AtomicU64::new(0),
            liveness: Liveness::default(),
            sequence: Mutex::new(None),
            resume: Mutex::new(None),
            protocol: Arc::new(PrimaryProtocol),
            session_tx,
            liveness_tx,
            events_tx,
            failures_tx,
        });
        tokio::spawn(Inner::drive(Arc::downgrade(&inner), session_rx, liveness_rx));
        Self { inner }
    }

    /// Starts (or restarts) the connection. Returns immediately; progress is
    /// visible through [`state_watch`](Self::state_watch) and the event
    /// stream. Safe to call from any state, including `Stopped`.
    pub fn connect(&self) {
        tokio::spawn(Arc::clone(&self.inner).connect_task());
    }

    /// Tears the connection down and pins the state to `Stopped`. Idempotent;
    /// no reconnection happens until the next explicit `connect()`.
    pub async fn disconnect(&self) {
        self.inner.shutdown("disconnect requested").await;
    }

    pub fn state(&self) -> GatewayState {
        self.inner.state.get()
    }

    pub fn state_watch(&self) -> watch::Receiver<GatewayState> {
        self.inner.state.watch()
    }

    /// Independent stream of every inbound gateway event. Each subscriber has
    /// its own buffer; one falling behind never affects the others or the
    /// read loop.
    pub fn subscribe(&self) -> EventStream<GatewayEvent> {
        EventStream::new(self.inner.events_tx.subscribe())
    }

    /// Frames the decoder rejected, with the raw text attached.
    pub fn subscribe_decode_failures(&self) -> EventStream<FrameDecodeFailure> {
        EventStream::new(self.inner.failures_tx.subscribe())
    }

    pub fn update_presence(&self, presence: &Presence) -> Result<(), GatewayError> {
        self.inner
            .enqueue_data(Opcode::PresenceUpdate, presence, "presence_update")
    }

    pub fn update_voice_state(&self, update: &VoiceStateUpdate) -> Result<(), GatewayError> {
        self.inner
            .enqueue_data(Opcode::VoiceStateUpdate, update, "voice_state_update")
    }

    pub fn request_guild_members(
        &self,
        request: &RequestGuildMembers,
    ) -> Result<(), GatewayError> {
        self.inner
            .enqueue_data(Opcode::RequestGuildMembers, request, "request_guild_members")
    }
}

impl std::fmt::Debug for GatewayManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayManager")
            .field("state", &self.inner.state.get())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Event loop. Holds only a weak handle so dropping the manager lets the
    /// channels close and the loop end.
    async fn drive(
        inner: Weak<Self>,
        mut session_rx: mpsc::Receiver<SessionEvent<GatewayEvent>>,
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

    /// Makes every identity-tagged task and send currently in flight stale.
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
        // connect() while a session is live replaces it; close the old socket
        // rather than leaving it to the server's idle timeout.
        self.close_writer(RECYCLE_CLOSE_CODE, "connection superseded").await;
        self.queue.reset();
        self.liveness.clear();

        let wait = self.backoff.lock().ok().and_then(|b| b.can_proceed_in());
        if let Some(wait) = wait {
            debug!(connection_id, ?wait, "throttling connection attempt");
            tokio::time::sleep(wait).await;
        }
        // A newer connect() or a disconnect() may have superseded us while we
        // waited out the backoff.
        if !self.is_live(connection_id) {
            trace!(connection_id, "connection attempt superseded before opening");
            return;
        }

        let url = self.connection_url();
        debug!(connection_id, %url, "opening gateway connection");
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
            warn!(connection_id, error = %err, "gateway connection failed to open");
            if self.is_live(connection_id) {
                if let Ok(mut backoff) = self.backoff.lock() {
                    backoff.record_attempt();
                }
                self.state.set(GatewayState::NoConnection);
                tokio::spawn(Arc::clone(&self).connect_task());
            }
        }
    }

    /// Resume URL when we hold resumable coordinates, else the configured
    /// gateway URL, with the protocol query attached.
    fn connection_url(&self) -> String {
        let resumable = self.sequence.lock().ok().is_some_and(|s| s.is_some());
        let base = if resumable {
            self.resume
                .lock()
                .ok()
                .and_then(|r| r.as_ref().and_then(|r| r.resume_url.clone()))
        } else {
            None
        };
        let base = base.unwrap_or_else(|| self.config.gateway_url.clone());
        format!(
            "{}/?v={}&encoding=json",
            base.trim_end_matches('/'),
            self.config.api_version
        )
    }

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent<GatewayEvent>) {
        match event {
            SessionEvent::Opened { connection_id } => {
                if !self.is_live(connection_id) {
                    trace!(connection_id, "ignoring open of a superseded connection");
                    return;
                }
                debug!(connection_id, "gateway transport open");
                self.state.set(GatewayState::Configured);
            }
            SessionEvent::Inbound {
                connection_id,
                event,
            } => {
                if !self.is_live(connection_id) {
                    trace!(connection_id, "ignoring event from a superseded connection");
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
                    trace!(connection_id, "superseded connection finished closing");
                    return;
                }
                self.handle_ended(connection_id, reason);
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, connection_id: u64, event: GatewayEvent) {
        if let Some(seq) = event.s {
            if let Ok(mut stored) = self.sequence.lock() {
                *stored = Some(seq);
            }
        }

        match event.op {
            Opcode::Hello => {
                let Some(hello) = event.hello() else {
                    warn!(connection_id, "hello frame without a heartbeat interval");
                    return;
                };
                self.on_hello(connection_id, hello.heartbeat_interval);
            }
            Opcode::Dispatch => match event.dispatch_name() {
                Some("READY") => {
                    if let Some(ready) = event.ready() {
                        debug!(connection_id, session_id = %ready.session_id, "session ready");
                        if let Ok(mut resume) = self.resume.lock() {
                            *resume = Some(ResumeState {
                                session_id: ready.session_id,
                                resume_url: ready.resume_gateway_url,
                            });
                        }
                    } else {
                        warn!(connection_id, "ready payload missing session coordinates");
                    }
                    self.on_established(connection_id);
                }
                Some("RESUMED") => {
                    debug!(connection_id, "session resumed");
                    self.on_established(connection_id);
                }
                _ => {}
            },
            Opcode::Heartbeat => {
                // Server asked for an immediate beat.
                self.send_heartbeat(connection_id);
            }
            Opcode::HeartbeatAck => self.liveness.record_ack(),
            Opcode::InvalidSession => {
                let resumable = event.invalid_session_resumable().unwrap_or(false);
                warn!(connection_id, resumable, "server invalidated the session");
                if !resumable {
                    self.clear_resume_state();
                }
                self.recycle(connection_id).await;
            }
            Opcode::Reconnect => {
                debug!(connection_id, "server requested a reconnect");
            }
            _ => {}
        }

        let _ = self.events_tx.send(event);
    }

    fn on_hello(self: &Arc<Self>, connection_id: u64, heartbeat_interval_ms: u64) {
        debug!(connection_id, heartbeat_interval_ms, "gateway hello");
        let timing = HeartbeatTiming {
            ack_grace: self.config.ack_grace(),
            ack_tolerance: self.config.ack_tolerance(),
            max_missed: self.config.max_missed_heartbeats,
        };
        let beater = Arc::downgrade(self);
        heartbeat::start(
            std::time::Duration::from_millis(heartbeat_interval_ms),
            timing,
            connection_id,
            Arc::clone(&self.live_connection),
            self.liveness.clone(),
            move || {
                if let Some(inner) = beater.upgrade() {
                    inner.send_heartbeat(connection_id);
                }
            },
            self.liveness_tx.clone(),
        );

        // A retained sequence plus session coordinates means we try to pick
        // the old session back up; the sequence is spent by the attempt so a
        // failed resume falls back to identify on the next connection.
        let resume_with = {
            let session = self
                .resume
                .lock()
                .ok()
                .and_then(|r| r.as_ref().map(|r| r.session_id.clone()));
            let sequence = self.sequence.lock().ok().and_then(|mut s| s.take());
            session.zip(sequence)
        };
        let frame = match resume_with {
            Some((session_id, sequence)) => {
                debug!(connection_id, %session_id, sequence, "resuming session");
                let payload = Resume {
                    token: self.token.clone(),
                    session_id,
                    sequence,
                };
                GatewayEvent::with_data(Opcode::Resume, &payload).map(|e| (e, "resume"))
            }
            None => {
                debug!(connection_id, "identifying");
                let payload = Identify::new(self.token.clone());
                GatewayEvent::with_data(Opcode::Identify, &payload).map(|e| (e, "identify"))
            }
        };
        match frame {
            Ok((event, label)) => {
                self.record_attempt();
                self.enqueue_bootstrap(connection_id, &event, label);
            }
            Err(err) => warn!(connection_id, error = %err, "failed to encode session payload"),
        }
    }

    /// READY or RESUMED: the server acknowledged the session.
    fn on_established(&self, connection_id: u64) {
        self.state.set(GatewayState::Connected);
        self.liveness.record_ack();
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.reset();
        }
        trace!(connection_id, "connection established");
    }

    fn handle_ended(self: &Arc<Self>, connection_id: u64, reason: CloseReason) {
        let recoverable = match &reason {
            CloseReason::Closed(code) => self.config.reconnect.is_recoverable(*code),
            CloseReason::TransportError(_) | CloseReason::StreamEnded => true,
        };
        if recoverable {
            debug!(connection_id, ?reason, "connection lost, reconnecting");
            self.state.set(GatewayState::NoConnection);
            tokio::spawn(Arc::clone(self).connect_task());
        } else {
            let described = match &reason {
                CloseReason::Closed(code) => ReconnectPolicy::describe(*code),
                _ => "none".to_string(),
            };
            error!(connection_id, close_code = %described, "gateway closed terminally, stopping");
            self.retire_live_connection();
            self.state.set(GatewayState::Stopped);
        }
    }

    async fn handle_liveness(self: &Arc<Self>, signal: LivenessSignal) {
        let LivenessSignal::Unresponsive { connection_id } = signal;
        if !self.is_live(connection_id) {
            return;
        }
        warn!(connection_id, "connection unresponsive, recycling");
        self.recycle(connection_id).await;
    }

    /// Drops the current connection and starts a new one. The caller decides
    /// beforehand whether resume state survives. Retiring the identity first
    /// means the dying session's close report arrives stale and cannot start
    /// a second reconnect.
    async fn recycle(self: &Arc<Self>, connection_id: u64) {
        if !self.is_live(connection_id) {
            return;
        }
        self.retire_live_connection();
        self.close_writer(RECYCLE_CLOSE_CODE, "recycling connection").await;
        self.state.set(GatewayState::NoConnection);
        tokio::spawn(Arc::clone(self).connect_task());
    }

    async fn shutdown(&self, reason: &'static str) {
        self.retire_live_connection();
        self.close_writer(1000, reason).await;
        self.state.set(GatewayState::Stopped);
        self.queue.reset();
        self.liveness.clear();
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.reset();
        }
        // A deliberate stop forfeits the session; the next connect starts
        // clean.
        self.clear_resume_state();
    }

    async fn close_writer(&self, code: u16, reason: &'static str) {
        let sender = { self.writer.lock().await.take() };
        if let Some(sender) = sender {
            let _ = sender.send(OutboundFrame::Close { code, reason }).await;
        }
    }

    fn clear_resume_state(&self) {
        if let Ok(mut resume) = self.resume.lock() {
            *resume = None;
        }
        if let Ok(mut sequence) = self.sequence.lock() {
            *sequence = None;
        }
    }

    fn record_attempt(&self) {
        if let Ok(mut backoff) = self.backoff.lock() {
            backoff.record_attempt();
        }
    }

    fn send_heartbeat(&self, connection_id: u64) {
        let sequence = self.sequence.lock().ok().and_then(|s| *s);
        self.enqueue_bootstrap(connection_id, &GatewayEvent::heartbeat(sequence), "heartbeat");
    }

    /// Bootstrap frames bypass the queue's connected-gate but still honor
    /// pacing and identity checks.
    fn enqueue_bootstrap(&self, connection_id: u64, event: &GatewayEvent, label: &'static str) {
        match serde_json::to_string(event) {
            Ok(body) => self.queue.enqueue(OutboundRequest {
                body,
                kind: FrameKind::Text,
                connection_id: Some(connection_id),
                bootstrap: true,
                label,
            }),
            Err(err) => warn!(op = label, error = %err, "failed to encode outbound frame"),
        }
    }

    fn enqueue_data<T: serde::Serialize>(
        &self,
        op: Opcode,
        payload: &T,
        label: &'static str,
    ) -> Result<(), GatewayError> {
        if self.state.get() == GatewayState::Stopped {
            return Err(GatewayError::Stopped);
        }
        let event = GatewayEvent::with_data(op, payload)?;
        self.queue.enqueue(OutboundRequest {
            body: serde_json::to_string(&event)?,
            kind: FrameKind::Text,
            connection_id: None,
            bootstrap: false,
            label,
        });
        Ok(())
    }
}
