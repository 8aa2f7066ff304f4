//! Rate-limited outbound send queue.
//!
//! The remote service allows at most one gateway send per 500 ms per
//! connection. All outbound traffic funnels through a single worker task that
//! enforces that spacing in FIFO order among deliverable requests. Requests
//! submitted while the session is not yet `Connected` are held in a side
//! buffer and flushed when the state watch reaches `Connected`, unless their
//! opcode is in the bootstrap allow-list (heartbeat, identify/init, resume),
//! which the server accepts pre-`Connected`. Held requests never block
//! bootstrap traffic behind them.

use {
    std::collections::VecDeque,
    std::sync::{Arc, Mutex},
    std::sync::atomic::{AtomicU64, Ordering},
    std::time::Duration,
    tokio::sync::{mpsc, watch},
    tokio::time::Instant,
    tracing::{debug, trace, warn},
};

use crate::{
    session::{FrameKind, OutboundFrame, WriterSlot},
    state::GatewayState,
};

/// One outbound protocol message, already encoded.
#[derive(Debug)]
pub struct OutboundRequest {
    pub body: String,
    pub kind: FrameKind,
    /// When set, the request is silently discarded at delivery time if the
    /// live connection identity has moved past this value.
    pub connection_id: Option<u64>,
    /// Whether the opcode is valid to send before `Connected`.
    pub bootstrap: bool,
    /// Opcode name, for logging only.
    pub label: &'static str,
}

pub struct SendQueue {
    tx: mpsc::Sender<OutboundRequest>,
    /// Timestamp of the last physical send. Owned by the worker; `reset`
    /// clears it so a fresh connection does not inherit stale pacing.
    last_send: Arc<Mutex<Option<Instant>>>,
}

impl SendQueue {
    pub fn new(
        interval: Duration,
        state: watch::Receiver<GatewayState>,
        live_connection: Arc<AtomicU64>,
        writer: WriterSlot,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let last_send = Arc::new(Mutex::new(None));
        tokio::spawn(worker(
            rx,
            interval,
            state,
            live_connection,
            writer,
            Arc::clone(&last_send),
        ));
        Self { tx, last_send }
    }

    /// Submits a request; returns immediately. The queue is bounded, so a
    /// runaway producer drops (with a warning) rather than growing without
    /// limit.
    pub fn enqueue(&self, request: OutboundRequest) {
        if let Err(err) = self.tx.try_send(request) {
            let request = match err {
                mpsc::error::TrySendError::Full(r) => r,
                mpsc::error::TrySendError::Closed(r) => r,
            };
            warn!(op = request.label, "send queue unavailable, dropping outbound message");
        }
    }

    /// Clears the pacing timer without dropping queued messages. Called on
    /// every reconnect and disconnect.
    pub fn reset(&self) {
        if let Ok(mut last) = self.last_send.lock() {
            *last = None;
        }
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue").finish_non_exhaustive()
    }
}

/// Requests held back while the session is not `Connected`. The cap matches
/// the channel cap; past it the oldest held request is dropped.
const HELD_CAP: usize = 64;

async fn worker(
    mut rx: mpsc::Receiver<OutboundRequest>,
    interval: Duration,
    mut state: watch::Receiver<GatewayState>,
    live_connection: Arc<AtomicU64>,
    writer: WriterSlot,
    last_send: Arc<Mutex<Option<Instant>>>,
) {
    let mut held: VecDeque<OutboundRequest> = VecDeque::new();
    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(request) = request else { break };
                let current = *state.borrow();
                if current == GatewayState::Stopped {
                    warn!(op = request.label, "will not send message because the gateway is stopped");
                    continue;
                }
                if !request.bootstrap && current != GatewayState::Connected {
                    // Held aside so bootstrap traffic behind it keeps moving.
                    debug!(op = request.label, "holding outbound message until connected");
                    if held.len() == HELD_CAP {
                        if let Some(dropped) = held.pop_front() {
                            warn!(op = dropped.label, "held buffer full, dropping oldest outbound message");
                        }
                    }
                    held.push_back(request);
                    continue;
                }
                deliver(request, interval, &live_connection, &writer, &last_send).await;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    GatewayState::Connected => {
                        for request in held.drain(..) {
                            deliver(request, interval, &live_connection, &writer, &last_send)
                                .await;
                        }
                    }
                    GatewayState::Stopped => {
                        for request in held.drain(..) {
                            warn!(op = request.label, "dropping outbound message, gateway stopped while queued");
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn deliver(
    request: OutboundRequest,
    interval: Duration,
    live_connection: &AtomicU64,
    writer: &WriterSlot,
    last_send: &Mutex<Option<Instant>>,
) {
    if let Some(required) = request.connection_id {
        if live_connection.load(Ordering::Relaxed) != required {
            trace!(op = request.label, connection_id = required, "dropping stale outbound message");
            return;
        }
    }

    let wait = last_send
        .lock()
        .ok()
        .and_then(|last| *last)
        .map(|at| (at + interval).saturating_duration_since(Instant::now()))
        .unwrap_or(Duration::ZERO);
    if !wait.is_zero() {
        tokio::time::sleep(wait).await;
    }

    let sender = { writer.lock().await.clone() };
    match sender {
        Some(tx) => {
            trace!(op = request.label, "delivering outbound message");
            if tx
                .send(OutboundFrame::Message {
                    kind: request.kind,
                    body: request.body,
                })
                .await
                .is_err()
            {
                debug!(op = request.label, "writer task gone, outbound message dropped");
            }
            if let Ok(mut last) = last_send.lock() {
                *last = Some(Instant::now());
            }
        }
        // Heartbeats are expected to fire while a connection is down;
        // anything else here is worth a warning.
        None if request.bootstrap => {
            debug!(op = request.label, "no active connection for outbound message")
        }
        None => warn!(op = request.label, "no active connection for outbound message"),
    }
}
