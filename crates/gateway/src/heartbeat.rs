//! Heartbeat scheduling and liveness verification.
//!
//! The server announces a heartbeat interval in its hello payload. For every
//! beat we send, a verification fires `ack_grace` later and checks that an
//! acknowledgement arrived within the success window (`ack_grace` plus
//! `ack_tolerance`). Consecutive misses past the configured limit mean the
//! connection is a zombie, and the monitor tells the supervisor to replace it.

use {
    std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    std::time::Duration,
    tokio::sync::mpsc,
    tokio::time::Instant,
    tracing::{debug, trace, warn},
};

/// Shared record of the most recent heartbeat acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    last_ack: Arc<Mutex<Option<Instant>>>,
}

impl Liveness {
    pub fn record_ack(&self) {
        if let Ok(mut last) = self.last_ack.lock() {
            *last = Some(Instant::now());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut last) = self.last_ack.lock() {
            *last = None;
        }
    }

    fn acked_within(&self, window: Duration) -> bool {
        self.last_ack
            .lock()
            .ok()
            .and_then(|last| *last)
            .is_some_and(|at| at.elapsed() <= window)
    }
}

/// Verdicts the monitor reports to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessSignal {
    /// The connection missed too many acknowledgements in a row.
    Unresponsive { connection_id: u64 },
}

/// Per-monitor timing knobs, lifted out of the gateway config.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTiming {
    pub ack_grace: Duration,
    pub ack_tolerance: Duration,
    pub max_missed: u32,
}

/// Spawns the monitor loop for one connection. The loop exits on its own as
/// soon as `live_connection` no longer names `connection_id`, so tearing down
/// a session never has to chase this task.
pub fn start<F>(
    interval: Duration,
    timing: HeartbeatTiming,
    connection_id: u64,
    live_connection: Arc<AtomicU64>,
    liveness: Liveness,
    beat: F,
    signals: mpsc::Sender<LivenessSignal>,
) where
    F: Fn() + Send + Sync + 'static,
{
    tokio::spawn(async move {
        // First beat fires after a random fraction of the interval.
        let jitter = interval.mul_f64(rand::random::<f64>());
        tokio::time::sleep(jitter).await;

        let window = timing.ack_grace + timing.ack_tolerance;
        let mut missed = 0u32;
        loop {
            if live_connection.load(Ordering::Relaxed) != connection_id || signals.is_closed() {
                trace!(connection_id, "heartbeat monitor retired");
                return;
            }
            beat();

            tokio::time::sleep(timing.ack_grace).await;
            if live_connection.load(Ordering::Relaxed) != connection_id {
                trace!(connection_id, "heartbeat monitor retired");
                return;
            }

            if liveness.acked_within(window) {
                missed = 0;
            } else {
                missed += 1;
                warn!(connection_id, missed, "heartbeat went unacknowledged");
            }
            if missed >= timing.max_missed {
                debug!(connection_id, "connection unresponsive, requesting replacement");
                let _ = signals
                    .send(LivenessSignal::Unresponsive { connection_id })
                    .await;
                return;
            }

            tokio::time::sleep(interval.saturating_sub(timing.ack_grace)).await;
        }
    });
}
