//! Connection state shared between the manager, the send queue, and callers.

use {
    std::sync::Arc,
    tokio::sync::watch,
};

/// Gateway connection lifecycle states.
///
/// `Configured` means the transport is open but the session has not yet been
/// acknowledged by the server (no ready/resumed); the remote-auth variant
/// skips it and goes straight to `Connected` on transport open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    NoConnection,
    Connecting,
    Configured,
    Connected,
    Stopped,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoConnection => "no_connection",
            Self::Connecting => "connecting",
            Self::Configured => "configured",
            Self::Connected => "connected",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

pub type StateCallback = Arc<dyn Fn(GatewayState) + Send + Sync>;

/// Single live state cell per manager. Observers either poll [`get`], await
/// changes on a [`watch`] receiver, or register a callback at construction.
///
/// [`get`]: SharedState::get
/// [`watch`]: SharedState::watch
pub struct SharedState {
    tx: watch::Sender<GatewayState>,
    callback: Option<StateCallback>,
}

impl SharedState {
    pub fn new(callback: Option<StateCallback>) -> Self {
        let (tx, _) = watch::channel(GatewayState::NoConnection);
        Self { tx, callback }
    }

    pub fn get(&self) -> GatewayState {
        *self.tx.borrow()
    }

    /// Transitions to `next`. A no-op (and not observable) when the state is
    /// already `next`, which is what makes `disconnect()` idempotent.
    pub fn set(&self, next: GatewayState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            if let Some(callback) = &self.callback {
                callback(next);
            }
        }
    }

    pub fn watch(&self) -> watch::Receiver<GatewayState> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedState").field("state", &self.get()).finish()
    }
}
