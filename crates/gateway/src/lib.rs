//! Realtime gateway client: connection supervision, heartbeating, and the
//! rate-limited outbound path.
//!
//! The entry point is [`GatewayManager`]. It owns one connection at a time,
//! reconnects on its own after recoverable failures (with exponential
//! backoff), and fans inbound events out to any number of subscribers. The
//! building blocks (backoff policy, send queue, session, heartbeat monitor)
//! are public so the remote-auth crate can assemble its own manager from the
//! same parts.

pub mod backoff;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod queue;
pub mod session;
pub mod state;

pub use {
    backoff::{Backoff, BackoffConfig},
    config::{GatewayConfig, ReconnectPolicy},
    error::GatewayError,
    manager::{FrameDecodeFailure, GatewayManager},
    session::{EventStream, Protocol},
    state::{GatewayState, SharedState, StateCallback},
};
