//! Gateway client configuration.

use {
    loon_protocol::CloseCode,
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
    std::time::Duration,
};

use crate::backoff::BackoffConfig;

/// Configuration for a [`GatewayManager`](crate::manager::GatewayManager).
///
/// Defaults match the remote service's documented limits: one outbound send
/// per 500 ms, three missed heartbeats before a forced reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Base gateway URL, without query parameters.
    pub gateway_url: String,
    /// Protocol version sent as the `v` query parameter.
    pub api_version: u8,
    /// Minimum spacing between physical outbound sends.
    pub send_interval_ms: u64,
    /// How long to wait after sending a heartbeat before checking for an ack.
    pub ack_grace_ms: u64,
    /// Extra slack on top of the grace window before a heartbeat counts as
    /// missed.
    pub ack_tolerance_ms: u64,
    /// Consecutive missed heartbeats that force a reconnect.
    pub max_missed_heartbeats: u32,
    /// User-agent header presented during the websocket upgrade.
    pub user_agent: String,
    /// Origin header presented during the websocket upgrade.
    pub origin: Option<String>,
    pub backoff: BackoffConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_url: "wss://gateway.loon.chat".to_string(),
            api_version: 9,
            send_interval_ms: 500,
            ack_grace_ms: 10_000,
            ack_tolerance_ms: 5_000,
            max_missed_heartbeats: 3,
            user_agent: concat!("loon/", env!("CARGO_PKG_VERSION")).to_string(),
            origin: Some("https://loon.chat".to_string()),
            backoff: BackoffConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn ack_grace(&self) -> Duration {
        Duration::from_millis(self.ack_grace_ms)
    }

    pub fn ack_tolerance(&self) -> Duration {
        Duration::from_millis(self.ack_tolerance_ms)
    }
}

/// Close-code classification used by the reconnection supervisor.
///
/// The built-in table treats unknown codes as recoverable. Individual codes
/// can be pinned to recoverable or terminal through `overrides`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Per-code overrides of the built-in table; `true` means recoverable.
    pub overrides: HashMap<u16, bool>,
}

impl ReconnectPolicy {
    /// `code` is `None` for network-level errors and codeless closes, which
    /// are always recoverable.
    pub fn is_recoverable(&self, code: Option<u16>) -> bool {
        let Some(code) = code else { return true };
        if let Some(&overridden) = self.overrides.get(&code) {
            return overridden;
        }
        CloseCode::from_code(code).is_none_or(CloseCode::is_recoverable)
    }

    pub fn describe(code: Option<u16>) -> String {
        match code {
            None => "none".to_string(),
            Some(code) => match CloseCode::from_code(code) {
                Some(known) => format!("{known}({code})"),
                None => code.to_string(),
            },
        }
    }
}
