/// Errors surfaced by the gateway manager API.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to open gateway connection: {0}")]
    Connect(String),
    #[error("failed to encode outbound payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("gateway manager is stopped")]
    Stopped,
}
