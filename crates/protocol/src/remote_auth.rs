//! Remote-auth gateway payloads.
//!
//! The remote-auth gateway uses a flat packet where a string `op` identifies
//! the payload kind and every other key is optional depending on the op.

use {serde::{Deserialize, Serialize}, thiserror::Error};

/// Remote-auth opcodes. String-keyed on the wire; unrecognized values decode
/// as `Unknown` with the raw string preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RemoteAuthOp {
    Hello,
    Init,
    Heartbeat,
    HeartbeatAck,
    NonceProof,
    PendingRemoteInit,
    PendingTicket,
    PendingLogin,
    Cancel,
    Unknown(String),
}

impl RemoteAuthOp {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hello => "hello",
            Self::Init => "init",
            Self::Heartbeat => "heartbeat",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::NonceProof => "nonce_proof",
            Self::PendingRemoteInit => "pending_remote_init",
            Self::PendingTicket => "pending_ticket",
            Self::PendingLogin => "pending_login",
            Self::Cancel => "cancel",
            Self::Unknown(raw) => raw,
        }
    }

    /// Ops valid to send before the session reaches `Connected`.
    pub fn is_bootstrap(&self) -> bool {
        matches!(self, Self::Init | Self::Heartbeat | Self::HeartbeatAck)
    }
}

impl From<String> for RemoteAuthOp {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "hello" => Self::Hello,
            "init" => Self::Init,
            "heartbeat" => Self::Heartbeat,
            "heartbeat_ack" => Self::HeartbeatAck,
            "nonce_proof" => Self::NonceProof,
            "pending_remote_init" => Self::PendingRemoteInit,
            "pending_ticket" => Self::PendingTicket,
            "pending_login" => Self::PendingLogin,
            "cancel" => Self::Cancel,
            _ => Self::Unknown(raw),
        }
    }
}

impl From<RemoteAuthOp> for String {
    fn from(op: RemoteAuthOp) -> Self {
        op.as_str().to_string()
    }
}

impl std::fmt::Display for RemoteAuthOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User summary attached to `pending_ticket`, decrypted from
/// `encrypted_user_payload`. Wire form is a colon-delimited record:
/// `id:discriminator:avatar:username` (avatar may be empty).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    pub id: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    pub username: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed user payload record: expected at least 4 colon-delimited fields")]
pub struct UserPayloadParseError;

impl UserPayload {
    pub fn parse(record: &str) -> Result<Self, UserPayloadParseError> {
        let mut parts = record.splitn(4, ':');
        let id = parts.next().ok_or(UserPayloadParseError)?;
        let discriminator = parts.next().ok_or(UserPayloadParseError)?;
        let avatar = parts.next().ok_or(UserPayloadParseError)?;
        let username = parts.next().ok_or(UserPayloadParseError)?;
        Ok(Self {
            id: id.to_string(),
            discriminator: discriminator.to_string(),
            avatar: (!avatar.is_empty()).then(|| avatar.to_string()),
            username: username.to_string(),
        })
    }
}

/// One remote-auth frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAuthPayload {
    pub op: RemoteAuthOp,

    // hello
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    // init (outgoing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoded_public_key: Option<String>,

    // nonce_proof (incoming)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_nonce: Option<String>,

    // nonce_proof (outgoing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    // pending_remote_init
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,

    // pending_ticket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_user_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_payload: Option<UserPayload>,

    // pending_login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
}

impl RemoteAuthPayload {
    pub fn new(op: RemoteAuthOp) -> Self {
        Self {
            op,
            heartbeat_interval: None,
            timeout_ms: None,
            encoded_public_key: None,
            encrypted_nonce: None,
            nonce: None,
            fingerprint: None,
            encrypted_user_payload: None,
            user_payload: None,
            ticket: None,
        }
    }

    pub fn init(encoded_public_key: impl Into<String>) -> Self {
        Self {
            encoded_public_key: Some(encoded_public_key.into()),
            ..Self::new(RemoteAuthOp::Init)
        }
    }

    pub fn nonce_proof(nonce: impl Into<String>) -> Self {
        Self {
            nonce: Some(nonce.into()),
            ..Self::new(RemoteAuthOp::NonceProof)
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(RemoteAuthOp::Heartbeat)
    }
}
