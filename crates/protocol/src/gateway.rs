//! Primary gateway events: numeric opcodes plus a flat `{op, d, s, t}` record.

use {
    serde::{Deserialize, Deserializer, Serialize, Serializer},
    serde_json::Value,
};

/// Gateway opcodes. Closed set; anything the server sends that we do not
/// recognize decodes as `Unknown` and is passed through to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    Unknown(u8),
}

impl Opcode {
    pub fn code(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::PresenceUpdate => 3,
            Self::VoiceStateUpdate => 4,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::RequestGuildMembers => 8,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            other => Self::Unknown(other),
        }
    }

    /// Opcodes that are valid to send before the session reaches `Connected`.
    /// The send queue lets these through while the connection is still being
    /// established; everything else waits.
    pub fn is_bootstrap(self) -> bool {
        matches!(self, Self::Heartbeat | Self::Identify | Self::Resume)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Heartbeat => "heartbeat",
            Self::Identify => "identify",
            Self::PresenceUpdate => "presence_update",
            Self::VoiceStateUpdate => "voice_state_update",
            Self::Resume => "resume",
            Self::Reconnect => "reconnect",
            Self::RequestGuildMembers => "request_guild_members",
            Self::InvalidSession => "invalid_session",
            Self::Hello => "hello",
            Self::HeartbeatAck => "heartbeat_ack",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({code})"),
            other => f.write_str(other.name()),
        }
    }
}

impl Serialize for Opcode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::from_code(u8::deserialize(deserializer)?))
    }
}

/// One gateway frame. `d` stays a raw JSON value; op-specific payloads are
/// extracted lazily so a malformed `d` for one opcode never poisons the rest
/// of the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub op: Opcode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayEvent {
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            d: None,
            s: None,
            t: None,
        }
    }

    pub fn with_data<T: Serialize>(op: Opcode, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            op,
            d: Some(serde_json::to_value(data)?),
            s: None,
            t: None,
        })
    }

    /// Heartbeat frame carrying the last seen sequence number (or null).
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self {
            op: Opcode::Heartbeat,
            d: Some(sequence.map_or(Value::Null, Value::from)),
            s: None,
            t: None,
        }
    }

    /// Dispatch event name, when this is a dispatch frame.
    pub fn dispatch_name(&self) -> Option<&str> {
        (self.op == Opcode::Dispatch).then_some(self.t.as_deref()).flatten()
    }

    pub fn hello(&self) -> Option<Hello> {
        (self.op == Opcode::Hello)
            .then(|| self.d.clone().and_then(|d| serde_json::from_value(d).ok()))
            .flatten()
    }

    pub fn ready(&self) -> Option<Ready> {
        (self.dispatch_name() == Some("READY"))
            .then(|| self.d.clone().and_then(|d| serde_json::from_value(d).ok()))
            .flatten()
    }

    /// For `invalid_session`, whether the server says the session is resumable.
    pub fn invalid_session_resumable(&self) -> Option<bool> {
        (self.op == Opcode::InvalidSession)
            .then(|| self.d.as_ref().and_then(Value::as_bool))
            .flatten()
    }
}

/// Server `hello` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

/// The subset of `READY` the connection layer cares about. Everything else in
/// the dispatch payload belongs to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "loon".to_string(),
            device: "loon".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Presence {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default)]
    pub activities: Vec<Value>,
    pub afk: bool,
}

/// Identify payload sent after `hello` when no resumable session exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub properties: ConnectionProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

impl Identify {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            properties: ConnectionProperties::default(),
            capabilities: None,
            large_threshold: None,
            presence: None,
        }
    }
}

/// Resume payload for picking an interrupted session back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    #[serde(rename = "seq")]
    pub sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Member-chunk request for one guild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestGuildMembers {
    pub guild_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub limit: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrip() {
        for code in [0u8, 1, 2, 3, 4, 6, 7, 8, 9, 10, 11] {
            assert_eq!(Opcode::from_code(code).code(), code);
        }
    }

    #[test]
    fn unknown_opcode_survives_decode() {
        let event: GatewayEvent = serde_json::from_str(r#"{"op":99,"d":{"x":1}}"#).unwrap();
        assert_eq!(event.op, Opcode::Unknown(99));
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"op\":99"));
    }

    #[test]
    fn absent_fields_decode_as_unset() {
        let event: GatewayEvent = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(event.op, Opcode::HeartbeatAck);
        assert!(event.d.is_none());
        assert!(event.s.is_none());
        assert!(event.t.is_none());
    }

    #[test]
    fn hello_payload_extraction() {
        let event: GatewayEvent =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(event.hello().unwrap().heartbeat_interval, 41250);
    }

    #[test]
    fn ready_only_matches_ready_dispatch() {
        let event: GatewayEvent = serde_json::from_str(
            r#"{"op":0,"t":"READY","s":1,"d":{"session_id":"abc","resume_gateway_url":"wss://resume.example"}}"#,
        )
        .unwrap();
        let ready = event.ready().unwrap();
        assert_eq!(ready.session_id, "abc");
        assert_eq!(ready.resume_gateway_url.as_deref(), Some("wss://resume.example"));

        let other: GatewayEvent =
            serde_json::from_str(r#"{"op":0,"t":"MESSAGE_CREATE","s":2,"d":{}}"#).unwrap();
        assert!(other.ready().is_none());
    }

    #[test]
    fn heartbeat_carries_sequence_or_null() {
        let with_seq = serde_json::to_string(&GatewayEvent::heartbeat(Some(42))).unwrap();
        assert!(with_seq.contains("\"d\":42"));
        let without = serde_json::to_string(&GatewayEvent::heartbeat(None)).unwrap();
        assert!(without.contains("\"d\":null"));
    }

    #[test]
    fn invalid_session_resumable_flag() {
        let event: GatewayEvent = serde_json::from_str(r#"{"op":9,"d":false}"#).unwrap();
        assert_eq!(event.invalid_session_resumable(), Some(false));
    }

    #[test]
    fn bootstrap_allow_list() {
        assert!(Opcode::Heartbeat.is_bootstrap());
        assert!(Opcode::Identify.is_bootstrap());
        assert!(Opcode::Resume.is_bootstrap());
        assert!(!Opcode::PresenceUpdate.is_bootstrap());
        assert!(!Opcode::Unknown(200).is_bootstrap());
    }
}
