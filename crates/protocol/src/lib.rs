//! Wire model for the realtime gateway and the remote-auth gateway.
//!
//! Both gateways speak flat JSON records keyed by an opcode field (`op`).
//! Unknown or absent fields always decode as unset rather than failing the
//! whole message, and unknown opcodes decode into an explicit unknown variant
//! so a new server-side opcode never breaks an established session.

pub mod close;
pub mod gateway;
pub mod remote_auth;

pub use {
    close::CloseCode,
    gateway::{
        ConnectionProperties, GatewayEvent, Hello, Identify, Opcode, Presence, Ready,
        RequestGuildMembers, Resume, VoiceStateUpdate,
    },
    remote_auth::{RemoteAuthOp, RemoteAuthPayload, UserPayload},
};
