//! QR-code remote-auth: log in by approving on an already-authenticated
//! device.
//!
//! The flow: connect to the remote-auth gateway, announce a fresh RSA public
//! key, prove possession of the private half via a nonce challenge, surface
//! the fingerprint (rendered as a QR code by the UI), then wait for the user
//! to approve on their other device. Approval yields a ticket that an HTTP
//! exchange plus one final decryption turns into an auth token.

pub mod crypto;
pub mod http;
pub mod manager;

pub use {
    crypto::{CryptoError, DeviceKey},
    http::{ExchangeError, RestTicketExchanger, TicketExchanger},
    manager::{RemoteAuthConfig, RemoteAuthError, RemoteAuthManager},
};
