//! Dastak Telephony SDK
//!
//! Client for the cloud Telephony Provider's observable contract:
//! - Outbound call placement with retry and signed callback URLs
//! - Webhook signature verification (HMAC-SHA256 over the raw body)
//! - Bidirectional audio stream framing (mu-law 8 kHz, 20 ms frames)
//!
//! The provider's SIP internals are not modeled here; only what the comms
//! core can observe over HTTP and WebSocket.

pub mod client;
pub mod signature;
pub mod stream;

pub use client::{CallStatus, PlaceCallRequest, TelephonyClient, TelephonyConfig};
pub use signature::WebhookSigner;
pub use stream::{StreamFrame, FRAME_BYTES, FRAME_MS, SAMPLE_RATE_HZ};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelephonyError {
    #[error("Telephony credentials missing: {0}")]
    MissingCredentials(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Provider rejected request: status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Bad stream frame: {0}")]
    BadFrame(String),
}

pub type Result<T> = std::result::Result<T, TelephonyError>;
