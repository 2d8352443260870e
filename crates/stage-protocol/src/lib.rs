//! Signaling protocol for Stagelink.
//!
//! This crate defines the fixed, versioned message schema exchanged between
//! the stage client and the stage server: a correlation envelope layered on
//! top of fire-and-forget events, one typed message per event name, and the
//! stable error codes surfaced to clients.
//!
//! Payloads are typed where the orchestration layer inspects them (media
//! kind, codec capabilities, participant info) and deliberately opaque
//! (`serde_json::Value`) where the layer only relays them verbatim (DTLS/RTP
//! parameters, SDP offers/answers, ICE candidates). Unknown fields in
//! incoming messages are ignored at the boundary.

#![warn(clippy::pedantic)]

pub mod envelope;
pub mod error;
pub mod messages;
pub mod types;

pub use envelope::{ClientEnvelope, ServerEnvelope, PROTOCOL_VERSION};
pub use error::{ErrorCode, ErrorPayload};
pub use messages::{ClientMessage, ResponsePayload, ServerMessage};
