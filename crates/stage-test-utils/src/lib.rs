//! Shared test fixtures for Stagelink.
//!
//! Mocks for the external collaborators (media engine, identity service,
//! client media stack, peer connector) and a harness that wires a real
//! client [`Channel`](stage_client::Channel) to a real server connection
//! task over an in-memory duplex pipe, WebSocket handshake included.

#![warn(clippy::pedantic)]
// Test fixtures may take liberties production code may not.
#![allow(clippy::unwrap_used, clippy::expect_used)]

pub mod fake_peer;
pub mod fake_stack;
pub mod harness;
pub mod mock_engine;
pub mod mock_identity;

pub use fake_peer::{FakePeerConnector, FakePeerLink};
pub use fake_stack::FakeMediaStack;
pub use harness::{identity_token, TestServer};
pub use mock_engine::MockMediaEngine;
pub use mock_identity::MockIdentityVerifier;
