//! Stagelink signaling server library.
//!
//! The server is the authoritative side of the stage-orchestration
//! protocol: it owns the stage registry, drives the media engine on behalf
//! of participants, relays mesh signaling, and speaks the versioned
//! envelope protocol over TLS WebSockets.

#![warn(clippy::pedantic)]

pub mod actors;
pub mod auth;
pub mod config;
pub mod connection;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod relay;
pub mod tls;
