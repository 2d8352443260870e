//! Stagelink client session library.
//!
//! Everything a client needs to participate in a stage: the signaling
//! [`Channel`](channel::Channel) with request/response correlation, the
//! [`SessionController`](session::SessionController) state machine, the SFU
//! [`TransportOrchestrator`](orchestrator::TransportOrchestrator) and the
//! mesh [`MeshConnector`](mesh::MeshConnector). The native RTC stack is
//! reached through the [`media`] and [`mesh`] boundary traits.

#![warn(clippy::pedantic)]

pub mod channel;
pub mod errors;
pub mod events;
pub mod media;
pub mod mesh;
pub mod orchestrator;
pub mod session;

pub use channel::{Channel, ChannelConfig};
pub use errors::{MediaError, SessionError};
pub use events::SessionEvent;
pub use media::{LocalTrack, MediaStack, RemoteTrack};
pub use mesh::{PeerConnector, PeerLink};
pub use session::{SessionConfig, SessionController, SessionState};
