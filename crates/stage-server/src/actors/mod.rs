//! Actor system for the stage server.
//!
//! Hierarchy:
//! - `RegistryActor` (singleton): supervises stages
//! - `StageActor` (per stage): owns roster and media session state
//! - Connection tasks (per WebSocket) feed requests into the actors

pub mod media;
pub mod messages;
pub mod registry;
pub mod stage;

pub use messages::{ConnectionHandle, JoinedStage, RegistryStatus, RelayPayload, StageCreation};
pub use registry::{RegistryActor, RegistryActorHandle};
pub use stage::{StageActor, StageActorHandle, StageSpec};
