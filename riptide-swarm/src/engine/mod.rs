//! Connection engine built on the actor model.
//!
//! [`spawn_swarm_engine`] starts the actor; [`SwarmHandle`] is the only way
//! in. Internally the engine is split by stage: scheduling, the
//! encryption and handshake pipeline, the message pump and cleanup.

mod actor;
mod cleanup;
mod commands;
pub mod connection;
mod core;
mod events;
mod handle;
mod pipeline;
mod pump;
mod registry;
mod scheduler;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_mocks;

pub use actor::spawn_swarm_engine;
pub use cleanup::DisconnectReason;
pub use commands::{EngineStats, SwarmCommand};
pub use connection::{ConnectionId, ConnectionInfo, ConnectionState};
pub use events::{BanPolicy, BanVerdict, SwarmEvent};
pub use handle::SwarmHandle;
pub use pump::MAX_BLOCK_LENGTH;
