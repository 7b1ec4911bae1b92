//! # Overmap Presence
//!
//! The realtime presence layer: who is connected, which map they are
//! on, and the protocol state machine that keeps every client's view of
//! a map consistent.
//!
//! The pieces:
//!
//! - [`SessionRegistry`] — one [`PlayerSession`] per live connection.
//! - [`MapIndex`] — spatial partition of connections by map, so
//!   broadcast cost tracks per-map occupancy, not server size.
//! - [`UpdateLimiter`] — per-connection throttle for position updates.
//! - [`PresenceEngine`] — the synchronous state machine tying them
//!   together. Operations mutate state and return [`Effect`]s for the
//!   caller to execute.
//! - [`PersistenceGateway`] — the async seam to the external store,
//!   with [`NullGateway`] and [`MemoryGateway`] implementations.

mod engine;
mod gateway;
mod limiter;
mod map_index;
mod registry;
mod session;

pub use engine::{Effect, JoinRequest, PersistOp, PresenceEngine};
pub use gateway::{
    ActiveSession, GatewayError, MemoryGateway, NullGateway,
    PersistenceGateway, ProfileCache,
};
pub use limiter::UpdateLimiter;
pub use map_index::MapIndex;
pub use registry::SessionRegistry;
pub use session::{PlayerSession, PresenceConfig};
