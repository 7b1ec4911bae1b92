//! # Overmap
//!
//! Realtime presence server for a shared 2D overworld: who is online,
//! which map they are on, where they are standing. Clients connect over
//! WebSockets, join a map, and stream position updates; the server
//! relays movement to everyone on the same map, enforces one live
//! session per user identity, and persists last-known positions through
//! a pluggable gateway.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use overmap::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), OvermapError> {
//!     let server = OvermapServerBuilder::new()
//!         .bind("0.0.0.0:8080")
//!         .build(NullGateway)
//!         .await?;
//!     server.run().await
//! }
//! ```

mod error;
mod handler;
mod server;

pub use error::OvermapError;
pub use server::{OvermapServer, OvermapServerBuilder};

/// One-stop imports for building and running a server.
pub mod prelude {
    pub use crate::{OvermapError, OvermapServer, OvermapServerBuilder};
    pub use overmap_presence::{
        ActiveSession, GatewayError, MemoryGateway, NullGateway,
        PersistenceGateway, PresenceConfig,
    };
    pub use overmap_protocol::{
        ClientFrame, CloseReason, Codec, DEFAULT_MAP, JsonCodec, MapId,
        PlayerInfo, Position, ServerFrame, spawn_position,
    };
    pub use overmap_transport::ConnectionId;
}
