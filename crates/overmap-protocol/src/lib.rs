//! Wire protocol for Overmap.
//!
//! Defines the language the overworld client and the presence server
//! speak:
//!
//! - **Frames** ([`ClientFrame`], [`ServerFrame`]) — JSON text messages,
//!   internally tagged with a `type` discriminator.
//! - **Codec** ([`Codec`], [`JsonCodec`]) — how frames become bytes.
//! - **Close reasons** ([`CloseReason`]) — app-level WebSocket close
//!   codes used by the session-takeover protocol.
//!
//! The protocol layer knows nothing about connections or maps' occupancy
//! state; it only describes what travels on the wire.

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ClientFrame, CloseReason, DEFAULT_MAP, MapId, PlayerInfo, Position,
    ServerFrame, spawn_position,
};
