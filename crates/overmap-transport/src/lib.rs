//! Transport layer for Overmap.
//!
//! Provides the [`Transport`] and [`Connection`] traits plus the
//! WebSocket implementation the presence server runs on. A
//! [`Connection`] is cheap to clone, and its send side never contends
//! with a blocked receive — broadcast fan-out pushes frames to any
//! occupant of a map while that occupant's own read loop is parked.

#![allow(async_fn_in_trait)]

mod error;
mod websocket;

pub use error::TransportError;
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;

/// Opaque process-unique identifier for a connection.
///
/// This is the key the presence layer uses for the session registry and
/// the map index; it never leaves the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;
}

/// A single bidirectional message channel to one client.
pub trait Connection: Clone + Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Queues a text frame for delivery to the remote peer.
    async fn send(&self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receives the next inbound frame.
    ///
    /// Returns `Ok(None)` when the connection is closed. Only one task
    /// should receive on a given connection.
    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Closes the connection with a normal-closure status.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Closes the connection with an application close code and reason,
    /// after any frames already queued have been flushed.
    async fn close_with(&self, code: u16, reason: &str) -> Result<(), Self::Error>;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}
