//! Unified error type for the Overmap server.

use overmap_protocol::ProtocolError;
use overmap_transport::TransportError;

/// Top-level error that wraps the sub-crate errors.
///
/// Connection handlers and the server loop return this single type; the
/// `#[from]` attributes generate the `From` impls that make `?` convert
/// sub-crate errors automatically.
///
/// Gateway errors are deliberately absent: store failures never
/// terminate a connection. Writes are logged and swallowed, and the one
/// read on the join path degrades to "no prior session found".
#[derive(Debug, thiserror::Error)]
pub enum OvermapError {
    /// A transport-level error (accept, send, recv, close).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
