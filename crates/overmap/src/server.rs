//! `OvermapServer` builder and accept loop.
//!
//! This is the entry point for running a presence server. It ties the
//! layers together: transport → protocol → presence engine → gateway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use overmap_presence::{
    PersistenceGateway, PresenceConfig, PresenceEngine, ProfileCache,
};
use overmap_protocol::{Codec, JsonCodec};
use overmap_transport::{
    ConnectionId, Transport, WebSocketConnection, WebSocketTransport,
};
use tokio::sync::Mutex;

use crate::OvermapError;
use crate::handler::{dispatch_effects, handle_connection};

/// The engine and the peer table, guarded together.
///
/// One lock covers both so an engine operation and the peer lookup for
/// its effects can never observe each other half-done. Engine calls are
/// synchronous and short; no IO happens under this lock.
pub(crate) struct Shared {
    pub(crate) engine: PresenceEngine,
    pub(crate) peers: HashMap<ConnectionId, WebSocketConnection>,
}

/// Shared server state passed to each connection handler task.
pub(crate) struct ServerState<G: PersistenceGateway, C: Codec> {
    pub(crate) shared: Mutex<Shared>,
    pub(crate) gateway: Arc<G>,
    pub(crate) profiles: Mutex<ProfileCache>,
    pub(crate) codec: C,
    pub(crate) config: PresenceConfig,
}

/// Builder for configuring and starting an Overmap server.
///
/// # Example
///
/// ```rust,ignore
/// use overmap::prelude::*;
///
/// let server = OvermapServer::builder()
///     .bind("0.0.0.0:8080")
///     .build(my_gateway)
///     .await?;
/// server.run().await
/// ```
pub struct OvermapServerBuilder {
    bind_addr: String,
    config: PresenceConfig,
}

impl OvermapServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            config: PresenceConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the presence configuration.
    pub fn presence_config(mut self, config: PresenceConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds and starts the server with the given persistence gateway.
    ///
    /// Uses `JsonCodec` and `WebSocketTransport`, which is what the
    /// deployed overworld client speaks.
    pub async fn build<G: PersistenceGateway>(
        self,
        gateway: G,
    ) -> Result<OvermapServer<G, JsonCodec>, OvermapError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;

        let state = Arc::new(ServerState {
            shared: Mutex::new(Shared {
                engine: PresenceEngine::new(self.config.clone()),
                peers: HashMap::new(),
            }),
            gateway: Arc::new(gateway),
            profiles: Mutex::new(ProfileCache::new()),
            codec: JsonCodec,
            config: self.config,
        });

        Ok(OvermapServer { transport, state })
    }
}

impl Default for OvermapServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running Overmap presence server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct OvermapServer<G: PersistenceGateway, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<G, C>>,
}

impl<G, C> OvermapServer<G, C>
where
    G: PersistenceGateway,
    C: Codec,
{
    /// Creates a new builder.
    pub fn builder() -> OvermapServerBuilder {
        OvermapServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    /// Runs the server accept loop.
    ///
    /// Accepts incoming connections and spawns a handler task for each.
    /// Starts the liveness sweep if an idle timeout is configured. Runs
    /// until the process is terminated.
    pub async fn run(mut self) -> Result<(), OvermapError> {
        tracing::info!("overmap server running");

        if let Some(timeout) = self.state.config.idle_timeout {
            spawn_sweeper(Arc::clone(&self.state), timeout);
        }

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(
                                error = %e,
                                "connection ended with error"
                            );
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Periodically reaps sessions with no inbound activity.
fn spawn_sweeper<G: PersistenceGateway, C: Codec>(
    state: Arc<ServerState<G, C>>,
    timeout: Duration,
) {
    // Sweeping at half the timeout bounds overshoot without waking the
    // server constantly.
    let period = (timeout / 2).max(Duration::from_millis(250));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let effects = {
                let mut shared = state.shared.lock().await;
                shared.engine.sweep_stale(Instant::now())
            };
            if !effects.is_empty() {
                dispatch_effects(&state, effects).await;
            }
        }
    });
}
