//! A runnable presence server backed by the in-memory store.
//!
//! Point any overworld client at it:
//!
//! ```text
//! OVERMAP_BIND=0.0.0.0:8080 RUST_LOG=info cargo run -p overworld-server
//! ```
//!
//! Positions and active sessions live only as long as the process; a
//! real deployment implements `PersistenceGateway` against its database
//! and swaps it in here.

use overmap::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("OVERMAP_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    let gateway = MemoryGateway::new()
        .with_profile("demo-user", "Demo");

    let server = OvermapServerBuilder::new()
        .bind(&bind)
        .presence_config(PresenceConfig::default())
        .build(gateway)
        .await?;

    tracing::info!(addr = %server.local_addr()?, "overworld server listening");
    server.run().await?;
    Ok(())
}
