//! Scribe sync server: one instance of the collaborative text backend.
//!
//! Configured through `SCRIBE_*` environment variables (see
//! [`scribe_sync::ServerConfig`]); log output is controlled by `RUST_LOG`.
//! With the `redis` feature and `SCRIBE_REDIS_URL` set, edits replicate to
//! every other instance subscribed to the same server.

use std::sync::Arc;

use log::{error, info, warn};
use scribe_sync::{DocumentRegistry, ReplicationBus, ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting scribe-server on {} (document {})",
        config.bind_addr, config.document_id
    );

    let bus = replication_bus(&config).await;
    let registry = Arc::new(DocumentRegistry::new(config.hub_config(), bus));
    let server = SyncServer::new(config, registry);

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "redis")]
async fn replication_bus(config: &ServerConfig) -> Option<Arc<dyn ReplicationBus>> {
    let url = config.redis_url.as_deref()?;
    match scribe_sync::RedisBus::connect(url, config.publish_timeout).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!("Replication disabled, could not connect to {url}: {e}");
            None
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn replication_bus(config: &ServerConfig) -> Option<Arc<dyn ReplicationBus>> {
    if let Some(url) = &config.redis_url {
        warn!("SCRIBE_REDIS_URL={url} ignored: built without the `redis` feature");
    }
    None
}
