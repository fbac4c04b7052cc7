//! Server and hub configuration.
//!
//! Defaults suit local development; [`ServerConfig::from_env`] overlays
//! `SCRIBE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::document::DocumentId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Document served on `/` and `/ws`
    pub document_id: DocumentId,
    /// Initial text of the default document
    pub seed_text: String,
    /// Outbound frames buffered per session before it is evicted
    pub session_buffer: usize,
    /// Hub event channel capacity
    pub event_capacity: usize,
    /// Edits buffered for replication before new ones are dropped
    pub replication_buffer: usize,
    /// Upper bound on a single replication publish
    pub publish_timeout: Duration,
    /// Replication bus address (None = single instance)
    pub redis_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            document_id: DocumentId::random(),
            seed_text: String::new(),
            session_buffer: 512,
            event_capacity: 1024,
            replication_buffer: 256,
            publish_timeout: Duration::from_millis(200),
            redis_url: None,
        }
    }
}

impl ServerConfig {
    /// Load from `SCRIBE_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("SCRIBE_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(id) = lookup("SCRIBE_DOCUMENT_ID").filter(|id| !id.is_empty()) {
            config.document_id = DocumentId::new(id);
        }
        if let Some(text) = lookup("SCRIBE_SEED_TEXT") {
            config.seed_text = text;
        }
        parse_into(&lookup, "SCRIBE_SESSION_BUFFER", &mut config.session_buffer);
        parse_into(&lookup, "SCRIBE_EVENT_CAPACITY", &mut config.event_capacity);
        parse_into(&lookup, "SCRIBE_REPLICATION_BUFFER", &mut config.replication_buffer);

        let mut timeout_ms = config.publish_timeout.as_millis() as u64;
        parse_into(&lookup, "SCRIBE_PUBLISH_TIMEOUT_MS", &mut timeout_ms);
        config.publish_timeout = Duration::from_millis(timeout_ms);

        config.redis_url = lookup("SCRIBE_REDIS_URL").filter(|url| !url.is_empty());
        config
    }

    /// Hub settings derived from this configuration.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            event_capacity: self.event_capacity,
            replication_buffer: self.replication_buffer,
        }
    }
}

fn parse_into<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => log::warn!("Ignoring {key}={raw:?}: not a valid number"),
        }
    }
}

/// Per-hub channel sizing.
#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// Hub event channel capacity
    pub event_capacity: usize,
    /// Replication outbox capacity
    pub replication_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            replication_buffer: 256,
        }
    }
}
