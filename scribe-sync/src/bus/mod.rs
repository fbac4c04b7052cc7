//! Cross-process replication bus.
//!
//! ```text
//! Hub A ── publish ──► topic "document:<id>" ──► subscription ──► Hub B
//!   ▲                                                               │
//!   └──────────────── subscription ◄── topic ◄── publish ───────────┘
//! ```
//!
//! The transport is treated as best-effort, unordered and at-least-once.
//! Every payload is a complete edit that the receiving hub clamps and applies
//! on its own, so late, reordered or duplicated messages never corrupt a
//! document. Duplicates are applied twice: there is no deduplication key.
//!
//! Each bus endpoint stamps the edits it publishes with its origin id and
//! drops that origin from its own subscriptions, since pub/sub transports
//! deliver to the publisher's own subscribers as well.

mod local;
#[cfg(feature = "redis")]
mod redis_bus;

pub use local::{LocalBroker, LocalBus};
#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;

use std::future::Future;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::document::DocumentId;
use crate::protocol::Edit;

/// Publish/subscribe fan-out of edits between hub instances.
pub trait ReplicationBus: Send + Sync {
    /// Best-effort send of `edit` to the document's topic.
    ///
    /// Implementations bound the send with a short timeout so a slow
    /// transport cannot stall the caller for long.
    fn publish<'a>(
        &'a self,
        document_id: &'a DocumentId,
        edit: &'a Edit,
    ) -> BoxFuture<'a, Result<(), BusError>>;

    /// Long-lived listener on the document's topic.
    ///
    /// Malformed payloads are skipped, never ending the stream.
    fn subscribe<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Edit>, BusError>>;
}

/// Replication errors. Logged and swallowed by the hub.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to encode edit: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Bus that replicates nothing: for single-instance deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

impl ReplicationBus for NoopBus {
    fn publish<'a>(
        &'a self,
        _document_id: &'a DocumentId,
        _edit: &'a Edit,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        futures_util::future::ready(Ok(())).boxed()
    }

    fn subscribe<'a>(
        &'a self,
        _document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Edit>, BusError>> {
        futures_util::future::ready(Ok(futures_util::stream::pending::<Edit>().boxed())).boxed()
    }
}

/// Payload on the wire: the edit's own fields plus the publishing endpoint.
#[derive(Debug, Serialize, Deserialize)]
struct BusMessage {
    origin: Uuid,
    #[serde(flatten)]
    edit: Edit,
}

fn encode_payload(origin: Uuid, edit: &Edit) -> Result<Vec<u8>, BusError> {
    let message = BusMessage {
        origin,
        edit: edit.clone(),
    };
    Ok(serde_json::to_vec(&message)?)
}

/// Decode a received payload; `None` for malformed input or our own echo.
fn decode_payload(payload: &[u8], own_origin: Uuid, topic: &str) -> Option<Edit> {
    match serde_json::from_slice::<BusMessage>(payload) {
        Ok(message) if message.origin == own_origin => None,
        Ok(message) => Some(message.edit),
        Err(e) => {
            log::warn!("Skipping malformed replication payload on {topic}: {e}");
            None
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BusError>>,
) -> Result<T, BusError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BusError::Timeout(limit))?
}

/// Opens a fresh subscription stream of raw payloads.
#[cfg_attr(not(feature = "redis"), allow(dead_code))]
type Reopen = Box<dyn Fn() -> BoxFuture<'static, Result<BoxStream<'static, Vec<u8>>, BusError>> + Send + Sync>;

#[cfg_attr(not(feature = "redis"), allow(dead_code))]
struct Resubscribe {
    topic: String,
    reopen: Reopen,
    current: Option<BoxStream<'static, Vec<u8>>>,
    backoff: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// Raw payloads of `first`, reopened through `reopen` whenever it ends.
///
/// Reconnect attempts back off exponentially from `initial_backoff` up to
/// `max_backoff`; the stream itself never ends.
#[cfg_attr(not(feature = "redis"), allow(dead_code))]
fn resubscribing(
    topic: String,
    first: BoxStream<'static, Vec<u8>>,
    reopen: Reopen,
    initial_backoff: Duration,
    max_backoff: Duration,
) -> BoxStream<'static, Vec<u8>> {
    let state = Resubscribe {
        topic,
        reopen,
        current: Some(first),
        backoff: initial_backoff,
        initial_backoff,
        max_backoff,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payloads) = state.current.as_mut() {
                match payloads.next().await {
                    Some(payload) => return Some((payload, state)),
                    None => {
                        log::warn!("Subscription on {} lost, reconnecting", state.topic);
                        state.current = None;
                    }
                }
            }

            tokio::time::sleep(state.backoff).await;
            match (state.reopen)().await {
                Ok(payloads) => {
                    log::info!("Resubscribed to {}", state.topic);
                    state.current = Some(payloads);
                    state.backoff = state.initial_backoff;
                }
                Err(e) => {
                    state.backoff = (state.backoff * 2).min(state.max_backoff);
                    log::warn!(
                        "Resubscribing to {} failed, retrying in {:?}: {e}",
                        state.topic,
                        state.backoff
                    );
                }
            }
        }
    })
    .boxed()
}
