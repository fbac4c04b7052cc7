//! In-process replication broker.
//!
//! Each topic is a tokio broadcast channel; every subscriber gets an
//! independent receiver buffering up to `capacity` payloads. A receiver that
//! falls further behind skips the lost payloads with a warning, the same
//! loss a real pub/sub transport may exhibit.
//!
//! [`LocalBroker::endpoint`] hands out one [`LocalBus`] per simulated
//! server instance, so several hubs in one process replicate to each other
//! exactly as separate processes would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::{decode_payload, encode_payload, with_timeout, BusError, ReplicationBus};
use crate::document::DocumentId;
use crate::protocol::Edit;

type Payload = Arc<Vec<u8>>;

/// Shared topic table.
pub struct LocalBroker {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Payload>>>>,
    capacity: usize,
    published: Arc<AtomicU64>,
}

impl LocalBroker {
    /// Create a broker buffering `capacity` payloads per subscriber.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
            published: Arc::new(AtomicU64::new(0)),
        })
    }

    /// A new bus endpoint with its own origin id.
    pub fn endpoint(self: &Arc<Self>, publish_timeout: Duration) -> LocalBus {
        LocalBus {
            broker: Arc::clone(self),
            origin: Uuid::new_v4(),
            publish_timeout,
        }
    }

    /// Payloads accepted across all topics.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of topics seen so far.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    async fn topic(&self, name: &str) -> broadcast::Sender<Payload> {
        // Fast path: read lock
        {
            let topics = self.topics.read().await;
            if let Some(sender) = topics.get(name) {
                return sender.clone();
            }
        }

        // Slow path: double-check under the write lock
        let mut topics = self.topics.write().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

/// One instance's connection to a [`LocalBroker`].
#[derive(Clone)]
pub struct LocalBus {
    broker: Arc<LocalBroker>,
    origin: Uuid,
    publish_timeout: Duration,
}

impl LocalBus {
    pub fn origin(&self) -> Uuid {
        self.origin
    }
}

impl ReplicationBus for LocalBus {
    fn publish<'a>(
        &'a self,
        document_id: &'a DocumentId,
        edit: &'a Edit,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let payload = Arc::new(encode_payload(self.origin, edit)?);
            with_timeout(self.publish_timeout, async move {
                let sender = self.broker.topic(&document_id.topic()).await;
                // No subscribers is not an error for fire-and-forget pub/sub
                let receivers = sender.send(payload).unwrap_or(0);
                self.broker.published.fetch_add(1, Ordering::Relaxed);
                log::trace!("Published edit to {document_id} ({receivers} receivers)");
                Ok(())
            })
            .await
        }
        .boxed()
    }

    fn subscribe<'a>(
        &'a self,
        document_id: &'a DocumentId,
    ) -> BoxFuture<'a, Result<BoxStream<'static, Edit>, BusError>> {
        async move {
            let topic = document_id.topic();
            let receiver = self.broker.topic(&topic).await.subscribe();
            let origin = self.origin;

            let payloads = futures_util::stream::unfold(
                (receiver, topic.clone()),
                |(mut receiver, topic)| async move {
                    loop {
                        match receiver.recv().await {
                            Ok(payload) => return Some((payload, (receiver, topic))),
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Subscription on {topic} lagged by {n} messages");
                            }
                            Err(RecvError::Closed) => return None,
                        }
                    }
                },
            );

            let edits = payloads
                .filter_map(move |payload| {
                    futures_util::future::ready(decode_payload(&payload, origin, &topic))
                })
                .boxed();
            Ok(edits)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_endpoints_exchange_edits() {
        let broker = LocalBroker::new(16);
        let a = broker.endpoint(Duration::from_millis(200));
        let b = broker.endpoint(Duration::from_millis(200));
        let doc = DocumentId::new("shared");

        let mut from_a = b.subscribe(&doc).await.unwrap();
        let edit = Edit::insert(0, "hi").authored_by("s1");
        a.publish(&doc, &edit).await.unwrap();

        let received = timeout(WAIT, from_a.next()).await.unwrap().unwrap();
        assert_eq!(received, edit);
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn test_own_publishes_are_not_delivered_back() {
        let broker = LocalBroker::new(16);
        let a = broker.endpoint(Duration::from_millis(200));
        let b = broker.endpoint(Duration::from_millis(200));
        let doc = DocumentId::new("shared");

        let mut own = a.subscribe(&doc).await.unwrap();
        a.publish(&doc, &Edit::insert(0, "mine")).await.unwrap();
        b.publish(&doc, &Edit::insert(0, "theirs")).await.unwrap();

        let received = timeout(WAIT, own.next()).await.unwrap().unwrap();
        assert_eq!(received.content, "theirs");
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = LocalBroker::new(16);
        let a = broker.endpoint(Duration::from_millis(200));
        let b = broker.endpoint(Duration::from_millis(200));

        let mut doc2 = b.subscribe(&DocumentId::new("doc2")).await.unwrap();
        a.publish(&DocumentId::new("doc1"), &Edit::insert(0, "x"))
            .await
            .unwrap();

        let result = timeout(Duration::from_millis(100), doc2.next()).await;
        assert!(result.is_err(), "doc2 should not receive doc1 edits");
        assert_eq!(broker.topic_count().await, 2);
    }

    #[tokio::test]
    async fn test_malformed_payload_skipped_not_fatal() {
        let broker = LocalBroker::new(16);
        let a = broker.endpoint(Duration::from_millis(200));
        let b = broker.endpoint(Duration::from_millis(200));
        let doc = DocumentId::new("shared");

        let mut stream = b.subscribe(&doc).await.unwrap();

        let raw = broker.topic(&doc.topic()).await;
        raw.send(Arc::new(b"{not json".to_vec())).unwrap();
        a.publish(&doc, &Edit::delete(0, 1)).await.unwrap();

        let received = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(received, Edit::delete(0, 1));
    }

    #[tokio::test]
    async fn test_lagged_subscriber_keeps_receiving() {
        let broker = LocalBroker::new(2);
        let a = broker.endpoint(Duration::from_millis(200));
        let b = broker.endpoint(Duration::from_millis(200));
        let doc = DocumentId::new("busy");

        let mut stream = b.subscribe(&doc).await.unwrap();
        for i in 0..5 {
            a.publish(&doc, &Edit::insert(i, i.to_string())).await.unwrap();
        }

        // Oldest payloads were overwritten; the newest survive
        let first = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(first.content, "3");
        let second = timeout(WAIT, stream.next()).await.unwrap().unwrap();
        assert_eq!(second.content, "4");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let broker = LocalBroker::new(4);
        let bus = broker.endpoint(Duration::from_millis(200));
        bus.publish(&DocumentId::new("lonely"), &Edit::insert(0, "x"))
            .await
            .unwrap();
        assert_eq!(broker.published(), 1);
    }
}
