//! Redis pub/sub replication.
//!
//! Publishes go through one reconnecting connection manager shared by every
//! hub of this process; each subscription opens its own pub/sub connection
//! and reopens it with backoff whenever the server drops it.

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use super::{
    decode_payload, encode_payload, resubscribing, with_timeout, BusError, ReplicationBus,
};
use crate::document::DocumentId;
use crate::protocol::Edit;

const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Transport(e.to_string())
    }
}

/// Replication over Redis `PUBLISH`/`SUBSCRIBE`.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    connection: ConnectionManager,
    origin: Uuid,
    publish_timeout: Duration,
}

impl RedisBus {
    /// Connect to the server at `url`, e.g. `redis://localhost:6380/0`.
    pub async fn connect(url: &str, publish_timeout: Duration) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        log::info!("Connected to replication bus at {url}");
        Ok(Self {
            client,
            connection,
            origin: Uuid::new_v4(),
            publish_timeout,
        })
    }

    pub fn origin(&self) -> Uuid {
        self.origin
    }
}

/// Subscribe on a dedicated pub/sub connection.
fn open_subscription(
    client: redis::Client,
    topic: String,
) -> BoxFuture<'static, Result<BoxStream<'static, Vec<u8>>, BusError>> {
    async move {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&topic).await?;
        let payloads = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec())
            .boxed();
        Ok::<_, BusError>(payloads)
    }
    .boxed()
}

impl ReplicationBus for RedisBus {
    fn publish<'a>(
        &'a self,
        document_id: &'a DocumentId,
        edit: &'a Edit,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        async move {
            let payload = encode_payload(self.origin, edit)?;
            let mut connection = self.connection.clone();
            with_timeout(self.publish_timeout, async move {
                let receivers: i64 = connection.publish(document_id.topic(), payload).await?;
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
            let first = open_subscription(self.client.clone(), topic.clone()).await?;
            log::info!("Subscribed to {topic}");

            let client = self.client.clone();
            let reopen_topic = topic.clone();
            let payloads = resubscribing(
                topic.clone(),
                first,
                Box::new(move || open_subscription(client.clone(), reopen_topic.clone())),
                RESUBSCRIBE_INITIAL_BACKOFF,
                RESUBSCRIBE_MAX_BACKOFF,
            );

            let origin = self.origin;
            let edits = payloads
                .filter_map(move |payload| {
                    futures_util::future::ready(decode_payload(&payload, origin, &topic))
                })
                .boxed();
            Ok::<_, BusError>(edits)
        }
        .boxed()
    }
}
