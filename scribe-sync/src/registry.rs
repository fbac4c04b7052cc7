//! Document registry: maps document ids to running hubs.
//!
//! Each document gets its own hub so edits stay isolated between documents.
//! Seeded documents stay loaded for the registry's lifetime. Any other
//! document is loaded by its first session and unloaded when its last
//! session is released, which drops the registry's handle and stops the hub.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bus::ReplicationBus;
use crate::config::HubConfig;
use crate::document::{Document, DocumentId};
use crate::hub::{Hub, HubHandle};

struct LoadedDocument {
    handle: HubHandle,
    /// Sessions currently holding the document
    sessions: AtomicUsize,
    /// Seeded documents are never unloaded
    pinned: bool,
}

impl LoadedDocument {
    fn new(handle: HubHandle, sessions: usize, pinned: bool) -> Self {
        Self {
            handle,
            sessions: AtomicUsize::new(sessions),
            pinned,
        }
    }

    fn retain(&self) -> HubHandle {
        self.sessions.fetch_add(1, Ordering::Relaxed);
        self.handle.clone()
    }
}

pub struct DocumentRegistry {
    hubs: RwLock<HashMap<DocumentId, LoadedDocument>>,
    config: HubConfig,
    bus: Option<Arc<dyn ReplicationBus>>,
}

impl DocumentRegistry {
    /// Create an empty registry. With a bus, every hub replicates through it.
    pub fn new(config: HubConfig, bus: Option<Arc<dyn ReplicationBus>>) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            config,
            bus,
        }
    }

    /// Start a hub for a seeded document, unless one is already running.
    ///
    /// The document stays loaded even without sessions.
    pub async fn insert(&self, document: Document) -> HubHandle {
        let id = document.id().clone();
        if let Some(loaded) = self.hubs.write().await.get_mut(&id) {
            log::warn!("Document {id} already running, ignoring seed");
            loaded.pinned = true;
            return loaded.handle.clone();
        }

        // Start outside the lock: subscribing may wait on the network
        let started = self.start(document).await;

        let mut hubs = self.hubs.write().await;
        match hubs.entry(id) {
            Entry::Occupied(mut slot) => {
                log::warn!("Document {} started concurrently, ignoring seed", slot.key());
                slot.get_mut().pinned = true;
                slot.get().handle.clone()
            }
            Entry::Vacant(slot) => slot.insert(LoadedDocument::new(started, 0, true)).handle.clone(),
        }
    }

    /// Get the hub for `id` on behalf of one session, starting it on an
    /// empty document if needed. Pair every call with [`release`](Self::release).
    pub async fn acquire(&self, id: &DocumentId) -> HubHandle {
        // Fast path: read lock
        if let Some(handle) = self.hubs.read().await.get(id).map(LoadedDocument::retain) {
            return handle;
        }

        let started = self.start(Document::new(id.clone(), "")).await;

        let mut hubs = self.hubs.write().await;
        match hubs.entry(id.clone()) {
            // Lost the race: `started` stops once dropped
            Entry::Occupied(slot) => slot.get().retain(),
            Entry::Vacant(slot) => {
                log::info!("Loaded document {id}");
                slot.insert(LoadedDocument::new(started, 1, false)).handle.clone()
            }
        }
    }

    /// Give back one session's hold on `id`.
    ///
    /// The last release of a document that was not seeded unloads it; its
    /// hub stops once the remaining handles are dropped.
    pub async fn release(&self, id: &DocumentId) {
        let mut hubs = self.hubs.write().await;
        let Some(loaded) = hubs.get_mut(id) else {
            return;
        };
        let sessions = loaded.sessions.get_mut();
        *sessions = sessions.saturating_sub(1);

        if *sessions == 0 && !loaded.pinned {
            hubs.remove(id);
            log::info!("Unloaded document {id}: no sessions left");
        }
    }

    /// Running hub for `id`, without holding the document.
    pub async fn get(&self, id: &DocumentId) -> Option<HubHandle> {
        self.hubs.read().await.get(id).map(|loaded| loaded.handle.clone())
    }

    /// Number of running hubs.
    pub async fn document_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    /// All served document ids.
    pub async fn documents(&self) -> Vec<DocumentId> {
        self.hubs.read().await.keys().cloned().collect()
    }

    async fn start(&self, document: Document) -> HubHandle {
        match &self.bus {
            Some(bus) => Hub::spawn_replicated(document, self.config, Arc::clone(bus)).await,
            None => Hub::spawn(document, self.config, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, LocalBroker};
    use crate::protocol::Edit;
    use futures_util::future::BoxFuture;
    use futures_util::stream::BoxStream;
    use futures_util::{FutureExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// Subscriptions to `gated` wait until the gate is opened.
    struct GatedBus {
        gated: DocumentId,
        gate: Notify,
    }

    impl ReplicationBus for GatedBus {
        fn publish<'a>(
            &'a self,
            _document_id: &'a DocumentId,
            _edit: &'a Edit,
        ) -> BoxFuture<'a, Result<(), BusError>> {
            futures_util::future::ready(Ok(())).boxed()
        }

        fn subscribe<'a>(
            &'a self,
            document_id: &'a DocumentId,
        ) -> BoxFuture<'a, Result<BoxStream<'static, Edit>, BusError>> {
            async move {
                if *document_id == self.gated {
                    self.gate.notified().await;
                }
                Ok::<_, BusError>(futures_util::stream::pending::<Edit>().boxed())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_acquire_returns_same_hub() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        let id = DocumentId::new("notes");

        let first = registry.acquire(&id).await;
        first.submit_edit(Edit::insert(0, "hi")).await.unwrap();
        let second = registry.acquire(&id).await;

        assert_eq!(second.snapshot().await.unwrap().text, "hi");
        assert_eq!(registry.document_count().await, 1);
    }

    #[tokio::test]
    async fn test_documents_are_isolated() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        let a = registry.acquire(&DocumentId::new("a")).await;
        let b = registry.acquire(&DocumentId::new("b")).await;

        a.submit_edit(Edit::insert(0, "only a")).await.unwrap();
        assert_eq!(b.snapshot().await.unwrap().version, 0);

        let mut ids = registry.documents().await;
        ids.sort();
        assert_eq!(ids, vec![DocumentId::new("a"), DocumentId::new("b")]);
    }

    #[tokio::test]
    async fn test_insert_seeded_document_once() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        registry.insert(Document::new("main", "seed")).await;
        let again = registry.insert(Document::new("main", "other")).await;

        assert_eq!(again.snapshot().await.unwrap().text, "seed");
        let found = registry.get(&DocumentId::new("main")).await.unwrap();
        assert_eq!(found.snapshot().await.unwrap().text, "seed");
        assert!(registry.get(&DocumentId::new("missing")).await.is_none());
    }

    #[tokio::test]
    async fn test_last_release_unloads_document() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        let id = DocumentId::new("scratch");

        let first = registry.acquire(&id).await;
        let _second = registry.acquire(&id).await;
        first.submit_edit(Edit::insert(0, "draft")).await.unwrap();

        registry.release(&id).await;
        assert_eq!(registry.document_count().await, 1);
        registry.release(&id).await;
        assert_eq!(registry.document_count().await, 0);
        assert!(registry.get(&id).await.is_none());

        // Extra and unknown releases are no-ops
        registry.release(&id).await;
        registry.release(&DocumentId::new("never-loaded")).await;

        // A later session starts from an empty document
        let fresh = registry.acquire(&id).await;
        assert_eq!(fresh.snapshot().await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_transient_documents_do_not_accumulate() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        registry.insert(Document::new("main", "")).await;

        for i in 0..1000 {
            let id = DocumentId::new(format!("junk-{i}"));
            let handle = registry.acquire(&id).await;
            drop(handle);
            registry.release(&id).await;
        }

        assert_eq!(registry.documents().await, vec![DocumentId::new("main")]);
    }

    #[tokio::test]
    async fn test_seeded_document_survives_release() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        let id = DocumentId::new("main");
        registry.insert(Document::new("main", "keep")).await;

        let handle = registry.acquire(&id).await;
        drop(handle);
        registry.release(&id).await;

        let found = registry.get(&id).await.unwrap();
        assert_eq!(found.snapshot().await.unwrap().text, "keep");
    }

    #[tokio::test]
    async fn test_unloaded_hub_stops() {
        let registry = DocumentRegistry::new(HubConfig::default(), None);
        let id = DocumentId::new("short-lived");
        let handle = registry.acquire(&id).await;
        let (session, mut outbox) = crate::session::Session::open(4);
        handle.join(session).await.unwrap();
        assert!(timeout(WAIT, outbox.recv()).await.unwrap().is_some());

        registry.release(&id).await;
        drop(handle);

        // The hub exits and drops its sessions, closing the outbox
        assert!(timeout(WAIT, outbox.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscription_does_not_block_other_documents() {
        let bus = Arc::new(GatedBus {
            gated: DocumentId::new("slow"),
            gate: Notify::new(),
        });
        let shared: Arc<dyn ReplicationBus> = bus.clone();
        let registry = Arc::new(DocumentRegistry::new(HubConfig::default(), Some(shared)));
        registry.insert(Document::new("existing", "here")).await;

        let loading = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.acquire(&DocumentId::new("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let existing = timeout(Duration::from_millis(500), registry.get(&DocumentId::new("existing")))
            .await
            .expect("lookup waited on another document's subscription");
        assert!(existing.is_some());
        let acquired = timeout(Duration::from_millis(500), registry.acquire(&DocumentId::new("existing")))
            .await
            .expect("acquire waited on another document's subscription");
        assert_eq!(acquired.snapshot().await.unwrap().text, "here");
        assert!(!loading.is_finished());

        bus.gate.notify_one();
        let slow = timeout(WAIT, loading).await.unwrap().unwrap();
        assert_eq!(slow.document_id().as_str(), "slow");
        assert_eq!(registry.document_count().await, 2);
    }

    #[tokio::test]
    async fn test_replicated_registries_converge() {
        let broker = LocalBroker::new(64);
        let timeout_limit = Duration::from_millis(200);
        let east_bus: Arc<dyn ReplicationBus> = Arc::new(broker.endpoint(timeout_limit));
        let west_bus: Arc<dyn ReplicationBus> = Arc::new(broker.endpoint(timeout_limit));
        let east = DocumentRegistry::new(HubConfig::default(), Some(east_bus));
        let west = DocumentRegistry::new(HubConfig::default(), Some(west_bus));
        let id = DocumentId::new("shared");

        let east_hub = east.acquire(&id).await;
        let west_hub = west.acquire(&id).await;
        east_hub.submit_edit(Edit::insert(0, "hello")).await.unwrap();

        timeout(WAIT, async {
            while west_hub.snapshot().await.unwrap().text != "hello" {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("west never saw the edit");
        assert_eq!(east_hub.snapshot().await.unwrap().version, 1);
    }
}
