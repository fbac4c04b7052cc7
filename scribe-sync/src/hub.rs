//! Per-document synchronization hub.
//!
//! ```text
//!  gateway ──┐  Join / Leave / Edit          ┌──► session outboxes (try_send)
//!  gateway ──┼──────────────► control loop ──┤
//!  bus pump ─┘  (remote Edit)   │            └──► replication outbox ──► bus
//!                               ▼
//!                           Document
//! ```
//!
//! One task owns the [`Document`] and the session registry and processes
//! events strictly one at a time from a single FIFO channel. Nothing else
//! touches either, so there is no lock: diagnostics are answered by the loop
//! itself through oneshot replies.
//!
//! Delivery to sessions never blocks. A session whose buffer is full is
//! evicted on the spot and has to rejoin for a fresh snapshot. Replication is
//! handed to a separate publisher task through a bounded outbox; when that
//! outbox is full the edit is not replicated, and local sessions are still
//! served.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::bus::ReplicationBus;
use crate::config::HubConfig;
use crate::document::{Document, DocumentId, Revision};
use crate::protocol::{Edit, SyncMessage};
use crate::session::{Delivery, Departure, Frame, Session, SessionId};

/// Hub errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Hub for document {0} is no longer running")]
    Closed(DocumentId),
}

/// Where an edit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EditOrigin {
    /// A session of this instance: broadcast and replicate
    Local,
    /// A peer instance via the bus: broadcast only
    Remote,
}

pub(crate) enum HubEvent {
    Join(Session),
    Leave(SessionId),
    Edit(Edit, EditOrigin),
    Snapshot(oneshot::Sender<Revision>),
    Stats(oneshot::Sender<HubStats>),
}

/// Hub diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubStats {
    pub document_id: DocumentId,
    pub version: u64,
    pub active_sessions: usize,
    pub local_edits: u64,
    pub remote_edits: u64,
    pub broadcasts: u64,
    pub evictions: u64,
    pub replication_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    local_edits: u64,
    remote_edits: u64,
    broadcasts: u64,
    evictions: u64,
    replication_dropped: u64,
}

/// Control-loop state for one document.
pub struct Hub {
    document: Document,
    sessions: HashMap<SessionId, Session>,
    /// Edits waiting for the publisher task (None = no bus)
    replication: Option<mpsc::Sender<Edit>>,
    counters: Counters,
    /// Dropped with the hub, which ends the remote pump
    _pump_guard: Option<oneshot::Sender<()>>,
}

impl Hub {
    fn new(document: Document, replication: Option<mpsc::Sender<Edit>>) -> Self {
        Self {
            document,
            sessions: HashMap::new(),
            replication,
            counters: Counters::default(),
            _pump_guard: None,
        }
    }

    /// Start a hub for `document`.
    ///
    /// With a bus, locally submitted edits are published to it; nothing is
    /// received from it (see [`spawn_replicated`](Self::spawn_replicated)).
    /// Must be called within a tokio runtime.
    pub fn spawn(
        document: Document,
        config: HubConfig,
        bus: Option<Arc<dyn ReplicationBus>>,
    ) -> HubHandle {
        Self::launch(document, config, bus, None)
    }

    /// Start a hub that both publishes to and receives from `bus`.
    ///
    /// A failed subscription is logged and the hub runs without inbound
    /// replication; its own sessions are served either way. The
    /// subscription is dropped when the hub stops.
    pub async fn spawn_replicated(
        document: Document,
        config: HubConfig,
        bus: Arc<dyn ReplicationBus>,
    ) -> HubHandle {
        let document_id = document.id().clone();
        match bus.subscribe(&document_id).await {
            Ok(edits) => {
                let (guard, stopped) = oneshot::channel();
                let handle = Self::launch(document, config, Some(bus), Some(guard));
                spawn_remote_pump(&handle, edits, stopped);
                handle
            }
            Err(e) => {
                log::warn!(
                    "Replication subscription for document {document_id} failed, serving local sessions only: {e}"
                );
                Self::launch(document, config, Some(bus), None)
            }
        }
    }

    fn launch(
        document: Document,
        config: HubConfig,
        bus: Option<Arc<dyn ReplicationBus>>,
        pump_guard: Option<oneshot::Sender<()>>,
    ) -> HubHandle {
        let document_id = document.id().clone();
        let replication =
            bus.map(|bus| spawn_publisher(bus, document_id.clone(), config.replication_buffer));

        let (events, inbox) = mpsc::channel(config.event_capacity.max(1));
        let mut hub = Hub::new(document, replication);
        hub._pump_guard = pump_guard;
        tokio::spawn(hub.run(inbox));

        HubHandle {
            document_id,
            events,
        }
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<HubEvent>) {
        log::info!(
            "Hub for document {} started at version {}",
            self.document.id(),
            self.document.version()
        );

        while let Some(event) = inbox.recv().await {
            self.handle(event);
        }

        log::info!(
            "Hub for document {} stopped at version {}",
            self.document.id(),
            self.document.version()
        );
    }

    fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Join(session) => self.join(session),
            HubEvent::Leave(id) => self.leave(id, Departure::Left),
            HubEvent::Edit(edit, origin) => self.apply(edit, origin),
            HubEvent::Snapshot(reply) => {
                let _ = reply.send(self.document.revision());
            }
            HubEvent::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn join(&mut self, session: Session) {
        let id = session.id();
        if self.sessions.insert(id, session).is_some() {
            log::warn!("Session {id} joined twice, replacing the earlier registration");
        }
        log::info!(
            "Session {id} joined document {} ({} active)",
            self.document.id(),
            self.sessions.len()
        );

        let Some(frame) = encode_frame(self.document.revision()) else {
            return;
        };
        let delivery = match self.sessions.get(&id) {
            Some(session) => session.try_deliver(frame),
            None => return,
        };
        match delivery {
            Delivery::Sent => {}
            Delivery::Full => self.leave(id, Departure::Evicted),
            Delivery::Closed => self.leave(id, Departure::Left),
        }
    }

    fn leave(&mut self, id: SessionId, reason: Departure) {
        // Dropping the hub-side session is what closes the outbound channel
        let Some(session) = self.sessions.remove(&id) else {
            log::trace!("Session {id} already gone from document {}", self.document.id());
            return;
        };
        drop(session);

        match reason {
            Departure::Left => log::info!(
                "Session {id} left document {} ({} active)",
                self.document.id(),
                self.sessions.len()
            ),
            Departure::Evicted => {
                self.counters.evictions += 1;
                log::warn!(
                    "Session {id} evicted from document {}: outbound buffer full",
                    self.document.id()
                );
            }
        }
    }

    fn apply(&mut self, edit: Edit, origin: EditOrigin) {
        let revision = self.document.transition(&edit);
        match origin {
            EditOrigin::Local => self.counters.local_edits += 1,
            EditOrigin::Remote => self.counters.remote_edits += 1,
        }
        log::debug!(
            "Applied {:?} edit from {:?} to document {} at version {}",
            edit.kind,
            edit.author_id,
            self.document.id(),
            revision.version
        );

        if let Some(frame) = encode_frame(revision) {
            self.broadcast(frame);
        }
        if origin == EditOrigin::Local {
            self.replicate(edit);
        }
    }

    fn broadcast(&mut self, frame: Frame) {
        let mut departed = Vec::new();
        for (id, session) in &self.sessions {
            match session.try_deliver(Arc::clone(&frame)) {
                Delivery::Sent => {}
                Delivery::Full => departed.push((*id, Departure::Evicted)),
                Delivery::Closed => departed.push((*id, Departure::Left)),
            }
        }
        self.counters.broadcasts += 1;

        for (id, reason) in departed {
            self.leave(id, reason);
        }
    }

    fn replicate(&mut self, edit: Edit) {
        let Some(outbox) = &self.replication else {
            return;
        };
        match outbox.try_send(edit) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.replication_dropped += 1;
                log::warn!(
                    "Replication outbox full for document {}, edit not published",
                    self.document.id()
                );
            }
            Err(TrySendError::Closed(_)) => {
                log::warn!(
                    "Replication publisher for document {} stopped, continuing without it",
                    self.document.id()
                );
                self.replication = None;
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            document_id: self.document.id().clone(),
            version: self.document.version(),
            active_sessions: self.sessions.len(),
            local_edits: self.counters.local_edits,
            remote_edits: self.counters.remote_edits,
            broadcasts: self.counters.broadcasts,
            evictions: self.counters.evictions,
            replication_dropped: self.counters.replication_dropped,
        }
    }
}

fn encode_frame(revision: Revision) -> Option<Frame> {
    match SyncMessage::from(revision).encode() {
        Ok(text) => Some(Frame::from(text)),
        Err(e) => {
            log::error!("Failed to encode document state: {e}");
            None
        }
    }
}

/// Publishes queued edits one at a time, off the control loop.
fn spawn_publisher(
    bus: Arc<dyn ReplicationBus>,
    document_id: DocumentId,
    capacity: usize,
) -> mpsc::Sender<Edit> {
    let (outbox, mut queued) = mpsc::channel::<Edit>(capacity.max(1));
    tokio::spawn(async move {
        while let Some(edit) = queued.recv().await {
            if let Err(e) = bus.publish(&document_id, &edit).await {
                log::warn!("Replication publish for document {document_id} failed: {e}");
            }
        }
    });
    outbox
}

/// Feeds bus edits into the hub as remote edits until the hub is gone.
fn spawn_remote_pump(
    handle: &HubHandle,
    mut edits: BoxStream<'static, Edit>,
    mut stopped: oneshot::Receiver<()>,
) {
    let hub = handle.events.downgrade();
    let document_id = handle.document_id.clone();
    tokio::spawn(async move {
        loop {
            let edit = tokio::select! {
                _ = &mut stopped => break,
                edit = edits.next() => match edit {
                    Some(edit) => edit,
                    None => break,
                },
            };
            let Some(events) = hub.upgrade() else {
                break;
            };
            if events.send(HubEvent::Edit(edit, EditOrigin::Remote)).await.is_err() {
                break;
            }
        }
        log::info!("Replication subscription for document {document_id} ended");
    });
}

/// Cloneable entry point into a running hub.
///
/// Every call is a signal into the control loop; the hub stops once all
/// handles are dropped.
#[derive(Clone)]
pub struct HubHandle {
    document_id: DocumentId,
    events: mpsc::Sender<HubEvent>,
}

impl HubHandle {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Register `session`; it receives a snapshot of the current state first.
    pub async fn join(&self, session: Session) -> Result<(), HubError> {
        self.send(HubEvent::Join(session)).await
    }

    /// Unregister a session and close its outbox. Unknown ids are ignored.
    pub async fn leave(&self, id: SessionId) -> Result<(), HubError> {
        self.send(HubEvent::Leave(id)).await
    }

    /// Queue an edit from a local session.
    pub async fn submit_edit(&self, edit: Edit) -> Result<(), HubError> {
        self.send(HubEvent::Edit(edit, EditOrigin::Local)).await
    }

    /// Queue an edit received from a peer instance. Never re-published.
    pub async fn apply_remote_edit(&self, edit: Edit) -> Result<(), HubError> {
        self.send(HubEvent::Edit(edit, EditOrigin::Remote)).await
    }

    /// Current document state, ordered after every previously queued event.
    pub async fn snapshot(&self) -> Result<Revision, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(HubEvent::Snapshot(reply)).await?;
        response.await.map_err(|_| self.closed())
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, response) = oneshot::channel();
        self.send(HubEvent::Stats(reply)).await?;
        response.await.map_err(|_| self.closed())
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    async fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.events.send(event).await.map_err(|_| self.closed())
    }

    fn closed(&self) -> HubError {
        HubError::Closed(self.document_id.clone())
    }
}
