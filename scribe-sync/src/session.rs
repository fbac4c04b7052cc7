//! Per-connection session bookkeeping.
//!
//! A session is split in two halves:
//! - [`Session`]: the only sender of the outbound channel, owned by the hub
//!   registry while the session is active
//! - [`SessionOutbox`]: the receiving end, held by the gateway's write loop
//!
//! Dropping the `Session` closes the channel, so the hub closes it exactly
//! once by removing it from the registry.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

/// Encoded outbound frame, shared across every session of a broadcast.
pub type Frame = Arc<str>;

/// Unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Why a session left the registry. Both close the outbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Connection ended or the gateway dropped its outbox
    Left,
    /// Outbound buffer was full during a broadcast
    Evicted,
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Sent,
    Full,
    Closed,
}

/// Hub-side half of a session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    outbound: mpsc::Sender<Frame>,
}

impl Session {
    /// Open a session with an outbound buffer of `capacity` frames (at least 1).
    pub fn open(capacity: usize) -> (Session, SessionOutbox) {
        Self::open_with_id(SessionId::new(), capacity)
    }

    pub fn open_with_id(id: SessionId, capacity: usize) -> (Session, SessionOutbox) {
        let (outbound, inbound) = mpsc::channel(capacity.max(1));
        (Session { id, outbound }, SessionOutbox { id, inbound })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Queue a frame without waiting.
    pub(crate) fn try_deliver(&self, frame: Frame) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Gateway-side half of a session.
#[derive(Debug)]
pub struct SessionOutbox {
    id: SessionId,
    inbound: mpsc::Receiver<Frame>,
}

impl SessionOutbox {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Next queued frame, or `None` once the hub has closed the session and
    /// every buffered frame has been drained.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Frame> {
        self.inbound.try_recv().ok()
    }

    /// Whether the hub side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }
}
