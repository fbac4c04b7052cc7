//! # scribe-sync: Real-time collaborative text synchronization
//!
//! Serializes concurrent positional edits into one authoritative document
//! per hub and fans the resulting state out to every connected session and
//! to peer server instances.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────┐   Edit    ┌──────────────┐
//! │ Client      │ ◄──────────────► │ SyncServer   │ ────────► │ Hub          │
//! │ (per user)  │   JSON frames    │ (gateway)    │           │ (control     │
//! └─────────────┘                  └──────────────┘           │  loop)       │
//!                                         ▲                   └──────┬───────┘
//!                                         │ SyncMessage              │
//!                                         └──────────────────────────┤
//!                                                                    ▼
//!                                                            ┌──────────────┐
//!                                                            │ Replication  │ ◄──► peer hubs
//!                                                            │ Bus          │
//!                                                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`document`]: text buffer, version counter, clamped transition
//! - [`protocol`]: JSON wire messages (`Edit`, `SyncMessage`)
//! - [`session`]: per-connection outbound channels
//! - [`hub`]: single-writer control loop per document
//! - [`bus`]: cross-process replication (no-op, in-process, Redis)
//! - [`registry`]: document id → running hub
//! - [`server`]: WebSocket session gateway
//! - [`config`]: server and hub configuration

pub mod bus;
pub mod config;
pub mod document;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use bus::{BusError, LocalBroker, LocalBus, NoopBus, ReplicationBus};
#[cfg(feature = "redis")]
pub use bus::RedisBus;
pub use config::{HubConfig, ServerConfig};
pub use document::{Document, DocumentId, Revision};
pub use hub::{Hub, HubError, HubHandle, HubStats};
pub use protocol::{Edit, EditKind, ProtocolError, SyncMessage};
pub use registry::DocumentRegistry;
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{Departure, Session, SessionId, SessionOutbox};
