//! JSON wire protocol between sessions and the hub.
//!
//! Inbound (client → server), one edit per text frame:
//! ```text
//! {"user_id": "...", "type": "INSERT" | "DELETE", "position": 3, "content": "x", "length": 0}
//! ```
//!
//! Outbound (server → client), identical for the join snapshot and every update:
//! ```text
//! {"version": 7, "full_text": "..."}
//! ```
//!
//! Positions and lengths are code-point offsets and are never trusted; the
//! document clamps them before use.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::Revision;

/// Kind of positional edit.
///
/// Only `INSERT` and `DELETE` are accepted. Any other tag fails decoding, so
/// an unrecognized kind never reaches the document and never bumps its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EditKind {
    Insert,
    Delete,
}

/// A single Insert or Delete instruction ("delta").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edit {
    /// Session that authored the edit. Stamped by the gateway.
    #[serde(rename = "user_id", alias = "author_id", default)]
    pub author_id: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: EditKind,
    /// Code-point offset, clamped into `[0, len]` on apply
    #[serde(default)]
    pub position: i64,
    /// Inserted text (ignored for deletes)
    #[serde(alias = "text", default)]
    pub content: String,
    /// Deletion span (ignored for inserts)
    #[serde(default)]
    pub length: i64,
}

impl Edit {
    /// Create an insert of `content` at `position`.
    pub fn insert(position: i64, content: impl Into<String>) -> Self {
        Self {
            author_id: String::new(),
            kind: EditKind::Insert,
            position,
            content: content.into(),
            length: 0,
        }
    }

    /// Create a delete of `length` code points starting at `position`.
    pub fn delete(position: i64, length: i64) -> Self {
        Self {
            author_id: String::new(),
            kind: EditKind::Delete,
            position,
            content: String::new(),
            length,
        }
    }

    /// Replace the author with `author_id`.
    pub fn authored_by(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = author_id.into();
        self
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

/// Full document state pushed to sessions.
///
/// Always carries the complete text, never a diff, so a client that applies
/// the latest message it received is consistent no matter how many
/// intermediate messages it missed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub version: u64,
    pub full_text: String,
}

impl SyncMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

impl From<Revision> for SyncMessage {
    fn from(revision: Revision) -> Self {
        Self {
            version: revision.version,
            full_text: revision.text,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Decode(#[source] serde_json::Error),
}
