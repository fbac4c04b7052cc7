//! Authoritative document state and its transition function.
//!
//! The document is mutated only through [`Document::transition`], which the
//! owning hub calls from its control loop. Positions are code-point offsets
//! so multi-byte characters never split.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::{Edit, EditKind};

/// Opaque document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for documents without a configured name.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Replication topic for this document.
    pub fn topic(&self) -> String {
        format!("document:{}", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocumentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Document text at a given version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub version: u64,
    pub text: String,
}

/// Text buffer plus version counter.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    content: String,
    /// Cached length in code points
    chars: usize,
    version: u64,
}

impl Document {
    /// Create a document at version 0.
    pub fn new(id: impl Into<DocumentId>, initial_text: impl Into<String>) -> Self {
        let content = initial_text.into();
        let chars = content.chars().count();
        Self {
            id: id.into(),
            content,
            chars,
            version: 0,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Length in code points.
    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn revision(&self) -> Revision {
        Revision {
            version: self.version,
            text: self.content.clone(),
        }
    }

    /// Apply one edit and return the resulting full text and version.
    ///
    /// Coordinates are clamped, never rejected:
    /// - `position` into `[0, len]`
    /// - a delete's end into `[position, len]`, negative lengths count as 0
    ///
    /// The version always advances by exactly one.
    pub fn transition(&mut self, edit: &Edit) -> Revision {
        let position = clamp_offset(edit.position, self.chars);

        match edit.kind {
            EditKind::Insert => {
                let at = self.byte_offset(position);
                self.content.insert_str(at, &edit.content);
                self.chars += edit.content.chars().count();
            }
            EditKind::Delete => {
                let span = edit.length.max(0);
                let end = clamp_offset((position as i64).saturating_add(span), self.chars)
                    .max(position);
                if end > position {
                    let start_byte = self.byte_offset(position);
                    let end_byte = self.byte_offset(end);
                    self.content.replace_range(start_byte..end_byte, "");
                    self.chars -= end - position;
                }
            }
        }

        self.version += 1;
        self.revision()
    }

    /// Byte index of the `offset`-th code point (`len` maps to the end).
    fn byte_offset(&self, offset: usize) -> usize {
        if offset >= self.chars {
            return self.content.len();
        }
        self.content
            .char_indices()
            .nth(offset)
            .map_or(self.content.len(), |(index, _)| index)
    }
}

fn clamp_offset(value: i64, len: usize) -> usize {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    // In [0, len], which always fits back into usize
    value.clamp(0, len) as usize
}
