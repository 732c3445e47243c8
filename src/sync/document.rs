//! The single shared document and the attribution of its last change.
//!
//! Changes are whole-content overwrites: the last applied change wins and
//! nothing is merged.

use serde::{Deserialize, Serialize};

use super::{validate_identity, Identity, SyncResult};

/// Who made the most recent change and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastEditor {
    /// Identity the change is attributed to
    pub identity: Identity,
    /// Server time of the change (milliseconds since epoch)
    pub timestamp: i64,
}

/// Read-only view of the document handed out for unicast and broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub content: String,
    pub last_editor: Option<LastEditor>,
}

/// Canonical document record. Owned by the hub, never shared directly.
#[derive(Debug, Default)]
pub struct DocumentState {
    content: String,
    last_editor: Option<LastEditor>,
    /// Number of changes applied since startup
    revision: u64,
}

impl DocumentState {
    /// Create an empty document with no editor
    pub fn new() -> Self {
        Self::default()
    }

    /// Current content and attribution
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            content: self.content.clone(),
            last_editor: self.last_editor.clone(),
        }
    }

    /// Overwrite the content and attribute the change to `identity`
    pub fn apply(&mut self, identity: &str, new_content: String) -> SyncResult<DocumentSnapshot> {
        let identity = validate_identity(identity)?;

        // Wall clock may step backwards; attribution timestamps must not.
        let now = chrono::Utc::now().timestamp_millis();
        let timestamp = match &self.last_editor {
            Some(prev) => now.max(prev.timestamp),
            None => now,
        };

        self.content = new_content;
        self.last_editor = Some(LastEditor { identity, timestamp });
        self.revision += 1;

        Ok(self.snapshot())
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Content size in bytes
    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
