//! Realtime echo filtering.
//!
//! Every row this client pushes to the remote is tagged with its opaque
//! client identifier. When a realtime change notification arrives, the
//! [`EchoFilter`] drops events whose embedded identifier matches our own:
//! they are echoes of writes we already hold, and reapplying them would
//! loop.
//!
//! A missing identifier is processed, not dropped. An event that cannot
//! be proven to be an echo is treated as a foreign change; the cost of a
//! redundant reapply is small, the cost of dropping a real foreign change
//! is divergence. Fail-open, by choice.

use crate::{RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};

/// Field the remote embeds in every row image to identify the writer.
pub const CLIENT_ID_FIELD: &str = "client_id";

/// The kind of row change a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventKind {
    Insert,
    Update,
    Delete,
}

/// A row-change notification pushed by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the change happened in
    pub table_name: TableName,
    /// Record that changed
    pub record_id: RecordId,
    /// Change kind
    pub kind: ChangeEventKind,
    /// Post-change row image (pre-change image for deletes)
    pub row: serde_json::Value,
    /// Remote `updated_at` of the row, when the notification carries one
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

impl ChangeEvent {
    /// The writer's client identifier embedded in the row image, if any.
    pub fn client_id(&self) -> Option<&str> {
        self.row.get(CLIENT_ID_FIELD).and_then(|v| v.as_str())
    }
}

/// Suppresses notifications caused by this client's own writes.
#[derive(Debug, Clone)]
pub struct EchoFilter {
    client_id: String,
}

impl EchoFilter {
    /// Create a filter for this process's client identifier.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// This process's identifier.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Whether the event should be applied locally.
    ///
    /// `false` only when the embedded identifier provably matches our
    /// own; absent or differing identifiers are processed.
    pub fn should_process(&self, event: &ChangeEvent) -> bool {
        match event.client_id() {
            Some(id) if !id.is_empty() => id != self.client_id,
            _ => true,
        }
    }
}
