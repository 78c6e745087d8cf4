//! Audit change records.
//!
//! Every insert, update, and delete — whether it reaches storage through a
//! repository call or through a low-level storage trigger — appends exactly
//! one [`ChangeRecord`]. Records are immutable once written; the
//! application never updates or deletes them.

use crate::{ActorId, Error, RecordId, SiteId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sentinel written to the audit row's `field_name` column: change records
/// capture full entity snapshots, never per-field deltas.
pub const ALL_FIELDS: &str = "ALL_FIELDS";

/// Actor recorded when a mutation carries no user attribution.
pub const SYSTEM_ACTOR: &str = "system";

/// The kind of mutation a change record or queued operation describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    /// Canonical wire string, matching the persisted `action_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(ChangeAction::Insert),
            "UPDATE" => Ok(ChangeAction::Update),
            "DELETE" => Ok(ChangeAction::Delete),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

/// An immutable audit entry describing one logical mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Storage-assigned identifier (0 until persisted)
    pub id: i64,
    /// Table the mutation targeted
    pub table_name: TableName,
    /// Record the mutation targeted
    pub record_id: RecordId,
    /// Mutation kind
    pub action: ChangeAction,
    /// Full JSON snapshot of the entity before the mutation (None for inserts)
    pub old_values: Option<serde_json::Value>,
    /// Full JSON snapshot of the entity after the mutation (None for deletes)
    pub new_values: Option<serde_json::Value>,
    /// Who made the change
    pub actor: ActorId,
    /// Site context, when the entity is site-scoped
    pub site_id: Option<SiteId>,
    /// Optional free-form context
    pub description: Option<String>,
    /// When the change happened (epoch millis)
    pub changed_at: Timestamp,
}

impl ChangeRecord {
    /// Build a change record for a mutation.
    ///
    /// The actor defaults to [`SYSTEM_ACTOR`] when empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table_name: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        action: ChangeAction,
        old_values: Option<serde_json::Value>,
        new_values: Option<serde_json::Value>,
        actor: impl Into<ActorId>,
        site_id: Option<SiteId>,
        changed_at: Timestamp,
    ) -> Self {
        let actor = actor.into();
        let actor = if actor.is_empty() {
            SYSTEM_ACTOR.to_string()
        } else {
            actor
        };

        Self {
            id: 0,
            table_name: table_name.into(),
            record_id: record_id.into(),
            action,
            old_values,
            new_values,
            actor,
            site_id,
            description: None,
            changed_at,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
