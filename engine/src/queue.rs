//! The local mutation queue model and its coalescing rules.
//!
//! Each local mutation that has not yet been acknowledged by the remote is
//! one [`QueuedOperation`]. The invariant the queue maintains: at most one
//! non-terminal entry per (table, record) pair, carrying the latest
//! payload. [`coalesce`] is the pure decision procedure the durable queue
//! applies inside its enqueue transaction.

use crate::{ChangeAction, Error, RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a queue entry.
///
/// `Pending → Syncing → (removed | Failed)`; `Failed` entries are retried
/// with backoff until the retry cap, after which they become `Conflict`.
/// `Conflict` is terminal: the entry is never pushed again and waits for
/// manual resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Failed,
    Conflict,
}

impl QueueStatus {
    /// Canonical wire string, matching the persisted `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Failed => "failed",
            QueueStatus::Conflict => "conflict",
        }
    }

    /// Terminal entries no longer participate in coalescing or pushes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Conflict)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "syncing" => Ok(QueueStatus::Syncing),
            "failed" => Ok(QueueStatus::Failed),
            "conflict" => Ok(QueueStatus::Conflict),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// One outstanding local mutation awaiting remote acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Queue entry identifier
    pub id: String,
    /// Table the mutation targets
    pub table_name: TableName,
    /// Record the mutation targets
    pub record_id: RecordId,
    /// Mutation kind
    pub operation: ChangeAction,
    /// JSON snapshot of the entity at mutation time (empty object for deletes)
    pub payload: serde_json::Value,
    /// When the entry was created (epoch millis)
    pub created_at: Timestamp,
    /// Failed push attempts so far
    pub retry_count: u32,
    /// Error message from the last failed attempt
    pub last_error: Option<String>,
    /// Current lifecycle state
    pub status: QueueStatus,
    /// Remote `updated_at` observed when the mutation was made; a newer
    /// value on the server at push time means a conflict
    pub last_known_remote_updated_at: Option<Timestamp>,
}

impl QueuedOperation {
    /// Create a fresh pending entry.
    pub fn new(
        id: impl Into<String>,
        table_name: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        operation: ChangeAction,
        payload: serde_json::Value,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table_name: table_name.into(),
            record_id: record_id.into(),
            operation,
            payload,
            created_at,
            retry_count: 0,
            last_error: None,
            status: QueueStatus::Pending,
            last_known_remote_updated_at: None,
        }
    }

    /// Record the remote timestamp observed at mutation time.
    pub fn with_remote_updated_at(mut self, updated_at: Option<Timestamp>) -> Self {
        self.last_known_remote_updated_at = updated_at;
        self
    }
}

/// How a new mutation folds into the queue, given the existing
/// non-terminal entry for the same (table, record) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalesceDecision {
    /// No pending entry exists; append a new one.
    Append,
    /// Overwrite the pending entry's payload in place, keeping its
    /// operation kind (an INSERT followed by UPDATEs still pushes as one
    /// INSERT carrying the final state).
    MergePayload,
    /// Convert the pending entry into a DELETE.
    PromoteToDelete,
    /// Drop the pending entry and enqueue nothing: the record was deleted
    /// before its INSERT ever reached the remote.
    Cancel,
    /// Keep the pending entry as-is and ignore the incoming mutation
    /// (a DELETE is already queued; nothing can follow it).
    Ignore,
}

/// Decide how an incoming mutation coalesces with the existing pending
/// entry for the same record.
///
/// `pending` is the current non-terminal entry for the (table, record)
/// pair, if any. Terminal (conflict) entries must not be passed here —
/// they are out of the push pipeline and a new mutation starts over with
/// a fresh entry.
pub fn coalesce(pending: Option<&QueuedOperation>, incoming: ChangeAction) -> CoalesceDecision {
    let Some(pending) = pending else {
        return CoalesceDecision::Append;
    };

    debug_assert!(!pending.status.is_terminal());

    match (pending.operation, incoming) {
        // A queued DELETE is final for this key; later mutations for the
        // same id are inconsistent and dropped.
        (ChangeAction::Delete, _) => CoalesceDecision::Ignore,

        // Deletes always win over prior un-synced work.
        (ChangeAction::Insert, ChangeAction::Delete) => CoalesceDecision::Cancel,
        (ChangeAction::Update, ChangeAction::Delete) => CoalesceDecision::PromoteToDelete,

        // Repeat mutations keep one entry with the newest payload.
        (ChangeAction::Insert, _) | (ChangeAction::Update, _) => CoalesceDecision::MergePayload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(op: ChangeAction) -> QueuedOperation {
        QueuedOperation::new(
            "q-1",
            "products",
            "prod-1",
            op,
            json!({"name": "Ibuprofen"}),
            1000,
        )
    }

    #[test]
    fn first_mutation_appends() {
        assert_eq!(coalesce(None, ChangeAction::Insert), CoalesceDecision::Append);
        assert_eq!(coalesce(None, ChangeAction::Update), CoalesceDecision::Append);
        assert_eq!(coalesce(None, ChangeAction::Delete), CoalesceDecision::Append);
    }

    #[test]
    fn update_after_insert_keeps_insert() {
        let decision = coalesce(Some(&pending(ChangeAction::Insert)), ChangeAction::Update);
        assert_eq!(decision, CoalesceDecision::MergePayload);
    }

    #[test]
    fn update_after_update_replaces_payload() {
        let decision = coalesce(Some(&pending(ChangeAction::Update)), ChangeAction::Update);
        assert_eq!(decision, CoalesceDecision::MergePayload);
    }

    #[test]
    fn delete_after_insert_cancels_both() {
        let decision = coalesce(Some(&pending(ChangeAction::Insert)), ChangeAction::Delete);
        assert_eq!(decision, CoalesceDecision::Cancel);
    }

    #[test]
    fn delete_after_update_promotes() {
        let decision = coalesce(Some(&pending(ChangeAction::Update)), ChangeAction::Delete);
        assert_eq!(decision, CoalesceDecision::PromoteToDelete);
    }

    #[test]
    fn nothing_follows_a_delete() {
        for incoming in [
            ChangeAction::Insert,
            ChangeAction::Update,
            ChangeAction::Delete,
        ] {
            let decision = coalesce(Some(&pending(ChangeAction::Delete)), incoming);
            assert_eq!(decision, CoalesceDecision::Ignore);
        }
    }

    #[test]
    fn status_round_trip() {
        for status in [
            QueueStatus::Pending,
            QueueStatus::Syncing,
            QueueStatus::Failed,
            QueueStatus::Conflict,
        ] {
            let parsed: QueueStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!(matches!(
            "done".parse::<QueueStatus>(),
            Err(Error::UnknownStatus(_))
        ));
    }

    #[test]
    fn only_conflict_is_terminal() {
        assert!(QueueStatus::Conflict.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Syncing.is_terminal());
        assert!(!QueueStatus::Failed.is_terminal());
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_action() -> impl Strategy<Value = ChangeAction> {
            prop_oneof![
                Just(ChangeAction::Insert),
                Just(ChangeAction::Update),
                Just(ChangeAction::Delete),
            ]
        }

        /// Replay a mutation sequence through the decision procedure the
        /// way the durable queue does, tracking the single pending slot.
        fn replay(actions: &[ChangeAction]) -> Option<(ChangeAction, usize)> {
            let mut slot: Option<(ChangeAction, usize)> = None;

            for (i, &action) in actions.iter().enumerate() {
                let entry = slot.map(|(op, _)| {
                    QueuedOperation::new("q", "t", "r", op, serde_json::json!({"seq": 0}), 0)
                });
                match coalesce(entry.as_ref(), action) {
                    CoalesceDecision::Append => slot = Some((action, i)),
                    CoalesceDecision::MergePayload => {
                        let kept = slot.take().map(|(op, _)| op).unwrap_or(action);
                        slot = Some((kept, i));
                    }
                    CoalesceDecision::PromoteToDelete => slot = Some((ChangeAction::Delete, i)),
                    CoalesceDecision::Cancel => slot = None,
                    CoalesceDecision::Ignore => {}
                }
            }

            slot
        }

        proptest! {
            #[test]
            fn prop_last_payload_wins(actions in proptest::collection::vec(arb_action(), 1..20)) {
                // If the surviving entry is an INSERT or UPDATE, it must
                // carry the payload of the very last mutation in the
                // sequence: once a DELETE is pending nothing replaces it,
                // so a surviving non-delete means no mutation was ignored.
                if let Some((op, seq)) = replay(&actions) {
                    if op != ChangeAction::Delete {
                        prop_assert_eq!(seq, actions.len() - 1);
                        prop_assert!(actions[seq] != ChangeAction::Delete);
                    }
                }
            }

            #[test]
            fn prop_delete_after_unsynced_insert_leaves_nothing(
                updates in proptest::collection::vec(Just(ChangeAction::Update), 0..5)
            ) {
                // INSERT, any number of UPDATEs, then DELETE: the record
                // never reached the remote, so the queue ends empty.
                let mut actions = vec![ChangeAction::Insert];
                actions.extend(updates);
                actions.push(ChangeAction::Delete);
                prop_assert_eq!(replay(&actions), None);
            }
        }
    }
}
