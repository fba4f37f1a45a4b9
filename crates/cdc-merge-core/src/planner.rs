//! Batch merge planning
//!
//! Collapses a batch of change records into one operation per entity key.
//! The planner is a pure function: it owns no state and performs no I/O.
//!
//! ## Algorithm
//!
//! 1. Group records by key, keeping arrival order within each group.
//! 2. Select the winning record of each group (last by arrival, or latest
//!    `ts_ms` when ordering by source timestamp).
//! 3. The winner decides the action: `Upsert(after)` or `Delete`.
//!
//! Re-applying the same winner is idempotent, and create-then-delete churn
//! inside one batch resolves to a single `Delete`.

use crate::record::{ChangeOperation, ChangeRecord, EntityKey, SourcePosition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// How the winning record of a key group is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingMode {
    /// Trust delivery order within the batch
    #[default]
    Arrival,
    /// Prefer the greatest `ts_ms`; arrival order breaks ties
    SourceTimestamp,
}

/// Final action for one key
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    Upsert { document: Value },
    Delete,
}

/// One planned operation, with the positions that contributed to it
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    pub key: EntityKey,
    pub action: PlanAction,
    /// Operation of the winning record
    pub operation: ChangeOperation,
    /// Position of the winning record
    pub position: SourcePosition,
    /// Earliest position among all records for this key in the batch
    pub first_position: SourcePosition,
    /// Number of records for this key that lost to the winner
    pub superseded: usize,
}

impl PlanEntry {
    pub fn is_upsert(&self) -> bool {
        matches!(self.action, PlanAction::Upsert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.action, PlanAction::Delete)
    }

    pub fn document(&self) -> Option<&Value> {
        match &self.action {
            PlanAction::Upsert { document } => Some(document),
            PlanAction::Delete => None,
        }
    }
}

/// Deduplicated set of operations derived from a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPlan {
    entries: Vec<PlanEntry>,
}

impl OperationPlan {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn upserts(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.is_upsert())
    }

    pub fn deletes(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.is_delete())
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts().count()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes().count()
    }

    /// Records that were collapsed away across all keys
    pub fn superseded_count(&self) -> usize {
        self.entries.iter().map(|e| e.superseded).sum()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }
}

impl IntoIterator for OperationPlan {
    type Item = PlanEntry;
    type IntoIter = std::vec::IntoIter<PlanEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Per-key accumulator while scanning the batch
struct KeyGroup {
    winner: ChangeRecord,
    first_position: SourcePosition,
    seen: usize,
}

/// Pure batch-to-plan function
#[derive(Debug, Clone, Default)]
pub struct MergePlanner {
    ordering: OrderingMode,
}

impl MergePlanner {
    pub fn new(ordering: OrderingMode) -> Self {
        Self { ordering }
    }

    /// Build the operation plan for an ordered batch of records
    pub fn plan(&self, records: impl IntoIterator<Item = ChangeRecord>) -> OperationPlan {
        let mut index: HashMap<EntityKey, usize> = HashMap::new();
        let mut groups: Vec<KeyGroup> = Vec::new();

        for record in records {
            match index.get(&record.key).copied() {
                Some(slot) => {
                    let group = &mut groups[slot];
                    group.seen += 1;
                    group.first_position = group.first_position.min(record.position);
                    if self.supersedes(&record, &group.winner) {
                        group.winner = record;
                    }
                }
                None => {
                    index.insert(record.key.clone(), groups.len());
                    groups.push(KeyGroup {
                        first_position: record.position,
                        winner: record,
                        seen: 1,
                    });
                }
            }
        }

        let entries = groups
            .into_iter()
            .map(|group| {
                let winner = group.winner;
                let action = match (winner.operation, winner.after) {
                    (op, Some(document)) if op.is_upsert() => PlanAction::Upsert { document },
                    // Decoder guarantees an after image for upserts
                    (op, None) if op.is_upsert() => PlanAction::Upsert {
                        document: Value::Object(Default::default()),
                    },
                    _ => PlanAction::Delete,
                };
                PlanEntry {
                    key: winner.key,
                    action,
                    operation: winner.operation,
                    position: winner.position,
                    first_position: group.first_position,
                    superseded: group.seen - 1,
                }
            })
            .collect();

        OperationPlan { entries }
    }

    /// Whether `candidate`, arriving after `current`, should replace it
    fn supersedes(&self, candidate: &ChangeRecord, current: &ChangeRecord) -> bool {
        match self.ordering {
            OrderingMode::Arrival => true,
            OrderingMode::SourceTimestamp => {
                match (candidate.source_timestamp, current.source_timestamp) {
                    (Some(new), Some(old)) => new >= old,
                    _ => true,
                }
            }
        }
    }
}
