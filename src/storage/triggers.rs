//! Trigger table
//!
//! Triggers bind a procedure to a database operation: after the operation
//! commits, the procedure runs over the affected row and its outputs are
//! written to the trigger's target fields. The table is persisted as a
//! snapshot (`triggers.idx`) and additionally journaled in the primary-index
//! log, because unlike the secondary indexes it cannot be rebuilt from the
//! heaps.

use crate::storage::error::{DbError, DbResult};
use crate::storage::series::TimeSeries;
use crate::storage::snapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Database operations a trigger can bind to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Operation {
    InsertTs,
    UpsertMeta,
    DeleteTs,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::InsertTs => "insert_ts",
            Operation::UpsertMeta => "upsert_meta",
            Operation::DeleteTs => "delete_ts",
        }
    }

    pub fn parse(name: &str) -> DbResult<Self> {
        match name {
            "insert_ts" => Ok(Operation::InsertTs),
            "upsert_meta" => Ok(Operation::UpsertMeta),
            "delete_ts" => Ok(Operation::DeleteTs),
            other => Err(DbError::InvalidArgument(format!(
                "unknown trigger operation {}",
                other
            ))),
        }
    }
}

/// One trigger binding: procedure, target fields and optional argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Procedure name looked up in the registry at fire time.
    pub proc: String,
    /// Fields that receive the procedure's positional outputs.
    pub targets: Vec<String>,
    /// Optional series argument passed to the procedure.
    pub arg: Option<TimeSeries>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TriggerSnapshot {
    lsn: u64,
    triggers: BTreeMap<Operation, Vec<TriggerSpec>>,
}

/// Mapping from operation to its ordered trigger list.
#[derive(Debug, Default)]
pub struct TriggerTable {
    triggers: BTreeMap<Operation, Vec<TriggerSpec>>,
}

impl TriggerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trigger; firing order is insertion order.
    pub fn add(&mut self, on: Operation, spec: TriggerSpec) {
        self.triggers.entry(on).or_default().push(spec);
    }

    /// Remove the first trigger matching (operation, proc).
    pub fn remove_first(&mut self, on: Operation, proc: &str) -> DbResult<TriggerSpec> {
        let list = self
            .triggers
            .get_mut(&on)
            .ok_or_else(|| DbError::NotFound(format!("no triggers on {}", on.name())))?;
        let pos = list.iter().position(|t| t.proc == proc).ok_or_else(|| {
            DbError::NotFound(format!("no {} trigger on {}", proc, on.name()))
        })?;
        Ok(list.remove(pos))
    }

    /// Triggers bound to `on`, in firing order.
    pub fn for_operation(&self, on: Operation) -> &[TriggerSpec] {
        self.triggers.get(&on).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.values().all(Vec::is_empty)
    }

    /// Persist the table, tagged with the primary index lsn.
    pub fn save(&self, path: &Path, lsn: u64) -> DbResult<()> {
        snapshot::write_snapshot(
            path,
            &TriggerSnapshot {
                lsn,
                triggers: self.triggers.clone(),
            },
        )
    }

    /// Load a snapshot; returns the table and the lsn it was taken at, or
    /// `None` if the file does not exist.
    pub fn load(path: &Path) -> DbResult<Option<(Self, u64)>> {
        match snapshot::read_snapshot::<TriggerSnapshot>(path)? {
            Some(snap) => Ok(Some((
                Self {
                    triggers: snap.triggers,
                },
                snap.lsn,
            ))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(proc: &str) -> TriggerSpec {
        TriggerSpec {
            proc: proc.to_string(),
            targets: vec!["mean".to_string(), "std".to_string()],
            arg: None,
        }
    }

    #[test]
    fn test_firing_order_is_insertion_order() {
        let mut table = TriggerTable::new();
        table.add(Operation::InsertTs, spec("stats"));
        table.add(Operation::InsertTs, spec("corr"));
        table.add(Operation::InsertTs, spec("stats"));

        let procs: Vec<&str> = table
            .for_operation(Operation::InsertTs)
            .iter()
            .map(|t| t.proc.as_str())
            .collect();
        assert_eq!(procs, vec!["stats", "corr", "stats"]);
    }

    #[test]
    fn test_remove_first_match() {
        let mut table = TriggerTable::new();
        table.add(Operation::InsertTs, spec("stats"));
        table.add(Operation::InsertTs, spec("stats"));

        table.remove_first(Operation::InsertTs, "stats").unwrap();
        assert_eq!(table.for_operation(Operation::InsertTs).len(), 1);

        table.remove_first(Operation::InsertTs, "stats").unwrap();
        let err = table.remove_first(Operation::InsertTs, "stats").unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[test]
    fn test_unbound_operation_is_empty() {
        let table = TriggerTable::new();
        assert!(table.for_operation(Operation::DeleteTs).is_empty());
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("triggers.idx");

        let mut table = TriggerTable::new();
        table.add(Operation::InsertTs, spec("stats"));
        table.add(Operation::UpsertMeta, spec("corr"));
        table.save(&path, 42).unwrap();

        let (restored, lsn) = TriggerTable::load(&path).unwrap().unwrap();
        assert_eq!(lsn, 42);
        assert_eq!(restored.for_operation(Operation::InsertTs).len(), 1);
        assert_eq!(restored.for_operation(Operation::UpsertMeta).len(), 1);

        assert!(TriggerTable::load(&dir.path().join("absent.idx"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_operation_names() {
        assert_eq!(Operation::parse("insert_ts").unwrap(), Operation::InsertTs);
        assert_eq!(Operation::InsertTs.name(), "insert_ts");
        assert!(Operation::parse("select").is_err());
    }
}
