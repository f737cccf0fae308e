//! Primary index
//!
//! The authoritative mapping from primary key to the pair of heap offsets
//! holding the record. The in-memory map is the state; the write-ahead log
//! is the serialization boundary; the snapshot (`pk.idx`) is an
//! optimization that bounds replay time. The two are kept deliberately
//! separate: mutations go log-first, and recovery is snapshot + replay.

use crate::storage::error::DbResult;
use crate::storage::snapshot;
use crate::storage::wal::{LogOp, LogRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Where a primary key's records live in the two heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapOffsets {
    pub ts: u64,
    pub meta: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PrimarySnapshot {
    lsn: u64,
    entries: BTreeMap<String, HeapOffsets>,
}

/// Ordered pk → offsets map plus the log sequence counter.
#[derive(Debug, Default)]
pub struct PrimaryIndex {
    entries: BTreeMap<String, HeapOffsets>,
    last_lsn: u64,
}

impl PrimaryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot, or an empty index if none exists. Checksum
    /// failures propagate; the engine refuses to open on them.
    pub fn load(path: &Path) -> DbResult<Self> {
        match snapshot::read_snapshot::<PrimarySnapshot>(path)? {
            Some(snap) => Ok(Self {
                entries: snap.entries,
                last_lsn: snap.lsn,
            }),
            None => Ok(Self::new()),
        }
    }

    /// Write the snapshot atomically.
    pub fn save(&self, path: &Path) -> DbResult<()> {
        snapshot::write_snapshot(
            path,
            &PrimarySnapshot {
                lsn: self.last_lsn,
                entries: self.entries.clone(),
            },
        )
    }

    /// Highest lsn applied to this index.
    pub fn last_lsn(&self) -> u64 {
        self.last_lsn
    }

    /// Allocate the next lsn. Called immediately before appending the
    /// matching record to the log.
    pub fn next_lsn(&mut self) -> u64 {
        self.last_lsn += 1;
        self.last_lsn
    }

    /// Apply a replayed log record. Idempotent: replaying an already
    /// applied record reproduces the same state.
    pub fn apply(&mut self, record: &LogRecord) {
        self.last_lsn = self.last_lsn.max(record.lsn);
        match &record.op {
            LogOp::Put {
                pk,
                ts_offset,
                meta_offset,
            } => {
                self.entries.insert(
                    pk.clone(),
                    HeapOffsets {
                        ts: *ts_offset,
                        meta: *meta_offset,
                    },
                );
            }
            LogOp::Del { pk } => {
                self.entries.remove(pk);
            }
            // trigger records are applied by the engine
            LogOp::TriggerAdd { .. } | LogOp::TriggerDel { .. } => {}
        }
    }

    pub fn insert(&mut self, pk: String, offsets: HeapOffsets) {
        self.entries.insert(pk, offsets);
    }

    pub fn remove(&mut self, pk: &str) -> Option<HeapOffsets> {
        self.entries.remove(pk)
    }

    pub fn get(&self, pk: &str) -> Option<HeapOffsets> {
        self.entries.get(pk).copied()
    }

    pub fn contains(&self, pk: &str) -> bool {
        self.entries.contains_key(pk)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All primary keys in ascending order.
    pub fn pks(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeapOffsets)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::wal::WriteAheadLog;
    use tempfile::tempdir;

    fn offsets(n: u64) -> HeapOffsets {
        HeapOffsets {
            ts: 8 + n * 160,
            meta: n * 20,
        }
    }

    #[test]
    fn test_basic_map_operations() {
        let mut index = PrimaryIndex::new();
        index.insert("ts-1".to_string(), offsets(1));
        index.insert("ts-0".to_string(), offsets(0));

        assert_eq!(index.len(), 2);
        assert_eq!(index.get("ts-0"), Some(offsets(0)));
        assert!(index.contains("ts-1"));
        assert!(!index.contains("ts-2"));

        // keys come back ordered
        let pks: Vec<&String> = index.pks().collect();
        assert_eq!(pks, vec!["ts-0", "ts-1"]);

        assert_eq!(index.remove("ts-0"), Some(offsets(0)));
        assert_eq!(index.remove("ts-0"), None);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pk.idx");

        let mut index = PrimaryIndex::new();
        for i in 0..5 {
            let lsn = index.next_lsn();
            index.insert(format!("ts-{}", i), offsets(lsn));
        }
        index.save(&path).unwrap();

        let restored = PrimaryIndex::load(&path).unwrap();
        assert_eq!(restored.len(), 5);
        assert_eq!(restored.last_lsn(), 5);
        assert_eq!(restored.get("ts-3"), index.get("ts-3"));
    }

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = tempdir().unwrap();
        let index = PrimaryIndex::load(&dir.path().join("pk.idx")).unwrap();
        assert!(index.is_empty());
        assert_eq!(index.last_lsn(), 0);
    }

    #[test]
    fn test_snapshot_plus_replay_reconstructs_state() {
        let dir = tempdir().unwrap();
        let idx_path = dir.path().join("pk.idx");
        let log_path = dir.path().join("pk.log");

        // build state through the log, snapshot halfway
        let mut index = PrimaryIndex::new();
        let mut wal = WriteAheadLog::open(&log_path).unwrap();

        for i in 0..4 {
            let lsn = index.next_lsn();
            let record = LogRecord {
                lsn,
                op: LogOp::Put {
                    pk: format!("ts-{}", i),
                    ts_offset: offsets(i).ts,
                    meta_offset: offsets(i).meta,
                },
            };
            wal.append(&record).unwrap();
            index.apply(&record);

            if i == 1 {
                index.save(&idx_path).unwrap();
            }
        }
        let del = LogRecord {
            lsn: index.next_lsn(),
            op: LogOp::Del {
                pk: "ts-0".to_string(),
            },
        };
        wal.append(&del).unwrap();
        index.apply(&del);

        // recover: snapshot + replay of lsn > snapshot lsn
        let mut recovered = PrimaryIndex::load(&idx_path).unwrap();
        let snapshot_lsn = recovered.last_lsn();
        assert_eq!(snapshot_lsn, 2);

        let mut wal = WriteAheadLog::open(&log_path).unwrap();
        for record in wal.replay().unwrap() {
            if record.lsn > snapshot_lsn {
                recovered.apply(&record);
            }
        }

        assert_eq!(recovered.len(), index.len());
        assert_eq!(recovered.last_lsn(), index.last_lsn());
        assert!(!recovered.contains("ts-0"));
        assert!(recovered.contains("ts-3"));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let record = LogRecord {
            lsn: 1,
            op: LogOp::Put {
                pk: "ts-0".to_string(),
                ts_offset: 8,
                meta_offset: 0,
            },
        };

        let mut index = PrimaryIndex::new();
        index.apply(&record);
        index.apply(&record);
        assert_eq!(index.len(), 1);
        assert_eq!(index.last_lsn(), 1);

        let del = LogRecord {
            lsn: 2,
            op: LogOp::Del {
                pk: "ts-0".to_string(),
            },
        };
        index.apply(&del);
        index.apply(&del);
        assert!(index.is_empty());
    }
}
