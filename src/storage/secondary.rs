//! Secondary indexes
//!
//! Per-field inverse lookups from metadata value to the primary keys
//! carrying it. Two shapes behind one tagged variant:
//!
//! - `OrderedTreeIndex` — balanced ordered map, for high-cardinality fields;
//!   supports the full comparison operator set.
//! - `BitmapIndex` — per-value bit vectors over pk slot ids, for
//!   low-cardinality fields; supports equality and membership only. The
//!   slot table is persisted beside the bitmaps (`index_<field>_pks.idx`).
//!
//! Snapshots are best-effort and lsn-tagged: a missing, stale or corrupt
//! snapshot is not an error, the engine rebuilds the index by streaming the
//! metadata heap through the primary index.

use crate::storage::error::{DbError, DbResult};
use crate::storage::schema::{FieldValue, IndexKind};
use crate::storage::snapshot;
use crate::storage::types::{CompareOp, Condition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

/// Ordered-tree index: value → set of pks.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderedTreeIndex {
    entries: BTreeMap<FieldValue, BTreeSet<String>>,
}

impl OrderedTreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, value: FieldValue, pk: &str) {
        self.entries.entry(value).or_default().insert(pk.to_string());
    }

    pub fn remove(&mut self, value: &FieldValue, pk: &str) {
        if let Some(set) = self.entries.get_mut(value) {
            set.remove(pk);
            if set.is_empty() {
                self.entries.remove(value);
            }
        }
    }

    /// All pks whose value satisfies `op value`.
    pub fn query_cmp(&self, op: CompareOp, value: &FieldValue) -> BTreeSet<String> {
        match op {
            CompareOp::Eq => self.entries.get(value).cloned().unwrap_or_default(),
            _ => self
                .entries
                .iter()
                .filter(|(k, _)| op.accepts((*k).cmp(value)))
                .flat_map(|(_, pks)| pks.iter().cloned())
                .collect(),
        }
    }

    /// All pks whose value is in `values`.
    pub fn query_in(&self, values: &[FieldValue]) -> BTreeSet<String> {
        values
            .iter()
            .filter_map(|v| self.entries.get(v))
            .flat_map(|pks| pks.iter().cloned())
            .collect()
    }

    /// Every pk present in the index.
    pub fn all_pks(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|pks| pks.iter().cloned())
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &FieldValue> {
        self.entries.keys()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BitmapBuckets {
    lsn: u64,
    buckets: BTreeMap<FieldValue, Vec<u64>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotTable {
    slots: Vec<String>,
}

/// Bitmap index: value → bit vector addressed by pk slot id.
///
/// Slots are allocated once per pk and reused on re-insertion; a removed
/// pk keeps its slot with all bits cleared.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BitmapIndex {
    buckets: BTreeMap<FieldValue, Vec<u64>>,
    slots: Vec<String>,
    slot_of: HashMap<String, usize>,
}

impl BitmapIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, pk: &str) -> usize {
        if let Some(&s) = self.slot_of.get(pk) {
            return s;
        }
        let s = self.slots.len();
        self.slots.push(pk.to_string());
        self.slot_of.insert(pk.to_string(), s);
        s
    }

    fn set_bit(words: &mut Vec<u64>, slot: usize, on: bool) {
        let word = slot / 64;
        if word >= words.len() {
            words.resize(word + 1, 0);
        }
        let mask = 1u64 << (slot % 64);
        if on {
            words[word] |= mask;
        } else {
            words[word] &= !mask;
        }
    }

    fn get_bit(words: &[u64], slot: usize) -> bool {
        words
            .get(slot / 64)
            .map(|w| w & (1u64 << (slot % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn insert(&mut self, value: FieldValue, pk: &str) {
        let slot = self.slot(pk);
        let words = self.buckets.entry(value).or_default();
        Self::set_bit(words, slot, true);
    }

    pub fn remove(&mut self, value: &FieldValue, pk: &str) {
        if let (Some(words), Some(&slot)) =
            (self.buckets.get_mut(value), self.slot_of.get(pk))
        {
            Self::set_bit(words, slot, false);
        }
    }

    fn decode(&self, words: &[u64]) -> BTreeSet<String> {
        let mut pks = BTreeSet::new();
        for (slot, pk) in self.slots.iter().enumerate() {
            if Self::get_bit(words, slot) {
                pks.insert(pk.clone());
            }
        }
        pks
    }

    pub fn query_eq(&self, value: &FieldValue) -> BTreeSet<String> {
        self.buckets
            .get(value)
            .map(|words| self.decode(words))
            .unwrap_or_default()
    }

    pub fn query_ne(&self, value: &FieldValue) -> BTreeSet<String> {
        let mut pks = BTreeSet::new();
        for (v, words) in &self.buckets {
            if v != value {
                pks.extend(self.decode(words));
            }
        }
        pks
    }

    pub fn query_in(&self, values: &[FieldValue]) -> BTreeSet<String> {
        let mut pks = BTreeSet::new();
        for v in values {
            pks.extend(self.query_eq(v));
        }
        pks
    }

    pub fn all_pks(&self) -> BTreeSet<String> {
        let mut pks = BTreeSet::new();
        for words in self.buckets.values() {
            pks.extend(self.decode(words));
        }
        pks
    }
}

/// A secondary index of either shape, behind one capability set.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldIndex {
    Ordered(OrderedTreeIndex),
    Bitmap(BitmapIndex),
}

impl FieldIndex {
    pub fn new(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Ordered => FieldIndex::Ordered(OrderedTreeIndex::new()),
            IndexKind::Bitmap => FieldIndex::Bitmap(BitmapIndex::new()),
        }
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            FieldIndex::Ordered(_) => IndexKind::Ordered,
            FieldIndex::Bitmap(_) => IndexKind::Bitmap,
        }
    }

    pub fn insert(&mut self, value: FieldValue, pk: &str) {
        match self {
            FieldIndex::Ordered(idx) => idx.insert(value, pk),
            FieldIndex::Bitmap(idx) => idx.insert(value, pk),
        }
    }

    pub fn remove(&mut self, value: &FieldValue, pk: &str) {
        match self {
            FieldIndex::Ordered(idx) => idx.remove(value, pk),
            FieldIndex::Bitmap(idx) => idx.remove(value, pk),
        }
    }

    /// Evaluate a condition. Bitmap indexes reject range comparisons.
    pub fn query(&self, field: &str, cond: &Condition) -> DbResult<BTreeSet<String>> {
        match (self, cond) {
            (FieldIndex::Ordered(idx), Condition::Value(v)) => {
                Ok(idx.query_cmp(CompareOp::Eq, v))
            }
            (FieldIndex::Ordered(idx), Condition::Cmp(op, v)) => Ok(idx.query_cmp(*op, v)),
            (FieldIndex::Ordered(idx), Condition::In(vs)) => Ok(idx.query_in(vs)),
            (FieldIndex::Bitmap(idx), Condition::Value(v)) => Ok(idx.query_eq(v)),
            (FieldIndex::Bitmap(idx), Condition::Cmp(CompareOp::Eq, v)) => {
                Ok(idx.query_eq(v))
            }
            (FieldIndex::Bitmap(idx), Condition::Cmp(CompareOp::Ne, v)) => {
                Ok(idx.query_ne(v))
            }
            (FieldIndex::Bitmap(_), Condition::Cmp(op, _)) => {
                Err(DbError::InvalidArgument(format!(
                    "bitmap index on {} does not support {:?}",
                    field, op
                )))
            }
            (FieldIndex::Bitmap(idx), Condition::In(vs)) => Ok(idx.query_in(vs)),
        }
    }

    pub fn all_pks(&self) -> BTreeSet<String> {
        match self {
            FieldIndex::Ordered(idx) => idx.all_pks(),
            FieldIndex::Bitmap(idx) => idx.all_pks(),
        }
    }

    fn index_path(dir: &Path, field: &str) -> PathBuf {
        dir.join(format!("index_{}.idx", field))
    }

    fn slots_path(dir: &Path, field: &str) -> PathBuf {
        dir.join(format!("index_{}_pks.idx", field))
    }

    /// Persist the index snapshot tagged with `lsn`.
    pub fn save(&self, dir: &Path, field: &str, lsn: u64) -> DbResult<()> {
        match self {
            FieldIndex::Ordered(idx) => snapshot::write_snapshot(
                &Self::index_path(dir, field),
                &OrderedSnapshot {
                    lsn,
                    entries: idx.entries.clone(),
                },
            ),
            FieldIndex::Bitmap(idx) => {
                snapshot::write_snapshot(
                    &Self::index_path(dir, field),
                    &BitmapBuckets {
                        lsn,
                        buckets: idx.buckets.clone(),
                    },
                )?;
                snapshot::write_snapshot(
                    &Self::slots_path(dir, field),
                    &SlotTable {
                        slots: idx.slots.clone(),
                    },
                )
            }
        }
    }

    /// Load a snapshot if it exists, matches `kind`, is intact and was taken
    /// at exactly `expected_lsn`. Anything else returns `None` and the
    /// caller rebuilds from the heaps.
    pub fn load(
        dir: &Path,
        field: &str,
        kind: IndexKind,
        expected_lsn: u64,
    ) -> Option<Self> {
        let result = Self::try_load(dir, field, kind, expected_lsn);
        match result {
            Ok(idx) => idx,
            Err(e) => {
                tracing::warn!("index on {} unreadable ({}); will rebuild", field, e);
                None
            }
        }
    }

    fn try_load(
        dir: &Path,
        field: &str,
        kind: IndexKind,
        expected_lsn: u64,
    ) -> DbResult<Option<Self>> {
        match kind {
            IndexKind::Ordered => {
                let snap: Option<OrderedSnapshot> =
                    snapshot::read_snapshot(&Self::index_path(dir, field))?;
                Ok(snap.and_then(|s| {
                    if s.lsn != expected_lsn {
                        tracing::warn!(
                            "index on {} is stale (lsn {} != {}); will rebuild",
                            field,
                            s.lsn,
                            expected_lsn
                        );
                        return None;
                    }
                    Some(FieldIndex::Ordered(OrderedTreeIndex { entries: s.entries }))
                }))
            }
            IndexKind::Bitmap => {
                let buckets: Option<BitmapBuckets> =
                    snapshot::read_snapshot(&Self::index_path(dir, field))?;
                let slots: Option<SlotTable> =
                    snapshot::read_snapshot(&Self::slots_path(dir, field))?;
                match (buckets, slots) {
                    (Some(b), Some(s)) => {
                        if b.lsn != expected_lsn {
                            tracing::warn!(
                                "index on {} is stale (lsn {} != {}); will rebuild",
                                field,
                                b.lsn,
                                expected_lsn
                            );
                            return Ok(None);
                        }
                        let slot_of = s
                            .slots
                            .iter()
                            .enumerate()
                            .map(|(i, pk)| (pk.clone(), i))
                            .collect();
                        Ok(Some(FieldIndex::Bitmap(BitmapIndex {
                            buckets: b.buckets,
                            slots: s.slots,
                            slot_of,
                        })))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    /// Delete the on-disk snapshot files (field dropped from the schema).
    pub fn erase(dir: &Path, field: &str) -> DbResult<()> {
        for path in [Self::index_path(dir, field), Self::slots_path(dir, field)] {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OrderedSnapshot {
    lsn: u64,
    entries: BTreeMap<FieldValue, BTreeSet<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fv(v: i64) -> FieldValue {
        FieldValue::Int(v)
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ordered_insert_remove_query() {
        let mut idx = OrderedTreeIndex::new();
        idx.insert(fv(1), "a");
        idx.insert(fv(1), "b");
        idx.insert(fv(2), "c");
        idx.insert(fv(5), "d");

        assert_eq!(
            idx.query_cmp(CompareOp::Eq, &fv(1)),
            set(&["a", "b"])
        );
        assert_eq!(
            idx.query_cmp(CompareOp::Lt, &fv(2)),
            set(&["a", "b"])
        );
        assert_eq!(
            idx.query_cmp(CompareOp::Ge, &fv(2)),
            set(&["c", "d"])
        );
        assert_eq!(
            idx.query_cmp(CompareOp::Ne, &fv(2)),
            set(&["a", "b", "d"])
        );
        assert_eq!(
            idx.query_in(&[fv(1), fv(5)]),
            set(&["a", "b", "d"])
        );

        idx.remove(&fv(1), "a");
        assert_eq!(idx.query_cmp(CompareOp::Eq, &fv(1)).len(), 1);

        // removing the last pk of a value drops the key
        idx.remove(&fv(1), "b");
        assert!(!idx.keys().any(|k| *k == fv(1)));
    }

    #[test]
    fn test_ordered_float_keys() {
        let mut idx = OrderedTreeIndex::new();
        idx.insert(FieldValue::float(0.5), "a");
        idx.insert(FieldValue::float(1.5), "b");
        idx.insert(FieldValue::float(-0.1), "c");

        let below_one = idx.query_cmp(CompareOp::Lt, &FieldValue::float(1.0));
        assert_eq!(
            below_one,
            set(&["a", "c"])
        );
    }

    #[test]
    fn test_bitmap_insert_remove_query() {
        let mut idx = BitmapIndex::new();
        idx.insert(FieldValue::Bool(false), "a");
        idx.insert(FieldValue::Bool(false), "b");
        idx.insert(FieldValue::Bool(true), "c");

        assert_eq!(
            idx.query_eq(&FieldValue::Bool(false)),
            set(&["a", "b"])
        );
        assert_eq!(
            idx.query_ne(&FieldValue::Bool(false)),
            set(&["c"])
        );

        // value change: remove then insert under the new value
        idx.remove(&FieldValue::Bool(false), "b");
        idx.insert(FieldValue::Bool(true), "b");
        assert_eq!(
            idx.query_eq(&FieldValue::Bool(true)),
            set(&["b", "c"])
        );

        // slots are stable across re-insertion
        assert_eq!(idx.slots.len(), 3);
    }

    #[test]
    fn test_bitmap_many_slots() {
        let mut idx = BitmapIndex::new();
        for i in 0..130 {
            let v = FieldValue::Int(i % 3);
            idx.insert(v, &format!("pk-{:03}", i));
        }
        let zero = idx.query_eq(&FieldValue::Int(0));
        assert_eq!(zero.len(), 44); // 0,3,...,129
        assert!(zero.contains("pk-129"));
        assert_eq!(idx.all_pks().len(), 130);
    }

    #[test]
    fn test_field_index_query_dispatch() {
        let mut ordered = FieldIndex::new(IndexKind::Ordered);
        ordered.insert(fv(3), "a");
        assert_eq!(
            ordered
                .query("order", &Condition::Cmp(CompareOp::Le, fv(3)))
                .unwrap()
                .len(),
            1
        );

        let mut bitmap = FieldIndex::new(IndexKind::Bitmap);
        bitmap.insert(FieldValue::Bool(true), "a");
        assert_eq!(
            bitmap
                .query("vp", &Condition::Value(FieldValue::Bool(true)))
                .unwrap()
                .len(),
            1
        );

        // range ops are invalid on bitmaps
        let err = bitmap
            .query("vp", &Condition::Cmp(CompareOp::Lt, FieldValue::Bool(true)))
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidArgument");
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();

        let mut ordered = FieldIndex::new(IndexKind::Ordered);
        ordered.insert(fv(1), "a");
        ordered.insert(fv(2), "b");
        ordered.save(dir.path(), "order", 7).unwrap();

        let restored =
            FieldIndex::load(dir.path(), "order", IndexKind::Ordered, 7).unwrap();
        assert_eq!(restored, ordered);

        // stale lsn forces a rebuild
        assert!(FieldIndex::load(dir.path(), "order", IndexKind::Ordered, 8).is_none());

        let mut bitmap = FieldIndex::new(IndexKind::Bitmap);
        bitmap.insert(FieldValue::Bool(true), "a");
        bitmap.insert(FieldValue::Bool(false), "b");
        bitmap.save(dir.path(), "vp", 7).unwrap();
        assert!(dir.path().join("index_vp_pks.idx").exists());

        let restored = FieldIndex::load(dir.path(), "vp", IndexKind::Bitmap, 7).unwrap();
        assert_eq!(restored, bitmap);
    }

    #[test]
    fn test_corrupt_snapshot_rebuilds() {
        let dir = tempdir().unwrap();

        let mut ordered = FieldIndex::new(IndexKind::Ordered);
        ordered.insert(fv(1), "a");
        ordered.save(dir.path(), "order", 1).unwrap();

        let path = dir.path().join("index_order.idx");
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n / 2] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(FieldIndex::load(dir.path(), "order", IndexKind::Ordered, 1).is_none());
    }

    #[test]
    fn test_erase() {
        let dir = tempdir().unwrap();
        let mut bitmap = FieldIndex::new(IndexKind::Bitmap);
        bitmap.insert(FieldValue::Bool(true), "a");
        bitmap.save(dir.path(), "vp", 1).unwrap();

        FieldIndex::erase(dir.path(), "vp").unwrap();
        assert!(!dir.path().join("index_vp.idx").exists());
        assert!(!dir.path().join("index_vp_pks.idx").exists());
    }
}
