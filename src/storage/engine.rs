//! The storage engine
//!
//! Composes the heaps, the WAL-backed primary index, the secondary
//! indexes, the trigger table and the iSAX tree behind the user-visible
//! operation set:
//!
//! ```text
//! Write path:
//!   insert_ts → heaps → WAL (fsync = commit) → primary → secondary
//!             → triggers → iSAX → vantage distances
//!
//! Read path:
//!   select → indexes (candidate set) → heaps (materialize) → project
//! ```
//!
//! Concurrency is single-writer: every operation runs under one state
//! lock, and triggers execute post-commit inside the same hold, through a
//! non-firing write path so they cannot recurse.

use crate::procs::ProcRegistry;
use crate::sax::tree::IsaxTree;
use crate::sax::SaxEncoder;
use crate::similarity::{euclidean_znorm, ncc_distance};
use crate::storage::error::{DbError, DbResult};
use crate::storage::heap::{MetaHeap, TsHeap};
use crate::storage::primary::{HeapOffsets, PrimaryIndex};
use crate::storage::schema::{
    FieldDef, FieldType, FieldValue, IndexKind, Schema, FIELD_DELETED, FIELD_VP, VP_DIST_PREFIX,
};
use crate::storage::secondary::FieldIndex;
use crate::storage::series::TimeSeries;
use crate::storage::triggers::{Operation, TriggerSpec, TriggerTable};
use crate::storage::types::{CompareOp, Condition, Predicate, Row, SelectOptions, SortSpec, TS_FIELD};
use crate::storage::wal::{LogOp, LogRecord, WriteAheadLog};
use ordered_float::OrderedFloat;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{RwLock, RwLockWriteGuard};

/// Characters a primary key may not contain: delimiters of the on-disk
/// formats (schema field names embed pks, and the schema file is
/// line-oriented JSON).
const RESERVED_PK_CHARS: &[char] = &['\0', '\n'];

/// Configuration for one database.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root directory for all databases.
    pub data_dir: PathBuf,
    /// Subdirectory under `data_dir` for this database.
    pub db_name: String,
    /// Fixed series length, set at creation.
    pub ts_length: usize,
    /// Snapshot the primary index every this many mutations.
    pub flush_every: usize,
    /// SAX word length; must divide `ts_length`.
    pub word_length: usize,
    /// SAX alphabet cardinality; a power of two.
    pub cardinality: usize,
    /// iSAX terminal capacity.
    pub threshold: usize,
}

impl StorageConfig {
    pub fn new(data_dir: impl Into<PathBuf>, db_name: impl Into<String>, ts_length: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            db_name: db_name.into(),
            ts_length,
            flush_every: 10,
            word_length: 4,
            cardinality: 4,
            threshold: 5,
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join(&self.db_name)
    }

    pub fn ts_heap_path(&self) -> PathBuf {
        self.db_dir().join("heap_ts.met")
    }

    pub fn meta_heap_path(&self) -> PathBuf {
        self.db_dir().join("heap_meta.met")
    }

    pub fn schema_path(&self) -> PathBuf {
        self.db_dir().join("schema.idx")
    }

    pub fn primary_path(&self) -> PathBuf {
        self.db_dir().join("pk.idx")
    }

    pub fn log_path(&self) -> PathBuf {
        self.db_dir().join("pk.log")
    }

    pub fn triggers_path(&self) -> PathBuf {
        self.db_dir().join("triggers.idx")
    }

    pub fn isax_path(&self) -> PathBuf {
        self.db_dir().join("isax.idx")
    }

    fn validate(&self) -> DbResult<()> {
        if self.ts_length == 0 {
            return Err(DbError::InvalidArgument(
                "series length must be positive".to_string(),
            ));
        }
        if self.word_length == 0 || self.ts_length % self.word_length != 0 {
            return Err(DbError::InvalidArgument(format!(
                "SAX word length {} must divide series length {}",
                self.word_length, self.ts_length
            )));
        }
        if self.flush_every == 0 {
            return Err(DbError::InvalidArgument(
                "flush cadence must be positive".to_string(),
            ));
        }
        if self.db_name.is_empty()
            || self.db_name.contains(std::path::is_separator)
            || self.db_name.contains(RESERVED_PK_CHARS)
        {
            return Err(DbError::InvalidArgument(format!(
                "invalid database name {:?}",
                self.db_name
            )));
        }
        Ok(())
    }
}

/// Everything behind the mutation lock.
struct EngineState {
    schema: Schema,
    ts_heap: TsHeap,
    meta_heap: MetaHeap,
    primary: PrimaryIndex,
    wal: WriteAheadLog,
    indexes: BTreeMap<String, FieldIndex>,
    triggers: TriggerTable,
    tree: IsaxTree,
    ops_since_flush: usize,
}

/// The storage engine. All operations are synchronous; mutations
/// serialize on one internal lock.
pub struct StorageEngine {
    config: StorageConfig,
    encoder: SaxEncoder,
    procs: ProcRegistry,
    state: RwLock<EngineState>,
}

impl StorageEngine {
    /// Open or create a database. `fields` seeds the schema on first
    /// creation; an existing `schema.idx` takes precedence.
    pub fn open(config: StorageConfig, fields: Vec<FieldDef>) -> DbResult<Self> {
        config.validate()?;
        let dir = config.db_dir();
        std::fs::create_dir_all(&dir)?;

        let encoder = SaxEncoder::new(config.word_length, config.cardinality)?;

        let schema_path = config.schema_path();
        let schema = if schema_path.exists() {
            Schema::load(&schema_path)?
        } else {
            let schema = Schema::with_fields(fields)?;
            schema.save(&schema_path)?;
            schema
        };

        let mut ts_heap = TsHeap::open(config.ts_heap_path(), config.ts_length)?;
        let mut meta_heap = MetaHeap::open(config.meta_heap_path(), schema.record_size())?;

        // a corrupt snapshot refuses to open; a missing one starts empty
        let mut primary = PrimaryIndex::load(&config.primary_path())?;
        let snapshot_lsn = primary.last_lsn();

        let (mut triggers, triggers_lsn) = match TriggerTable::load(&config.triggers_path())? {
            Some((table, lsn)) => (table, lsn),
            None => (TriggerTable::new(), 0),
        };

        let mut wal = WriteAheadLog::open(config.log_path())?;
        let mut replayed = 0usize;
        for record in wal.replay()? {
            if record.lsn > snapshot_lsn {
                primary.apply(&record);
                replayed += 1;
            }
            match &record.op {
                LogOp::TriggerAdd { on, spec } if record.lsn > triggers_lsn => {
                    triggers.add(*on, spec.clone());
                }
                LogOp::TriggerDel { on, proc } if record.lsn > triggers_lsn => {
                    if let Err(e) = triggers.remove_first(*on, proc) {
                        tracing::warn!("replayed trigger removal had no target: {}", e);
                    }
                }
                _ => {}
            }
        }
        if replayed > 0 {
            tracing::info!(
                "replayed {} log records over snapshot lsn {}",
                replayed,
                snapshot_lsn
            );
        }

        // every committed entry must address whole records
        for (pk, offsets) in primary.iter() {
            if !ts_heap.contains_offset(offsets.ts) || !meta_heap.contains_offset(offsets.meta) {
                return Err(DbError::Corruption(format!(
                    "primary index entry for {} references a torn heap record",
                    pk
                )));
            }
        }

        let current_lsn = primary.last_lsn();

        // secondary indexes: load fresh snapshots, rebuild the rest
        let mut indexes: BTreeMap<String, FieldIndex> = BTreeMap::new();
        let mut rebuild: Vec<String> = Vec::new();
        for def in schema.indexed_fields() {
            let kind = def.index.expect("indexed_fields yields indexed defs");
            match FieldIndex::load(&dir, &def.name, kind, current_lsn) {
                Some(index) => {
                    indexes.insert(def.name.clone(), index);
                }
                None => {
                    indexes.insert(def.name.clone(), FieldIndex::new(kind));
                    rebuild.push(def.name.clone());
                }
            }
        }
        if !rebuild.is_empty() {
            tracing::info!("rebuilding {} secondary indexes from the heaps", rebuild.len());
            let entries: Vec<(String, u64)> = primary
                .iter()
                .map(|(pk, off)| (pk.clone(), off.meta))
                .collect();
            for (pk, meta_offset) in entries {
                let meta = schema.decode(&meta_heap.read(meta_offset)?)?;
                for field in &rebuild {
                    let index = indexes.get_mut(field).expect("created above");
                    if let Some(value) = meta.get(field) {
                        index.insert(value.clone(), &pk);
                    }
                }
            }
        }

        // iSAX tree: load a matching snapshot or re-encode everything
        let tree = match IsaxTree::load(
            &config.isax_path(),
            config.word_length,
            config.cardinality,
            config.threshold,
            current_lsn,
        ) {
            Some(tree) => tree,
            None => {
                let mut tree =
                    IsaxTree::new(config.word_length, config.cardinality, config.threshold);
                let entries: Vec<(String, u64)> = primary
                    .iter()
                    .map(|(pk, off)| (pk.clone(), off.ts))
                    .collect();
                if !entries.is_empty() {
                    tracing::info!("rebuilding iSAX tree over {} series", entries.len());
                }
                for (pk, ts_offset) in entries {
                    let series = ts_heap.read(ts_offset)?;
                    tree.insert(&pk, encoder.encode(series.values())?);
                }
                tree
            }
        };

        tracing::info!(
            "opened database {} with {} series",
            config.db_name,
            primary.len()
        );

        Ok(Self {
            config,
            encoder,
            procs: ProcRegistry::standard(),
            state: RwLock::new(EngineState {
                schema,
                ts_heap,
                meta_heap,
                primary,
                wal,
                indexes,
                triggers,
                tree,
                ops_since_flush: 0,
            }),
        })
    }

    /// The mutation lock. Poisoning only follows a panic in another
    /// holder; the state itself stays structurally sound, so recover it.
    fn state(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn validate_pk(pk: &str) -> DbResult<()> {
        if pk.is_empty() {
            return Err(DbError::InvalidArgument("empty primary key".to_string()));
        }
        if pk.contains(RESERVED_PK_CHARS) {
            return Err(DbError::InvalidArgument(format!(
                "primary key {:?} contains reserved characters",
                pk
            )));
        }
        Ok(())
    }

    // ==================== mutations ====================

    /// Insert a new series under `pk` with default metadata.
    pub fn insert_ts(&self, pk: &str, ts: TimeSeries) -> DbResult<()> {
        Self::validate_pk(pk)?;
        if ts.len() != self.config.ts_length {
            return Err(DbError::InvalidArgument(format!(
                "series length {} does not match database length {}",
                ts.len(),
                self.config.ts_length
            )));
        }

        let mut st = self.state();
        if st.primary.contains(pk) {
            return Err(DbError::AlreadyExists(pk.to_string()));
        }

        // heap records first; an orphan record on failure is unreferenced
        let ts_offset = st.ts_heap.write(&ts)?;
        let default_record = st.schema.default_record();
        let meta_bytes = st.schema.encode(&default_record)?;
        let meta_offset = st.meta_heap.write(&meta_bytes)?;
        st.ts_heap.sync()?;
        st.meta_heap.sync()?;

        // commit
        let lsn = st.primary.next_lsn();
        st.wal.append(&LogRecord {
            lsn,
            op: LogOp::Put {
                pk: pk.to_string(),
                ts_offset,
                meta_offset,
            },
        })?;
        st.primary.insert(
            pk.to_string(),
            HeapOffsets {
                ts: ts_offset,
                meta: meta_offset,
            },
        );

        for (field, index) in st.indexes.iter_mut() {
            if let Some(value) = default_record.get(field) {
                index.insert(value.clone(), pk);
            }
        }

        self.fire_triggers(&mut st, Operation::InsertTs, pk, &ts);

        let word = self.encoder.encode(ts.values())?;
        st.tree.insert(pk, word);

        // cache the distance to every vantage point
        let vps = self.vantage_points(&st)?;
        for vp in vps {
            let offsets = st
                .primary
                .get(&vp)
                .ok_or_else(|| DbError::Corruption(format!("vantage point {} has no record", vp)))?;
            let vp_series = st.ts_heap.read(offsets.ts)?;
            let distance = ncc_distance(&ts, &vp_series);
            let field = format!("{}{}", VP_DIST_PREFIX, vp);
            let mut md = BTreeMap::new();
            md.insert(field, FieldValue::float(distance));
            self.apply_meta(&mut st, pk, &md)?;
        }

        tracing::debug!("inserted {} at lsn {}", pk, lsn);
        self.note_op(&mut st)
    }

    /// Merge `md` into the metadata for `pk`. Unknown fields are rejected;
    /// the implicit fields are managed through their own operations.
    pub fn upsert_meta(&self, pk: &str, md: &BTreeMap<String, FieldValue>) -> DbResult<()> {
        if md.contains_key(FIELD_DELETED) || md.contains_key(FIELD_VP) {
            return Err(DbError::InvalidArgument(
                "deleted and vp are managed through delete_ts / insert_vp".to_string(),
            ));
        }

        let mut st = self.state();
        if !st.primary.contains(pk) {
            return Err(DbError::NotFound(pk.to_string()));
        }

        self.apply_meta(&mut st, pk, md)?;

        let offsets = st.primary.get(pk).expect("checked above");
        let series = st.ts_heap.read(offsets.ts)?;
        self.fire_triggers(&mut st, Operation::UpsertMeta, pk, &series);

        self.note_op(&mut st)
    }

    /// Logically delete `pk`: tombstone the heap record, remove it from
    /// the primary index (logged), every secondary index and the tree.
    /// The heap slots are retained until compaction.
    pub fn delete_ts(&self, pk: &str) -> DbResult<()> {
        let mut st = self.state();
        if !st.primary.contains(pk) {
            return Err(DbError::NotFound(pk.to_string()));
        }

        // a vantage point loses its status (and distance field) first
        let meta = self.read_meta(&mut st, pk)?;
        if meta.get(FIELD_VP) == Some(&FieldValue::Bool(true)) {
            self.retire_vantage_point(&mut st, pk)?;
        }

        let offsets = st
            .primary
            .get(pk)
            .ok_or_else(|| DbError::NotFound(pk.to_string()))?;
        let series = st.ts_heap.read(offsets.ts)?;
        let meta = self.read_meta(&mut st, pk)?;

        // tombstone in the heap record
        let mut merged = meta.clone();
        merged.insert(FIELD_DELETED.to_string(), FieldValue::Bool(true));
        let bytes = st.schema.encode(&merged)?;
        st.meta_heap.overwrite(offsets.meta, &bytes)?;
        st.meta_heap.sync()?;

        // commit the removal
        let lsn = st.primary.next_lsn();
        st.wal.append(&LogRecord {
            lsn,
            op: LogOp::Del { pk: pk.to_string() },
        })?;
        st.primary.remove(pk);

        // drop from every secondary index under the pre-delete values
        for (field, index) in st.indexes.iter_mut() {
            if let Some(value) = meta.get(field) {
                index.remove(value, pk);
            }
        }

        let word = self.encoder.encode(series.values())?;
        st.tree.remove(pk, &word);

        self.fire_triggers(&mut st, Operation::DeleteTs, pk, &series);

        tracing::debug!("deleted {} at lsn {}", pk, lsn);
        self.note_op(&mut st)
    }

    // ==================== triggers ====================

    /// Bind a procedure to an operation. The procedure must be registered
    /// and every target field must exist in the schema.
    pub fn add_trigger(
        &self,
        proc: &str,
        onwhat: Operation,
        target: Vec<String>,
        arg: Option<TimeSeries>,
    ) -> DbResult<()> {
        if !self.procs.contains(proc) {
            return Err(DbError::InvalidArgument(format!(
                "unknown procedure {}",
                proc
            )));
        }

        let mut st = self.state();
        for field in &target {
            if !st.schema.contains(field) {
                return Err(DbError::SchemaMismatch(format!(
                    "trigger target {} not in schema",
                    field
                )));
            }
        }

        let spec = TriggerSpec {
            proc: proc.to_string(),
            targets: target,
            arg,
        };
        let lsn = st.primary.next_lsn();
        st.wal.append(&LogRecord {
            lsn,
            op: LogOp::TriggerAdd {
                on: onwhat,
                spec: spec.clone(),
            },
        })?;
        st.triggers.add(onwhat, spec);
        self.note_op(&mut st)
    }

    /// Remove the first trigger matching (operation, proc).
    pub fn remove_trigger(&self, proc: &str, onwhat: Operation) -> DbResult<()> {
        let mut st = self.state();
        if !st
            .triggers
            .for_operation(onwhat)
            .iter()
            .any(|t| t.proc == proc)
        {
            return Err(DbError::NotFound(format!(
                "no {} trigger on {}",
                proc,
                onwhat.name()
            )));
        }

        let lsn = st.primary.next_lsn();
        st.wal.append(&LogRecord {
            lsn,
            op: LogOp::TriggerDel {
                on: onwhat,
                proc: proc.to_string(),
            },
        })?;
        st.triggers.remove_first(onwhat, proc)?;
        self.note_op(&mut st)
    }

    /// Run post-commit triggers for `op` over `pk`. Failures never abort
    /// the committed operation: unknown procedures are skipped, procedure
    /// errors are surfaced per row as warnings.
    fn fire_triggers(&self, st: &mut EngineState, op: Operation, pk: &str, series: &TimeSeries) {
        let specs: Vec<TriggerSpec> = st.triggers.for_operation(op).to_vec();
        for spec in specs {
            if !self.procs.contains(&spec.proc) {
                tracing::warn!("skipping trigger with unknown procedure {}", spec.proc);
                continue;
            }
            match self.procs.call(&spec.proc, pk, series, spec.arg.as_ref()) {
                Ok(outputs) => {
                    if !st.primary.contains(pk) {
                        // the row is gone (delete_ts); nothing to assign to
                        continue;
                    }
                    let md: BTreeMap<String, FieldValue> =
                        spec.targets.iter().cloned().zip(outputs).collect();
                    if let Err(e) = self.apply_meta(st, pk, &md) {
                        tracing::warn!(
                            "trigger {} on {} could not store its results: {}",
                            spec.proc,
                            pk,
                            e
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("trigger {} on {} failed: {}", spec.proc, pk, e);
                }
            }
        }
    }

    // ==================== metadata plumbing ====================

    fn read_meta(
        &self,
        st: &mut EngineState,
        pk: &str,
    ) -> DbResult<BTreeMap<String, FieldValue>> {
        let offsets = st
            .primary
            .get(pk)
            .ok_or_else(|| DbError::NotFound(pk.to_string()))?;
        let bytes = st.meta_heap.read(offsets.meta)?;
        st.schema.decode(&bytes)
    }

    /// Merge `md` into the stored record and keep the affected secondary
    /// indexes in lockstep. This is the non-firing write path used by
    /// triggers and the vantage-point machinery.
    fn apply_meta(
        &self,
        st: &mut EngineState,
        pk: &str,
        md: &BTreeMap<String, FieldValue>,
    ) -> DbResult<()> {
        let offsets = st
            .primary
            .get(pk)
            .ok_or_else(|| DbError::NotFound(pk.to_string()))?;
        let old_bytes = st.meta_heap.read(offsets.meta)?;
        let old = st.schema.decode(&old_bytes)?;

        let mut merged = old.clone();
        for (field, value) in md {
            if !st.schema.contains(field) {
                return Err(DbError::SchemaMismatch(format!("unknown field {}", field)));
            }
            merged.insert(field.clone(), value.clone());
        }

        let bytes = st.schema.encode(&merged)?;
        st.meta_heap.overwrite(offsets.meta, &bytes)?;

        for (field, index) in st.indexes.iter_mut() {
            let (Some(before), Some(after)) = (old.get(field), merged.get(field)) else {
                continue;
            };
            if before != after {
                index.remove(before, pk);
                index.insert(after.clone(), pk);
            }
        }
        Ok(())
    }

    // ==================== select ====================

    /// Evaluate a conjunctive predicate, project `fields`, apply ordering
    /// and limit. Projection semantics: `None` returns bare pks,
    /// `Some([])` all metadata except the tombstone flag; the pseudo-field
    /// `"ts"` materializes the raw series.
    pub fn select(
        &self,
        md: &Predicate,
        fields: Option<&[String]>,
        additional: &SelectOptions,
    ) -> DbResult<Vec<Row>> {
        let mut st = self.state();
        let mut candidates: Option<BTreeSet<String>> = None;

        for (field, cond) in md {
            let matched: BTreeSet<String> = if field == "pk" {
                Self::match_pk_condition(&st, cond)?
            } else if let Some(def) = st.schema.field(field).cloned() {
                let cond = Self::coerce_condition(&def, cond)?;
                if st.indexes.contains_key(field) {
                    st.indexes[field].query(field, &cond)?
                } else {
                    // unindexed field: scan the narrowest known set
                    let scan: Vec<String> = match &candidates {
                        Some(set) => set.iter().cloned().collect(),
                        None => st.primary.pks().cloned().collect(),
                    };
                    let mut hits = BTreeSet::new();
                    for pk in scan {
                        let meta = self.read_meta(&mut st, &pk)?;
                        if let Some(value) = meta.get(field) {
                            if Self::condition_holds(value, &cond) {
                                hits.insert(pk);
                            }
                        }
                    }
                    hits
                }
            } else {
                return Err(DbError::SchemaMismatch(format!(
                    "unknown field {} in predicate",
                    field
                )));
            };

            candidates = Some(match candidates.take() {
                Some(previous) => previous.intersection(&matched).cloned().collect(),
                None => matched,
            });
            if candidates.as_ref().is_some_and(BTreeSet::is_empty) {
                break;
            }
        }

        let mut pks: Vec<String> = match candidates {
            Some(set) => set.into_iter().collect(),
            None => st.primary.pks().cloned().collect(),
        };

        if let Some(spec) = &additional.sort_by {
            let sort = SortSpec::parse(spec)?;
            if sort.field == "pk" {
                pks.sort();
            } else {
                if !st.schema.contains(&sort.field) {
                    return Err(DbError::InvalidArgument(format!(
                        "sort field {} not in schema",
                        sort.field
                    )));
                }
                let mut keyed: Vec<(FieldValue, String)> = Vec::with_capacity(pks.len());
                for pk in pks {
                    let meta = self.read_meta(&mut st, &pk)?;
                    let key = meta.get(&sort.field).cloned().ok_or_else(|| {
                        DbError::Corruption(format!("record for {} lacks {}", pk, sort.field))
                    })?;
                    keyed.push((key, pk));
                }
                keyed.sort();
                pks = keyed.into_iter().map(|(_, pk)| pk).collect();
            }
            if sort.descending {
                pks.reverse();
            }
        }

        if let Some(limit) = additional.limit {
            pks.truncate(limit);
        }

        let mut rows = Vec::with_capacity(pks.len());
        for pk in pks {
            let row = match fields {
                None => Row {
                    pk: pk.clone(),
                    fields: BTreeMap::new(),
                    ts: None,
                },
                Some(list) if list.is_empty() => {
                    let mut meta = self.read_meta(&mut st, &pk)?;
                    meta.remove(FIELD_DELETED);
                    Row {
                        pk: pk.clone(),
                        fields: meta,
                        ts: None,
                    }
                }
                Some(list) => {
                    let meta = self.read_meta(&mut st, &pk)?;
                    let mut projected = BTreeMap::new();
                    let mut ts = None;
                    for field in list {
                        if field == TS_FIELD {
                            let offsets = st
                                .primary
                                .get(&pk)
                                .ok_or_else(|| DbError::NotFound(pk.clone()))?;
                            ts = Some(st.ts_heap.read(offsets.ts)?);
                        } else if let Some(value) = meta.get(field) {
                            projected.insert(field.clone(), value.clone());
                        }
                    }
                    Row {
                        pk: pk.clone(),
                        fields: projected,
                        ts,
                    }
                }
            };
            rows.push(row);
        }
        Ok(rows)
    }

    /// `select`, then run `proc` over each row's series and return its
    /// positional outputs under `target` names. Nothing is persisted; a
    /// failing row is returned without the augmented fields.
    pub fn augmented_select(
        &self,
        proc: &str,
        target: &[String],
        arg: Option<&TimeSeries>,
        md: &Predicate,
        additional: &SelectOptions,
    ) -> DbResult<Vec<Row>> {
        if !self.procs.contains(proc) {
            return Err(DbError::InvalidArgument(format!(
                "unknown procedure {}",
                proc
            )));
        }

        let ts_fields = [TS_FIELD.to_string()];
        let mut rows = self.select(md, Some(&ts_fields), additional)?;

        for row in &mut rows {
            let series = row.ts.take().ok_or_else(|| {
                DbError::Corruption(format!("selected row {} lacks its series", row.pk))
            })?;
            match self.procs.call(proc, &row.pk, &series, arg) {
                Ok(outputs) => {
                    row.fields = target.iter().cloned().zip(outputs).collect();
                }
                Err(e) => {
                    tracing::warn!("procedure {} failed on {}: {}", proc, row.pk, e);
                }
            }
        }
        Ok(rows)
    }

    fn match_pk_condition(st: &EngineState, cond: &Condition) -> DbResult<BTreeSet<String>> {
        let as_pk = |value: &FieldValue| -> DbResult<String> {
            value
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| {
                    DbError::InvalidArgument("pk conditions take string values".to_string())
                })
        };

        match cond {
            Condition::Value(value) | Condition::Cmp(CompareOp::Eq, value) => {
                let pk = as_pk(value)?;
                Ok(if st.primary.contains(&pk) {
                    BTreeSet::from([pk])
                } else {
                    BTreeSet::new()
                })
            }
            Condition::In(values) => {
                let mut set = BTreeSet::new();
                for value in values {
                    let pk = as_pk(value)?;
                    if st.primary.contains(&pk) {
                        set.insert(pk);
                    }
                }
                Ok(set)
            }
            Condition::Cmp(op, value) => {
                let bound = as_pk(value)?;
                Ok(st
                    .primary
                    .pks()
                    .filter(|pk| op.accepts(pk.as_str().cmp(bound.as_str())))
                    .cloned()
                    .collect())
            }
        }
    }

    fn condition_holds(value: &FieldValue, cond: &Condition) -> bool {
        match cond {
            Condition::Value(v) => value == v,
            Condition::Cmp(op, v) => op.accepts(value.cmp(v)),
            Condition::In(vs) => vs.contains(value),
        }
    }

    /// Coerce condition values to the field's type (ints widen to floats);
    /// anything else is a schema mismatch.
    fn coerce_condition(def: &FieldDef, cond: &Condition) -> DbResult<Condition> {
        let coerce = |value: &FieldValue| -> DbResult<FieldValue> {
            if def.field_type.matches(value) {
                return Ok(value.clone());
            }
            match (def.field_type, value) {
                (FieldType::Float, FieldValue::Int(i)) => Ok(FieldValue::float(*i as f64)),
                _ => Err(DbError::SchemaMismatch(format!(
                    "condition value for {} does not match its type",
                    def.name
                ))),
            }
        };

        Ok(match cond {
            Condition::Value(v) => Condition::Value(coerce(v)?),
            Condition::Cmp(op, v) => Condition::Cmp(*op, coerce(v)?),
            Condition::In(vs) => {
                Condition::In(vs.iter().map(coerce).collect::<DbResult<Vec<_>>>()?)
            }
        })
    }

    // ==================== vantage points ====================

    fn vantage_points(&self, st: &EngineState) -> DbResult<Vec<String>> {
        let index = st
            .indexes
            .get(FIELD_VP)
            .ok_or_else(|| DbError::Corruption("vp index missing".to_string()))?;
        Ok(index
            .query(FIELD_VP, &Condition::Value(FieldValue::Bool(true)))?
            .into_iter()
            .collect())
    }

    /// Primary keys currently marked as vantage points, in pk order.
    pub fn list_vantage_points(&self) -> DbResult<Vec<String>> {
        let st = self.state();
        self.vantage_points(&st)
    }

    /// Mark `pk` as a vantage point: the schema grows a `d_vp_<pk>` field
    /// (metadata heap rewrite), and the distance from every stored series
    /// to the new vantage point is computed and cached.
    pub fn insert_vp(&self, pk: &str) -> DbResult<()> {
        let mut st = self.state();
        let offsets = st
            .primary
            .get(pk)
            .ok_or_else(|| DbError::NotFound(pk.to_string()))?;
        let meta = self.read_meta(&mut st, pk)?;
        if meta.get(FIELD_VP) == Some(&FieldValue::Bool(true)) {
            return Err(DbError::InvalidArgument(format!(
                "{} is already a vantage point",
                pk
            )));
        }

        let vp_series = st.ts_heap.read(offsets.ts)?;
        let field = format!("{}{}", VP_DIST_PREFIX, pk);

        let mut md = BTreeMap::new();
        md.insert(FIELD_VP.to_string(), FieldValue::Bool(true));
        self.apply_meta(&mut st, pk, &md)?;

        let def = FieldDef::new(
            field.clone(),
            FieldType::Float,
            FieldValue::float(0.0),
            Some(IndexKind::Ordered),
        );
        self.change_schema(&mut st, move |schema| schema.add_field(def))?;
        self.install_index(&mut st, &field, IndexKind::Ordered)?;

        // distances from every stored series, the vantage point included
        let entries: Vec<(String, HeapOffsets)> = st
            .primary
            .iter()
            .map(|(p, o)| (p.clone(), *o))
            .collect();
        for (other, other_offsets) in entries {
            let other_series = st.ts_heap.read(other_offsets.ts)?;
            let distance = ncc_distance(&other_series, &vp_series);
            let mut md = BTreeMap::new();
            md.insert(field.clone(), FieldValue::float(distance));
            self.apply_meta(&mut st, &other, &md)?;
        }

        // snapshot again so the cached distances land on disk
        self.flush_locked(&mut st)?;
        tracing::info!("added vantage point {}", pk);
        Ok(())
    }

    /// Unmark a vantage point; its distance field leaves the schema and
    /// the metadata heap is rewritten without it.
    pub fn delete_vp(&self, pk: &str) -> DbResult<()> {
        let mut st = self.state();
        if !st.primary.contains(pk) {
            return Err(DbError::NotFound(pk.to_string()));
        }
        let meta = self.read_meta(&mut st, pk)?;
        if meta.get(FIELD_VP) != Some(&FieldValue::Bool(true)) {
            return Err(DbError::InvalidArgument(format!(
                "{} is not a vantage point",
                pk
            )));
        }

        self.retire_vantage_point(&mut st, pk)?;
        tracing::info!("removed vantage point {}", pk);
        Ok(())
    }

    fn retire_vantage_point(&self, st: &mut EngineState, pk: &str) -> DbResult<()> {
        let mut md = BTreeMap::new();
        md.insert(FIELD_VP.to_string(), FieldValue::Bool(false));
        self.apply_meta(st, pk, &md)?;

        let field = format!("{}{}", VP_DIST_PREFIX, pk);
        st.indexes.remove(&field);
        FieldIndex::erase(&self.config.db_dir(), &field)?;
        let field_name = field.clone();
        self.change_schema(st, move |schema| {
            schema.remove_field(&field_name).map(|_| ())
        })
    }

    /// Exact similarity search through the vantage-point cache: candidates
    /// are pruned by the triangle-inequality lower bound over every
    /// vantage point, with the cutoff doubling until at least `top`
    /// survive; survivors are refined with exact distances.
    pub fn vp_similarity_search(
        &self,
        query: &TimeSeries,
        top: usize,
    ) -> DbResult<Vec<(String, f64)>> {
        if top == 0 {
            return Err(DbError::InvalidArgument("top must be positive".to_string()));
        }
        if query.len() != self.config.ts_length {
            return Err(DbError::InvalidArgument(format!(
                "query length {} does not match database length {}",
                query.len(),
                self.config.ts_length
            )));
        }

        let mut st = self.state();
        let vps = self.vantage_points(&st)?;
        if vps.is_empty() {
            return Ok(Vec::new());
        }

        // distance from the query to each vantage point
        let mut query_dists: BTreeMap<String, f64> = BTreeMap::new();
        for vp in &vps {
            let offsets = st
                .primary
                .get(vp)
                .ok_or_else(|| DbError::Corruption(format!("vantage point {} has no record", vp)))?;
            let series = st.ts_heap.read(offsets.ts)?;
            query_dists.insert(vp.clone(), ncc_distance(query, &series));
        }

        // triangle-inequality lower bound per stored pk, off the cache
        let entries: Vec<(String, HeapOffsets)> = st
            .primary
            .iter()
            .map(|(p, o)| (p.clone(), *o))
            .collect();
        let mut bounds: Vec<(String, f64)> = Vec::with_capacity(entries.len());
        for (pk, offsets) in &entries {
            let bytes = st.meta_heap.read(offsets.meta)?;
            let meta = st.schema.decode(&bytes)?;
            let mut bound = 0.0f64;
            for vp in &vps {
                let field = format!("{}{}", VP_DIST_PREFIX, vp);
                let cached = meta
                    .get(&field)
                    .and_then(FieldValue::as_f64)
                    .ok_or_else(|| {
                        DbError::Corruption(format!("record for {} lacks {}", pk, field))
                    })?;
                bound = bound.max((query_dists[vp] - cached).abs());
            }
            bounds.push((pk.clone(), bound));
        }

        // widen the cutoff until enough candidates survive; the nearest
        // vantage point always qualifies at the starting cutoff
        let mut cutoff = query_dists
            .values()
            .cloned()
            .fold(f64::INFINITY, f64::min);
        if cutoff <= 0.0 {
            cutoff = f64::EPSILON;
        }
        let candidates: Vec<String> = loop {
            let survivors: Vec<String> = bounds
                .iter()
                .filter(|(_, b)| *b <= cutoff)
                .map(|(pk, _)| pk.clone())
                .collect();
            if survivors.len() >= top || survivors.len() == bounds.len() {
                break survivors;
            }
            cutoff *= 2.0;
        };

        // refine exactly; order by (distance, pk) for reproducibility
        let mut results: Vec<(String, f64)> = Vec::with_capacity(candidates.len());
        for pk in candidates {
            let offsets = st
                .primary
                .get(&pk)
                .ok_or_else(|| DbError::NotFound(pk.clone()))?;
            let series = st.ts_heap.read(offsets.ts)?;
            results.push((pk, ncc_distance(query, &series)));
        }
        results.sort_by(|a, b| {
            OrderedFloat(a.1)
                .cmp(&OrderedFloat(b.1))
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(top);
        Ok(results)
    }

    /// Approximate nearest neighbor through the iSAX tree: descend to one
    /// terminal, refine its entries with exact z-normalized Euclidean
    /// distance. `None` when the reached terminal is empty.
    pub fn isax_similarity_search(
        &self,
        query: &TimeSeries,
    ) -> DbResult<Option<(String, f64)>> {
        if query.len() != self.config.ts_length {
            return Err(DbError::InvalidArgument(format!(
                "query length {} does not match database length {}",
                query.len(),
                self.config.ts_length
            )));
        }

        let mut st = self.state();
        let word = self.encoder.encode(query.values())?;
        let candidates: Vec<String> = st
            .tree
            .candidates(&word, &self.encoder)
            .iter()
            .map(|(pk, _)| pk.clone())
            .collect();

        let mut best: Option<(String, f64)> = None;
        for pk in candidates {
            let Some(offsets) = st.primary.get(&pk) else {
                continue;
            };
            let series = st.ts_heap.read(offsets.ts)?;
            let distance = euclidean_znorm(query.values(), series.values());
            let better = match &best {
                None => true,
                Some((best_pk, best_d)) => {
                    (OrderedFloat(distance), &pk) < (OrderedFloat(*best_d), best_pk)
                }
            };
            if better {
                best = Some((pk, distance));
            }
        }
        Ok(best)
    }

    // ==================== schema evolution ====================

    /// Append a field to the schema, rewriting the metadata heap; existing
    /// records take the default. A declared index starts fully populated.
    pub fn add_field(&self, def: FieldDef) -> DbResult<()> {
        if def.name.starts_with(VP_DIST_PREFIX) {
            return Err(DbError::InvalidArgument(
                "distance fields are managed through insert_vp".to_string(),
            ));
        }

        let mut st = self.state();
        let name = def.name.clone();
        let index = def.index;
        self.change_schema(&mut st, move |schema| schema.add_field(def))?;
        if let Some(kind) = index {
            self.install_index(&mut st, &name, kind)?;
            self.flush_locked(&mut st)?;
        }
        Ok(())
    }

    /// Remove an unused field from the schema. Rejected while any live
    /// record carries a non-default value for it.
    pub fn remove_field(&self, name: &str) -> DbResult<()> {
        if name.starts_with(VP_DIST_PREFIX) {
            return Err(DbError::InvalidArgument(
                "distance fields are managed through delete_vp".to_string(),
            ));
        }

        let mut st = self.state();
        let def = st
            .schema
            .field(name)
            .cloned()
            .ok_or_else(|| DbError::SchemaMismatch(format!("field {} not in schema", name)))?;

        let entries: Vec<(String, HeapOffsets)> = st
            .primary
            .iter()
            .map(|(p, o)| (p.clone(), *o))
            .collect();
        for (pk, offsets) in &entries {
            let bytes = st.meta_heap.read(offsets.meta)?;
            let meta = st.schema.decode(&bytes)?;
            if meta.get(name) != Some(&def.default) {
                return Err(DbError::InvalidArgument(format!(
                    "field {} is still in use by {}",
                    name, pk
                )));
            }
        }

        st.indexes.remove(name);
        FieldIndex::erase(&self.config.db_dir(), name)?;
        let field_name = name.to_string();
        self.change_schema(&mut st, move |schema| {
            schema.remove_field(&field_name).map(|_| ())
        })
    }

    /// Create an index over `field` and seed it with the current value of
    /// every live record.
    fn install_index(&self, st: &mut EngineState, field: &str, kind: IndexKind) -> DbResult<()> {
        let mut index = FieldIndex::new(kind);
        let entries: Vec<(String, HeapOffsets)> = st
            .primary
            .iter()
            .map(|(p, o)| (p.clone(), *o))
            .collect();
        for (pk, offsets) in entries {
            let bytes = st.meta_heap.read(offsets.meta)?;
            let meta = st.schema.decode(&bytes)?;
            if let Some(value) = meta.get(field) {
                index.insert(value.clone(), &pk);
            }
        }
        st.indexes.insert(field.to_string(), index);
        Ok(())
    }

    /// Mutate the schema and rewrite the metadata heap to the new layout:
    /// decode every live record under the old layout, re-encode under the
    /// new one (defaults for added fields, dropped fields vanish), rename
    /// atomically, refresh the primary offsets and force a snapshot so the
    /// log never references the old layout.
    fn change_schema<F>(&self, st: &mut EngineState, mutate: F) -> DbResult<()>
    where
        F: FnOnce(&mut Schema) -> DbResult<()>,
    {
        let entries: Vec<(String, HeapOffsets)> = st
            .primary
            .iter()
            .map(|(p, o)| (p.clone(), *o))
            .collect();
        let mut records = Vec::with_capacity(entries.len());
        for (pk, offsets) in &entries {
            let bytes = st.meta_heap.read(offsets.meta)?;
            let meta = st.schema.decode(&bytes)?;
            records.push((pk.clone(), offsets.ts, meta));
        }

        mutate(&mut st.schema)?;
        st.schema.save(&self.config.schema_path())?;

        let tmp = self.config.db_dir().join("heap_meta.met.rewrite");
        if tmp.exists() {
            std::fs::remove_file(&tmp)?;
        }
        let mut new_heap = MetaHeap::open(&tmp, st.schema.record_size())?;
        for (pk, ts_offset, mut meta) in records {
            meta.retain(|field, _| st.schema.contains(field));
            let bytes = st.schema.encode(&meta)?;
            let meta_offset = new_heap.write(&bytes)?;
            st.primary.insert(
                pk,
                HeapOffsets {
                    ts: ts_offset,
                    meta: meta_offset,
                },
            );
        }
        new_heap.sync()?;
        drop(new_heap);
        std::fs::rename(&tmp, self.config.meta_heap_path())?;
        st.meta_heap = MetaHeap::open(self.config.meta_heap_path(), st.schema.record_size())?;

        self.flush_locked(st)?;
        tracing::debug!(
            "metadata heap rewritten; record size is now {} bytes",
            st.schema.record_size()
        );
        Ok(())
    }

    // ==================== reads & maintenance ====================

    /// The raw series stored under `pk`.
    pub fn series(&self, pk: &str) -> DbResult<TimeSeries> {
        let mut st = self.state();
        let offsets = st
            .primary
            .get(pk)
            .ok_or_else(|| DbError::NotFound(pk.to_string()))?;
        st.ts_heap.read(offsets.ts)
    }

    /// The full metadata record stored under `pk`.
    pub fn metadata(&self, pk: &str) -> DbResult<BTreeMap<String, FieldValue>> {
        let mut st = self.state();
        if !st.primary.contains(pk) {
            return Err(DbError::NotFound(pk.to_string()));
        }
        self.read_meta(&mut st, pk)
    }

    /// Whether `pk` holds a live series.
    pub fn contains(&self, pk: &str) -> bool {
        self.state().primary.contains(pk)
    }

    /// Whether the iSAX tree holds `pk` (descending with its word).
    pub fn tree_contains(&self, pk: &str) -> DbResult<bool> {
        let mut st = self.state();
        let Some(offsets) = st.primary.get(pk) else {
            return Ok(false);
        };
        let series = st.ts_heap.read(offsets.ts)?;
        let word = self.encoder.encode(series.values())?;
        Ok(st.tree.contains(pk, &word))
    }

    fn note_op(&self, st: &mut EngineState) -> DbResult<()> {
        st.ops_since_flush += 1;
        if st.ops_since_flush >= self.config.flush_every {
            self.flush_locked(st)?;
        }
        Ok(())
    }

    fn flush_locked(&self, st: &mut EngineState) -> DbResult<()> {
        st.ts_heap.sync()?;
        st.meta_heap.sync()?;

        st.primary.save(&self.config.primary_path())?;
        let lsn = st.primary.last_lsn();

        let dir = self.config.db_dir();
        for (field, index) in &st.indexes {
            index.save(&dir, field, lsn)?;
        }
        st.triggers.save(&self.config.triggers_path(), lsn)?;
        st.tree.save(&self.config.isax_path(), lsn)?;

        st.wal.truncate()?;
        st.ops_since_flush = 0;
        tracing::debug!("flushed snapshots at lsn {}", lsn);
        Ok(())
    }

    /// Snapshot everything and truncate the log.
    pub fn flush(&self) -> DbResult<()> {
        let mut st = self.state();
        self.flush_locked(&mut st)
    }

    /// Flush and release; the engine is unusable afterwards only by
    /// convention (dropping it closes the descriptors).
    pub fn close(&self) -> DbResult<()> {
        self.flush()
    }

    /// Engine statistics.
    pub fn stats(&self) -> DbResult<EngineStats> {
        let st = self.state();
        Ok(EngineStats {
            series_count: st.primary.len(),
            vantage_point_count: self.vantage_points(&st)?.len(),
            indexed_field_count: st.indexes.len(),
            tree_entries: st.tree.len(),
            record_size: st.schema.record_size(),
            last_lsn: st.primary.last_lsn(),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub series_count: usize,
    pub vantage_point_count: usize,
    pub indexed_field_count: usize,
    pub tree_entries: usize,
    pub record_size: usize,
    pub last_lsn: u64,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Series: {}, VPs: {}, Indexes: {}, Tree: {}, Record: {} B, LSN: {}",
            self.series_count,
            self.vantage_point_count,
            self.indexed_field_count,
            self.tree_entries,
            self.record_size,
            self.last_lsn
        )
    }
}
