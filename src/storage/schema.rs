//! Metadata schema
//!
//! The schema is an ordered list of field descriptors and is the single
//! source of truth for the metadata heap's record layout: every record is
//! the fields' fixed-width encodings concatenated in schema order. The
//! schema is persisted as JSON to `schema.idx` so that the layout survives
//! restarts independently of the heap file itself.
//!
//! Field encodings (little-endian):
//! - int:   8 bytes (i64)
//! - float: 8 bytes (f64)
//! - bool:  1 byte
//! - str:   2-byte length + `max_len` bytes, zero padded

use crate::storage::error::{DbError, DbResult};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// A metadata field value.
///
/// Floats are wrapped in `OrderedFloat` so values can serve as ordered index
/// keys; comparisons only ever happen between values of the same field, so
/// the cross-variant ordering of the derive is never observed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    Int(i64),
    Float(OrderedFloat<f64>),
    Bool(bool),
    Str(String),
}

impl FieldValue {
    pub fn float(v: f64) -> Self {
        FieldValue::Float(OrderedFloat(v))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(v.into_inner()),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// The type of a metadata field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Int,
    Float,
    Bool,
    /// Fixed-capacity string; longer values are rejected.
    Str { max_len: usize },
}

impl FieldType {
    /// Encoded width of a value of this type, in bytes.
    pub fn encoded_size(&self) -> usize {
        match self {
            FieldType::Int | FieldType::Float => 8,
            FieldType::Bool => 1,
            FieldType::Str { max_len } => 2 + max_len,
        }
    }

    /// Whether `value` carries this type.
    pub fn matches(&self, value: &FieldValue) -> bool {
        matches!(
            (self, value),
            (FieldType::Int, FieldValue::Int(_))
                | (FieldType::Float, FieldValue::Float(_))
                | (FieldType::Bool, FieldValue::Bool(_))
                | (FieldType::Str { .. }, FieldValue::Str(_))
        )
    }
}

/// Which secondary index structure a field is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Balanced ordered map; for high-cardinality fields.
    Ordered,
    /// Bitmap over pk slots; for low-cardinality fields.
    Bitmap,
}

/// Descriptor of one metadata field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub default: FieldValue,
    pub index: Option<IndexKind>,
}

impl FieldDef {
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        default: FieldValue,
        index: Option<IndexKind>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type,
            default,
            index,
        }
    }
}

/// Name of the implicit tombstone field.
pub const FIELD_DELETED: &str = "deleted";
/// Name of the implicit vantage-point marker field.
pub const FIELD_VP: &str = "vp";
/// Prefix of the implicit per-vantage-point distance fields.
pub const VP_DIST_PREFIX: &str = "d_vp_";

/// Ordered description of the metadata record layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldDef>,
}

impl Schema {
    /// A schema holding only the implicit fields.
    pub fn standard() -> Self {
        Self {
            fields: vec![
                FieldDef::new(
                    FIELD_DELETED,
                    FieldType::Bool,
                    FieldValue::Bool(false),
                    Some(IndexKind::Bitmap),
                ),
                FieldDef::new(
                    FIELD_VP,
                    FieldType::Bool,
                    FieldValue::Bool(false),
                    Some(IndexKind::Bitmap),
                ),
            ],
        }
    }

    /// A schema with the implicit fields plus `extra` user fields appended.
    pub fn with_fields(extra: Vec<FieldDef>) -> DbResult<Self> {
        let mut schema = Self::standard();
        for def in extra {
            schema.add_field(def)?;
        }
        Ok(schema)
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Fields declared with a secondary index.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.index.is_some())
    }

    /// Total encoded record size in bytes.
    pub fn record_size(&self) -> usize {
        self.fields.iter().map(|f| f.field_type.encoded_size()).sum()
    }

    /// Append a field. The default must match the declared type.
    pub fn add_field(&mut self, def: FieldDef) -> DbResult<()> {
        if def.name.is_empty() {
            return Err(DbError::InvalidArgument("empty field name".to_string()));
        }
        if self.contains(&def.name) {
            return Err(DbError::SchemaMismatch(format!(
                "field {} already in schema",
                def.name
            )));
        }
        if !def.field_type.matches(&def.default) {
            return Err(DbError::SchemaMismatch(format!(
                "default for field {} does not match its type",
                def.name
            )));
        }
        self.fields.push(def);
        Ok(())
    }

    /// Remove a field by name. The implicit fields cannot be removed.
    pub fn remove_field(&mut self, name: &str) -> DbResult<FieldDef> {
        if name == FIELD_DELETED || name == FIELD_VP {
            return Err(DbError::InvalidArgument(format!(
                "field {} is implicit and cannot be removed",
                name
            )));
        }
        let pos = self
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| DbError::SchemaMismatch(format!("field {} not in schema", name)))?;
        Ok(self.fields.remove(pos))
    }

    /// Encode a record in schema order. Omitted fields take their defaults;
    /// unknown fields and type mismatches are rejected.
    pub fn encode(&self, record: &BTreeMap<String, FieldValue>) -> DbResult<Vec<u8>> {
        for name in record.keys() {
            if !self.contains(name) {
                return Err(DbError::SchemaMismatch(format!(
                    "unknown field {}",
                    name
                )));
            }
        }

        let mut buf = Vec::with_capacity(self.record_size());
        for def in &self.fields {
            let value = record.get(&def.name).unwrap_or(&def.default);
            if !def.field_type.matches(value) {
                return Err(DbError::SchemaMismatch(format!(
                    "value for field {} does not match its type",
                    def.name
                )));
            }
            match (def.field_type, value) {
                (FieldType::Int, FieldValue::Int(v)) => buf.extend_from_slice(&v.to_le_bytes()),
                (FieldType::Float, FieldValue::Float(v)) => {
                    buf.extend_from_slice(&v.into_inner().to_le_bytes())
                }
                (FieldType::Bool, FieldValue::Bool(v)) => buf.push(*v as u8),
                (FieldType::Str { max_len }, FieldValue::Str(s)) => {
                    let bytes = s.as_bytes();
                    if bytes.len() > max_len {
                        return Err(DbError::InvalidArgument(format!(
                            "string for field {} exceeds max length {}",
                            def.name, max_len
                        )));
                    }
                    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
                    buf.extend_from_slice(bytes);
                    buf.resize(buf.len() + (max_len - bytes.len()), 0);
                }
                _ => unreachable!("type checked above"),
            }
        }
        Ok(buf)
    }

    /// Decode a record encoded by [`Schema::encode`].
    pub fn decode(&self, bytes: &[u8]) -> DbResult<BTreeMap<String, FieldValue>> {
        if bytes.len() != self.record_size() {
            return Err(DbError::Corruption(format!(
                "metadata record is {} bytes, schema expects {}",
                bytes.len(),
                self.record_size()
            )));
        }

        let mut record = BTreeMap::new();
        let mut pos = 0usize;
        for def in &self.fields {
            let value = match def.field_type {
                FieldType::Int => {
                    let v = i64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
                    pos += 8;
                    FieldValue::Int(v)
                }
                FieldType::Float => {
                    let v = f64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
                    pos += 8;
                    FieldValue::float(v)
                }
                FieldType::Bool => {
                    let v = bytes[pos] != 0;
                    pos += 1;
                    FieldValue::Bool(v)
                }
                FieldType::Str { max_len } => {
                    let len =
                        u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
                    if len > max_len {
                        return Err(DbError::Corruption(format!(
                            "string length {} exceeds field capacity {}",
                            len, max_len
                        )));
                    }
                    let s = String::from_utf8(bytes[pos + 2..pos + 2 + len].to_vec())
                        .map_err(|e| DbError::Corruption(e.to_string()))?;
                    pos += 2 + max_len;
                    FieldValue::Str(s)
                }
            };
            record.insert(def.name.clone(), value);
        }
        Ok(record)
    }

    /// A record carrying every field's default.
    pub fn default_record(&self) -> BTreeMap<String, FieldValue> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.default.clone()))
            .collect()
    }

    /// Load a schema from its JSON file.
    pub fn load(path: &Path) -> DbResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let fields: Vec<FieldDef> = serde_json::from_str(&content)?;
        Ok(Self { fields })
    }

    /// Persist the schema as JSON, atomically (tmp + rename).
    pub fn save(&self, path: &Path) -> DbResult<()> {
        let content = serde_json::to_string_pretty(&self.fields)?;
        let tmp = path.with_extension("idx.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
