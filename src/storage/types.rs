//! Query types for `select`
//!
//! A select predicate is a conjunction of per-field conditions; each
//! condition is either an exact value, a comparison, or a membership test.
//! `SelectOptions` carries the post-filter ordering and truncation.

use crate::storage::error::{DbError, DbResult};
use crate::storage::schema::FieldValue;
use crate::storage::series::TimeSeries;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Pseudo-field that projects the raw series into a result row.
pub const TS_FIELD: &str = "ts";

/// Comparison operators supported by the ordered-tree index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn parse(op: &str) -> DbResult<Self> {
        match op {
            "==" => Ok(CompareOp::Eq),
            "!=" => Ok(CompareOp::Ne),
            "<" => Ok(CompareOp::Lt),
            "<=" => Ok(CompareOp::Le),
            ">" => Ok(CompareOp::Gt),
            ">=" => Ok(CompareOp::Ge),
            other => Err(DbError::InvalidArgument(format!(
                "unknown comparison operator {}",
                other
            ))),
        }
    }

    /// Whether an ordering outcome satisfies this operator.
    pub fn accepts(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }
}

/// One field's condition within a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Exact match.
    Value(FieldValue),
    /// Comparison against a bound.
    Cmp(CompareOp, FieldValue),
    /// Membership in a value list.
    In(Vec<FieldValue>),
}

/// Conjunctive predicate: every entry must hold.
pub type Predicate = BTreeMap<String, Condition>;

/// Sort direction and field parsed from a `±field` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub descending: bool,
}

impl SortSpec {
    /// Parse `+field`, `-field` or bare `field` (ascending).
    pub fn parse(spec: &str) -> DbResult<Self> {
        let (descending, field) = match spec.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, spec.strip_prefix('+').unwrap_or(spec)),
        };
        if field.is_empty() {
            return Err(DbError::InvalidArgument("empty sort field".to_string()));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }
}

/// Post-filter options for `select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    /// `±field` ordering; results are pk-ordered when absent.
    pub sort_by: Option<String>,
    /// Keep at most this many rows, applied after ordering.
    pub limit: Option<usize>,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sort_by(mut self, spec: impl Into<String>) -> Self {
        self.sort_by = Some(spec.into());
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

/// One selected row: projected metadata, optionally the raw series.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub pk: String,
    pub fields: BTreeMap<String, FieldValue>,
    pub ts: Option<TimeSeries>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_parse() {
        assert_eq!(CompareOp::parse("==").unwrap(), CompareOp::Eq);
        assert_eq!(CompareOp::parse(">=").unwrap(), CompareOp::Ge);
        assert!(CompareOp::parse("~").is_err());
    }

    #[test]
    fn test_compare_op_accepts() {
        assert!(CompareOp::Lt.accepts(Ordering::Less));
        assert!(!CompareOp::Lt.accepts(Ordering::Equal));
        assert!(CompareOp::Le.accepts(Ordering::Equal));
        assert!(CompareOp::Ne.accepts(Ordering::Greater));
        assert!(!CompareOp::Ne.accepts(Ordering::Equal));
    }

    #[test]
    fn test_sort_spec_parse() {
        assert_eq!(
            SortSpec::parse("+mean").unwrap(),
            SortSpec {
                field: "mean".to_string(),
                descending: false
            }
        );
        assert_eq!(
            SortSpec::parse("-mean").unwrap(),
            SortSpec {
                field: "mean".to_string(),
                descending: true
            }
        );
        assert_eq!(SortSpec::parse("mean").unwrap().descending, false);
        assert!(SortSpec::parse("-").is_err());
    }
}
