//! Procedure registry
//!
//! Procedures are pure functions over a series and an optional series
//! argument, returning positional outputs that triggers and augmented
//! selects assign to target fields. The registry is an explicit handle
//! owned by the engine; there is no process-wide state.

use crate::similarity::ncc_distance;
use crate::storage::error::{DbError, DbResult};
use crate::storage::schema::FieldValue;
use crate::storage::series::TimeSeries;
use std::collections::BTreeMap;

/// A registered procedure.
pub type ProcFn = fn(&str, &TimeSeries, Option<&TimeSeries>) -> DbResult<Vec<FieldValue>>;

/// Name → procedure mapping.
#[derive(Debug, Default)]
pub struct ProcRegistry {
    procs: BTreeMap<String, ProcFn>,
}

impl ProcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with the built-in procedures.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("stats", proc_stats);
        registry.register("corr", proc_corr);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, proc: ProcFn) {
        self.procs.insert(name.into(), proc);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.procs.contains_key(name)
    }

    /// Run a procedure; `InvalidArgument` for unknown names.
    pub fn call(
        &self,
        name: &str,
        pk: &str,
        series: &TimeSeries,
        arg: Option<&TimeSeries>,
    ) -> DbResult<Vec<FieldValue>> {
        let proc = self
            .procs
            .get(name)
            .ok_or_else(|| DbError::InvalidArgument(format!("unknown procedure {}", name)))?;
        proc(pk, series, arg)
    }
}

/// `stats`: mean and population standard deviation of the values.
fn proc_stats(
    _pk: &str,
    series: &TimeSeries,
    _arg: Option<&TimeSeries>,
) -> DbResult<Vec<FieldValue>> {
    Ok(vec![
        FieldValue::float(series.mean()),
        FieldValue::float(series.std()),
    ])
}

/// `corr`: normalized cross-correlation distance to the argument series.
fn proc_corr(
    _pk: &str,
    series: &TimeSeries,
    arg: Option<&TimeSeries>,
) -> DbResult<Vec<FieldValue>> {
    let reference = arg.ok_or_else(|| {
        DbError::InvalidArgument("corr requires a series argument".to_string())
    })?;
    if reference.len() != series.len() {
        return Err(DbError::InvalidArgument(format!(
            "corr argument length {} does not match series length {}",
            reference.len(),
            series.len()
        )));
    }
    Ok(vec![FieldValue::float(ncc_distance(series, reference))])
}
