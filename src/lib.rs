//! # Vantage
//!
//! A persistent time-series database core for fixed-length numeric series:
//! heap-file storage, a WAL-backed primary index, typed secondary indexes,
//! operation triggers, an iSAX tree for approximate similarity search and a
//! vantage-point distance cache for exact similarity search.
//!
//! ## Modules
//!
//! - [`storage`]: heaps, indexes, WAL and the storage engine
//! - [`sax`]: SAX encoding and the iSAX tree
//! - [`similarity`]: series distance kernels
//! - [`procs`]: the procedure registry used by triggers
//! - [`config`]: TOML/environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use vantage::storage::{
//!     Condition, FieldDef, FieldType, FieldValue, IndexKind, Operation,
//!     SelectOptions, StorageConfig, StorageEngine, TimeSeries,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StorageConfig::new("./vantage_data", "prices", 100);
//!     let engine = StorageEngine::open(
//!         config,
//!         vec![FieldDef::new(
//!             "mean",
//!             FieldType::Float,
//!             FieldValue::float(0.0),
//!             Some(IndexKind::Ordered),
//!         )],
//!     )?;
//!
//!     // compute the mean on every insert
//!     engine.add_trigger("stats", Operation::InsertTs, vec!["mean".into()], None)?;
//!
//!     let times: Vec<f64> = (0..100).map(|i| i as f64).collect();
//!     let values: Vec<f64> = (0..100).map(|i| (i as f64 * 0.1).sin()).collect();
//!     engine.insert_ts("ts-0", TimeSeries::new(times, values)?)?;
//!
//!     let mut md = BTreeMap::new();
//!     md.insert(
//!         "pk".to_string(),
//!         Condition::Value(FieldValue::Str("ts-0".to_string())),
//!     );
//!     let rows = engine.select(&md, Some(&["mean".to_string()]), &SelectOptions::new())?;
//!     println!("mean = {}", rows[0].fields["mean"]);
//!
//!     engine.close()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod procs;
pub mod sax;
pub mod similarity;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{
    CompareOp, Condition, DbError, DbResult, EngineStats, FieldDef, FieldType, FieldValue,
    IndexKind, Operation, Predicate, Row, Schema, SelectOptions, StorageConfig, StorageEngine,
    TimeSeries, TriggerSpec,
};

pub use config::{Config, ConfigError};
pub use procs::ProcRegistry;
pub use sax::{SaxEncoder, SaxWord};
pub use sax::tree::IsaxTree;
