//! Vantage storage engine
//!
//! The persistence and indexing core:
//!
//! - **series**: the fixed-length time-series value type
//! - **schema**: metadata field descriptors and record layout
//! - **heap**: fixed-record binary stores for series and metadata
//! - **wal**: CRC-framed write-ahead log (the commit point)
//! - **primary**: pk → heap offsets, snapshot + replay
//! - **secondary**: ordered-tree and bitmap field indexes
//! - **triggers**: operation → procedure bindings
//! - **engine**: the composer exposing the operation set
//! - **snapshot**: shared checksummed snapshot framing
//! - **error**: error types
//!
//! # Architecture
//!
//! ```text
//! Write path:
//!   insert_ts → heaps → WAL (fsync = commit) → primary → secondary
//!             → triggers → iSAX → vantage distances
//!
//! Read path:
//!   select → indexes (candidate set) → heaps → project
//! ```

pub mod engine;
pub mod error;
pub mod heap;
pub mod primary;
pub mod schema;
pub mod secondary;
pub mod snapshot;
pub mod series;
pub mod triggers;
pub mod types;
pub mod wal;

// Re-export commonly used types
pub use engine::{EngineStats, StorageConfig, StorageEngine};
pub use error::{DbError, DbResult};
pub use heap::{MetaHeap, TsHeap};
pub use primary::{HeapOffsets, PrimaryIndex};
pub use schema::{FieldDef, FieldType, FieldValue, IndexKind, Schema};
pub use secondary::{BitmapIndex, FieldIndex, OrderedTreeIndex};
pub use series::TimeSeries;
pub use triggers::{Operation, TriggerSpec, TriggerTable};
pub use types::{CompareOp, Condition, Predicate, Row, SelectOptions, SortSpec};
pub use wal::{LogOp, LogRecord, WriteAheadLog};
