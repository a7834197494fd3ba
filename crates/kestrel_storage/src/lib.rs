//! Per-partition storage for kestrel.
//!
//! Two layers live here:
//!
//! - [`engine`] — the capability interface a storage engine must provide to
//!   back a replicated partition (`TableEngine`), plus the option and
//!   ingest-batch types that cross that boundary.
//! - [`lsm`] — the bundled leveled engine: memtable, sorted table files,
//!   per-level manifest, and a background compaction worker. Any compliant
//!   `TableEngine` implementation can replace it without touching callers.

pub mod engine;
pub mod lsm;

pub use engine::{CompactOptions, EngineOptions, IngestBatch, TableEngine};
pub use lsm::LsmEngine;
pub use lsm::table::{TableMeta, TableReader, TableWriter};
