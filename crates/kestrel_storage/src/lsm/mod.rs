//! Bundled leveled storage engine.
//!
//! ```text
//!   put/delete ──► MemTable (sorted, in-memory)
//!                    │  (flush)
//!                    ▼
//!                level-0 table files (overlapping, newest first)
//!                    │  (background merge)
//!                    ▼
//!                level 1..N-1 (non-overlapping per level)
//!                    ▲
//!                    │  (ingest-behind installs at the deepest vacant level)
//!                external table files
//! ```
//!
//! The engine implements [`crate::engine::TableEngine`]. Background merges
//! run on a dedicated worker thread; foreground calls never run the
//! scheduler loop themselves.

pub mod compaction;
pub mod engine;
pub mod filter;
pub mod memtable;
pub mod table;

pub use engine::LsmEngine;
pub use filter::KeyFilter;
pub use memtable::MemTable;
pub use table::{TableMeta, TableReader, TableWriter};
