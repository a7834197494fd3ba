//! The storage-engine capability interface.
//!
//! `ReplicatedStore` consumes a [`TableEngine`] trait object rather than a
//! concrete engine, so any leveled key-value engine that can express these
//! operations — open/put/get/delete, flush, compaction control, external
//! file ingestion, level introspection — can back a partition.

use std::path::PathBuf;
use std::time::Duration;

use kestrel_common::StoreError;

/// Options fixed at engine open time.
///
/// `allow_ingest_behind` and the level geometry are immutable for the life
/// of the open handle; changing them requires a close and reopen.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Create the data directory if it does not exist.
    pub create_if_missing: bool,
    /// Fail the open if the data directory already exists.
    pub error_if_exists: bool,
    /// Reserve the capability to install external files below all existing
    /// data. Cannot be toggled after open.
    pub allow_ingest_behind: bool,
    /// Number of levels in the tree (indices `0..num_levels`).
    pub num_levels: usize,
    /// L0 file count at which a background merge into L1 becomes eligible.
    pub level0_file_num_compaction_trigger: usize,
    /// Memtable size budget before an automatic flush.
    pub memtable_budget_bytes: u64,
    /// Target size for L1; deeper levels scale by `level_multiplier`.
    pub l1_target_bytes: u64,
    /// Size multiplier between adjacent levels.
    pub level_multiplier: u64,
    /// Fsync table files on write.
    pub sync_writes: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            allow_ingest_behind: false,
            num_levels: 7,
            level0_file_num_compaction_trigger: 4,
            memtable_budget_bytes: 64 * 1024 * 1024,
            l1_target_bytes: 64 * 1024 * 1024,
            level_multiplier: 10,
            sync_writes: true,
        }
    }
}

/// Options for a manual full-range compaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactOptions {
    /// When false, data compacts toward the bottommost occupied level and
    /// level boundaries are never reassigned. When true, the engine may
    /// re-place the merged run at a shallower level, collapsing previously
    /// occupied bottom levels.
    pub change_level: bool,
}

/// An ordered batch of externally pre-built, sorted, immutable table files.
#[derive(Debug, Clone)]
pub struct IngestBatch {
    /// Paths of the files to install, each internally sorted with key
    /// ranges disjoint across the batch.
    pub files: Vec<PathBuf>,
    /// Install the batch as the logically oldest data in the store.
    pub ingest_behind: bool,
    /// Permit the engine to assign the batch a sequence position of its
    /// choosing. Required for ingest-behind.
    pub allow_global_seqno: bool,
    /// Move files into the data directory instead of copying them.
    pub move_files: bool,
}

impl IngestBatch {
    /// A batch configured for ingest-behind loading, the common case.
    pub fn behind(files: Vec<PathBuf>) -> Self {
        Self {
            files,
            ingest_behind: true,
            allow_global_seqno: true,
            move_files: true,
        }
    }
}

/// Capability interface for a leveled key-value engine.
///
/// Foreground operations are synchronous on the caller's thread; flush and
/// compaction scheduling run on engine-owned worker threads. Level and
/// pending-work reads are point-in-time snapshots with no consistency
/// guarantee relative to concurrent background work.
pub trait TableEngine: Send + Sync {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Persist the active memtable as a level-0 table file.
    fn flush(&self) -> Result<(), StoreError>;

    /// Synchronous full-range compaction. Does not cancel or wait for
    /// background work already in flight.
    fn compact_range(&self, opts: CompactOptions) -> Result<(), StoreError>;

    /// Install a batch of external files. With `ingest_behind` set, the
    /// engine must have been opened with `allow_ingest_behind`.
    fn ingest_external_files(&self, batch: &IngestBatch) -> Result<(), StoreError>;

    /// Enable or disable background compaction scheduling; returns the
    /// previous setting. Affects only work scheduled after the call.
    fn set_auto_compaction(&self, enabled: bool) -> bool;

    fn auto_compaction_enabled(&self) -> bool;

    /// Level count fixed at open.
    fn num_levels(&self) -> usize;

    /// Resident file count at `level`; zero for out-of-range levels.
    fn files_at_level(&self, level: usize) -> usize;

    /// Estimated number of outstanding compaction jobs. Computed from
    /// manifest state even while auto-compaction is disabled.
    fn pending_compaction_count(&self) -> usize;

    /// Block until no compaction is running and none is schedulable, or
    /// until `timeout` elapses. Returns true if quiescence was reached.
    fn wait_compaction_idle(&self, timeout: Option<Duration>) -> bool;

    /// Whether the engine was opened with the ingest-behind capability.
    fn allow_ingest_behind(&self) -> bool;

    /// Flush remaining data and stop background work at a safe point.
    fn close(&self) -> Result<(), StoreError>;
}
