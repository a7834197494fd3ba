use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),
}

/// Storage and per-partition coordination errors.
///
/// None of these are retried at the layer that produces them; retry and
/// backoff policy belongs to the caller.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Engine initialization failed: lock contention, corrupt on-disk
    /// state, or create/exists flags conflicting with the actual path.
    #[error("Open failed for {}: {reason}", path.display())]
    Open { path: PathBuf, reason: String },

    /// Operation invoked on a closed store. Contract violation, not a
    /// transient condition.
    #[error("store is closed")]
    Closed,

    /// `ingest_behind` on a store opened without `allow_ingest_behind`.
    #[error("ingest-behind is disabled: store was opened without allow_ingest_behind")]
    IngestionDisabled,

    /// Malformed ingest input: unreadable, unsorted, or overlapping files.
    #[error("invalid ingest batch: {0}")]
    IngestionInvalid(String),

    /// The per-store ingestion lock was not acquired within the caller's
    /// configured timeout.
    #[error("ingestion lock not acquired within {0:?}")]
    IngestionLockTimeout(Duration),

    /// Engine-level compaction failure.
    #[error("compaction failed: {0}")]
    Compaction(String),

    /// Data on disk does not match its checksum or declared layout.
    #[error("table file corruption in {}: {detail}", path.display())]
    Corruption { path: PathBuf, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Assignment-snapshot and partition-registry errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A required metadata field is absent from the snapshot.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// A required metadata field is present but unparseable.
    #[error("malformed field {field}: {value:?}")]
    MalformedField { field: String, value: String },

    #[error("partition already open: {0}")]
    PartitionExists(String),

    #[error("unknown partition: {0}")]
    UnknownPartition(String),
}
