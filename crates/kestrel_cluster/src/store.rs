//! The replicated storage wrapper for one partition.
//!
//! A `ReplicatedStore` owns exactly one storage engine, bound to the
//! replication role it was opened with. It is the safe coordination
//! surface over that engine: compaction control, level introspection, and
//! bulk ingest-behind loading, with the mutual exclusion those operations
//! require.
//!
//! Role is immutable metadata for the life of the handle — a role
//! transition observed from the coordination layer closes the store and
//! reopens it with the new role. Read/write permission by role is enforced
//! by the request-routing layer, not here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use kestrel_common::StoreError;
use kestrel_storage::engine::{CompactOptions, EngineOptions, IngestBatch, TableEngine};
use kestrel_storage::lsm::LsmEngine;

use crate::states::ReplicaRole;

/// One partition's engine plus its replication binding.
///
/// Lifecycle is `Open → Closed`: every data operation on a closed store
/// fails with [`StoreError::Closed`]. Engine options (level count,
/// ingest-behind capability) are fixed at open; changing them requires a
/// close and a fresh open.
pub struct ReplicatedStore {
    name: String,
    path: PathBuf,
    role: ReplicaRole,
    engine: RwLock<Option<Arc<dyn TableEngine>>>,
    /// Serializes ingest-behind against itself and against
    /// level-reassigning compaction on this store.
    ingest_lock: Mutex<()>,
}

impl std::fmt::Debug for ReplicatedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedStore")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl ReplicatedStore {
    /// Open (or recover) the bundled engine at `path` and bind `role`.
    pub fn open(
        path: impl Into<PathBuf>,
        role: ReplicaRole,
        options: EngineOptions,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let engine = LsmEngine::open(&path, options)?;
        tracing::info!(partition = %name, %role, "opened replicated store");
        Ok(Self {
            name,
            path,
            role,
            engine: RwLock::new(Some(Arc::new(engine))),
            ingest_lock: Mutex::new(()),
        })
    }

    /// Bind `role` over an already-open engine. Lets any `TableEngine`
    /// implementation back the partition.
    pub fn from_engine(
        name: impl Into<String>,
        role: ReplicaRole,
        engine: Arc<dyn TableEngine>,
    ) -> Self {
        let name = name.into();
        Self {
            path: PathBuf::from(&name),
            name,
            role,
            engine: RwLock::new(Some(engine)),
            ingest_lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Role recorded at open. Immutable for the life of the handle.
    pub fn role(&self) -> ReplicaRole {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Run `f` against the engine while holding the open-state read guard,
    /// so `close()` drains in-flight callers before releasing the engine.
    fn with_engine<T>(
        &self,
        f: impl FnOnce(&dyn TableEngine) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self.engine.read();
        match guard.as_deref() {
            Some(engine) => f(engine),
            None => Err(StoreError::Closed),
        }
    }

    // ── Data path ───────────────────────────────────────────────────────

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_engine(|e| e.put(key, value))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_engine(|e| e.get(key))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.with_engine(|e| e.delete(key))
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.with_engine(|e| e.flush())
    }

    // ── Level introspection ─────────────────────────────────────────────

    /// Level count fixed at open.
    pub fn num_levels(&self) -> Result<usize, StoreError> {
        self.with_engine(|e| Ok(e.num_levels()))
    }

    /// Resident file count at `level`.
    pub fn files_at_level(&self, level: usize) -> Result<usize, StoreError> {
        self.with_engine(|e| Ok(e.files_at_level(level)))
    }

    /// The highest level index holding zero files, scanning level 0 toward
    /// the bottom; `None` when every level is occupied. Callers use this to
    /// judge the room below resident data before an ingest-behind load.
    ///
    /// Only meaningful as an instantaneous snapshot — a concurrent flush or
    /// compaction may invalidate it immediately. For a stable value,
    /// disable compaction and wait for quiescence first.
    pub fn highest_empty_level(&self) -> Result<Option<usize>, StoreError> {
        self.with_engine(|e| {
            let mut highest = None;
            for level in 0..e.num_levels() {
                if e.files_at_level(level) == 0 {
                    highest = Some(level);
                }
            }
            Ok(highest)
        })
    }

    // ── Compaction control ──────────────────────────────────────────────

    /// Allow or forbid the engine's background scheduler to start new
    /// compactions. Returns the previous setting. Future-effect only: an
    /// in-flight compaction is never canceled.
    pub fn set_compaction_enabled(&self, enabled: bool) -> Result<bool, StoreError> {
        self.with_engine(|e| Ok(e.set_auto_compaction(enabled)))
    }

    /// Engine-estimated outstanding compaction work.
    pub fn pending_compaction_count(&self) -> Result<usize, StoreError> {
        self.with_engine(|e| Ok(e.pending_compaction_count()))
    }

    /// Block until background compaction is quiescent (or `timeout`
    /// elapses; returns false on timeout). The synchronization primitive
    /// for "wait until level occupancy is stable" — not a fixed sleep.
    pub fn wait_for_quiescence(&self, timeout: Option<Duration>) -> Result<bool, StoreError> {
        self.with_engine(|e| Ok(e.wait_compaction_idle(timeout)))
    }

    /// Trigger a full-range compaction. With `change_level` the engine may
    /// collapse occupied bottom levels into a shallower placement, which
    /// can raise [`Self::highest_empty_level`]; without it the result
    /// stays at the bottommost occupied level and never raises it.
    pub fn compact(&self, change_level: bool) -> Result<(), StoreError> {
        // Level reassignment and ingest-behind both rewrite level
        // placement; their interleaving is undefined, so they share a lock.
        let _ingest_guard = change_level.then(|| self.ingest_lock.lock());
        self.with_engine(|e| e.compact_range(CompactOptions { change_level }))
    }

    // ── Bulk load ───────────────────────────────────────────────────────

    /// Install `batch` as the logically oldest data in the store.
    /// Concurrent callers block on the per-store ingestion lock until it
    /// frees; see [`Self::ingest_behind_timeout`] for a bounded wait.
    pub fn ingest_behind(&self, batch: &IngestBatch) -> Result<(), StoreError> {
        self.check_ingest_batch(batch)?;
        let _ingest_guard = self.ingest_lock.lock();
        self.with_engine(|e| e.ingest_external_files(batch))
    }

    /// [`Self::ingest_behind`] with a bounded wait for the ingestion lock.
    pub fn ingest_behind_timeout(
        &self,
        batch: &IngestBatch,
        timeout: Duration,
    ) -> Result<(), StoreError> {
        self.check_ingest_batch(batch)?;
        let Some(_ingest_guard) = self.ingest_lock.try_lock_for(timeout) else {
            return Err(StoreError::IngestionLockTimeout(timeout));
        };
        self.with_engine(|e| e.ingest_external_files(batch))
    }

    /// Reject batches this entry point cannot honor before any lock or
    /// engine state is touched.
    fn check_ingest_batch(&self, batch: &IngestBatch) -> Result<(), StoreError> {
        if !batch.ingest_behind {
            return Err(StoreError::IngestionInvalid(
                "batch is not marked ingest-behind".into(),
            ));
        }
        self.with_engine(|e| {
            if !e.allow_ingest_behind() {
                return Err(StoreError::IngestionDisabled);
            }
            Ok(())
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Close the store: drain in-flight foreground calls, then shut the
    /// engine down at its safe stopping point. Subsequent operations fail
    /// with [`StoreError::Closed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.engine.write();
        match guard.take() {
            Some(engine) => {
                engine.close()?;
                tracing::info!(partition = %self.name, "closed replicated store");
                Ok(())
            }
            None => Err(StoreError::Closed),
        }
    }
}

impl Drop for ReplicatedStore {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.write().take() {
            if let Err(e) = engine.close() {
                tracing::warn!(partition = %self.name, "close on drop failed: {e}");
            }
        }
    }
}
