//! The bundled leveled engine.
//!
//! Owns the memtable, the per-level file manifest, and a background worker
//! thread that merges level-0 backlogs into level 1. Implements
//! [`TableEngine`], the capability surface the replication layer consumes.
//!
//! Write path: put/delete → active memtable → (flush) → L0 table file.
//! Read path: active → frozen memtables → L0 (newest first) → L1..Ln.

use std::collections::HashSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};

use kestrel_common::StoreError;

use crate::engine::{CompactOptions, EngineOptions, IngestBatch, TableEngine};

use super::compaction::{CompactionStats, Compactor};
use super::memtable::MemTable;
use super::table::{parse_table_file_name, table_file_name, TableMeta, TableReader};

const LOCK_FILE: &str = "LOCK";

/// Leveled storage engine with a background compaction worker.
pub struct LsmEngine {
    inner: Arc<Inner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for LsmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmEngine")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

struct Inner {
    opts: EngineOptions,
    dir: PathBuf,
    /// Held for the lifetime of the open handle; released at close so the
    /// directory can be reopened immediately.
    dir_lock: Mutex<Option<File>>,
    active: RwLock<Arc<MemTable>>,
    /// Frozen memtables still visible to reads while their flush runs.
    frozen: RwLock<Vec<Arc<MemTable>>>,
    /// File manifest. Level 0 is kept newest-first by file number;
    /// deeper levels are non-overlapping, sorted by min key.
    levels: RwLock<Vec<Vec<TableMeta>>>,
    compactor: Compactor,
    next_file_no: AtomicU64,
    auto_compaction: AtomicBool,
    shutdown: AtomicBool,
    /// Serializes flush snapshot/swap.
    flush_lock: Mutex<()>,
    /// Serializes every manifest-rewriting job: background merge, manual
    /// compaction, ingest install.
    compaction_lock: Mutex<()>,
    work: Mutex<WorkerState>,
    cond: Condvar,
}

struct WorkerState {
    inflight: bool,
}

fn open_err(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Open {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

impl LsmEngine {
    /// Open or create the engine at `dir`, honoring the create/exists
    /// flags, and recover the level manifest from resident table files.
    pub fn open(dir: &Path, opts: EngineOptions) -> Result<Self, StoreError> {
        if opts.num_levels < 2 {
            return Err(open_err(dir, "num_levels must be at least 2"));
        }

        let exists = dir.exists();
        if exists && opts.error_if_exists {
            return Err(open_err(dir, "path already exists and error_if_exists is set"));
        }
        if !exists && !opts.create_if_missing {
            return Err(open_err(dir, "path does not exist and create_if_missing is not set"));
        }
        if exists && !dir.is_dir() {
            return Err(open_err(dir, "path exists but is not a directory"));
        }
        fs::create_dir_all(dir).map_err(|e| open_err(dir, e.to_string()))?;

        let lock_file =
            File::create(dir.join(LOCK_FILE)).map_err(|e| open_err(dir, e.to_string()))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| open_err(dir, "data directory is locked by another instance"))?;

        let (levels, next_file_no) = Self::recover(dir, &opts)?;
        let file_count: usize = levels.iter().map(Vec::len).sum();

        let inner = Arc::new(Inner {
            compactor: Compactor::new(dir, &opts),
            dir: dir.to_path_buf(),
            dir_lock: Mutex::new(Some(lock_file)),
            active: RwLock::new(Arc::new(MemTable::new())),
            frozen: RwLock::new(Vec::new()),
            levels: RwLock::new(levels),
            next_file_no: AtomicU64::new(next_file_no),
            auto_compaction: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            work: Mutex::new(WorkerState { inflight: false }),
            cond: Condvar::new(),
            opts,
        });

        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name("kestrel-compaction".into())
            .spawn(move || worker_loop(worker_inner))
            .map_err(|e| open_err(dir, format!("failed to start compaction worker: {e}")))?;

        tracing::info!(
            dir = %dir.display(),
            recovered_files = file_count,
            "opened leveled engine"
        );

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Merge counters, exposed for introspection and tests.
    pub fn compaction_stats(&self) -> CompactionStats {
        self.inner.compactor.stats()
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn options(&self) -> &EngineOptions {
        &self.inner.opts
    }

    fn recover(dir: &Path, opts: &EngineOptions) -> Result<(Vec<Vec<TableMeta>>, u64), StoreError> {
        let mut levels: Vec<Vec<TableMeta>> = vec![Vec::new(); opts.num_levels];
        let mut max_file_no = 0u64;

        for entry in fs::read_dir(dir).map_err(|e| open_err(dir, e.to_string()))? {
            let entry = entry.map_err(|e| open_err(dir, e.to_string()))?;
            let name = entry.file_name();
            let Some((level, file_no)) = name.to_str().and_then(parse_table_file_name) else {
                continue;
            };
            if level >= opts.num_levels {
                return Err(open_err(
                    dir,
                    format!("table file {:?} is beyond the configured level count", name),
                ));
            }
            let path = entry.path();
            let reader = TableReader::open(&path)
                .map_err(|e| open_err(dir, format!("corrupt table file {:?}: {e}", name)))?;
            let mut meta = reader.meta();
            meta.level = level;
            meta.file_no = file_no;
            max_file_no = max_file_no.max(file_no);
            levels[level].push(meta);
        }

        levels[0].sort_by(|a, b| b.file_no.cmp(&a.file_no));
        for level in levels.iter_mut().skip(1) {
            level.sort_by(|a, b| a.min_key.cmp(&b.min_key));
        }
        Ok((levels, max_file_no + 1))
    }

    fn apply(&self, key: &[u8], value: Option<&[u8]>) -> Result<(), StoreError> {
        loop {
            let memtable = self.inner.active.read().clone();
            if memtable.write(key.to_vec(), value.map(<[u8]>::to_vec)) {
                break;
            }
            // Lost a race with a freeze; the flush path installs a fresh
            // active memtable before releasing the flush lock.
            thread::yield_now();
        }

        if self.inner.active.read().approx_bytes() >= self.inner.opts.memtable_budget_bytes {
            self.flush_impl()?;
        }
        Ok(())
    }

    fn flush_impl(&self) -> Result<(), StoreError> {
        let _fg = self.inner.flush_lock.lock();

        let frozen = {
            let mut active = self.inner.active.write();
            if active.is_empty() {
                return Ok(());
            }
            let old = active.clone();
            old.freeze();
            *active = Arc::new(MemTable::new());
            old
        };
        self.inner.frozen.write().push(frozen.clone());

        let file_no = self.inner.next_file_no.fetch_add(1, Ordering::Relaxed);
        let path = self.inner.dir.join(table_file_name(0, file_no));
        let entries = frozen.snapshot_sorted();

        let mut writer = super::table::TableWriter::create(&path, entries.len())?;
        for (key, value) in &entries {
            writer.add(key, value.as_deref())?;
        }
        let mut meta = writer.finish(self.inner.opts.sync_writes)?;
        meta.file_no = file_no;
        meta.level = 0;

        {
            let mut levels = self.inner.levels.write();
            levels[0].push(meta);
            levels[0].sort_by(|a, b| b.file_no.cmp(&a.file_no));
        }
        self.inner
            .frozen
            .write()
            .retain(|m| !Arc::ptr_eq(m, &frozen));

        tracing::debug!(file_no, entries = entries.len(), "flushed memtable to level 0");
        self.inner.kick_worker();
        Ok(())
    }

    fn close_impl(&self) -> Result<(), StoreError> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.kick_worker();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.flush_impl()?;
        if let Some(lock) = self.inner.dir_lock.lock().take() {
            let _ = lock.unlock();
        }
        tracing::info!(dir = %self.inner.dir.display(), "closed leveled engine");
        Ok(())
    }
}

impl Drop for LsmEngine {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::SeqCst) {
            let _ = self.close_impl();
        }
    }
}

impl TableEngine for LsmEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.apply(key, Some(value))
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        // Active memtable.
        let active = self.inner.active.read().clone();
        if let Some(slot) = active.get(key) {
            return Ok(slot);
        }

        // Frozen memtables, newest first.
        {
            let frozen = self.inner.frozen.read();
            for memtable in frozen.iter().rev() {
                if let Some(slot) = memtable.get(key) {
                    return Ok(slot);
                }
            }
        }

        let levels = self.inner.levels.read();

        // L0 is newest-first and files overlap: check each in order.
        for meta in &levels[0] {
            if !meta.covers(key) {
                continue;
            }
            if let Some(value) = TableReader::open(&meta.path)?.get(key)? {
                return Ok((!value.is_empty()).then_some(value));
            }
        }

        // Deeper levels are disjoint: at most one candidate file each.
        for level in levels.iter().skip(1) {
            let idx = level.partition_point(|m| m.max_key.as_slice() < key);
            let Some(meta) = level.get(idx) else { continue };
            if !meta.covers(key) {
                continue;
            }
            if let Some(value) = TableReader::open(&meta.path)?.get(key)? {
                return Ok((!value.is_empty()).then_some(value));
            }
        }

        Ok(None)
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.apply(key, None)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.flush_impl()
    }

    fn compact_range(&self, opts: CompactOptions) -> Result<(), StoreError> {
        let _cg = self.inner.compaction_lock.lock();

        let (inputs, bottom) = {
            let levels = self.inner.levels.read();
            let mut inputs = levels[0].clone();
            for level in levels.iter().skip(1) {
                inputs.extend(level.iter().cloned());
            }
            let bottom = (0..levels.len()).rev().find(|&l| !levels[l].is_empty());
            (inputs, bottom)
        };
        let Some(bottom) = bottom else {
            return Ok(());
        };

        let input_bytes: u64 = inputs.iter().map(|m| m.file_size).sum();
        let target = if opts.change_level {
            self.inner.compactor.fit_level(input_bytes, bottom)
        } else {
            bottom
        };

        let out_file_no = self.inner.next_file_no.fetch_add(1, Ordering::Relaxed);
        // Full-range output has nothing older below it: tombstones drop.
        let outcome = self
            .inner
            .compactor
            .merge(&inputs, target, out_file_no, true)?;

        self.inner.install_merge(&outcome, target);
        tracing::info!(
            consumed = outcome.consumed.len(),
            target_level = target,
            change_level = opts.change_level,
            "manual full-range compaction"
        );
        self.inner.kick_worker();
        Ok(())
    }

    fn ingest_external_files(&self, batch: &IngestBatch) -> Result<(), StoreError> {
        if batch.ingest_behind && !self.inner.opts.allow_ingest_behind {
            return Err(StoreError::IngestionDisabled);
        }
        if batch.files.is_empty() {
            return Err(StoreError::IngestionInvalid("empty batch".into()));
        }
        if batch.ingest_behind && !batch.allow_global_seqno {
            return Err(StoreError::IngestionInvalid(
                "ingest-behind requires global sequence-number assignment".into(),
            ));
        }

        // Validate the whole batch before touching engine state.
        let mut metas = Vec::with_capacity(batch.files.len());
        for path in &batch.files {
            let reader = TableReader::open(path).map_err(|e| {
                StoreError::IngestionInvalid(format!("{}: {e}", path.display()))
            })?;
            reader
                .verify()
                .map_err(|e| StoreError::IngestionInvalid(format!("{}: {e}", path.display())))?;
            let meta = reader.meta();
            if meta.entry_count == 0 {
                return Err(StoreError::IngestionInvalid(format!(
                    "{}: empty table file",
                    path.display()
                )));
            }
            metas.push(meta);
        }
        metas.sort_by(|a, b| a.min_key.cmp(&b.min_key));
        for pair in metas.windows(2) {
            if pair[1].min_key <= pair[0].max_key {
                return Err(StoreError::IngestionInvalid(
                    "key ranges overlap within the batch".into(),
                ));
            }
        }

        let _cg = self.inner.compaction_lock.lock();

        let target = if batch.ingest_behind {
            let levels = self.inner.levels.read();
            (0..levels.len())
                .rev()
                .find(|&l| levels[l].is_empty())
                .ok_or_else(|| {
                    StoreError::IngestionInvalid("no vacant level below resident data".into())
                })?
        } else {
            0
        };

        let mut installed = Vec::with_capacity(metas.len());
        for mut meta in metas {
            let file_no = self.inner.next_file_no.fetch_add(1, Ordering::Relaxed);
            let dest = self.inner.dir.join(table_file_name(target, file_no));
            if batch.move_files {
                if fs::rename(&meta.path, &dest).is_err() {
                    // Cross-device move: copy then unlink the source.
                    fs::copy(&meta.path, &dest)?;
                    let _ = fs::remove_file(&meta.path);
                }
            } else {
                fs::copy(&meta.path, &dest)?;
            }
            meta.path = dest;
            meta.file_no = file_no;
            meta.level = target;
            installed.push(meta);
        }

        let count = installed.len();
        {
            let mut levels = self.inner.levels.write();
            levels[target].extend(installed);
            if target == 0 {
                levels[0].sort_by(|a, b| b.file_no.cmp(&a.file_no));
            } else {
                levels[target].sort_by(|a, b| a.min_key.cmp(&b.min_key));
            }
        }

        tracing::info!(
            files = count,
            level = target,
            ingest_behind = batch.ingest_behind,
            "installed external table files"
        );
        self.inner.kick_worker();
        Ok(())
    }

    fn set_auto_compaction(&self, enabled: bool) -> bool {
        let previous = self.inner.auto_compaction.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            tracing::info!(enabled, "auto-compaction toggled");
            self.inner.kick_worker();
        }
        previous
    }

    fn auto_compaction_enabled(&self) -> bool {
        self.inner.auto_compaction.load(Ordering::SeqCst)
    }

    fn num_levels(&self) -> usize {
        self.inner.opts.num_levels
    }

    fn files_at_level(&self, level: usize) -> usize {
        self.inner
            .levels
            .read()
            .get(level)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn pending_compaction_count(&self) -> usize {
        let levels = self.inner.levels.read();
        self.inner
            .compactor
            .pending_estimate(&levels, self.inner.opts.level0_file_num_compaction_trigger)
    }

    fn wait_compaction_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.work.lock();
        loop {
            if !guard.inflight && !self.inner.schedulable() {
                return true;
            }
            match deadline {
                None => self.inner.cond.wait(&mut guard),
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                        return !guard.inflight && !self.inner.schedulable();
                    }
                }
            }
        }
    }

    fn allow_ingest_behind(&self) -> bool {
        self.inner.opts.allow_ingest_behind
    }

    fn close(&self) -> Result<(), StoreError> {
        self.close_impl()
    }
}

impl Inner {
    fn kick_worker(&self) {
        let _guard = self.work.lock();
        self.cond.notify_all();
    }

    /// Whether the background worker has runnable work right now.
    fn schedulable(&self) -> bool {
        self.auto_compaction.load(Ordering::SeqCst) && self.l0_over_trigger()
    }

    fn l0_over_trigger(&self) -> bool {
        let trigger = self.opts.level0_file_num_compaction_trigger.max(1);
        self.levels.read()[0].len() >= trigger
    }

    /// Rewrite the manifest after a merge: drop consumed files, install the
    /// produced file at `target`, then delete consumed files from disk.
    fn install_merge(&self, outcome: &super::compaction::MergeOutcome, target: usize) {
        {
            let mut levels = self.levels.write();
            let consumed: HashSet<u64> = outcome.consumed.iter().map(|m| m.file_no).collect();
            for level in levels.iter_mut() {
                level.retain(|m| !consumed.contains(&m.file_no));
            }
            if let Some(produced) = &outcome.produced {
                levels[target].push(produced.clone());
                if target == 0 {
                    levels[0].sort_by(|a, b| b.file_no.cmp(&a.file_no));
                } else {
                    levels[target].sort_by(|a, b| a.min_key.cmp(&b.min_key));
                }
            }
        }
        for meta in &outcome.consumed {
            let _ = fs::remove_file(&meta.path);
        }
    }

    /// One background L0 → L1 merge. Re-checks the trigger under the
    /// compaction lock: a manual compaction or ingest may have run since
    /// the worker woke.
    fn run_l0_merge(&self) -> Result<(), StoreError> {
        let _cg = self.compaction_lock.lock();

        let (inputs, drop_tombstones) = {
            let levels = self.levels.read();
            let trigger = self.opts.level0_file_num_compaction_trigger.max(1);
            if levels[0].len() < trigger {
                return Ok(());
            }
            let l0 = levels[0].clone();
            let l0_min = l0.iter().map(|m| m.min_key.clone()).min().unwrap_or_default();
            let l0_max = l0.iter().map(|m| m.max_key.clone()).max().unwrap_or_default();

            let mut inputs = l0;
            inputs.extend(
                levels[1]
                    .iter()
                    .filter(|m| m.max_key >= l0_min && m.min_key <= l0_max)
                    .cloned(),
            );
            // Tombstones may only drop when no level below the output can
            // still hold an older version.
            let deeper_occupied = levels.iter().skip(2).any(|l| !l.is_empty());
            (inputs, !deeper_occupied)
        };

        let out_file_no = self.next_file_no.fetch_add(1, Ordering::Relaxed);
        let outcome = self.compactor.merge(&inputs, 1, out_file_no, drop_tombstones)?;
        let consumed = outcome.consumed.len();
        self.install_merge(&outcome, 1);

        tracing::info!(consumed, "background level-0 merge completed");
        Ok(())
    }
}

fn worker_loop(inner: Arc<Inner>) {
    let mut guard = inner.work.lock();
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        if inner.schedulable() {
            guard.inflight = true;
            drop(guard);
            let result = inner.run_l0_merge();
            guard = inner.work.lock();
            guard.inflight = false;
            inner.cond.notify_all();
            if let Err(e) = result {
                tracing::warn!("background compaction failed: {e}");
                // Back off instead of spinning on a persistent failure.
                let _ = inner
                    .cond
                    .wait_for(&mut guard, Duration::from_millis(100));
            }
        } else {
            inner.cond.wait(&mut guard);
        }
    }
    guard.inflight = false;
    drop(guard);
    inner.cond.notify_all();
}
