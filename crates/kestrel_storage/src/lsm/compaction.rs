//! Table-file merging for the leveled engine.
//!
//! Two shapes of job share this machinery:
//!
//! - the background worker's L0 → L1 merge, triggered by L0 file count;
//! - manual full-range compaction, merging every resident file into one
//!   run at a caller-influenced target level.
//!
//! Inputs are supplied newest-first; the first occurrence of a key wins.
//! Tombstones survive a merge unless the output lands below all other
//! data, in which case nothing older can be shadowed and they are dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use kestrel_common::StoreError;

use crate::engine::EngineOptions;

use super::table::{table_file_name, TableMeta, TableReader, TableWriter};

/// Counters accumulated across merge runs.
#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub runs_completed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub files_consumed: u64,
    pub files_produced: u64,
}

/// Result of one merge run. `produced` is None when every surviving entry
/// was a dropped tombstone.
#[derive(Debug)]
pub struct MergeOutcome {
    pub consumed: Vec<TableMeta>,
    pub produced: Option<TableMeta>,
}

/// Executes merges and owns level-sizing arithmetic.
pub struct Compactor {
    dir: PathBuf,
    l1_target_bytes: u64,
    level_multiplier: u64,
    sync_writes: bool,
    runs: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    files_consumed: AtomicU64,
    files_produced: AtomicU64,
}

impl Compactor {
    pub fn new(dir: &Path, opts: &EngineOptions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            l1_target_bytes: opts.l1_target_bytes,
            level_multiplier: opts.level_multiplier.max(2),
            sync_writes: opts.sync_writes,
            runs: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            files_consumed: AtomicU64::new(0),
            files_produced: AtomicU64::new(0),
        }
    }

    /// Size budget for a level; level 0 is count-triggered, not sized.
    pub fn target_bytes(&self, level: usize) -> u64 {
        if level <= 1 {
            return self.l1_target_bytes;
        }
        self.l1_target_bytes
            .saturating_mul(self.level_multiplier.saturating_pow((level - 1) as u32))
    }

    /// Shallowest level (≥ 1, ≤ `max_level`) whose budget holds `bytes`.
    pub fn fit_level(&self, bytes: u64, max_level: usize) -> usize {
        for level in 1..=max_level {
            if bytes <= self.target_bytes(level) {
                return level;
            }
        }
        max_level
    }

    /// Merge `inputs` (newest first) into one table file at `target_level`.
    /// Consumed files are reported, not deleted — the manifest owner
    /// removes them after the level rewrite.
    pub fn merge(
        &self,
        inputs: &[TableMeta],
        target_level: usize,
        out_file_no: u64,
        drop_tombstones: bool,
    ) -> Result<MergeOutcome, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut bytes_read = 0u64;

        for meta in inputs {
            let reader = TableReader::open(&meta.path)?;
            for entry in reader.scan()? {
                // Newest-first input order: first write for a key wins.
                merged.entry(entry.key).or_insert(entry.value);
            }
            bytes_read += meta.file_size;
        }

        if drop_tombstones {
            merged.retain(|_, v| !v.is_empty());
        }

        let produced = if merged.is_empty() {
            None
        } else {
            let out_path = self.dir.join(table_file_name(target_level, out_file_no));
            let mut writer = TableWriter::create(&out_path, merged.len())
                .map_err(|e| StoreError::Compaction(e.to_string()))?;
            for (key, value) in &merged {
                let value = (!value.is_empty()).then_some(value.as_slice());
                writer
                    .add(key, value)
                    .map_err(|e| StoreError::Compaction(e.to_string()))?;
            }
            let mut meta = writer
                .finish(self.sync_writes)
                .map_err(|e| StoreError::Compaction(e.to_string()))?;
            meta.file_no = out_file_no;
            meta.level = target_level;
            self.bytes_written
                .fetch_add(meta.file_size, Ordering::Relaxed);
            Some(meta)
        };

        self.runs.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes_read, Ordering::Relaxed);
        self.files_consumed
            .fetch_add(inputs.len() as u64, Ordering::Relaxed);
        if produced.is_some() {
            self.files_produced.fetch_add(1, Ordering::Relaxed);
        }

        Ok(MergeOutcome {
            consumed: inputs.to_vec(),
            produced,
        })
    }

    /// Estimated count of schedulable compaction jobs given the current
    /// manifest. Independent of whether the scheduler is enabled.
    pub fn pending_estimate(&self, levels: &[Vec<TableMeta>], l0_trigger: usize) -> usize {
        let mut jobs = 0;
        if levels.first().map(Vec::len).unwrap_or(0) >= l0_trigger.max(1) {
            jobs += 1;
        }
        // Interior levels over budget also owe a merge; the bottom level
        // has nowhere deeper to push.
        for (level, files) in levels.iter().enumerate().skip(1) {
            if level + 1 == levels.len() {
                break;
            }
            let bytes: u64 = files.iter().map(|m| m.file_size).sum();
            if bytes > self.target_bytes(level) {
                jobs += 1;
            }
        }
        jobs
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            runs_completed: self.runs.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            files_consumed: self.files_consumed.load(Ordering::Relaxed),
            files_produced: self.files_produced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts() -> EngineOptions {
        EngineOptions {
            sync_writes: false,
            ..Default::default()
        }
    }

    fn write_table(
        dir: &Path,
        level: usize,
        file_no: u64,
        entries: &[(&[u8], Option<&[u8]>)],
    ) -> TableMeta {
        let path = dir.join(table_file_name(level, file_no));
        let mut w = TableWriter::create(&path, entries.len()).unwrap();
        for (k, v) in entries {
            w.add(k, *v).unwrap();
        }
        let mut meta = w.finish(false).unwrap();
        meta.level = level;
        meta.file_no = file_no;
        meta
    }

    #[test]
    fn test_merge_newest_wins() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());

        let newer = write_table(
            dir.path(),
            0,
            2,
            &[(b"aaa", Some(b"new")), (b"ccc", Some(b"3"))],
        );
        let older = write_table(
            dir.path(),
            0,
            1,
            &[(b"aaa", Some(b"old")), (b"bbb", Some(b"2"))],
        );

        let out = c.merge(&[newer, older], 1, 10, false).unwrap();
        assert_eq!(out.consumed.len(), 2);
        let produced = out.produced.unwrap();
        assert_eq!(produced.level, 1);

        let entries = TableReader::open(&produced.path).unwrap().scan().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, b"aaa");
        assert_eq!(entries[0].value, b"new");
        assert_eq!(entries[1].key, b"bbb");
        assert_eq!(entries[2].key, b"ccc");
    }

    #[test]
    fn test_merge_keeps_tombstones_when_asked() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());

        let t = write_table(dir.path(), 0, 1, &[(b"gone", None), (b"kept", Some(b"v"))]);
        let out = c.merge(&[t], 1, 10, false).unwrap();
        let entries = TableReader::open(&out.produced.unwrap().path)
            .unwrap()
            .scan()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].value.is_empty());
    }

    #[test]
    fn test_merge_drops_tombstones_at_bottom() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());

        let newer = write_table(dir.path(), 0, 2, &[(b"aaa", None)]);
        let older = write_table(dir.path(), 0, 1, &[(b"aaa", Some(b"v")), (b"bbb", Some(b"w"))]);

        let out = c.merge(&[newer, older], 6, 10, true).unwrap();
        let entries = TableReader::open(&out.produced.unwrap().path)
            .unwrap()
            .scan()
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, b"bbb");
    }

    #[test]
    fn test_merge_to_nothing() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());

        let t = write_table(dir.path(), 0, 1, &[(b"aaa", None)]);
        let out = c.merge(&[t], 6, 10, true).unwrap();
        assert!(out.produced.is_none());
        assert_eq!(out.consumed.len(), 1);
    }

    #[test]
    fn test_level_sizing() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());
        let l1 = c.target_bytes(1);
        assert_eq!(c.target_bytes(2), l1 * 10);
        assert_eq!(c.target_bytes(3), l1 * 100);

        assert_eq!(c.fit_level(1024, 6), 1);
        assert_eq!(c.fit_level(l1 + 1, 6), 2);
        assert_eq!(c.fit_level(u64::MAX, 6), 6);
    }

    #[test]
    fn test_pending_estimate() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());

        let mut levels: Vec<Vec<TableMeta>> = vec![Vec::new(); 7];
        assert_eq!(c.pending_estimate(&levels, 4), 0);

        for i in 0..4 {
            levels[0].push(write_table(
                dir.path(),
                0,
                i,
                &[(format!("k{i}").as_bytes(), Some(b"v"))],
            ));
        }
        assert_eq!(c.pending_estimate(&levels, 4), 1);
        assert_eq!(c.pending_estimate(&levels, 5), 0);
    }

    #[test]
    fn test_stats_accumulate() {
        let dir = TempDir::new().unwrap();
        let c = Compactor::new(dir.path(), &opts());
        let t = write_table(dir.path(), 0, 1, &[(b"k", Some(b"v"))]);
        c.merge(&[t], 1, 10, false).unwrap();

        let stats = c.stats();
        assert_eq!(stats.runs_completed, 1);
        assert!(stats.bytes_read > 0);
        assert!(stats.bytes_written > 0);
        assert_eq!(stats.files_consumed, 1);
        assert_eq!(stats.files_produced, 1);
    }
}
