//! Sorted in-memory write buffer.
//!
//! All writes land in the active memtable. When it exceeds its byte budget
//! the engine freezes it, swaps in a fresh one, and flushes the frozen
//! buffer to a level-0 table file. A write that races the freeze is
//! rejected and retried by the engine against the new active memtable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Sorted write buffer. `None` values are tombstones.
pub struct MemTable {
    entries: RwLock<BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
    frozen: AtomicBool,
    approx_bytes: AtomicU64,
}

impl MemTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            frozen: AtomicBool::new(false),
            approx_bytes: AtomicU64::new(0),
        }
    }

    /// Record a write. Returns false if this memtable was frozen first, in
    /// which case the caller retries against the new active memtable.
    pub fn write(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> bool {
        let mut entries = self.entries.write();
        // Re-check under the map lock: freeze() takes the same lock, so a
        // frozen memtable can never gain entries after its flush snapshot.
        if self.frozen.load(Ordering::Acquire) {
            return false;
        }

        let key_len = key.len();
        let new_val_len = value.as_ref().map(Vec::len).unwrap_or(0);
        if let Some(old) = entries.insert(key, value) {
            // Replacement: the key is already accounted for.
            let old_val_len = old.map(|v| v.len()).unwrap_or(0);
            self.approx_bytes
                .fetch_sub(old_val_len as u64, Ordering::Relaxed);
            self.approx_bytes
                .fetch_add(new_val_len as u64, Ordering::Relaxed);
        } else {
            self.approx_bytes
                .fetch_add((key_len + new_val_len) as u64, Ordering::Relaxed);
        }
        true
    }

    /// Point lookup. `Some(None)` is a tombstone; `None` means not present.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.entries.read().get(key).cloned()
    }

    /// Make this memtable immutable. Writes racing the freeze fail and are
    /// retried by the engine.
    pub fn freeze(&self) {
        let _entries = self.entries.write();
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn approx_bytes(&self) -> u64 {
        self.approx_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of all entries in key order, for flushing to a table file.
    pub fn snapshot_sorted(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_get() {
        let mt = MemTable::new();
        assert!(mt.write(b"k1".to_vec(), Some(b"v1".to_vec())));
        assert!(mt.write(b"k2".to_vec(), Some(b"v2".to_vec())));

        assert_eq!(mt.get(b"k1"), Some(Some(b"v1".to_vec())));
        assert_eq!(mt.get(b"k2"), Some(Some(b"v2".to_vec())));
        assert_eq!(mt.get(b"k3"), None);
        assert_eq!(mt.len(), 2);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let mt = MemTable::new();
        mt.write(b"k".to_vec(), Some(b"old".to_vec()));
        mt.write(b"k".to_vec(), Some(b"new".to_vec()));

        assert_eq!(mt.get(b"k"), Some(Some(b"new".to_vec())));
        assert_eq!(mt.len(), 1);
    }

    #[test]
    fn test_tombstone() {
        let mt = MemTable::new();
        mt.write(b"k".to_vec(), Some(b"v".to_vec()));
        mt.write(b"k".to_vec(), None);

        assert_eq!(mt.get(b"k"), Some(None));
    }

    #[test]
    fn test_freeze_rejects_writes() {
        let mt = MemTable::new();
        mt.write(b"k".to_vec(), Some(b"v".to_vec()));
        mt.freeze();

        assert!(mt.is_frozen());
        assert!(!mt.write(b"k2".to_vec(), Some(b"v2".to_vec())));
        // Reads still served.
        assert_eq!(mt.get(b"k"), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn test_snapshot_sorted_order() {
        let mt = MemTable::new();
        mt.write(b"ccc".to_vec(), Some(b"3".to_vec()));
        mt.write(b"aaa".to_vec(), Some(b"1".to_vec()));
        mt.write(b"bbb".to_vec(), None);

        let snap = mt.snapshot_sorted();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].0, b"aaa");
        assert_eq!(snap[1], (b"bbb".to_vec(), None));
        assert_eq!(snap[2].0, b"ccc");
    }

    #[test]
    fn test_approx_bytes_tracks_writes() {
        let mt = MemTable::new();
        assert_eq!(mt.approx_bytes(), 0);
        mt.write(b"key".to_vec(), Some(b"value".to_vec()));
        assert_eq!(mt.approx_bytes(), 8);

        // Replacement adjusts by the value delta only.
        mt.write(b"key".to_vec(), Some(b"v".to_vec()));
        assert_eq!(mt.approx_bytes(), 4);
        mt.write(b"key".to_vec(), None);
        assert_eq!(mt.approx_bytes(), 3);
    }
}
