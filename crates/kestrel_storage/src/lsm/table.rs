//! Sorted table files.
//!
//! Immutable, internally sorted key-value files — the unit the level
//! manifest tracks, the flush path produces, and bulk loaders hand to
//! ingest. Layout:
//!
//! ```text
//!   [Block 0] [Block 1] ... [Block N-1]
//!   [Index]     — per block: offset, length, first and last key
//!   [Filter]    — serialized key filter
//!   [Footer]    — fixed 40-byte trailer, CRC-checked
//! ```
//!
//! Each block is a run of `[key_len u32][val_len u32][key][value]` entries
//! followed by a CRC32 of the run. A zero-length value is a tombstone.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use kestrel_common::StoreError;

use super::filter::KeyFilter;

const TABLE_MAGIC: &[u8; 4] = b"KTB1";

/// Target uncompressed block size.
const TARGET_BLOCK_SIZE: usize = 4096;

/// magic(4) + index_off(8) + index_len(4) + filter_off(8) + filter_len(4)
/// + entry_count(8) + crc(4).
const FOOTER_SIZE: usize = 40;

/// In-memory record of one table file, tracked by the level manifest.
#[derive(Debug, Clone)]
pub struct TableMeta {
    /// Monotonic file number; orders level-0 files by recency and names
    /// the file on disk.
    pub file_no: u64,
    pub path: PathBuf,
    pub level: usize,
    pub min_key: Vec<u8>,
    pub max_key: Vec<u8>,
    pub entry_count: u64,
    pub file_size: u64,
}

impl TableMeta {
    /// Whether `key` falls inside this file's key range.
    pub fn covers(&self, key: &[u8]) -> bool {
        key >= self.min_key.as_slice() && key <= self.max_key.as_slice()
    }
}

/// On-disk name for a manifest-tracked table file.
pub fn table_file_name(level: usize, file_no: u64) -> String {
    format!("L{level}_{file_no:06}.tbl")
}

/// Inverse of [`table_file_name`]; None for foreign files.
pub fn parse_table_file_name(name: &str) -> Option<(usize, u64)> {
    let rest = name.strip_prefix('L')?.strip_suffix(".tbl")?;
    let (level, file_no) = rest.split_once('_')?;
    Some((level.parse().ok()?, file_no.parse().ok()?))
}

fn corrupt(path: &Path, detail: impl Into<String>) -> StoreError {
    StoreError::Corruption {
        path: path.to_path_buf(),
        detail: detail.into(),
    }
}

fn read_array<const N: usize>(data: &[u8], at: usize) -> Option<[u8; N]> {
    data.get(at..at + N)?.try_into().ok()
}

// ── Writer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct BlockHandle {
    offset: u64,
    len: u32,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
}

/// Streams sorted key-value pairs into a new table file.
///
/// Also the producer interface for externally built ingest files: bulk
/// loaders write with this and hand the finished paths to ingestion.
pub struct TableWriter {
    out: BufWriter<File>,
    path: PathBuf,
    filter: KeyFilter,
    blocks: Vec<BlockHandle>,
    block_buf: Vec<u8>,
    block_first_key: Option<Vec<u8>>,
    prev_key: Option<Vec<u8>>,
    offset: u64,
    entry_count: u64,
}

impl TableWriter {
    /// `expected_entries` sizes the key filter.
    pub fn create(path: &Path, expected_entries: usize) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            out: BufWriter::with_capacity(64 * 1024, file),
            path: path.to_path_buf(),
            filter: KeyFilter::with_capacity(expected_entries),
            blocks: Vec::new(),
            block_buf: Vec::with_capacity(TARGET_BLOCK_SIZE),
            block_first_key: None,
            prev_key: None,
            offset: 0,
            entry_count: 0,
        })
    }

    /// Append an entry; keys must arrive in strictly ascending order.
    /// `None` writes a tombstone.
    pub fn add(&mut self, key: &[u8], value: Option<&[u8]>) -> io::Result<()> {
        if let Some(prev) = &self.prev_key {
            if key <= prev.as_slice() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "table writer keys must be strictly ascending",
                ));
            }
        }
        self.prev_key = Some(key.to_vec());
        if self.block_first_key.is_none() {
            self.block_first_key = Some(key.to_vec());
        }
        self.filter.insert(key);

        let value = value.unwrap_or(b"");
        self.block_buf
            .extend_from_slice(&(key.len() as u32).to_le_bytes());
        self.block_buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.block_buf.extend_from_slice(key);
        self.block_buf.extend_from_slice(value);
        self.entry_count += 1;

        if self.block_buf.len() >= TARGET_BLOCK_SIZE {
            self.finish_block()?;
        }
        Ok(())
    }

    /// Write index, filter, and footer. With `sync`, fsync before returning.
    pub fn finish(mut self, sync: bool) -> io::Result<TableMeta> {
        self.finish_block()?;

        let index_off = self.offset;
        let index = self.encode_index();
        self.out.write_all(&index)?;
        self.offset += index.len() as u64;

        let filter_off = self.offset;
        let filter = self.filter.to_bytes();
        self.out.write_all(&filter)?;
        self.offset += filter.len() as u64;

        let mut footer = [0u8; FOOTER_SIZE];
        footer[0..4].copy_from_slice(TABLE_MAGIC);
        footer[4..12].copy_from_slice(&index_off.to_le_bytes());
        footer[12..16].copy_from_slice(&(index.len() as u32).to_le_bytes());
        footer[16..24].copy_from_slice(&filter_off.to_le_bytes());
        footer[24..28].copy_from_slice(&(filter.len() as u32).to_le_bytes());
        footer[28..36].copy_from_slice(&self.entry_count.to_le_bytes());
        let crc = crc32fast::hash(&footer[0..36]);
        footer[36..40].copy_from_slice(&crc.to_le_bytes());
        self.out.write_all(&footer)?;
        self.out.flush()?;
        if sync {
            self.out.get_ref().sync_all()?;
        }

        let min_key = self
            .blocks
            .first()
            .map(|b| b.first_key.clone())
            .unwrap_or_default();
        let max_key = self
            .blocks
            .last()
            .map(|b| b.last_key.clone())
            .unwrap_or_default();

        Ok(TableMeta {
            file_no: 0,
            path: self.path,
            level: 0,
            min_key,
            max_key,
            entry_count: self.entry_count,
            file_size: self.offset + FOOTER_SIZE as u64,
        })
    }

    fn finish_block(&mut self) -> io::Result<()> {
        if self.block_buf.is_empty() {
            return Ok(());
        }
        let crc = crc32fast::hash(&self.block_buf);
        self.out.write_all(&self.block_buf)?;
        self.out.write_all(&crc.to_le_bytes())?;

        let len = (self.block_buf.len() + 4) as u32;
        let first_key = self.block_first_key.take().unwrap_or_default();
        let last_key = self.prev_key.clone().unwrap_or_default();
        self.blocks.push(BlockHandle {
            offset: self.offset,
            len,
            first_key,
            last_key,
        });
        self.offset += u64::from(len);
        self.block_buf.clear();
        Ok(())
    }

    fn encode_index(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.blocks.len() as u32).to_le_bytes());
        for b in &self.blocks {
            buf.extend_from_slice(&b.offset.to_le_bytes());
            buf.extend_from_slice(&b.len.to_le_bytes());
            buf.extend_from_slice(&(b.first_key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&b.first_key);
            buf.extend_from_slice(&(b.last_key.len() as u32).to_le_bytes());
            buf.extend_from_slice(&b.last_key);
        }
        buf
    }
}

// ── Reader ──────────────────────────────────────────────────────────────

/// One decoded entry. An empty value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Point lookups and scans over one table file.
#[derive(Debug)]
pub struct TableReader {
    path: PathBuf,
    blocks: Vec<BlockHandle>,
    filter: KeyFilter,
    entry_count: u64,
    file_size: u64,
}

impl TableReader {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file_size = fs::metadata(path)?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(corrupt(path, "file too small for footer"));
        }

        let mut file = BufReader::new(File::open(path)?);
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        if &footer[0..4] != TABLE_MAGIC {
            return Err(corrupt(path, format!("bad magic {:?}", &footer[0..4])));
        }
        let stored_crc = u32::from_le_bytes(
            read_array::<4>(&footer, 36).ok_or_else(|| corrupt(path, "short footer"))?,
        );
        let computed_crc = crc32fast::hash(&footer[0..36]);
        if stored_crc != computed_crc {
            return Err(corrupt(
                path,
                format!("footer checksum {stored_crc:#010x} != {computed_crc:#010x}"),
            ));
        }

        let index_off = u64::from_le_bytes(read_array::<8>(&footer, 4).unwrap_or_default());
        let index_len = u32::from_le_bytes(read_array::<4>(&footer, 12).unwrap_or_default());
        let filter_off = u64::from_le_bytes(read_array::<8>(&footer, 16).unwrap_or_default());
        let filter_len = u32::from_le_bytes(read_array::<4>(&footer, 24).unwrap_or_default());
        let entry_count = u64::from_le_bytes(read_array::<8>(&footer, 28).unwrap_or_default());

        let data_end = file_size - FOOTER_SIZE as u64;
        if index_off + u64::from(index_len) > data_end
            || filter_off + u64::from(filter_len) > data_end
        {
            return Err(corrupt(path, "index or filter extends beyond file"));
        }

        file.seek(SeekFrom::Start(index_off))?;
        let mut index_buf = vec![0u8; index_len as usize];
        file.read_exact(&mut index_buf)?;
        let blocks = Self::decode_index(path, &index_buf)?;

        file.seek(SeekFrom::Start(filter_off))?;
        let mut filter_buf = vec![0u8; filter_len as usize];
        file.read_exact(&mut filter_buf)?;
        let filter = KeyFilter::from_bytes(&filter_buf)
            .ok_or_else(|| corrupt(path, "invalid filter encoding"))?;

        Ok(Self {
            path: path.to_path_buf(),
            blocks,
            filter,
            entry_count,
            file_size,
        })
    }

    /// Metadata for manifest tracking; `file_no` and `level` are assigned
    /// by whoever installs the file.
    pub fn meta(&self) -> TableMeta {
        TableMeta {
            file_no: 0,
            path: self.path.clone(),
            level: 0,
            min_key: self
                .blocks
                .first()
                .map(|b| b.first_key.clone())
                .unwrap_or_default(),
            max_key: self
                .blocks
                .last()
                .map(|b| b.last_key.clone())
                .unwrap_or_default(),
            entry_count: self.entry_count,
            file_size: self.file_size,
        }
    }

    /// Point lookup. `Some(value)` may be an empty vec — a tombstone;
    /// the engine layer interprets that.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if !self.filter.may_contain(key) {
            return Ok(None);
        }
        let idx = self
            .blocks
            .partition_point(|b| b.last_key.as_slice() < key);
        let Some(block) = self.blocks.get(idx) else {
            return Ok(None);
        };
        if key < block.first_key.as_slice() {
            return Ok(None);
        }
        let data = self.read_block(block)?;
        for entry in BlockEntries::new(&self.path, &data) {
            let entry = entry?;
            match entry.key.as_slice() {
                k if k == key => return Ok(Some(entry.value)),
                k if k > key => return Ok(None),
                _ => {}
            }
        }
        Ok(None)
    }

    /// All entries in key order.
    pub fn scan(&self) -> Result<Vec<TableEntry>, StoreError> {
        let mut out = Vec::with_capacity(self.entry_count as usize);
        for block in &self.blocks {
            let data = self.read_block(block)?;
            for entry in BlockEntries::new(&self.path, &data) {
                out.push(entry?);
            }
        }
        Ok(out)
    }

    /// Full-file validation for ingest candidates: every block decodes,
    /// every checksum holds, keys strictly ascend.
    pub fn verify(&self) -> Result<(), StoreError> {
        let mut prev: Option<Vec<u8>> = None;
        for block in &self.blocks {
            let data = self.read_block(block)?;
            for entry in BlockEntries::new(&self.path, &data) {
                let entry = entry?;
                if let Some(p) = &prev {
                    if entry.key <= *p {
                        return Err(corrupt(&self.path, "keys not strictly ascending"));
                    }
                }
                prev = Some(entry.key);
            }
        }
        Ok(())
    }

    fn read_block(&self, handle: &BlockHandle) -> Result<Vec<u8>, StoreError> {
        let mut file = BufReader::new(File::open(&self.path)?);
        file.seek(SeekFrom::Start(handle.offset))?;
        let mut buf = vec![0u8; handle.len as usize];
        file.read_exact(&mut buf)?;

        if buf.len() < 4 {
            return Err(corrupt(&self.path, "block shorter than its checksum"));
        }
        let data_len = buf.len() - 4;
        let stored_crc = u32::from_le_bytes(
            read_array::<4>(&buf, data_len).ok_or_else(|| corrupt(&self.path, "short block"))?,
        );
        let computed_crc = crc32fast::hash(&buf[..data_len]);
        if stored_crc != computed_crc {
            return Err(corrupt(
                &self.path,
                format!(
                    "block at {} checksum {stored_crc:#010x} != {computed_crc:#010x}",
                    handle.offset
                ),
            ));
        }
        buf.truncate(data_len);
        Ok(buf)
    }

    fn decode_index(path: &Path, data: &[u8]) -> Result<Vec<BlockHandle>, StoreError> {
        let count =
            u32::from_le_bytes(read_array::<4>(data, 0).ok_or_else(|| {
                corrupt(path, "index too short")
            })?) as usize;
        let mut pos = 4;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = u64::from_le_bytes(
                read_array::<8>(data, pos).ok_or_else(|| corrupt(path, "truncated index"))?,
            );
            let len = u32::from_le_bytes(
                read_array::<4>(data, pos + 8).ok_or_else(|| corrupt(path, "truncated index"))?,
            );
            pos += 12;
            let first_key = Self::decode_key(path, data, &mut pos)?;
            let last_key = Self::decode_key(path, data, &mut pos)?;
            blocks.push(BlockHandle {
                offset,
                len,
                first_key,
                last_key,
            });
        }
        Ok(blocks)
    }

    fn decode_key(path: &Path, data: &[u8], pos: &mut usize) -> Result<Vec<u8>, StoreError> {
        let len = u32::from_le_bytes(
            read_array::<4>(data, *pos).ok_or_else(|| corrupt(path, "truncated index key"))?,
        ) as usize;
        *pos += 4;
        let key = data
            .get(*pos..*pos + len)
            .ok_or_else(|| corrupt(path, "index key overflows index block"))?
            .to_vec();
        *pos += len;
        Ok(key)
    }
}

/// Iterator over the entries of one decoded block.
struct BlockEntries<'a> {
    path: &'a Path,
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockEntries<'a> {
    fn new(path: &'a Path, data: &'a [u8]) -> Self {
        Self { path, data, pos: 0 }
    }
}

impl Iterator for BlockEntries<'_> {
    type Item = Result<TableEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let Some(klen) = read_array::<4>(self.data, self.pos) else {
            return Some(Err(corrupt(self.path, "truncated entry header")));
        };
        let Some(vlen) = read_array::<4>(self.data, self.pos + 4) else {
            return Some(Err(corrupt(self.path, "truncated entry header")));
        };
        let klen = u32::from_le_bytes(klen) as usize;
        let vlen = u32::from_le_bytes(vlen) as usize;
        let start = self.pos + 8;
        let Some(key) = self.data.get(start..start + klen) else {
            return Some(Err(corrupt(self.path, "entry key overflows block")));
        };
        let Some(value) = self.data.get(start + klen..start + klen + vlen) else {
            return Some(Err(corrupt(self.path, "entry value overflows block")));
        };
        self.pos = start + klen + vlen;
        Some(Ok(TableEntry {
            key: key.to_vec(),
            value: value.to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_table(dir: &Path, name: &str, entries: &[(&[u8], &[u8])]) -> TableMeta {
        let path = dir.join(name);
        let mut w = TableWriter::create(&path, entries.len()).unwrap();
        for (k, v) in entries {
            w.add(k, Some(v)).unwrap();
        }
        w.finish(false).unwrap()
    }

    #[test]
    fn test_write_read_basic() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(
            dir.path(),
            "t.tbl",
            &[(b"aaa", b"1"), (b"bbb", b"2"), (b"ccc", b"3")],
        );
        assert_eq!(meta.entry_count, 3);
        assert_eq!(meta.min_key, b"aaa");
        assert_eq!(meta.max_key, b"ccc");

        let r = TableReader::open(&meta.path).unwrap();
        assert_eq!(r.get(b"aaa").unwrap(), Some(b"1".to_vec()));
        assert_eq!(r.get(b"ccc").unwrap(), Some(b"3".to_vec()));
        assert_eq!(r.get(b"zzz").unwrap(), None);
        assert_eq!(r.get(b"a").unwrap(), None);
    }

    #[test]
    fn test_rejects_unsorted_writes() {
        let dir = TempDir::new().unwrap();
        let mut w = TableWriter::create(&dir.path().join("t.tbl"), 4).unwrap();
        w.add(b"bbb", Some(b"1")).unwrap();
        assert!(w.add(b"aaa", Some(b"2")).is_err());
        assert!(w.add(b"bbb", Some(b"dup")).is_err());
    }

    #[test]
    fn test_tombstone_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.tbl");
        let mut w = TableWriter::create(&path, 2).unwrap();
        w.add(b"dead", None).unwrap();
        w.add(b"live", Some(b"v")).unwrap();
        w.finish(false).unwrap();

        let r = TableReader::open(&path).unwrap();
        assert_eq!(r.get(b"dead").unwrap(), Some(Vec::new()));
        assert_eq!(r.get(b"live").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_scan_in_order() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(dir.path(), "t.tbl", &[(b"k1", b"v1"), (b"k2", b"v2")]);
        let r = TableReader::open(&meta.path).unwrap();
        let entries = r.scan().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, b"k1");
        assert_eq!(entries[1].value, b"v2");
    }

    #[test]
    fn test_many_entries_multiple_blocks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.tbl");
        let n = 5_000;
        let mut w = TableWriter::create(&path, n).unwrap();
        for i in 0..n {
            let k = format!("key_{i:08}");
            let v = format!("val_{i:08}");
            w.add(k.as_bytes(), Some(v.as_bytes())).unwrap();
        }
        let meta = w.finish(false).unwrap();
        assert_eq!(meta.entry_count, n as u64);

        let r = TableReader::open(&path).unwrap();
        assert_eq!(r.get(b"key_00000000").unwrap(), Some(b"val_00000000".to_vec()));
        assert_eq!(r.get(b"key_00002500").unwrap(), Some(b"val_00002500".to_vec()));
        assert_eq!(r.get(b"key_00004999").unwrap(), Some(b"val_00004999".to_vec()));
        assert_eq!(r.get(b"key_00005000").unwrap(), None);
        r.verify().unwrap();
    }

    #[test]
    fn test_empty_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.tbl");
        let w = TableWriter::create(&path, 0).unwrap();
        let meta = w.finish(false).unwrap();
        assert_eq!(meta.entry_count, 0);

        let r = TableReader::open(&path).unwrap();
        assert_eq!(r.get(b"any").unwrap(), None);
        assert!(r.scan().unwrap().is_empty());
    }

    #[test]
    fn test_footer_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(dir.path(), "t.tbl", &[(b"k", b"v")]);

        let mut data = fs::read(&meta.path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&meta.path, &data).unwrap();

        let err = TableReader::open(&meta.path).unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }), "{err}");
    }

    #[test]
    fn test_block_corruption_detected() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(dir.path(), "t.tbl", &[(b"aaa", b"xxx"), (b"bbb", b"yyy")]);

        // Flip a byte inside the first data block; footer stays intact.
        let mut data = fs::read(&meta.path).unwrap();
        data[10] ^= 0xFF;
        fs::write(&meta.path, &data).unwrap();

        let r = TableReader::open(&meta.path).unwrap();
        assert!(r.verify().is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.tbl");
        fs::write(&path, b"nope").unwrap();
        let err = TableReader::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));
    }

    #[test]
    fn test_file_name_round_trip() {
        assert_eq!(table_file_name(0, 7), "L0_000007.tbl");
        assert_eq!(parse_table_file_name("L0_000007.tbl"), Some((0, 7)));
        assert_eq!(parse_table_file_name("L6_123456.tbl"), Some((6, 123456)));
        assert_eq!(parse_table_file_name("MANIFEST"), None);
        assert_eq!(parse_table_file_name("L6.tbl"), None);
        assert_eq!(parse_table_file_name("Lx_1.tbl"), None);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let meta = write_table(dir.path(), "t.tbl", &[(b"k", b"v")]);

        let mut data = fs::read(&meta.path).unwrap();
        let footer_start = data.len() - FOOTER_SIZE;
        data[footer_start..footer_start + 4].copy_from_slice(b"XXXX");
        fs::write(&meta.path, &data).unwrap();

        assert!(TableReader::open(&meta.path).is_err());
    }
}
