//! Immutable sorted table files.
//!
//! A table holds records in ascending key order, packed into compressed
//! blocks with a sparse index and an optional bloom filter:
//!
//! ```text
//! [data block]*
//! [filter block]                         (bloom, uncompressed, optional)
//! [index block]                          (uncompressed)
//! [footer: fixed 39 bytes]
//! ```
//!
//! Each data block is `[raw_len u32][disk_len u32][crc32 u32][payload]`,
//! the payload compressed with the table's codec. Decompressed, a block is
//! a run of records `[key_len u32][val_len u32][seq u64][flag u8][key]
//! [value]`. The index stores each block's last key, offset, and on-disk
//! length; the footer pins down the sections and the codec.

use crate::blob::BlobRef;
use crate::bloom::BloomFilter;
use crate::tuning::CompressionKind;
use basalt_core::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Decompressed target size of one data block.
pub const BLOCK_TARGET_BYTES: usize = 4 * 1024;

const TABLE_MAGIC: u32 = 0x5442_534C; // "LSBT"
const FOOTER_BYTES: u64 = 8 + 8 + 8 + 8 + 1 + 1 + 1 + 4;

const FLAG_VALUE: u8 = 0;
const FLAG_TOMBSTONE: u8 = 1;
const FLAG_BLOB_REF: u8 = 2;

/// Bloom coverage bits stored in the footer.
const BLOOM_WHOLE_KEY: u8 = 0b01;
const BLOOM_PREFIX: u8 = 0b10;

/// What a record resolves to before blob indirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValue {
    Value(Vec<u8>),
    Tombstone,
    BlobRef(BlobRef),
}

/// One record streamed out of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRecord {
    pub key: Vec<u8>,
    pub seq: u64,
    pub value: RecordValue,
}

/// File name for table `number`.
pub fn table_file_name(number: u64) -> String {
    format!("{:06}.sst", number)
}

/// Bloom configuration a writer builds the filter with.
#[derive(Debug, Clone, Copy)]
pub struct BloomConfig {
    pub whole_key: bool,
    /// Also index the fixed-length key prefix of this many bytes.
    pub prefix_len: Option<usize>,
}

impl BloomConfig {
    fn mode_bits(&self) -> u8 {
        let mut bits = 0;
        if self.whole_key {
            bits |= BLOOM_WHOLE_KEY;
        }
        if self.prefix_len.is_some() {
            bits |= BLOOM_PREFIX;
        }
        bits
    }

    fn enabled(&self) -> bool {
        self.mode_bits() != 0
    }
}

struct IndexEntry {
    last_key: Vec<u8>,
    offset: u64,
    disk_len: u32,
}

/// Streams sorted records into a new table file.
pub struct TableWriter {
    file: File,
    path: PathBuf,
    codec: CompressionKind,
    bloom_config: BloomConfig,
    bloom: BloomFilter,
    block: Vec<u8>,
    block_last_key: Vec<u8>,
    index: Vec<IndexEntry>,
    offset: u64,
    records: usize,
}

impl TableWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        codec: CompressionKind,
        bloom_config: BloomConfig,
        expected_records: usize,
    ) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        Ok(TableWriter {
            file,
            path,
            codec,
            bloom_config,
            bloom: BloomFilter::new(expected_records.max(16) * 2, 0.01),
            block: Vec::with_capacity(BLOCK_TARGET_BYTES),
            block_last_key: Vec::new(),
            index: Vec::new(),
            offset: 0,
            records: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Keys must arrive in strictly ascending order.
    pub fn add(&mut self, key: &[u8], seq: u64, value: &RecordValue) -> Result<()> {
        if !self.block_last_key.is_empty() && key <= self.block_last_key.as_slice() {
            return Err(Error::InvalidArgument(format!(
                "table keys out of order: {:?} after {:?}",
                key, self.block_last_key
            )));
        }

        let (flag, val_bytes): (u8, std::borrow::Cow<'_, [u8]>) = match value {
            RecordValue::Value(v) => (FLAG_VALUE, std::borrow::Cow::Borrowed(v.as_slice())),
            RecordValue::Tombstone => (FLAG_TOMBSTONE, std::borrow::Cow::Borrowed(&[][..])),
            RecordValue::BlobRef(r) => (FLAG_BLOB_REF, std::borrow::Cow::Owned(r.encode())),
        };

        self.block.write_u32::<LittleEndian>(key.len() as u32)?;
        self.block
            .write_u32::<LittleEndian>(val_bytes.len() as u32)?;
        self.block.write_u64::<LittleEndian>(seq)?;
        self.block.write_u8(flag)?;
        self.block.extend_from_slice(key);
        self.block.extend_from_slice(&val_bytes);

        if self.bloom_config.whole_key {
            self.bloom.insert(key);
        }
        if let Some(plen) = self.bloom_config.prefix_len {
            if key.len() >= plen {
                self.bloom.insert(&key[..plen]);
            }
        }

        self.block_last_key.clear();
        self.block_last_key.extend_from_slice(key);
        self.records += 1;

        if self.block.len() >= BLOCK_TARGET_BYTES {
            self.finish_block()?;
        }
        Ok(())
    }

    fn finish_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let raw_len = self.block.len() as u32;
        let payload = compress(self.codec, &self.block)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut head = Vec::with_capacity(12);
        head.write_u32::<LittleEndian>(raw_len)?;
        head.write_u32::<LittleEndian>(payload.len() as u32)?;
        head.write_u32::<LittleEndian>(crc)?;
        self.file.write_all(&head)?;
        self.file.write_all(&payload)?;

        // The ordering check needs the last key across block boundaries,
        // so the index entry takes a copy.
        self.index.push(IndexEntry {
            last_key: self.block_last_key.clone(),
            offset: self.offset,
            disk_len: 12 + payload.len() as u32,
        });
        self.offset += 12 + payload.len() as u64;
        self.block.clear();
        Ok(())
    }

    /// Seals the file: remaining block, filter, index, footer, fsync.
    /// Returns the number of records written.
    pub fn finish(mut self) -> Result<usize> {
        self.finish_block()?;

        let filter_off = self.offset;
        let mut filter_len = 0u64;
        if self.bloom_config.enabled() {
            let mut buf = Vec::new();
            self.bloom.encode(&mut buf);
            self.file.write_all(&buf)?;
            filter_len = buf.len() as u64;
            self.offset += filter_len;
        }

        let index_off = self.offset;
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.index.len() as u32)?;
        for entry in &self.index {
            buf.write_u32::<LittleEndian>(entry.last_key.len() as u32)?;
            buf.extend_from_slice(&entry.last_key);
            buf.write_u64::<LittleEndian>(entry.offset)?;
            buf.write_u32::<LittleEndian>(entry.disk_len)?;
        }
        let index_len = buf.len() as u64;
        self.file.write_all(&buf)?;

        let mut footer = Vec::with_capacity(FOOTER_BYTES as usize);
        footer.write_u64::<LittleEndian>(filter_off)?;
        footer.write_u64::<LittleEndian>(filter_len)?;
        footer.write_u64::<LittleEndian>(index_off)?;
        footer.write_u64::<LittleEndian>(index_len)?;
        footer.write_u8(self.codec.tag())?;
        footer.write_u8(self.bloom_config.mode_bits())?;
        footer.write_u8(self.bloom_config.prefix_len.unwrap_or(0) as u8)?;
        footer.write_u32::<LittleEndian>(TABLE_MAGIC)?;
        self.file.write_all(&footer)?;

        self.file.sync_all()?;
        Ok(self.records)
    }
}

/// Shared cache of decompressed data blocks, keyed by `(table, offset)`.
pub struct BlockCache {
    shards: Vec<Mutex<LruCache<(u64, u64), Arc<Vec<u8>>>>>,
}

impl BlockCache {
    pub fn new(budget_bytes: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        // The budget is approximated in block-sized entries per shard.
        let per_shard = (budget_bytes / BLOCK_TARGET_BYTES / shards).max(8);
        BlockCache {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(LruCache::new(
                        NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN),
                    ))
                })
                .collect(),
        }
    }

    fn shard(&self, table: u64, offset: u64) -> &Mutex<LruCache<(u64, u64), Arc<Vec<u8>>>> {
        let mix = table
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add(offset);
        &self.shards[(mix % self.shards.len() as u64) as usize]
    }

    fn get(&self, table: u64, offset: u64) -> Option<Arc<Vec<u8>>> {
        self.shard(table, offset).lock().get(&(table, offset)).cloned()
    }

    fn put(&self, table: u64, offset: u64, block: Arc<Vec<u8>>) {
        self.shard(table, offset).lock().put((table, offset), block);
    }

    /// Drops every cached block of one table; called when the file is
    /// deleted after compaction.
    pub fn evict_table(&self, table: u64) {
        for shard in &self.shards {
            let mut guard = shard.lock();
            let doomed: Vec<(u64, u64)> = guard
                .iter()
                .filter(|((t, _), _)| *t == table)
                .map(|(k, _)| *k)
                .collect();
            for key in doomed {
                guard.pop(&key);
            }
        }
    }
}

/// Read handle over one sealed table.
pub struct TableReader {
    file: File,
    path: PathBuf,
    number: u64,
    codec: CompressionKind,
    bloom: Option<BloomFilter>,
    bloom_mode: u8,
    bloom_prefix_len: usize,
    index: Vec<IndexEntry>,
    cache: Arc<BlockCache>,
}

impl TableReader {
    pub fn open(path: impl Into<PathBuf>, number: u64, cache: Arc<BlockCache>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size < FOOTER_BYTES {
            return Err(Error::Corruption(format!(
                "table {} too small for a footer",
                path.display()
            )));
        }

        let mut footer = vec![0u8; FOOTER_BYTES as usize];
        file.read_exact_at(&mut footer, size - FOOTER_BYTES)?;
        let mut rdr: &[u8] = &footer;
        let filter_off = rdr.read_u64::<LittleEndian>()?;
        let filter_len = rdr.read_u64::<LittleEndian>()?;
        let index_off = rdr.read_u64::<LittleEndian>()?;
        let index_len = rdr.read_u64::<LittleEndian>()?;
        let codec_tag = rdr.read_u8()?;
        let bloom_mode = rdr.read_u8()?;
        let bloom_prefix_len = rdr.read_u8()? as usize;
        let magic = rdr.read_u32::<LittleEndian>()?;
        if magic != TABLE_MAGIC {
            return Err(Error::Corruption(format!(
                "bad table magic {magic:#x} in {}",
                path.display()
            )));
        }
        let codec = CompressionKind::from_tag(codec_tag).ok_or_else(|| {
            Error::Corruption(format!("unknown codec tag {codec_tag} in {}", path.display()))
        })?;

        let bloom = if bloom_mode != 0 && filter_len > 0 {
            let mut buf = vec![0u8; filter_len as usize];
            file.read_exact_at(&mut buf, filter_off)?;
            BloomFilter::decode(&buf)
        } else {
            None
        };

        let mut buf = vec![0u8; index_len as usize];
        file.read_exact_at(&mut buf, index_off)?;
        let mut rdr: &[u8] = &buf;
        let count = rdr.read_u32::<LittleEndian>()? as usize;
        let mut index = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = rdr.read_u32::<LittleEndian>()? as usize;
            if key_len > rdr.len() {
                return Err(Error::Corruption("table index key overruns block".into()));
            }
            let mut last_key = vec![0u8; key_len];
            std::io::Read::read_exact(&mut rdr, &mut last_key)?;
            let offset = rdr.read_u64::<LittleEndian>()?;
            let disk_len = rdr.read_u32::<LittleEndian>()?;
            index.push(IndexEntry {
                last_key,
                offset,
                disk_len,
            });
        }

        Ok(TableReader {
            file,
            path,
            number,
            codec,
            bloom,
            bloom_mode,
            bloom_prefix_len,
            index,
            cache,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Whether a point lookup can skip this table outright.
    fn bloom_rejects(&self, key: &[u8]) -> bool {
        let Some(bloom) = &self.bloom else {
            return false;
        };
        if self.bloom_mode & BLOOM_WHOLE_KEY != 0 {
            return !bloom.may_contain(key);
        }
        if self.bloom_mode & BLOOM_PREFIX != 0 && key.len() >= self.bloom_prefix_len {
            return !bloom.may_contain(&key[..self.bloom_prefix_len]);
        }
        false
    }

    /// Point lookup. Tombstones come back as records so callers can stop
    /// the search.
    pub fn get(&self, key: &[u8]) -> Result<Option<TableRecord>> {
        if self.bloom_rejects(key) {
            return Ok(None);
        }
        // First block whose last key is >= the target.
        let idx = self
            .index
            .partition_point(|e| e.last_key.as_slice() < key);
        let Some(entry) = self.index.get(idx) else {
            return Ok(None);
        };
        let block = self.load_block(entry)?;
        for record in parse_block(&block)? {
            match record.key.as_slice().cmp(key) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => return Ok(Some(record)),
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(None)
    }

    /// Streaming scan over `[start, end)`. An empty `end` means "to the
    /// end of the table".
    pub fn iter_range(self: &Arc<Self>, start: &[u8], end: &[u8]) -> TableIter {
        let first_block = self
            .index
            .partition_point(|e| e.last_key.as_slice() < start);
        TableIter {
            table: Arc::clone(self),
            block_idx: first_block,
            records: Vec::new().into_iter(),
            start: start.to_vec(),
            end: end.to_vec(),
            done: false,
        }
    }

    fn load_block(&self, entry: &IndexEntry) -> Result<Arc<Vec<u8>>> {
        if let Some(block) = self.cache.get(self.number, entry.offset) {
            return Ok(block);
        }
        let mut disk = vec![0u8; entry.disk_len as usize];
        self.file.read_exact_at(&mut disk, entry.offset)?;
        let mut rdr: &[u8] = &disk;
        let raw_len = rdr.read_u32::<LittleEndian>()? as usize;
        let comp_len = rdr.read_u32::<LittleEndian>()? as usize;
        let crc = rdr.read_u32::<LittleEndian>()?;
        if comp_len != rdr.len() {
            return Err(Error::Corruption(format!(
                "block length mismatch in {}",
                self.path.display()
            )));
        }
        let mut hasher = Crc32::new();
        hasher.update(rdr);
        if hasher.finalize() != crc {
            return Err(Error::Corruption(format!(
                "block crc mismatch in {}",
                self.path.display()
            )));
        }
        let raw = decompress(self.codec, rdr, raw_len)?;
        let block = Arc::new(raw);
        self.cache.put(self.number, entry.offset, Arc::clone(&block));
        Ok(block)
    }
}

/// Streaming record iterator over one table.
pub struct TableIter {
    table: Arc<TableReader>,
    block_idx: usize,
    records: std::vec::IntoIter<TableRecord>,
    start: Vec<u8>,
    end: Vec<u8>,
    done: bool,
}

impl Iterator for TableIter {
    type Item = Result<TableRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }
            if let Some(record) = self.records.next() {
                if record.key.as_slice() < self.start.as_slice() {
                    continue;
                }
                if !self.end.is_empty() && record.key.as_slice() >= self.end.as_slice() {
                    self.done = true;
                    return None;
                }
                return Some(Ok(record));
            }
            let Some(entry) = self.table.index.get(self.block_idx) else {
                self.done = true;
                return None;
            };
            // A block past the range end cannot hold more matches.
            if !self.end.is_empty() && self.block_idx > 0 {
                if let Some(prev) = self.table.index.get(self.block_idx - 1) {
                    if prev.last_key.as_slice() >= self.end.as_slice() {
                        self.done = true;
                        return None;
                    }
                }
            }
            self.block_idx += 1;
            let block = match self.table.load_block(entry) {
                Ok(b) => b,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            match parse_block(&block) {
                Ok(records) => self.records = records.into_iter(),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn parse_block(block: &[u8]) -> Result<Vec<TableRecord>> {
    let mut records = Vec::new();
    let mut rdr: &[u8] = block;
    while !rdr.is_empty() {
        let key_len = rdr.read_u32::<LittleEndian>()? as usize;
        let val_len = rdr.read_u32::<LittleEndian>()? as usize;
        let seq = rdr.read_u64::<LittleEndian>()?;
        let flag = rdr.read_u8()?;
        if key_len + val_len > rdr.len() {
            return Err(Error::Corruption("table record overruns block".into()));
        }
        let key = rdr[..key_len].to_vec();
        let val = rdr[key_len..key_len + val_len].to_vec();
        rdr = &rdr[key_len + val_len..];
        let value = match flag {
            FLAG_VALUE => RecordValue::Value(val),
            FLAG_TOMBSTONE => RecordValue::Tombstone,
            FLAG_BLOB_REF => RecordValue::BlobRef(BlobRef::decode(&val)?),
            other => {
                return Err(Error::Corruption(format!(
                    "unknown table record flag {other}"
                )))
            }
        };
        records.push(TableRecord { key, seq, value });
    }
    Ok(records)
}

pub(crate) fn compress(codec: CompressionKind, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        CompressionKind::None | CompressionKind::Disable => Ok(data.to_vec()),
        CompressionKind::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Corruption(format!("snappy compression failed: {e}"))),
        CompressionKind::Zstd => zstd::bulk::compress(data, 3).map_err(Error::Io),
        other => Err(Error::InvalidArgument(format!(
            "compression codec {other:?} not compiled in"
        ))),
    }
}

pub(crate) fn decompress(codec: CompressionKind, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
    let raw = match codec {
        CompressionKind::None | CompressionKind::Disable => data.to_vec(),
        CompressionKind::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::Corruption(format!("snappy decompression failed: {e}")))?,
        CompressionKind::Zstd => zstd::bulk::decompress(data, raw_len).map_err(Error::Io)?,
        other => {
            return Err(Error::InvalidArgument(format!(
                "compression codec {other:?} not compiled in"
            )))
        }
    };
    if raw.len() != raw_len {
        return Err(Error::Corruption(format!(
            "decompressed block length {} does not match header {}",
            raw.len(),
            raw_len
        )));
    }
    Ok(raw)
}
