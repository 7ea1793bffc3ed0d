//! The engine proper: trait contract and the log-structured
//! implementation.
//!
//! Write path: journal append (unless disabled), then the memtable; past
//! the write buffer budget the memtable flushes into a level-0 table and
//! the journal starts over. Enough level-0 tables trigger a compaction
//! that folds every table into one bottom-level file.
//!
//! Read path: row cache, memtable, then tables newest to oldest behind
//! their bloom filters. Scans merge the memtable with every table and
//! resolve separated values through the blob store.

use crate::blob::BlobStore;
use crate::compaction::{merge_sorted, CompactionGate, RateLimiter};
use crate::journal::{self, BatchOp, JournalWriter};
use crate::listener::{
    BackgroundErrorReason, CompactionInfo, EventListener, FlushInfo, StallState,
};
use crate::memtable::Memtable;
use crate::table::{
    table_file_name, BlockCache, BloomConfig, RecordValue, TableIter, TableReader, TableRecord,
    TableWriter,
};
use crate::tuning::EngineTuning;
use basalt_core::key::PART_PREFIX_LEN;
use basalt_core::{Error, Result};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Level-0 table count that triggers a compaction.
const L0_COMPACTION_TRIGGER: usize = 4;
/// Level-0 table counts at which the write path reports pressure.
const L0_DELAY_TRIGGER: usize = 8;
const L0_STOP_TRIGGER: usize = 12;

const MANIFEST_NAME: &str = "MANIFEST";
const JOURNAL_NAME: &str = "journal.log";

/// The contract the partition layer programs against.
pub trait StorageEngine: Send + Sync {
    /// Data path this engine owns.
    fn path(&self) -> &Path;
    /// Point lookup; absence is `None`, not an error.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    /// Single-key write.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;
    /// Atomic batch write: either all entries become durable or none.
    fn multi_put(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;
    /// Single-key delete.
    fn remove(&self, key: &[u8]) -> Result<()>;
    /// Atomic batch delete.
    fn multi_remove(&self, keys: Vec<Vec<u8>>) -> Result<()>;
    /// Sorted scan over `[start, end)`.
    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<EngineIter>;
    /// Sorted scan over every key beginning with `prefix`.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<EngineIter>;
    /// Folds tables together; the bounds are advisory hints.
    fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<()>;
    /// Forces the write buffer into a table file.
    fn flush(&self) -> Result<()>;
}

/// Point-in-time counters.
#[derive(Debug, Default, Clone)]
pub struct EngineStats {
    pub gets: u64,
    pub writes: u64,
    pub flushes: u64,
    pub compactions: u64,
}

#[derive(Default)]
struct StatCounters {
    gets: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

/// Sharded LRU over point lookups.
struct RowCache {
    shards: Vec<Mutex<LruCache<Vec<u8>, Vec<u8>>>>,
}

impl RowCache {
    fn new(entries: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let per_shard = (entries / shards).max(16);
        RowCache {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(LruCache::new(
                        NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN),
                    ))
                })
                .collect(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Mutex<LruCache<Vec<u8>, Vec<u8>>> {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for &b in key {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shard(key).lock().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        self.shard(key).lock().put(key.to_vec(), value.to_vec());
    }

    fn invalidate(&self, key: &[u8]) {
        self.shard(key).lock().pop(key);
    }
}

struct Inner {
    mem: Memtable,
    journal: Option<JournalWriter>,
    seq: u64,
    /// `levels[0]`: flush outputs, newest first, possibly overlapping.
    /// `levels[1]`: the compacted bottom, at most one table.
    levels: [Vec<Arc<TableReader>>; 2],
    next_table_no: u64,
    stall: StallState,
}

/// The log-structured engine on one data path.
pub struct LsmEngine {
    path: PathBuf,
    tuning: EngineTuning,
    listener: Arc<dyn EventListener>,
    cache: Arc<BlockCache>,
    row_cache: Option<RowCache>,
    blobs: Option<Arc<BlobStore>>,
    gate: CompactionGate,
    stats: StatCounters,
    inner: Mutex<Inner>,
}

impl LsmEngine {
    /// Opens the engine under `path`, creating the directory tree when
    /// missing and recovering the write buffer from the journal.
    pub fn open(
        path: impl Into<PathBuf>,
        tuning: EngineTuning,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        tuning.validate()?;
        let path = path.into();
        std::fs::create_dir_all(&path)?;

        let cache = Arc::new(BlockCache::new(
            tuning.block_cache_bytes,
            tuning.cache_shards,
        ));
        let row_cache = (tuning.row_cache_entries > 0)
            .then(|| RowCache::new(tuning.row_cache_entries, tuning.cache_shards));

        let blob_dir = path.join("blob");
        let blobs = if tuning.enable_kv_separation || blob_dir.is_dir() {
            Some(Arc::new(BlobStore::open(&blob_dir, tuning.blob_compression)?))
        } else {
            None
        };

        let manifest = Manifest::load(&path.join(MANIFEST_NAME))?;
        let mut levels: [Vec<Arc<TableReader>>; 2] = [Vec::new(), Vec::new()];
        for (level, numbers) in [&manifest.l0, &manifest.l1].into_iter().enumerate() {
            for &no in numbers {
                let reader = TableReader::open(
                    path.join(table_file_name(no)),
                    no,
                    Arc::clone(&cache),
                )?;
                levels[level].push(Arc::new(reader));
            }
        }

        let journal_path = tuning
            .wal_dir
            .clone()
            .unwrap_or_else(|| path.clone())
            .join(JOURNAL_NAME);
        let mut mem = Memtable::new();
        let replayed_seq = journal::replay(&journal_path, |seq, ops| {
            for op in ops {
                match op {
                    BatchOp::Put(k, v) => mem.put(k, v, seq),
                    BatchOp::Delete(k) => mem.delete(k, seq),
                }
            }
        })?;
        if !mem.is_empty() {
            info!(
                target: "basalt::engine",
                path = %path.display(),
                entries = mem.len(),
                "recovered write buffer from journal"
            );
        }
        let journal = if tuning.disable_wal {
            None
        } else {
            Some(JournalWriter::open(&journal_path, tuning.wal_sync)?)
        };

        Ok(LsmEngine {
            gate: CompactionGate::new(tuning.compaction_thread_limit),
            inner: Mutex::new(Inner {
                mem,
                journal,
                seq: manifest.last_seq.max(replayed_seq),
                levels,
                next_table_no: manifest.next_table_no,
                stall: StallState::Normal,
            }),
            path,
            tuning,
            listener,
            cache,
            row_cache,
            blobs,
            stats: StatCounters::default(),
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            gets: self.stats.gets.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            compactions: self.stats.compactions.load(Ordering::Relaxed),
        }
    }

    fn journal_path(&self) -> PathBuf {
        self.tuning
            .wal_dir
            .clone()
            .unwrap_or_else(|| self.path.clone())
            .join(JOURNAL_NAME)
    }

    fn bloom_config(&self) -> BloomConfig {
        BloomConfig {
            whole_key: self.tuning.whole_key_bloom,
            prefix_len: self
                .tuning
                .enable_prefix_bloom
                .then_some(PART_PREFIX_LEN),
        }
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.seq += 1;
        let seq = inner.seq;

        if let Some(journal) = inner.journal.as_mut() {
            journal.append_batch(seq, &ops)?;
        }
        for op in &ops {
            if let Some(cache) = &self.row_cache {
                cache.invalidate(op.key());
            }
        }
        for op in ops {
            match op {
                BatchOp::Put(k, v) => inner.mem.put(k, v, seq),
                BatchOp::Delete(k) => inner.mem.delete(k, seq),
            }
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);

        if inner.mem.approx_bytes() >= self.tuning.write_buffer_bytes {
            self.flush_locked(&mut inner)?;
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.mem.is_empty() {
            return Ok(());
        }
        let flush_info = FlushInfo {
            entries: inner.mem.len(),
            bytes: inner.mem.approx_bytes(),
            file_number: None,
        };
        self.listener.on_flush_begin(&flush_info);

        match self.flush_locked_inner(inner) {
            Ok(file_number) => {
                self.stats.flushes.fetch_add(1, Ordering::Relaxed);
                self.listener.on_flush_completed(&FlushInfo {
                    file_number: Some(file_number),
                    ..flush_info
                });
                self.update_stall(inner);
                if inner.levels[0].len() >= L0_COMPACTION_TRIGGER {
                    self.compact_locked(inner)?;
                }
                Ok(())
            }
            Err(e) => {
                // A partial table would collide with the retry.
                let _ = std::fs::remove_file(
                    self.path.join(table_file_name(inner.next_table_no)),
                );
                self.listener
                    .on_background_error(BackgroundErrorReason::Flush, &e);
                Err(e)
            }
        }
    }

    fn flush_locked_inner(&self, inner: &mut Inner) -> Result<u64> {
        let number = inner.next_table_no;
        let table_path = self.path.join(table_file_name(number));
        let mut writer = TableWriter::create(
            &table_path,
            self.tuning.compression_for_level(0),
            self.bloom_config(),
            inner.mem.len(),
        )?;

        let separate_past = self
            .tuning
            .enable_kv_separation
            .then_some(self.tuning.kv_separation_threshold_bytes);
        for (key, entry) in inner.mem.iter() {
            let value = match &entry.value {
                None => RecordValue::Tombstone,
                Some(v) => match (separate_past, self.blobs.as_ref()) {
                    (Some(threshold), Some(blobs)) if v.len() >= threshold => {
                        RecordValue::BlobRef(blobs.append(v)?)
                    }
                    _ => RecordValue::Value(v.clone()),
                },
            };
            writer.add(key, entry.seq, &value)?;
        }
        if let Some(blobs) = &self.blobs {
            blobs.sync()?;
        }
        writer.finish()?;
        self.listener.on_file_created(&table_path);

        let reader = Arc::new(TableReader::open(
            &table_path,
            number,
            Arc::clone(&self.cache),
        )?);
        inner.levels[0].insert(0, reader);
        inner.next_table_no += 1;
        inner.mem.clear();

        self.write_manifest(inner)?;

        // Everything flushed is in the tables now; the journal restarts.
        if inner.journal.is_some() {
            inner.journal = None;
            std::fs::remove_file(self.journal_path())?;
            inner.journal = Some(JournalWriter::open(
                self.journal_path(),
                self.tuning.wal_sync,
            )?);
        }
        Ok(number)
    }

    fn compact_locked(&self, inner: &mut Inner) -> Result<()> {
        let input_count = inner.levels[0].len() + inner.levels[1].len();
        if input_count < 2 {
            return Ok(());
        }
        let _permit = self.gate.enter();
        let begin_info = CompactionInfo {
            input_files: input_count,
            output_records: 0,
            output_level: 1,
        };
        self.listener.on_compaction_begin(&begin_info);

        match self.compact_locked_inner(inner) {
            Ok(records) => {
                self.stats.compactions.fetch_add(1, Ordering::Relaxed);
                self.listener.on_compaction_completed(&CompactionInfo {
                    output_records: records,
                    ..begin_info
                });
                self.update_stall(inner);
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(
                    self.path.join(table_file_name(inner.next_table_no)),
                );
                self.listener
                    .on_background_error(BackgroundErrorReason::Compaction, &e);
                Err(e)
            }
        }
    }

    fn compact_locked_inner(&self, inner: &mut Inner) -> Result<usize> {
        let inputs: Vec<Arc<TableReader>> = inner.levels[0]
            .iter()
            .chain(inner.levels[1].iter())
            .cloned()
            .collect();
        let input_iters: Vec<TableIter> =
            inputs.iter().map(|t| t.iter_range(b"", b"")).collect();

        // With blob GC on, live separated values move into a fresh blob
        // epoch so the old files can be retired afterwards.
        let gc_boundary = match (&self.blobs, self.tuning.enable_blob_gc) {
            (Some(blobs), true) => Some(blobs.begin_rewrite()?),
            _ => None,
        };

        let number = inner.next_table_no;
        let out_path = self.path.join(table_file_name(number));
        let mut writer = TableWriter::create(
            &out_path,
            self.tuning
                .compression_for_level(EngineTuning::NUM_LEVELS - 1),
            self.bloom_config(),
            inputs.len() * 1024,
        )?;
        let mut limiter = RateLimiter::new(self.tuning.write_rate_bytes_per_sec);

        let blobs = self.blobs.clone();
        let emitted = merge_sorted(input_iters, true, |record: TableRecord| {
            let value = match (&record.value, &blobs, gc_boundary) {
                (RecordValue::BlobRef(r), Some(store), Some(_)) => {
                    RecordValue::BlobRef(store.append(&store.read(r)?)?)
                }
                (v, _, _) => v.clone(),
            };
            limiter.consume(record.key.len() + 64);
            writer.add(&record.key, record.seq, &value)
        })?;

        if emitted == 0 {
            // Nothing survived the merge; drop the empty output.
            drop(writer);
            std::fs::remove_file(&out_path)?;
            inner.levels[0].clear();
            inner.levels[1].clear();
        } else {
            if let Some(blobs) = &self.blobs {
                blobs.sync()?;
            }
            writer.finish()?;
            self.listener.on_file_created(&out_path);
            let reader = Arc::new(TableReader::open(
                &out_path,
                number,
                Arc::clone(&self.cache),
            )?);
            inner.levels[0].clear();
            inner.levels[1] = vec![reader];
        }
        inner.next_table_no += 1;
        self.write_manifest(inner)?;

        for table in inputs {
            self.cache.evict_table(table.number());
            if let Err(e) = std::fs::remove_file(table.path()) {
                warn!(
                    target: "basalt::engine",
                    path = %table.path().display(),
                    error = %e,
                    "failed to remove compacted table"
                );
            } else {
                self.listener.on_file_deleted(table.path());
            }
        }
        if let (Some(blobs), Some(boundary)) = (&self.blobs, gc_boundary) {
            blobs.retire_before(boundary)?;
        }
        Ok(emitted)
    }

    fn update_stall(&self, inner: &mut Inner) {
        let cur = stall_for_l0(inner.levels[0].len());
        if cur != inner.stall {
            self.listener.on_stall_conditions_changed(inner.stall, cur);
            inner.stall = cur;
        }
    }

    fn write_manifest(&self, inner: &Inner) -> Result<()> {
        let manifest = Manifest {
            l0: inner.levels[0].iter().map(|t| t.number()).collect(),
            l1: inner.levels[1].iter().map(|t| t.number()).collect(),
            next_table_no: inner.next_table_no,
            last_seq: inner.seq,
        };
        manifest.store(&self.path.join(MANIFEST_NAME))
    }

    /// Looks `key` up in the tables only, newest first.
    fn get_from_tables(&self, tables: &[Arc<TableReader>], key: &[u8]) -> Result<Option<Vec<u8>>> {
        for table in tables {
            if let Some(record) = table.get(key)? {
                return match record.value {
                    RecordValue::Tombstone => Ok(None),
                    RecordValue::Value(v) => Ok(Some(v)),
                    RecordValue::BlobRef(r) => {
                        let blobs = self.blobs.as_ref().ok_or_else(|| {
                            Error::Corruption(
                                "table holds a blob ref but the blob store is absent".into(),
                            )
                        })?;
                        Ok(Some(blobs.read(&r)?))
                    }
                };
            }
        }
        Ok(None)
    }
}

impl StorageEngine for LsmEngine {
    fn path(&self) -> &Path {
        &self.path
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(cache) = &self.row_cache {
            if let Some(v) = cache.get(key) {
                return Ok(Some(v));
            }
        }

        let tables: Vec<Arc<TableReader>>;
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.mem.get_entry(key) {
                return Ok(entry.value.clone());
            }
            tables = inner.levels[0]
                .iter()
                .chain(inner.levels[1].iter())
                .cloned()
                .collect();
        }

        let found = self.get_from_tables(&tables, key)?;
        if let (Some(cache), Some(v)) = (&self.row_cache, &found) {
            cache.put(key, v);
        }
        Ok(found)
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.write_batch(vec![BatchOp::Put(key, value)])
    }

    fn multi_put(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.write_batch(batch.into_iter().map(|(k, v)| BatchOp::Put(k, v)).collect())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.write_batch(vec![BatchOp::Delete(key.to_vec())])
    }

    fn multi_remove(&self, keys: Vec<Vec<u8>>) -> Result<()> {
        self.write_batch(keys.into_iter().map(BatchOp::Delete).collect())
    }

    fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<EngineIter> {
        let inner = self.inner.lock();
        let mem_records: Vec<TableRecord> = inner
            .mem
            .range(start, (!end.is_empty()).then_some(end))
            .map(|(k, entry)| TableRecord {
                key: k.to_vec(),
                seq: entry.seq,
                value: match &entry.value {
                    Some(v) => RecordValue::Value(v.clone()),
                    None => RecordValue::Tombstone,
                },
            })
            .collect();
        let tables: Vec<Arc<TableReader>> = inner.levels[0]
            .iter()
            .chain(inner.levels[1].iter())
            .cloned()
            .collect();
        drop(inner);

        let mut sources = Vec::with_capacity(tables.len() + 1);
        sources.push(ScanSource::new_mem(mem_records));
        for table in &tables {
            sources.push(ScanSource::new_table(table.iter_range(start, end)));
        }
        EngineIter::new(sources, self.blobs.clone())
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<EngineIter> {
        match basalt_core::key::prefix_successor(prefix) {
            Some(end) => self.range_scan(prefix, &end),
            None => self.range_scan(prefix, b""),
        }
    }

    fn compact_range(&self, _start: Option<&[u8]>, _end: Option<&[u8]>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)?;
        self.compact_locked(&mut inner)
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }
}

fn stall_for_l0(l0_count: usize) -> StallState {
    if l0_count >= L0_STOP_TRIGGER {
        StallState::Stopped
    } else if l0_count >= L0_DELAY_TRIGGER {
        StallState::Delayed
    } else {
        StallState::Normal
    }
}

enum ScanSource {
    Mem(std::vec::IntoIter<TableRecord>),
    Table(TableIter),
}

struct ScanHead {
    head: Option<TableRecord>,
    source: ScanSource,
}

impl ScanHead {
    fn advance(&mut self) -> Result<()> {
        self.head = match &mut self.source {
            ScanSource::Mem(iter) => iter.next(),
            ScanSource::Table(iter) => match iter.next() {
                Some(r) => Some(r?),
                None => None,
            },
        };
        Ok(())
    }
}

impl ScanSource {
    fn new_mem(records: Vec<TableRecord>) -> ScanHead {
        let mut head = ScanHead {
            head: None,
            source: ScanSource::Mem(records.into_iter()),
        };
        // A fresh memtable iterator cannot fail.
        let _ = head.advance();
        head
    }

    fn new_table(iter: TableIter) -> ScanHead {
        ScanHead {
            head: None,
            source: ScanSource::Table(iter),
        }
    }
}

/// Merged snapshot scan over the engine. Yields live `(key, value)` pairs
/// in ascending key order; tombstones shadow and separated values resolve
/// through the blob store.
pub struct EngineIter {
    sources: Vec<ScanHead>,
    blobs: Option<Arc<BlobStore>>,
    done: bool,
}

impl EngineIter {
    fn new(mut sources: Vec<ScanHead>, blobs: Option<Arc<BlobStore>>) -> Result<Self> {
        for source in &mut sources {
            if source.head.is_none() {
                source.advance()?;
            }
        }
        Ok(EngineIter {
            sources,
            blobs,
            done: false,
        })
    }
}

impl Iterator for EngineIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            // Smallest key across heads; highest sequence number wins.
            let mut winner: Option<usize> = None;
            for (i, source) in self.sources.iter().enumerate() {
                let Some(head) = &source.head else { continue };
                match winner {
                    None => winner = Some(i),
                    Some(w) => {
                        let best = self.sources[w]
                            .head
                            .as_ref()
                            .expect("winner always holds a record");
                        match head.key.cmp(&best.key) {
                            std::cmp::Ordering::Less => winner = Some(i),
                            std::cmp::Ordering::Equal if head.seq > best.seq => winner = Some(i),
                            _ => {}
                        }
                    }
                }
            }
            let Some(w) = winner else {
                self.done = true;
                return None;
            };

            let record = match self.sources[w].head.take() {
                Some(r) => r,
                None => {
                    self.done = true;
                    return None;
                }
            };
            if let Err(e) = self.sources[w].advance() {
                self.done = true;
                return Some(Err(e));
            }
            // Skip shadowed versions of the key in every source.
            for (i, source) in self.sources.iter_mut().enumerate() {
                if i == w {
                    continue;
                }
                while source
                    .head
                    .as_ref()
                    .map(|h| h.key == record.key)
                    .unwrap_or(false)
                {
                    if let Err(e) = source.advance() {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }

            match record.value {
                RecordValue::Tombstone => continue,
                RecordValue::Value(v) => return Some(Ok((record.key, v))),
                RecordValue::BlobRef(r) => {
                    let Some(blobs) = &self.blobs else {
                        self.done = true;
                        return Some(Err(Error::Corruption(
                            "scan hit a blob ref but the blob store is absent".into(),
                        )));
                    };
                    return match blobs.read(&r) {
                        Ok(v) => Some(Ok((record.key, v))),
                        Err(e) => {
                            self.done = true;
                            Some(Err(e))
                        }
                    };
                }
            }
        }
    }
}

/// Level membership persisted across restarts. Plain text, written to a
/// temp file and renamed into place.
struct Manifest {
    l0: Vec<u64>,
    l1: Vec<u64>,
    next_table_no: u64,
    last_seq: u64,
}

impl Manifest {
    fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Manifest {
                    l0: Vec::new(),
                    l1: Vec::new(),
                    next_table_no: 1,
                    last_seq: 0,
                })
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let mut manifest = Manifest {
            l0: Vec::new(),
            l1: Vec::new(),
            next_table_no: 1,
            last_seq: 0,
        };
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(tag), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            let value: u64 = value
                .parse()
                .map_err(|_| Error::Corruption(format!("bad manifest line: {line}")))?;
            match tag {
                "l0" => manifest.l0.push(value),
                "l1" => manifest.l1.push(value),
                "next" => manifest.next_table_no = value,
                "seq" => manifest.last_seq = value,
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown manifest tag {other}"
                    )))
                }
            }
        }
        Ok(manifest)
    }

    fn store(&self, path: &Path) -> Result<()> {
        let mut text = String::new();
        for no in &self.l0 {
            text.push_str(&format!("l0 {no}\n"));
        }
        for no in &self.l1 {
            text.push_str(&format!("l1 {no}\n"));
        }
        text.push_str(&format!("next {}\n", self.next_table_no));
        text.push_str(&format!("seq {}\n", self.last_seq));

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
