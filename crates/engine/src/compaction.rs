//! Table compaction machinery.
//!
//! Compaction folds overlapping tables into one: a k-way merge streams
//! every input in key order, and for keys present in several inputs the
//! record from the newest table wins. A merge into the bottom level drops
//! tombstones, since there is nothing older left for them to shadow.

use crate::table::{TableIter, TableRecord};
use basalt_core::Result;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// One input to the merge. Lower `recency` is newer; it breaks ties
/// between equal keys.
struct MergeSource {
    iter: TableIter,
    head: Option<TableRecord>,
    recency: usize,
}

impl MergeSource {
    fn advance(&mut self) -> Result<()> {
        self.head = match self.iter.next() {
            Some(record) => Some(record?),
            None => None,
        };
        Ok(())
    }
}

/// Merges `inputs` (newest first) into `emit` in ascending key order,
/// one record per key. Returns how many records were emitted.
pub fn merge_sorted(
    inputs: Vec<TableIter>,
    drop_tombstones: bool,
    mut emit: impl FnMut(TableRecord) -> Result<()>,
) -> Result<usize> {
    let mut sources: Vec<MergeSource> = Vec::with_capacity(inputs.len());
    for (recency, iter) in inputs.into_iter().enumerate() {
        let mut source = MergeSource {
            iter,
            head: None,
            recency,
        };
        source.advance()?;
        sources.push(source);
    }

    let mut emitted = 0;
    loop {
        // The smallest key across heads; newest source breaks the tie.
        let mut winner: Option<usize> = None;
        for (i, source) in sources.iter().enumerate() {
            let Some(head) = &source.head else { continue };
            winner = match winner {
                None => Some(i),
                Some(w) => {
                    let best = sources[w].head.as_ref().map(|r| r.key.as_slice());
                    match best.map(|b| head.key.as_slice().cmp(b)) {
                        Some(std::cmp::Ordering::Less) => Some(i),
                        Some(std::cmp::Ordering::Equal)
                            if source.recency < sources[w].recency =>
                        {
                            Some(i)
                        }
                        _ => Some(w),
                    }
                }
            };
        }
        let Some(w) = winner else { break };

        let record = sources[w]
            .head
            .take()
            .expect("winner always holds a record");
        sources[w].advance()?;

        // Discard shadowed versions of the same key in every other source.
        for (i, source) in sources.iter_mut().enumerate() {
            if i == w {
                continue;
            }
            while source
                .head
                .as_ref()
                .map(|h| h.key == record.key)
                .unwrap_or(false)
            {
                source.advance()?;
            }
        }

        if drop_tombstones && matches!(record.value, crate::table::RecordValue::Tombstone) {
            continue;
        }
        emit(record)?;
        emitted += 1;
    }
    Ok(emitted)
}

/// Byte-per-second throttle for background writes. A zero rate means
/// unlimited.
pub struct RateLimiter {
    rate_bytes_per_sec: usize,
    window_start: Instant,
    window_bytes: usize,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: usize) -> Self {
        RateLimiter {
            rate_bytes_per_sec,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    /// Accounts `bytes` of background writing, sleeping out the rest of
    /// the current one-second window when the budget is spent.
    pub fn consume(&mut self, bytes: usize) {
        if self.rate_bytes_per_sec == 0 {
            return;
        }
        self.window_bytes += bytes;
        if self.window_bytes < self.rate_bytes_per_sec {
            return;
        }
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_secs(1) - elapsed);
        }
        self.window_start = Instant::now();
        self.window_bytes = 0;
    }
}

/// Caps concurrent compactions at `limit`; zero means unlimited.
pub struct CompactionGate {
    limit: usize,
    running: Mutex<usize>,
    cond: Condvar,
}

impl CompactionGate {
    pub fn new(limit: usize) -> Self {
        CompactionGate {
            limit,
            running: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a slot frees up, then holds it until the guard drops.
    pub fn enter(&self) -> CompactionPermit<'_> {
        if self.limit > 0 {
            let mut running = self.running.lock();
            while *running >= self.limit {
                self.cond.wait(&mut running);
            }
            *running += 1;
        }
        CompactionPermit { gate: self }
    }
}

/// RAII slot in the compaction gate.
pub struct CompactionPermit<'a> {
    gate: &'a CompactionGate,
}

impl Drop for CompactionPermit<'_> {
    fn drop(&mut self) {
        if self.gate.limit > 0 {
            let mut running = self.gate.running.lock();
            *running -= 1;
            self.gate.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{
        table_file_name, BlockCache, BloomConfig, RecordValue, TableReader, TableWriter,
    };
    use std::path::Path;
    use std::sync::Arc;

    fn write_table(path: &Path, entries: &[(&[u8], u64, RecordValue)]) {
        let mut w = TableWriter::create(
            path,
            crate::tuning::CompressionKind::None,
            BloomConfig {
                whole_key: false,
                prefix_len: None,
            },
            entries.len(),
        )
        .unwrap();
        for (key, seq, value) in entries {
            w.add(key, *seq, value).unwrap();
        }
        w.finish().unwrap();
    }

    fn open(path: &Path, number: u64, cache: &Arc<BlockCache>) -> Arc<TableReader> {
        Arc::new(TableReader::open(path, number, Arc::clone(cache)).unwrap())
    }

    fn value(v: &[u8]) -> RecordValue {
        RecordValue::Value(v.to_vec())
    }

    #[test]
    fn newest_table_wins_on_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20, 2));
        let newer = dir.path().join(table_file_name(2));
        let older = dir.path().join(table_file_name(1));
        write_table(
            &newer,
            &[(b"b", 10, value(b"new-b")), (b"d", 11, value(b"new-d"))],
        );
        write_table(
            &older,
            &[
                (b"a", 1, value(b"old-a")),
                (b"b", 2, value(b"old-b")),
                (b"c", 3, value(b"old-c")),
            ],
        );

        let inputs = vec![
            open(&newer, 2, &cache).iter_range(b"", b""),
            open(&older, 1, &cache).iter_range(b"", b""),
        ];
        let mut out = Vec::new();
        let emitted = merge_sorted(inputs, false, |r| {
            out.push(r);
            Ok(())
        })
        .unwrap();

        assert_eq!(emitted, 4);
        let keys: Vec<&[u8]> = out.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"c", b"d"]);
        assert_eq!(out[1].value, value(b"new-b"));
        assert_eq!(out[2].value, value(b"old-c"));
    }

    #[test]
    fn bottom_level_merge_drops_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(1 << 20, 2));
        let newer = dir.path().join(table_file_name(2));
        let older = dir.path().join(table_file_name(1));
        write_table(
            &newer,
            &[(b"a", 10, RecordValue::Tombstone), (b"b", 11, value(b"b"))],
        );
        write_table(&older, &[(b"a", 1, value(b"dead"))]);

        let inputs = vec![
            open(&newer, 2, &cache).iter_range(b"", b""),
            open(&older, 1, &cache).iter_range(b"", b""),
        ];
        let mut out = Vec::new();
        merge_sorted(inputs, true, |r| {
            out.push(r);
            Ok(())
        })
        .unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, b"b".to_vec());
    }

    #[test]
    fn unlimited_rate_never_sleeps() {
        let mut limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.consume(1 << 20);
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn gate_limits_concurrency() {
        let gate = Arc::new(CompactionGate::new(1));
        let first = gate.enter();

        let gate2 = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            let _permit = gate2.enter();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(first);
        handle.join().unwrap();
    }
}
