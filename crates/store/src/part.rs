//! One partition: a WAL, an engine reference, and a single writer task.
//!
//! Writes are logged before they are applied. Every external write is
//! enqueued onto the partition's writer thread, which assigns the next
//! log id, appends the command to the WAL, applies it to the engine, and
//! only then runs the caller's callback — on the writer task, never on
//! the caller.
//!
//! Failure policy: a WAL failure leaves the engine untouched and the
//! caller sees the error. An engine failure after the record is durable
//! marks the partition inconsistent; it refuses writes until
//! [`Partition::rebuild`] replays the whole log into the engine, which is
//! idempotent because batch application is atomic.

use crate::command::WalCommand;
use crate::iter::{ScanOptions, StoreIter};
use basalt_core::key::{part_key, part_prefix, prefix_successor};
use basalt_core::{watermark, Error, LogId, PartitionId, Result, SpaceId, TermId, NO_LOG};
use basalt_engine::StorageEngine;
use basalt_wal::{DiskManager, FileWal, PreProcessor, WalPolicy};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Write acknowledgement, run on the partition's writer task.
pub type Callback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

enum Task {
    Write(WalCommand, Callback),
    Stop,
}

/// A `(space, partition)` pair bound to one WAL and one engine.
pub struct Partition {
    space: SpaceId,
    part: PartitionId,
    wal: Arc<FileWal>,
    /// `None` in listener mode: the partition retains the log only.
    engine: Option<Arc<dyn StorageEngine>>,
    tx: Sender<Task>,
    writer: Mutex<Option<JoinHandle<()>>>,
    inconsistent: Arc<AtomicBool>,
    term: Arc<AtomicU64>,
}

impl Partition {
    /// Opens the partition's WAL under `wal_dir` and starts its writer
    /// task.
    pub fn open(
        space: SpaceId,
        part: PartitionId,
        wal_dir: &Path,
        policy: WalPolicy,
        engine: Option<Arc<dyn StorageEngine>>,
        disk: Option<Arc<dyn DiskManager>>,
        pre_processor: Option<PreProcessor>,
    ) -> Result<Arc<Self>> {
        let wal = Arc::new(FileWal::open(
            wal_dir,
            space,
            part,
            policy,
            pre_processor,
            disk,
        )?);

        let (tx, rx) = unbounded::<Task>();
        let inconsistent = Arc::new(AtomicBool::new(false));
        let term = Arc::new(AtomicU64::new(0));

        let writer = {
            let wal = Arc::clone(&wal);
            let engine = engine.clone();
            let inconsistent = Arc::clone(&inconsistent);
            let term = Arc::clone(&term);
            std::thread::Builder::new()
                .name(format!("basalt-part-{space}-{part}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        match task {
                            Task::Stop => break,
                            Task::Write(cmd, cb) => {
                                let result = write_through(
                                    space,
                                    part,
                                    &wal,
                                    engine.as_deref(),
                                    &inconsistent,
                                    term.load(Ordering::Acquire),
                                    &cmd,
                                );
                                if let Err(e) = &result {
                                    warn!(
                                        target: "basalt::store",
                                        space, part, error = %e,
                                        "partition write failed"
                                    );
                                }
                                cb(result);
                            }
                        }
                    }
                })
                .map_err(Error::Io)?
        };

        Ok(Arc::new(Partition {
            space,
            part,
            wal,
            engine,
            tx,
            writer: Mutex::new(Some(writer)),
            inconsistent,
            term,
        }))
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn part_id(&self) -> PartitionId {
        self.part
    }

    /// The partition's log, for snapshot and retention maintenance.
    pub fn wal(&self) -> &Arc<FileWal> {
        &self.wal
    }

    /// Leadership epoch tagged onto subsequent appends.
    pub fn set_term(&self, term: TermId) {
        self.term.store(term, Ordering::Release);
    }

    pub fn term(&self) -> TermId {
        self.term.load(Ordering::Acquire)
    }

    pub fn is_inconsistent(&self) -> bool {
        self.inconsistent.load(Ordering::Acquire)
    }

    /// Enqueues a batch put. The callback runs on the writer task once
    /// the batch is logged and applied.
    pub fn async_multi_put(&self, kvs: Vec<(Vec<u8>, Vec<u8>)>, cb: Callback) {
        self.enqueue(WalCommand::MultiPut(kvs), cb);
    }

    /// Enqueues a batch delete with the same contract.
    pub fn async_multi_remove(&self, keys: Vec<Vec<u8>>, cb: Callback) {
        self.enqueue(WalCommand::MultiRemove(keys), cb);
    }

    fn enqueue(&self, cmd: WalCommand, cb: Callback) {
        if let Err(undelivered) = self.tx.send(Task::Write(cmd, cb)) {
            // The writer task is gone; acknowledge with Stopped.
            if let Task::Write(_, cb) = undelivered.0 {
                cb(Err(Error::Stopped));
            }
        }
    }

    /// Point read through the engine, scoped to this partition.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.engine()?.get(&part_key(self.space, self.part, key))
    }

    /// Bounded scan over `[start, end)` of this partition's keys. An
    /// empty `end` runs to the end of the partition.
    pub fn range_scan(&self, start: &[u8], end: &[u8], opts: ScanOptions) -> Result<StoreIter> {
        let engine = self.engine()?;
        let start_key = part_key(self.space, self.part, start);
        let end_key = if end.is_empty() {
            prefix_successor(&part_prefix(self.space, self.part)).unwrap_or_default()
        } else {
            part_key(self.space, self.part, end)
        };
        Ok(StoreIter::new(
            engine.range_scan(&start_key, &end_key)?,
            opts,
        ))
    }

    /// Scan over this partition's keys beginning with `prefix`.
    pub fn prefix_scan(&self, prefix: &[u8], opts: ScanOptions) -> Result<StoreIter> {
        let engine = self.engine()?;
        Ok(StoreIter::new(
            engine.prefix_scan(&part_key(self.space, self.part, prefix))?,
            opts,
        ))
    }

    /// Replays the whole retained log into the engine and clears the
    /// inconsistent flag.
    pub fn rebuild(&self) -> Result<()> {
        let engine = self.engine()?;
        let first = self.wal.first_log_id();
        let last = self.wal.last_log_id();
        if first != NO_LOG {
            info!(
                target: "basalt::store",
                space = self.space, part = self.part, first, last,
                "rebuilding partition from wal"
            );
            for entry in self.wal.iterator(first, last) {
                let entry = entry?;
                let cmd = WalCommand::decode(&entry.msg)?;
                apply_to_engine(self.space, self.part, engine.as_ref(), &cmd)?;
            }
        }
        self.inconsistent.store(false, Ordering::Release);
        Ok(())
    }

    /// Last log id the WAL holds, for placement and catch-up decisions.
    pub fn last_log_id(&self) -> LogId {
        self.wal.last_log_id()
    }

    fn engine(&self) -> Result<&Arc<dyn StorageEngine>> {
        self.engine.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "partition {} of space {} is a listener and serves no engine reads",
                self.part, self.space
            ))
        })
    }

    /// Stops the writer task, draining queued writes first.
    pub fn stop(&self) {
        let _ = self.tx.send(Task::Stop);
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
        self.wal.stop();
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_through(
    space: SpaceId,
    part: PartitionId,
    wal: &FileWal,
    engine: Option<&dyn StorageEngine>,
    inconsistent: &AtomicBool,
    term: TermId,
    cmd: &WalCommand,
) -> Result<()> {
    if inconsistent.load(Ordering::Acquire) {
        return Err(Error::Inconsistent(space, part));
    }
    if watermark::hit() {
        return Err(Error::MemoryExceeded);
    }

    let msg = cmd.encode();
    let id = wal.last_log_id() + 1;
    wal.append_log(id, term, 0, &msg)?;

    if let Some(engine) = engine {
        if let Err(e) = apply_to_engine(space, part, engine, cmd) {
            // The record is durable but the engine missed it: refuse
            // writes until a replay reconciles them.
            inconsistent.store(true, Ordering::Release);
            return Err(e);
        }
    }
    Ok(())
}

fn apply_to_engine(
    space: SpaceId,
    part: PartitionId,
    engine: &(impl StorageEngine + ?Sized),
    cmd: &WalCommand,
) -> Result<()> {
    match cmd {
        WalCommand::MultiPut(kvs) => engine.multi_put(
            kvs.iter()
                .map(|(k, v)| (part_key(space, part, k), v.clone()))
                .collect(),
        ),
        WalCommand::MultiRemove(keys) => engine.multi_remove(
            keys.iter().map(|k| part_key(space, part, k)).collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_engine::{EngineTuning, LsmEngine};
    use crossbeam_channel::bounded;
    use std::time::Duration;

    fn open_engine(dir: &Path) -> Arc<dyn StorageEngine> {
        Arc::new(
            LsmEngine::open(
                dir.join("data"),
                EngineTuning::default(),
                Arc::new(basalt_engine::listener::NoopListener),
            )
            .unwrap(),
        )
    }

    fn open_part(dir: &Path, engine: Option<Arc<dyn StorageEngine>>) -> Arc<Partition> {
        Partition::open(
            1,
            7,
            &dir.join("wal"),
            WalPolicy::default(),
            engine,
            None,
            None,
        )
        .unwrap()
    }

    fn put_blocking(part: &Partition, kvs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let (tx, rx) = bounded(1);
        part.async_multi_put(
            kvs,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv_timeout(Duration::from_secs(5))
            .expect("writer task did not acknowledge")
    }

    fn remove_blocking(part: &Partition, keys: Vec<Vec<u8>>) -> Result<()> {
        let (tx, rx) = bounded(1);
        part.async_multi_remove(
            keys,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv_timeout(Duration::from_secs(5))
            .expect("writer task did not acknowledge")
    }

    #[test]
    fn log_then_apply_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), Some(open_engine(dir.path())));

        put_blocking(
            &part,
            vec![
                (b"k1".to_vec(), b"v1".to_vec()),
                (b"k2".to_vec(), b"v2".to_vec()),
            ],
        )
        .unwrap();

        // Read-your-writes once the callback fired.
        assert_eq!(part.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(part.get(b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(part.last_log_id(), 1);

        put_blocking(&part, vec![(b"k3".to_vec(), b"v3".to_vec())]).unwrap();
        assert_eq!(part.last_log_id(), 2);

        remove_blocking(&part, vec![b"k1".to_vec()]).unwrap();
        assert_eq!(part.get(b"k1").unwrap(), None);
        assert_eq!(part.last_log_id(), 3);
    }

    #[test]
    fn writes_are_serialized_in_submission_order() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), Some(open_engine(dir.path())));

        for i in 0..50u32 {
            part.async_multi_put(
                vec![(b"counter".to_vec(), i.to_le_bytes().to_vec())],
                Box::new(|_| {}),
            );
        }
        put_blocking(&part, vec![(b"counter".to_vec(), 99u32.to_le_bytes().to_vec())]).unwrap();

        // The last submitted write is the visible one.
        assert_eq!(
            part.get(b"counter").unwrap(),
            Some(99u32.to_le_bytes().to_vec())
        );
        assert_eq!(part.last_log_id(), 51);
    }

    #[test]
    fn scans_are_partition_scoped_and_strip_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = open_engine(dir.path());
        let part = open_part(dir.path(), Some(Arc::clone(&engine)));

        // A foreign partition's key in the same engine must stay hidden.
        engine
            .multi_put(vec![(part_key(1, 8, b"edge:x"), b"foreign".to_vec())])
            .unwrap();

        put_blocking(
            &part,
            vec![
                (b"edge:a".to_vec(), b"1".to_vec()),
                (b"edge:b".to_vec(), b"2".to_vec()),
                (b"vert:a".to_vec(), b"3".to_vec()),
            ],
        )
        .unwrap();

        let edges: Vec<_> = part
            .prefix_scan(b"edge:", ScanOptions::default())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            edges,
            vec![
                (b"edge:a".to_vec(), b"1".to_vec()),
                (b"edge:b".to_vec(), b"2".to_vec()),
            ]
        );

        let all: Vec<_> = part
            .range_scan(b"", b"", ScanOptions::default())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(all.len(), 3);

        let bounded_scan: Vec<_> = part
            .range_scan(b"edge:b", b"vert:", ScanOptions::default())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(bounded_scan, vec![(b"edge:b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn engine_failure_marks_inconsistent_and_rebuild_recovers() {
        // An engine that fails exactly one batch.
        struct FlakyEngine {
            inner: Arc<dyn StorageEngine>,
            fail_next: AtomicBool,
        }
        impl StorageEngine for FlakyEngine {
            fn path(&self) -> &Path {
                self.inner.path()
            }
            fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
                self.inner.get(key)
            }
            fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
                self.inner.put(key, value)
            }
            fn multi_put(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
                if self.fail_next.swap(false, Ordering::SeqCst) {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "injected engine failure",
                    )));
                }
                self.inner.multi_put(batch)
            }
            fn remove(&self, key: &[u8]) -> Result<()> {
                self.inner.remove(key)
            }
            fn multi_remove(&self, keys: Vec<Vec<u8>>) -> Result<()> {
                self.inner.multi_remove(keys)
            }
            fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<basalt_engine::EngineIter> {
                self.inner.range_scan(start, end)
            }
            fn prefix_scan(&self, prefix: &[u8]) -> Result<basalt_engine::EngineIter> {
                self.inner.prefix_scan(prefix)
            }
            fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
                self.inner.compact_range(start, end)
            }
            fn flush(&self) -> Result<()> {
                self.inner.flush()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let flaky = Arc::new(FlakyEngine {
            inner: open_engine(dir.path()),
            fail_next: AtomicBool::new(false),
        });
        let part = open_part(dir.path(), Some(Arc::clone(&flaky) as _));

        put_blocking(&part, vec![(b"a".to_vec(), b"1".to_vec())]).unwrap();

        flaky.fail_next.store(true, Ordering::SeqCst);
        let err = put_blocking(&part, vec![(b"b".to_vec(), b"2".to_vec())]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(part.is_inconsistent());

        // The WAL kept the record even though the engine missed it.
        assert_eq!(part.last_log_id(), 2);

        // Writes are refused until a rebuild.
        let err = put_blocking(&part, vec![(b"c".to_vec(), b"3".to_vec())]).unwrap_err();
        assert!(matches!(err, Error::Inconsistent(1, 7)));

        part.rebuild().unwrap();
        assert!(!part.is_inconsistent());
        assert_eq!(part.get(b"b").unwrap(), Some(b"2".to_vec()));

        put_blocking(&part, vec![(b"c".to_vec(), b"3".to_vec())]).unwrap();
        assert_eq!(part.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn listener_partition_keeps_log_but_serves_no_reads() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), None);

        put_blocking(&part, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();
        assert_eq!(part.last_log_id(), 1);
        assert!(matches!(part.get(b"k"), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            part.prefix_scan(b"", ScanOptions::default()),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn stopped_partition_acknowledges_with_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), Some(open_engine(dir.path())));
        part.stop();

        let err = put_blocking(&part, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap_err();
        assert!(matches!(err, Error::Stopped));
    }

    #[test]
    fn term_tags_appended_records() {
        let dir = tempfile::tempdir().unwrap();
        let part = open_part(dir.path(), Some(open_engine(dir.path())));

        part.set_term(3);
        put_blocking(&part, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();
        assert_eq!(part.wal().last_log_term(), 3);

        part.set_term(5);
        put_blocking(&part, vec![(b"k2".to_vec(), b"v".to_vec())]).unwrap();
        assert_eq!(part.wal().last_log_term(), 5);
    }

}
