//! The store façade: engines per data path, partitions by id.
//!
//! Each space owns one engine slot per data path; a slot opens lazily
//! when the first partition lands on it, and partitions are placed
//! round-robin by their insertion order within the space. Partition WALs
//! live under `<dataPath>/<space>/wal/<part>/`, or under the `wal_path`
//! override; in listener mode only the WAL subtree exists and engine
//! reads are refused.

use crate::disk::PathDiskManager;
use crate::iter::{ScanOptions, StoreIter};
use crate::options::StoreOptions;
use crate::part::{Callback, Partition};
use basalt_core::{Error, PartitionId, Result, SpaceId};
use basalt_engine::{EngineTuning, EventListener, LoggingListener, LsmEngine, StorageEngine};
use basalt_wal::{DiskManager, WalPolicy};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

struct SpaceHandle {
    /// One lazily opened engine per data path.
    engines: Vec<Option<Arc<LsmEngine>>>,
    /// Partitions placed so far; drives round-robin placement.
    placed: usize,
}

/// The single entry point over all spaces and partitions.
pub struct KVStore {
    opts: StoreOptions,
    wal_policy: WalPolicy,
    tuning: EngineTuning,
    listener: Arc<dyn EventListener>,
    spaces: Mutex<HashMap<SpaceId, SpaceHandle>>,
    parts: DashMap<(SpaceId, PartitionId), Arc<Partition>>,
    disk: Arc<PathDiskManager>,
}

impl KVStore {
    /// A store narrating engine events into the log.
    pub fn new(opts: StoreOptions, wal_policy: WalPolicy, tuning: EngineTuning) -> Result<Self> {
        Self::with_listener(opts, wal_policy, tuning, Arc::new(LoggingListener))
    }

    pub fn with_listener(
        opts: StoreOptions,
        wal_policy: WalPolicy,
        tuning: EngineTuning,
        listener: Arc<dyn EventListener>,
    ) -> Result<Self> {
        if opts.listener_path.is_none() && opts.data_paths.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one data path is required".into(),
            ));
        }
        tuning.validate()?;
        let disk = Arc::new(PathDiskManager::new(opts.min_free_bytes));
        Ok(KVStore {
            opts,
            wal_policy,
            tuning,
            listener,
            spaces: Mutex::new(HashMap::new()),
            parts: DashMap::new(),
            disk,
        })
    }

    /// Registers a space; idempotent.
    pub fn add_space(&self, space: SpaceId) {
        let mut spaces = self.spaces.lock();
        spaces.entry(space).or_insert_with(|| {
            info!(target: "basalt::store", space, "adding space");
            SpaceHandle {
                engines: vec![None; self.opts.data_paths.len()],
                placed: 0,
            }
        });
    }

    /// Creates a partition in `space`, placing it on the next data path
    /// in round-robin order and opening that path's engine when needed.
    pub fn add_part(&self, space: SpaceId, part: PartitionId) -> Result<()> {
        if self.parts.contains_key(&(space, part)) {
            return Ok(());
        }

        if let Some(listener_root) = &self.opts.listener_path {
            // Listener mode: retain the log only.
            let wal_dir = listener_root
                .join(space.to_string())
                .join("wal")
                .join(part.to_string());
            self.disk.register(space, part, listener_root.clone());
            let partition = Partition::open(
                space,
                part,
                &wal_dir,
                self.wal_policy.clone(),
                None,
                Some(Arc::clone(&self.disk) as Arc<dyn DiskManager>),
                None,
            )?;
            self.parts.insert((space, part), partition);
            return Ok(());
        }

        let (engine, data_path) = {
            let mut spaces = self.spaces.lock();
            let handle = spaces.get_mut(&space).ok_or(Error::SpaceNotFound(space))?;
            let idx = handle.placed % self.opts.data_paths.len();
            handle.placed += 1;
            let data_path = self.opts.data_paths[idx].clone();
            let engine = match &handle.engines[idx] {
                Some(engine) => Arc::clone(engine),
                None => {
                    let engine = Arc::new(LsmEngine::open(
                        data_path.join(space.to_string()).join("data"),
                        self.tuning.clone(),
                        Arc::clone(&self.listener),
                    )?);
                    handle.engines[idx] = Some(Arc::clone(&engine));
                    engine
                }
            };
            (engine, data_path)
        };

        let wal_root = self
            .opts
            .wal_path
            .clone()
            .unwrap_or_else(|| data_path.clone());
        let wal_dir = wal_root
            .join(space.to_string())
            .join("wal")
            .join(part.to_string());

        self.disk.register(space, part, data_path);
        let partition = Partition::open(
            space,
            part,
            &wal_dir,
            self.wal_policy.clone(),
            Some(engine as Arc<dyn StorageEngine>),
            Some(Arc::clone(&self.disk) as Arc<dyn DiskManager>),
            None,
        )?;
        self.parts.insert((space, part), partition);
        info!(target: "basalt::store", space, part, "added partition");
        Ok(())
    }

    /// Stops and forgets a partition; its data stays on disk.
    pub fn remove_part(&self, space: SpaceId, part: PartitionId) {
        if let Some((_, partition)) = self.parts.remove(&(space, part)) {
            partition.stop();
            self.disk.unregister(space, part);
            info!(target: "basalt::store", space, part, "removed partition");
        }
    }

    /// Drops a space: stops its partitions and removes its subtree from
    /// every root.
    pub fn drop_space(&self, space: SpaceId) -> Result<()> {
        let doomed: Vec<(SpaceId, PartitionId)> = self
            .parts
            .iter()
            .map(|e| *e.key())
            .filter(|(s, _)| *s == space)
            .collect();
        for (s, p) in doomed {
            self.remove_part(s, p);
        }
        self.spaces.lock().remove(&space);

        let mut roots: Vec<PathBuf> = self.opts.data_paths.clone();
        roots.extend(self.opts.wal_path.clone());
        roots.extend(self.opts.listener_path.clone());
        for root in roots {
            let subtree = root.join(space.to_string());
            match std::fs::remove_dir_all(&subtree) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        info!(target: "basalt::store", space, "dropped space");
        Ok(())
    }

    fn part_handle(&self, space: SpaceId, part: PartitionId) -> Result<Arc<Partition>> {
        if let Some(handle) = self.parts.get(&(space, part)) {
            return Ok(Arc::clone(handle.value()));
        }
        if self.spaces.lock().contains_key(&space) {
            Err(Error::PartitionNotFound(space, part))
        } else {
            Err(Error::SpaceNotFound(space))
        }
    }

    /// Point read. Absence is `None`.
    pub fn get(&self, space: SpaceId, part: PartitionId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.part_handle(space, part)?.get(key)
    }

    /// Sorted scan over `[start, end)` of one partition.
    pub fn range_scan(
        &self,
        space: SpaceId,
        part: PartitionId,
        start: &[u8],
        end: &[u8],
        opts: ScanOptions,
    ) -> Result<StoreIter> {
        self.part_handle(space, part)?.range_scan(start, end, opts)
    }

    /// Sorted scan over one partition's keys beginning with `prefix`.
    pub fn prefix_scan(
        &self,
        space: SpaceId,
        part: PartitionId,
        prefix: &[u8],
        opts: ScanOptions,
    ) -> Result<StoreIter> {
        self.part_handle(space, part)?.prefix_scan(prefix, opts)
    }

    /// Batch write. Routing failures return synchronously without
    /// invoking the callback; everything after routing is acknowledged
    /// through `cb` on the partition's writer task.
    pub fn async_multi_put(
        &self,
        space: SpaceId,
        part: PartitionId,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
        cb: Callback,
    ) -> Result<()> {
        self.part_handle(space, part)?.async_multi_put(kvs, cb);
        Ok(())
    }

    /// Batch delete with the same contract as [`Self::async_multi_put`].
    pub fn async_multi_remove(
        &self,
        space: SpaceId,
        part: PartitionId,
        keys: Vec<Vec<u8>>,
        cb: Callback,
    ) -> Result<()> {
        self.part_handle(space, part)?.async_multi_remove(keys, cb);
        Ok(())
    }

    /// TTL retention pass over every partition's WAL.
    pub fn clean_expired_wals(&self) {
        for entry in self.parts.iter() {
            entry.value().wal().clean_expired();
        }
    }

    /// Drops WAL files of one partition wholly before `id`.
    pub fn clean_wal_before(&self, space: SpaceId, part: PartitionId, id: u64) -> Result<()> {
        self.part_handle(space, part)?.wal().clean_before(id);
        Ok(())
    }

    /// Hardlinks one partition's WAL files under `dst` for snapshot
    /// shipping.
    pub fn snapshot_wal(
        &self,
        space: SpaceId,
        part: PartitionId,
        dst: &std::path::Path,
    ) -> Result<()> {
        self.part_handle(space, part)?.wal().link_current(dst)
    }

    /// Replays a partition's log into its engine after an apply failure.
    pub fn rebuild_part(&self, space: SpaceId, part: PartitionId) -> Result<()> {
        self.part_handle(space, part)?.rebuild()
    }

    /// Drains every partition and flushes every engine. Called on
    /// shutdown, typically from a termination signal handler.
    pub fn stop(&self) -> Result<()> {
        let keys: Vec<(SpaceId, PartitionId)> = self.parts.iter().map(|e| *e.key()).collect();
        for (space, part) in keys {
            if let Some((_, partition)) = self.parts.remove(&(space, part)) {
                partition.stop();
            }
        }
        let spaces = self.spaces.lock();
        for handle in spaces.values() {
            for engine in handle.engines.iter().flatten() {
                engine.flush()?;
            }
        }
        info!(target: "basalt::store", "store stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn store_with_paths(paths: Vec<PathBuf>) -> KVStore {
        let opts = StoreOptions {
            data_paths: paths,
            ..Default::default()
        };
        KVStore::new(opts, WalPolicy::default(), EngineTuning::default()).unwrap()
    }

    fn put_blocking(
        store: &KVStore,
        space: SpaceId,
        part: PartitionId,
        kvs: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        let (tx, rx) = bounded(1);
        store.async_multi_put(
            space,
            part,
            kvs,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.recv_timeout(Duration::from_secs(5))
            .expect("writer task did not acknowledge")
    }

    #[test]
    fn routing_failures_are_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_paths(vec![dir.path().to_path_buf()]);

        assert!(matches!(
            store.get(9, 1, b"k"),
            Err(Error::SpaceNotFound(9))
        ));

        store.add_space(9);
        assert!(matches!(
            store.get(9, 1, b"k"),
            Err(Error::PartitionNotFound(9, 1))
        ));

        // The callback must not run on a routing failure.
        let called = Arc::new(AtomicBool::new(false));
        let called2 = Arc::clone(&called);
        let result = store.async_multi_put(
            9,
            1,
            vec![(b"k".to_vec(), b"v".to_vec())],
            Box::new(move |_| called2.store(true, Ordering::SeqCst)),
        );
        assert!(matches!(result, Err(Error::PartitionNotFound(9, 1))));
        std::thread::sleep(Duration::from_millis(50));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn write_then_read_through_the_facade() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_paths(vec![dir.path().to_path_buf()]);
        store.add_space(1);
        store.add_part(1, 1).unwrap();
        store.add_part(1, 2).unwrap();

        put_blocking(&store, 1, 1, vec![(b"k".to_vec(), b"p1".to_vec())]).unwrap();
        put_blocking(&store, 1, 2, vec![(b"k".to_vec(), b"p2".to_vec())]).unwrap();

        // The same key is scoped per partition.
        assert_eq!(store.get(1, 1, b"k").unwrap(), Some(b"p1".to_vec()));
        assert_eq!(store.get(1, 2, b"k").unwrap(), Some(b"p2".to_vec()));

        let rows: Vec<_> = store
            .prefix_scan(1, 1, b"", ScanOptions::default())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(rows, vec![(b"k".to_vec(), b"p1".to_vec())]);
    }

    #[test]
    fn partitions_round_robin_across_data_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("disk-a");
        let path_b = dir.path().join("disk-b");
        let store = store_with_paths(vec![path_a.clone(), path_b.clone()]);
        store.add_space(3);
        for part in 1..=4 {
            store.add_part(3, part).unwrap();
        }

        // Both paths carry the space's engine and two WALs each.
        for root in [&path_a, &path_b] {
            assert!(root.join("3").join("data").is_dir());
            let wal_parts = std::fs::read_dir(root.join("3").join("wal"))
                .unwrap()
                .count();
            assert_eq!(wal_parts, 2, "uneven placement under {root:?}");
        }

        // Every partition serves reads and writes wherever it landed.
        for part in 1..=4 {
            put_blocking(
                &store,
                3,
                part,
                vec![(b"k".to_vec(), part.to_string().into_bytes())],
            )
            .unwrap();
            assert_eq!(
                store.get(3, part, b"k").unwrap(),
                Some(part.to_string().into_bytes())
            );
        }
    }

    #[test]
    fn wal_path_override_moves_the_wal_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data-root");
        let wal = dir.path().join("wal-root");
        let opts = StoreOptions {
            data_paths: vec![data.clone()],
            wal_path: Some(wal.clone()),
            ..Default::default()
        };
        let store = KVStore::new(opts, WalPolicy::default(), EngineTuning::default()).unwrap();
        store.add_space(5);
        store.add_part(5, 1).unwrap();
        put_blocking(&store, 5, 1, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();

        assert!(wal.join("5").join("wal").join("1").is_dir());
        assert!(!data.join("5").join("wal").exists());
        assert!(data.join("5").join("data").is_dir());
    }

    #[test]
    fn listener_mode_keeps_only_wals() {
        let dir = tempfile::tempdir().unwrap();
        let opts = StoreOptions {
            listener_path: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = KVStore::new(opts, WalPolicy::default(), EngineTuning::default()).unwrap();
        store.add_part(2, 1).unwrap();

        put_blocking(&store, 2, 1, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();
        assert!(matches!(
            store.get(2, 1, b"k"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(dir.path().join("2").join("wal").join("1").is_dir());
    }

    #[test]
    fn reads_observe_writes_after_callback() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_with_paths(vec![dir.path().to_path_buf()]));
        store.add_space(1);
        store.add_part(1, 1).unwrap();

        let observed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = bounded(1);
        {
            let store = Arc::clone(&store);
            let observed = Arc::clone(&observed);
            store
                .clone()
                .async_multi_put(
                    1,
                    1,
                    vec![(b"rw".to_vec(), b"yes".to_vec())],
                    Box::new(move |result| {
                        result.unwrap();
                        // Read-your-writes from inside the callback.
                        if store.get(1, 1, b"rw").unwrap() == Some(b"yes".to_vec()) {
                            observed.store(1, Ordering::SeqCst);
                        }
                        let _ = tx.send(());
                    }),
                )
                .unwrap();
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn scan_deadline_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_paths(vec![dir.path().to_path_buf()]);
        store.add_space(1);
        store.add_part(1, 1).unwrap();
        let batch: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| (format!("k{i:03}").into_bytes(), b"v".to_vec()))
            .collect();
        put_blocking(&store, 1, 1, batch).unwrap();

        // An already-expired deadline fails on the first row.
        let opts = ScanOptions {
            deadline: Some(Instant::now()),
            ..Default::default()
        };
        let mut it = store.prefix_scan(1, 1, b"", opts).unwrap();
        assert!(matches!(it.next(), Some(Err(Error::Timeout))));
        assert!(it.next().is_none());

        // A cancel flag set mid-scan stops it.
        let cancel = Arc::new(AtomicBool::new(false));
        let opts = ScanOptions {
            cancel: Some(Arc::clone(&cancel)),
            ..Default::default()
        };
        let mut it = store.prefix_scan(1, 1, b"", opts).unwrap();
        assert!(it.next().unwrap().is_ok());
        cancel.store(true, Ordering::Relaxed);
        assert!(matches!(it.next(), Some(Err(Error::Cancelled))));
    }

    #[test]
    fn drop_space_removes_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_paths(vec![dir.path().to_path_buf()]);
        store.add_space(4);
        store.add_part(4, 1).unwrap();
        put_blocking(&store, 4, 1, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();
        assert!(dir.path().join("4").is_dir());

        store.drop_space(4).unwrap();
        assert!(!dir.path().join("4").exists());
        assert!(matches!(
            store.get(4, 1, b"k"),
            Err(Error::SpaceNotFound(4))
        ));
    }

    #[test]
    fn partition_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store_with_paths(vec![dir.path().to_path_buf()]);
            store.add_space(1);
            store.add_part(1, 1).unwrap();
            put_blocking(&store, 1, 1, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();
            store.stop().unwrap();
        }
        let store = store_with_paths(vec![dir.path().to_path_buf()]);
        store.add_space(1);
        store.add_part(1, 1).unwrap();
        assert_eq!(store.get(1, 1, b"k").unwrap(), Some(b"v".to_vec()));

        // The recovered WAL continues from where it stopped.
        put_blocking(&store, 1, 1, vec![(b"k2".to_vec(), b"v2".to_vec())]).unwrap();
        let handle = store.part_handle(1, 1).unwrap();
        assert_eq!(handle.last_log_id(), 2);
    }

    #[test]
    fn snapshot_wal_links_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_paths(vec![dir.path().to_path_buf()]);
        store.add_space(1);
        store.add_part(1, 1).unwrap();
        put_blocking(&store, 1, 1, vec![(b"k".to_vec(), b"v".to_vec())]).unwrap();

        let snap = dir.path().join("snap");
        store.snapshot_wal(1, 1, &snap).unwrap();
        let linked = std::fs::read_dir(&snap).unwrap().count();
        assert_eq!(linked, 1);
    }
}
