//! Basalt: a durable partitioned key-value store.
//!
//! Every partition owns a crash-safe append-only log of state-machine
//! commands; commands are applied to a log-structured engine shared per
//! data path; point and range reads route straight to the engine. The
//! workspace splits along those seams:
//!
//! - [`basalt_core`]: ids, the closed error taxonomy, key scoping.
//! - [`basalt_common`]: memory accounting and watermark probing, signals.
//! - [`basalt_wal`]: the per-partition file-based write-ahead log.
//! - [`basalt_engine`]: the embedded sorted KV engine and its tuning.
//! - [`basalt_store`]: partitions and the `KVStore` façade.
//!
//! # Example
//!
//! ```no_run
//! use basaltdb::{EngineTuning, KVStore, ScanOptions, StoreOptions, WalPolicy};
//!
//! let opts = StoreOptions {
//!     data_paths: vec!["/var/lib/basalt".into()],
//!     ..Default::default()
//! };
//! let store = KVStore::new(opts, WalPolicy::default(), EngineTuning::default())?;
//! store.add_space(1);
//! store.add_part(1, 1)?;
//! store.async_multi_put(
//!     1,
//!     1,
//!     vec![(b"vertex:1".to_vec(), b"{}".to_vec())],
//!     Box::new(|result| drop(result)),
//! )?;
//! # Ok::<(), basaltdb::Error>(())
//! ```

pub use basalt_core::{
    key, watermark, ClusterId, Error, LogId, PartitionId, Result, SpaceId, TermId,
};

pub use basalt_common::{
    install as install_signal_handler, install_all as install_signal_handlers, MemoryOptions,
    MemoryStats, MemoryTracker, SignalInfo, WatermarkMonitor,
};

pub use basalt_wal::{DiskManager, FileWal, LogEntry, WalIterator, WalPolicy};

pub use basalt_engine::{
    CompressionKind, EngineTuning, EventListener, LoggingListener, LsmEngine, StatsLevel,
    StorageEngine,
};

pub use basalt_store::{
    Callback, KVStore, PathDiskManager, Partition, ScanOptions, StoreIter, StoreOptions,
    WalCommand,
};
