//! The partitioned KV store façade.
//!
//! A [`KVStore`] owns one engine slot per data path and a map of
//! partitions. Each partition binds one `(space, partition)` pair to its
//! write-ahead log and to the engine serving its data path: writes are
//! logged, then applied, then acknowledged through the caller's callback
//! on the partition's writer task; reads route straight to the engine
//! under the partition's key prefix.

pub mod command;
pub mod disk;
pub mod iter;
pub mod options;
pub mod part;
pub mod store;

pub use command::WalCommand;
pub use disk::PathDiskManager;
pub use iter::{ScanOptions, StoreIter};
pub use options::StoreOptions;
pub use part::{Callback, Partition};
pub use store::KVStore;
