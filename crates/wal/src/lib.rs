//! Per-partition file-based write-ahead log.
//!
//! Each partition owns one append-only log sharded across rolling files.
//! A file is a plain concatenation of records (no header, no footer) and is
//! named after the first log id it holds, `{:019}.wal`. The log recovers
//! from torn tails by truncation, drops orphaned history before an id gap,
//! supports rollback to an id, TTL-based cleanup, and hardlink snapshots.
//!
//! ```text
//! <dir>/
//!   0000000000000000001.wal     records 1..=41
//!   0000000000000000042.wal     records 42..   (open for append)
//! ```

pub mod buffer;
pub mod config;
pub mod file_info;
pub mod iterator;
pub mod record;
pub mod wal;

pub use config::{DiskManager, PreProcessor, WalPolicy};
pub use file_info::WalFileInfo;
pub use iterator::WalIterator;
pub use record::{LogEntry, RECORD_OVERHEAD};
pub use wal::FileWal;
