//! WAL policy and the hooks the log exposes to its owner.

use basalt_core::{ClusterId, LogId, PartitionId, SpaceId, TermId};
use std::time::Duration;

/// Tunables of one partition's log.
#[derive(Debug, Clone)]
pub struct WalPolicy {
    /// Age past which files other than the newest two may be removed.
    pub ttl: Duration,
    /// A file rolls when an append would push its size past this.
    pub file_size: u64,
    /// Byte capacity of the in-memory tail buffer.
    pub buffer_size: usize,
    /// Whether every append is followed by fsync.
    pub sync: bool,
}

impl Default for WalPolicy {
    fn default() -> Self {
        WalPolicy {
            ttl: Duration::from_secs(14_400),
            file_size: 16 * 1024 * 1024,
            buffer_size: 8 * 1024 * 1024,
            sync: false,
        }
    }
}

impl WalPolicy {
    /// Small sizes suitable for tests that exercise rollover and eviction.
    pub fn for_testing() -> Self {
        WalPolicy {
            ttl: Duration::from_secs(60),
            file_size: 1024,
            buffer_size: 4 * 1024,
            sync: false,
        }
    }
}

/// Upper-layer veto on every append: the record is written only when the
/// pre-processor returns true. Replication uses this to observe commands
/// before they become durable.
pub type PreProcessor = Box<dyn Fn(LogId, TermId, ClusterId, &[u8]) -> bool + Send + Sync>;

/// Disk-capacity admission consulted before every append.
pub trait DiskManager: Send + Sync {
    /// Whether the data path serving this partition can take more bytes.
    fn has_enough_space(&self, space: SpaceId, part: PartitionId) -> bool;
}
