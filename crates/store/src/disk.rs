//! Disk-capacity admission for WAL appends.

use basalt_core::{PartitionId, SpaceId};
use basalt_wal::DiskManager;
use dashmap::DashMap;
use std::path::PathBuf;
use tracing::warn;

/// Maps partitions to the data path that serves them and refuses appends
/// when that path runs below the reserved free bytes.
pub struct PathDiskManager {
    min_free_bytes: u64,
    part_paths: DashMap<(SpaceId, PartitionId), PathBuf>,
}

impl PathDiskManager {
    pub fn new(min_free_bytes: u64) -> Self {
        PathDiskManager {
            min_free_bytes,
            part_paths: DashMap::new(),
        }
    }

    /// Records which path a partition writes to.
    pub fn register(&self, space: SpaceId, part: PartitionId, path: PathBuf) {
        self.part_paths.insert((space, part), path);
    }

    pub fn unregister(&self, space: SpaceId, part: PartitionId) {
        self.part_paths.remove(&(space, part));
    }
}

impl DiskManager for PathDiskManager {
    fn has_enough_space(&self, space: SpaceId, part: PartitionId) -> bool {
        if self.min_free_bytes == 0 {
            return true;
        }
        let Some(path) = self.part_paths.get(&(space, part)) else {
            // Unregistered partitions are not throttled.
            return true;
        };
        match fs2::available_space(path.value()) {
            Ok(free) => free > self.min_free_bytes,
            Err(e) => {
                warn!(
                    target: "basalt::store",
                    path = %path.value().display(),
                    error = %e,
                    "cannot probe free space, admitting the write"
                );
                true
            }
        }
    }
}
