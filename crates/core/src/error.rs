//! The closed error taxonomy of the storage core.
//!
//! Every fallible operation in the workspace returns [`Result`]. The
//! variants form a fixed set: callers match on them for policy decisions
//! (retry, reject, rebuild) rather than string-inspecting messages.
//! Key absence is not an error; `get` returns `Option::None`.

use crate::types::{LogId, PartitionId, SpaceId};
use std::io;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for the storage core.
#[derive(Debug, Error)]
pub enum Error {
    /// Routing failure: the space is not served by this store.
    #[error("space {0} not found")]
    SpaceNotFound(SpaceId),

    /// Routing failure: the space exists but does not hold this partition.
    #[error("partition {1} of space {0} not found")]
    PartitionNotFound(SpaceId, PartitionId),

    /// An append's log id is not `lastLogId + 1`.
    #[error("log id gap: last log id is {last}, appending {appending}")]
    LogGap {
        /// Last log id known to the WAL
        last: LogId,
        /// Log id the caller tried to append
        appending: LogId,
    },

    /// The upper layer's pre-processor refused the append.
    #[error("pre-processor rejected log {0}")]
    PreprocessorRejected(LogId),

    /// Iterator bounds or rollback target outside `[firstLogId-1, lastLogId]`.
    #[error("log id {id} out of range [{first}, {last}]")]
    OutOfRange {
        /// Requested id
        id: LogId,
        /// First log id held
        first: LogId,
        /// Last log id held
        last: LogId,
    },

    /// On-disk state failed a structural check (length mismatch, bad file
    /// name, first-id/name mismatch, torn tail past the last good record).
    #[error("corruption: {0}")]
    Corruption(String),

    /// The disk manager refused the write for lack of space.
    #[error("not enough disk space for partition {1} of space {0}")]
    NoSpace(SpaceId, PartitionId),

    /// The memory high watermark tripped during iteration or admission.
    #[error("process memory high watermark exceeded")]
    MemoryExceeded,

    /// The WAL was shut down and accepts no further work.
    #[error("stopped")]
    Stopped,

    /// The caller cancelled a cooperative iterator.
    #[error("cancelled")]
    Cancelled,

    /// The caller-provided deadline elapsed.
    #[error("deadline elapsed")]
    Timeout,

    /// The partition logged a write the engine failed to apply; it refuses
    /// writes until rebuilt from its WAL.
    #[error("partition {1} of space {0} is inconsistent, rebuild required")]
    Inconsistent(SpaceId, PartitionId),

    /// OS-level read/write/seek/unlink/link/fsync failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed configuration or tuning.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A system file (procfs, cgroup) did not parse.
    #[error("parse error: {0}")]
    Parse(String),
}

impl Error {
    /// True for errors that abort one operation without poisoning the
    /// store; the caller may retry once pressure clears.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::MemoryExceeded | Error::NoSpace(..) | Error::Timeout | Error::Cancelled
        )
    }

    /// True when on-disk state is structurally damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }
}
