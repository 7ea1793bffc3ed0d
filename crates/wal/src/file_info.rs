//! Metadata for one wal file.

use basalt_core::{LogId, TermId};
use std::path::{Path, PathBuf};

/// Derived metadata of one wal file. The first id is fixed by the file
/// name; the rest is recovered on open and maintained by the writer.
#[derive(Debug, Clone)]
pub struct WalFileInfo {
    path: PathBuf,
    first_id: LogId,
    last_id: LogId,
    last_term: TermId,
    size: u64,
    /// Seconds since the epoch; committed explicitly when the file closes
    /// so TTL cleanup measures from close time.
    mtime: i64,
}

impl WalFileInfo {
    pub fn new(path: PathBuf, first_id: LogId) -> Self {
        WalFileInfo {
            path,
            first_id,
            last_id: 0,
            last_term: 0,
            size: 0,
            mtime: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn first_id(&self) -> LogId {
        self.first_id
    }

    pub fn last_id(&self) -> LogId {
        self.last_id
    }

    pub fn last_term(&self) -> TermId {
        self.last_term
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn set_last_id(&mut self, id: LogId) {
        self.last_id = id;
    }

    pub fn set_last_term(&mut self, term: TermId) {
        self.last_term = term;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn set_mtime(&mut self, mtime: i64) {
        self.mtime = mtime;
    }
}

/// File name for the wal file whose first record is `first_id`.
pub fn wal_file_name(first_id: LogId) -> String {
    format!("{:019}.wal", first_id)
}

/// Parses a wal file name back to its first log id. `None` for anything
/// that is not `<digits>.wal`.
pub fn parse_wal_file_name(name: &str) -> Option<LogId> {
    let stem = name.strip_suffix(".wal")?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}
