//! Streaming iteration over a contiguous log id range.
//!
//! Two sources back an iterator: the in-memory tail buffer when the whole
//! range is resident, and the files otherwise. The file path holds an open
//! descriptor for every file whose range intersects the request, oldest to
//! newest, walks the first file to the start offset, then streams records,
//! hopping files when the id crosses into the next one.
//!
//! Invalidity is terminal and silent: an id past the requested end, EOF in
//! the middle of a record, or a header/footer length mismatch all end the
//! iteration. Cooperative aborts are loud: a cancelled iterator yields
//! `Cancelled` once, and a tripped memory watermark yields
//! `MemoryExceeded`.

use crate::record::{self, LogEntry, CLUSTER_OFFSET, MSG_OFFSET};
use crate::wal::FileWal;
use basalt_core::{watermark, ClusterId, Error, LogId, Result, TermId, NO_LOG};
use std::collections::VecDeque;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// How many records pass between memory watermark samples.
const WATERMARK_SAMPLE_EVERY: u64 = 256;

/// Iterator over `[first, last]` of one partition's log.
pub struct WalIterator {
    inner: Inner,
    cancel: Option<Arc<AtomicBool>>,
    yielded: u64,
}

enum Inner {
    Buffer(std::vec::IntoIter<LogEntry>),
    Files(Box<FileIter>),
    Done,
}

impl WalIterator {
    pub(crate) fn from_buffer(entries: Vec<LogEntry>) -> Self {
        WalIterator {
            inner: Inner::Buffer(entries.into_iter()),
            cancel: None,
            yielded: 0,
        }
    }

    pub(crate) fn from_files(iter: FileIter) -> Self {
        WalIterator {
            inner: Inner::Files(Box::new(iter)),
            cancel: None,
            yielded: 0,
        }
    }

    /// Attaches a cooperative cancellation flag; when it becomes true the
    /// iterator yields `Cancelled` once and terminates.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

impl Iterator for WalIterator {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.inner, Inner::Done) {
            return None;
        }
        if let Some(flag) = &self.cancel {
            if flag.load(Ordering::Relaxed) {
                self.inner = Inner::Done;
                return Some(Err(Error::Cancelled));
            }
        }
        if self.yielded > 0 && self.yielded % WATERMARK_SAMPLE_EVERY == 0 && watermark::hit() {
            self.inner = Inner::Done;
            return Some(Err(Error::MemoryExceeded));
        }

        let entry = match &mut self.inner {
            Inner::Buffer(it) => it.next(),
            Inner::Files(it) => it.next_entry(),
            Inner::Done => None,
        };
        match entry {
            Some(e) => {
                self.yielded += 1;
                Some(Ok(e))
            }
            None => {
                self.inner = Inner::Done;
                None
            }
        }
    }
}

/// File-backed record stream.
pub(crate) struct FileIter {
    /// Open descriptors and id ranges, oldest first.
    files: VecDeque<(File, (LogId, LogId))>,
    curr_id: LogId,
    last_id: LogId,
    /// First id in the next file; crossing it hops to that file.
    next_first_id: LogId,
    pos: u64,
    curr_term: TermId,
    curr_msg_len: i32,
    eof: bool,
}

impl FileIter {
    pub(crate) fn new(wal: &FileWal, start: LogId, last: LogId) -> Self {
        let mut it = FileIter {
            files: VecDeque::new(),
            curr_id: start,
            last_id: last,
            next_first_id: NO_LOG,
            pos: 0,
            curr_term: 0,
            curr_msg_len: 0,
            eof: false,
        };

        if start > last {
            it.eof = true;
            return it;
        }
        let wal_first = wal.first_log_id();
        if wal_first == NO_LOG || start < wal_first {
            it.eof = true;
            return it;
        }

        for info in wal.files_for(start) {
            match File::open(info.path()) {
                Ok(f) => it
                    .files
                    .push_back((f, (info.first_id(), info.last_id()))),
                Err(e) => {
                    warn!(
                        target: "basalt::wal",
                        path = %info.path().display(),
                        error = %e,
                        "failed to open wal file for iteration"
                    );
                    it.eof = true;
                    return it;
                }
            }
        }

        let (front_first, front_last) = match it.files.front() {
            Some((_, range)) => *range,
            None => {
                it.eof = true;
                return it;
            }
        };
        if front_first > start {
            it.eof = true;
            return it;
        }
        it.next_first_id = it.peek_next_first_id();
        if start > front_last {
            // The tail was rolled back while the iterator was being built.
            it.eof = true;
            return it;
        }

        // Locate the start id's byte offset in the first file.
        loop {
            let Some((file, _)) = it.files.front() else {
                it.eof = true;
                return it;
            };
            let mut head = [0u8; 20];
            if file.read_exact_at(&mut head, it.pos).is_err() {
                it.eof = true;
                return it;
            }
            let id = LogId::from_le_bytes(head[0..8].try_into().unwrap_or_default());
            let term = TermId::from_le_bytes(head[8..16].try_into().unwrap_or_default());
            let len = i32::from_le_bytes(head[16..20].try_into().unwrap_or_default());
            if len < 0 {
                it.eof = true;
                return it;
            }
            if id == start {
                it.curr_term = term;
                it.curr_msg_len = len;
                break;
            }
            it.pos += record::encoded_len(len as usize) as u64;
        }
        it
    }

    fn next_entry(&mut self) -> Option<LogEntry> {
        if self.eof || self.curr_id > self.last_id {
            return None;
        }
        let (file, _) = self.files.front()?;

        let mut cluster_buf = [0u8; 8];
        if file
            .read_exact_at(&mut cluster_buf, self.pos + CLUSTER_OFFSET)
            .is_err()
        {
            self.eof = true;
            return None;
        }
        let cluster = ClusterId::from_le_bytes(cluster_buf);

        let mut msg = vec![0u8; self.curr_msg_len as usize];
        if file.read_exact_at(&mut msg, self.pos + MSG_OFFSET).is_err() {
            self.eof = true;
            return None;
        }

        let entry = LogEntry::new(self.curr_id, self.curr_term, cluster, msg);
        self.advance();
        Some(entry)
    }

    fn advance(&mut self) {
        self.curr_id += 1;
        if self.curr_id > self.last_id {
            self.eof = true;
            return;
        }

        if self.curr_id >= self.next_first_id {
            // Hop to the next file; dropping the handle closes it.
            self.files.pop_front();
            if self.files.is_empty() {
                self.eof = true;
                return;
            }
            self.next_first_id = self.peek_next_first_id();
            self.pos = 0;
        } else {
            self.pos += record::encoded_len(self.curr_msg_len as usize) as u64;
        }

        self.read_header_at_pos();
    }

    /// First id of the file after the front one; one past the front's
    /// range when the front is the newest.
    fn peek_next_first_id(&self) -> LogId {
        match self.files.get(1) {
            Some((_, (first, _))) => *first,
            None => self.files.front().map(|(_, (_, last))| last + 1).unwrap_or(NO_LOG),
        }
    }

    /// Reads the header of the record at `pos` into the cursor fields.
    /// Any structural problem ends the iteration.
    fn read_header_at_pos(&mut self) {
        let Some((file, _)) = self.files.front() else {
            self.eof = true;
            return;
        };
        let mut head = [0u8; 20];
        if file.read_exact_at(&mut head, self.pos).is_err() {
            self.eof = true;
            return;
        }
        let id = LogId::from_le_bytes(head[0..8].try_into().unwrap_or_default());
        if id != self.curr_id {
            warn!(
                target: "basalt::wal",
                found = id,
                expected = self.curr_id,
                "log id mismatch during iteration"
            );
            self.eof = true;
            return;
        }
        self.curr_term = TermId::from_le_bytes(head[8..16].try_into().unwrap_or_default());
        let len = i32::from_le_bytes(head[16..20].try_into().unwrap_or_default());
        if len < 0 {
            self.eof = true;
            return;
        }
        self.curr_msg_len = len;
    }
}
