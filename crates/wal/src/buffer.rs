//! In-memory tail buffer.
//!
//! The newest records are kept in RAM so iterators that chase the writer
//! never touch the files. The buffer holds a contiguous suffix of the log:
//! a push that does not extend the tail resets it, eviction drops from the
//! front, and a range is served only when it lies entirely inside.

use crate::record::LogEntry;
use parking_lot::RwLock;
use std::collections::VecDeque;

pub struct LogBuffer {
    cap_bytes: usize,
    inner: RwLock<Inner>,
}

struct Inner {
    entries: VecDeque<LogEntry>,
    bytes: usize,
}

impl LogBuffer {
    pub fn new(cap_bytes: usize) -> Self {
        LogBuffer {
            cap_bytes,
            inner: RwLock::new(Inner {
                entries: VecDeque::new(),
                bytes: 0,
            }),
        }
    }

    /// Appends one record, evicting from the front past capacity. A
    /// non-consecutive id resets the buffer to keep the suffix contiguous.
    pub fn push(&self, entry: LogEntry) {
        let mut inner = self.inner.write();
        if let Some(back) = inner.entries.back() {
            if back.id + 1 != entry.id {
                inner.entries.clear();
                inner.bytes = 0;
            }
        }
        inner.bytes += entry.encoded_len();
        inner.entries.push_back(entry);
        while inner.bytes > self.cap_bytes && inner.entries.len() > 1 {
            if let Some(evicted) = inner.entries.pop_front() {
                inner.bytes -= evicted.encoded_len();
            }
        }
    }

    /// Clones out `[first, last]` when the whole range is buffered.
    pub fn get_range(&self, first: u64, last: u64) -> Option<Vec<LogEntry>> {
        if first > last {
            return None;
        }
        let inner = self.inner.read();
        let head = inner.entries.front()?.id;
        let tail = inner.entries.back()?.id;
        if first < head || last > tail {
            return None;
        }
        let skip = (first - head) as usize;
        let take = (last - first + 1) as usize;
        Some(inner.entries.iter().skip(skip).take(take).cloned().collect())
    }

    pub fn first_id(&self) -> Option<u64> {
        self.inner.read().entries.front().map(|e| e.id)
    }

    pub fn last_id(&self) -> Option<u64> {
        self.inner.read().entries.back().map(|e| e.id)
    }

    pub fn reset(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, msg: &[u8]) -> LogEntry {
        LogEntry::new(id, 1, 0, msg.to_vec())
    }

    #[test]
    fn serves_contained_ranges_only() {
        let buf = LogBuffer::new(1024);
        for id in 5..=9 {
            buf.push(entry(id, b"m"));
        }
        assert!(buf.get_range(5, 9).is_some());
        assert!(buf.get_range(6, 8).is_some());
        assert!(buf.get_range(4, 6).is_none());
        assert!(buf.get_range(8, 10).is_none());

        let range = buf.get_range(6, 7).unwrap();
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].id, 6);
        assert_eq!(range[1].id, 7);
    }

    #[test]
    fn evicts_from_front_past_capacity() {
        // Each entry is RECORD_OVERHEAD + 8 bytes = 40; cap fits two.
        let buf = LogBuffer::new(80);
        buf.push(entry(1, b"12345678"));
        buf.push(entry(2, b"12345678"));
        buf.push(entry(3, b"12345678"));
        assert_eq!(buf.first_id(), Some(2));
        assert_eq!(buf.last_id(), Some(3));
        assert!(buf.get_range(1, 1).is_none());
    }

    #[test]
    fn non_consecutive_push_resets() {
        let buf = LogBuffer::new(1024);
        buf.push(entry(1, b"a"));
        buf.push(entry(2, b"a"));
        buf.push(entry(7, b"a"));
        assert_eq!(buf.first_id(), Some(7));
        assert_eq!(buf.last_id(), Some(7));
    }

    #[test]
    fn reset_clears() {
        let buf = LogBuffer::new(1024);
        buf.push(entry(1, b"a"));
        buf.reset();
        assert_eq!(buf.first_id(), None);
        assert!(buf.get_range(1, 1).is_none());
    }
}
