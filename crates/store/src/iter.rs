//! Store-level scans: cooperative cancellation, deadlines, and the memory
//! watermark.
//!
//! The engine yields keys carrying the partition prefix; the store strips
//! it so callers see their own keys. Every few rows the iterator samples
//! the caller's deadline and cancel flag and the process watermark, so a
//! runaway scan fails with `Timeout`, `Cancelled`, or `MemoryExceeded`
//! instead of starving the store.

use basalt_core::key::PART_PREFIX_LEN;
use basalt_core::{watermark, Error, Result};
use basalt_engine::EngineIter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Rows between control checks.
const CHECK_EVERY: u64 = 128;

/// Per-scan controls. The default has no deadline and no cancel flag.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Instant past which the scan fails with `Timeout`.
    pub deadline: Option<Instant>,
    /// Cooperative cancel flag; setting it fails the scan with
    /// `Cancelled`.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// A partition-scoped scan.
pub struct StoreIter {
    inner: EngineIter,
    opts: ScanOptions,
    rows: u64,
    done: bool,
}

impl StoreIter {
    pub(crate) fn new(inner: EngineIter, opts: ScanOptions) -> Self {
        StoreIter {
            inner,
            opts,
            rows: 0,
            done: false,
        }
    }

    fn control_check(&self) -> Result<()> {
        if let Some(flag) = &self.opts.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
        }
        if self.rows % CHECK_EVERY == 0 {
            if let Some(deadline) = self.opts.deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout);
                }
            }
            if self.rows > 0 && watermark::hit() {
                return Err(Error::MemoryExceeded);
            }
        }
        Ok(())
    }
}

impl Iterator for StoreIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if let Err(e) = self.control_check() {
            self.done = true;
            return Some(Err(e));
        }
        match self.inner.next() {
            Some(Ok((key, value))) => {
                self.rows += 1;
                // Hand back the caller's key, without the partition scope.
                let user_key = key.get(PART_PREFIX_LEN..).unwrap_or(&[]).to_vec();
                Some(Ok((user_key, value)))
            }
            Some(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
