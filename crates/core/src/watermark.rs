//! Process-wide memory high-watermark flag.
//!
//! The flag is written by the memory monitor and sampled by every long
//! iterator and every write admission check. It lives here, in the
//! dependency-free core crate, so that the WAL, the engine, and the store
//! can consult it without depending on the probing machinery.

use std::sync::atomic::{AtomicBool, Ordering};

static HIGH_WATERMARK: AtomicBool = AtomicBool::new(false);

/// True while the last probe saw system memory above the configured ratio.
pub fn hit() -> bool {
    HIGH_WATERMARK.load(Ordering::Relaxed)
}

/// Publishes the result of a probe. Called by the memory monitor.
pub fn publish(hit: bool) {
    HIGH_WATERMARK.store(hit, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_and_read() {
        publish(false);
        assert!(!hit());
        publish(true);
        assert!(hit());
        publish(false);
        assert!(!hit());
    }
}
