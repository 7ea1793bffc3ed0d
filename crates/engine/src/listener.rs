//! Engine event hooks.
//!
//! The engine reports background activity through a non-owning listener.
//! Callbacks run on whichever thread performed the work and must not
//! block or panic; the engine treats them as fire-and-forget.

use basalt_core::Error;
use std::path::Path;
use tracing::info;

/// Why a background operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundErrorReason {
    Flush,
    Compaction,
    WriteCallback,
}

/// Write-path throttle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallState {
    Normal,
    Delayed,
    Stopped,
}

/// What the engine knows about a flush when it begins or completes.
#[derive(Debug, Clone)]
pub struct FlushInfo {
    /// Entries drained from the write buffer.
    pub entries: usize,
    /// Bytes drained from the write buffer.
    pub bytes: usize,
    /// Table file the flush produced (set on completion).
    pub file_number: Option<u64>,
}

/// What the engine knows about a compaction when it begins or completes.
#[derive(Debug, Clone)]
pub struct CompactionInfo {
    /// Table files folded together.
    pub input_files: usize,
    /// Records written out.
    pub output_records: usize,
    /// Destination level.
    pub output_level: usize,
}

/// Observer of engine background activity. Default methods ignore every
/// event, so implementors override only what they watch.
pub trait EventListener: Send + Sync {
    fn on_flush_begin(&self, _info: &FlushInfo) {}
    fn on_flush_completed(&self, _info: &FlushInfo) {}
    fn on_compaction_begin(&self, _info: &CompactionInfo) {}
    fn on_compaction_completed(&self, _info: &CompactionInfo) {}
    fn on_file_created(&self, _path: &Path) {}
    fn on_file_deleted(&self, _path: &Path) {}
    fn on_background_error(&self, _reason: BackgroundErrorReason, _error: &Error) {}
    fn on_stall_conditions_changed(&self, _prev: StallState, _cur: StallState) {}
}

/// A listener that narrates every event into the log.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_flush_begin(&self, info: &FlushInfo) {
        info!(target: "basalt::engine", entries = info.entries, bytes = info.bytes,
              "flush begin");
    }

    fn on_flush_completed(&self, info: &FlushInfo) {
        info!(target: "basalt::engine", entries = info.entries, bytes = info.bytes,
              file = info.file_number, "flush completed");
    }

    fn on_compaction_begin(&self, info: &CompactionInfo) {
        info!(target: "basalt::engine", inputs = info.input_files,
              level = info.output_level, "compaction begin");
    }

    fn on_compaction_completed(&self, info: &CompactionInfo) {
        info!(target: "basalt::engine", inputs = info.input_files,
              records = info.output_records, level = info.output_level,
              "compaction completed");
    }

    fn on_file_created(&self, path: &Path) {
        info!(target: "basalt::engine", path = %path.display(), "file created");
    }

    fn on_file_deleted(&self, path: &Path) {
        info!(target: "basalt::engine", path = %path.display(), "file deleted");
    }

    fn on_background_error(&self, reason: BackgroundErrorReason, error: &Error) {
        info!(target: "basalt::engine", ?reason, %error, "background error");
    }

    fn on_stall_conditions_changed(&self, prev: StallState, cur: StallState) {
        info!(target: "basalt::engine", ?prev, ?cur, "stall conditions changed");
    }
}

/// No-op listener for callers that do not observe events.
#[derive(Debug, Default)]
pub struct NoopListener;

impl EventListener for NoopListener {}
