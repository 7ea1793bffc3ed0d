//! Cross-cutting process services for the Basalt storage core.
//!
//! - `memory`: process-wide byte accounting, the system memory watermark
//!   probe (procfs on hosts, cgroup v1/v2 in containers), and the monitor
//!   thread that publishes the result to [`basalt_core::watermark`].
//! - `signal`: a single registry mapping OS signals to callbacks, with
//!   fatal-signal re-raise semantics so core files are still produced.

pub mod memory;
pub mod signal;

pub use memory::{MemoryOptions, MemoryStats, MemoryTracker, WatermarkMonitor};
pub use signal::{install, install_all, SignalInfo};
