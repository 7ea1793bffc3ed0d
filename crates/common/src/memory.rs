//! Process memory accounting and the system high-watermark probe.
//!
//! Two mechanisms cooperate here:
//!
//! 1. [`MemoryStats`] counts bytes the process has admitted against a
//!    limit. `used` may transiently exceed the limit; the check is an
//!    admission signal, not an allocator bound.
//! 2. [`MemoryTracker::hits_high_watermark`] reads OS-reported memory
//!    (`/proc/meminfo` on hosts, cgroup v1/v2 files in containers),
//!    compares `used/total` against a configured ratio, refreshes the
//!    stats limit from the probe, and returns whether the watermark is hit.
//!
//! A [`WatermarkMonitor`] thread runs the probe on a fixed period and
//! publishes the result into [`basalt_core::watermark`], where iterators
//! and write admission sample it.

use basalt_core::{watermark, Error, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Memory subsystem configuration.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Fraction of system memory at which the store refuses new work.
    pub high_watermark_ratio: f64,
    /// Whether the probe may ask the allocator to return dirty pages.
    pub purge_enabled: bool,
    /// Minimum interval between allocator purges.
    pub purge_interval: Duration,
    /// Probe cgroup files instead of `/proc/meminfo`.
    pub containerized: bool,
    /// Period of the watermark monitor thread.
    pub check_interval: Duration,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        MemoryOptions {
            high_watermark_ratio: 0.8,
            purge_enabled: true,
            purge_interval: Duration::from_secs(10),
            containerized: false,
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Process-wide used/limit accounting. All methods are lock-free.
#[derive(Debug)]
pub struct MemoryStats {
    used: AtomicI64,
    limit: AtomicI64,
}

impl MemoryStats {
    /// A fresh accounting pair. The limit starts at `i64::MAX` and is
    /// refreshed by the first watermark probe.
    pub fn new() -> Self {
        MemoryStats {
            used: AtomicI64::new(0),
            limit: AtomicI64::new(i64::MAX),
        }
    }

    /// Atomically adjusts `used` by `delta` bytes. Never fails.
    pub fn add(&self, delta: i64) {
        self.used.fetch_add(delta, Ordering::Relaxed);
    }

    /// Current `used` bytes.
    pub fn amount(&self) -> i64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Replaces the limit.
    pub fn set_limit(&self, bytes: i64) {
        self.limit.store(bytes, Ordering::Relaxed);
    }

    /// Current limit in bytes.
    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Fraction of the limit currently used.
    pub fn used_ratio(&self) -> f64 {
        let limit = self.limit();
        if limit <= 0 {
            return 0.0;
        }
        self.amount() as f64 / limit as f64
    }

    /// Admits `size` bytes, failing with `MemoryExceeded` when the limit
    /// would be crossed. The accounting is adjusted only on success.
    pub fn alloc(&self, size: i64) -> Result<()> {
        let limit = self.limit();
        if self.amount() + size > limit {
            return Err(Error::MemoryExceeded);
        }
        self.add(size);
        Ok(())
    }

    /// Admits `size` bytes without checking the limit.
    pub fn alloc_unchecked(&self, size: i64) {
        self.add(size);
    }

    /// Re-admits a grown or shrunk allocation.
    pub fn realloc(&self, old: i64, new: i64) -> Result<()> {
        if new > old {
            self.alloc(new - old)
        } else {
            self.add(new - old);
            Ok(())
        }
    }

    /// Returns `size` bytes to the pool.
    pub fn free(&self, size: i64) {
        self.add(-size);
    }
}

impl Default for MemoryStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Locations of the system files the probe reads. Overridable so tests can
/// point the tracker at fixtures.
#[derive(Debug, Clone)]
pub struct ProbePaths {
    pub meminfo: PathBuf,
    pub cgroup_v2_controllers: PathBuf,
    pub cgroup_v1_stat: PathBuf,
    pub cgroup_v2_stat: PathBuf,
    pub cgroup_v1_max: PathBuf,
    pub cgroup_v2_max: PathBuf,
    pub cgroup_v1_current: PathBuf,
    pub cgroup_v2_current: PathBuf,
}

impl Default for ProbePaths {
    fn default() -> Self {
        ProbePaths {
            meminfo: "/proc/meminfo".into(),
            cgroup_v2_controllers: "/sys/fs/cgroup/cgroup.controllers".into(),
            cgroup_v1_stat: "/sys/fs/cgroup/memory/memory.stat".into(),
            cgroup_v2_stat: "/sys/fs/cgroup/memory.stat".into(),
            cgroup_v1_max: "/sys/fs/cgroup/memory/memory.limit_in_bytes".into(),
            cgroup_v2_max: "/sys/fs/cgroup/memory.max".into(),
            cgroup_v1_current: "/sys/fs/cgroup/memory/memory.usage_in_bytes".into(),
            cgroup_v2_current: "/sys/fs/cgroup/memory.current".into(),
        }
    }
}

/// The system memory watermark probe.
pub struct MemoryTracker {
    opts: MemoryOptions,
    paths: ProbePaths,
    stats: Arc<MemoryStats>,
    last_purge: Mutex<Option<Instant>>,
}

impl MemoryTracker {
    pub fn new(opts: MemoryOptions, stats: Arc<MemoryStats>) -> Self {
        Self::with_paths(opts, stats, ProbePaths::default())
    }

    pub fn with_paths(opts: MemoryOptions, stats: Arc<MemoryStats>, paths: ProbePaths) -> Self {
        MemoryTracker {
            opts,
            paths,
            stats,
            last_purge: Mutex::new(None),
        }
    }

    /// The accounting pair this tracker refreshes.
    pub fn stats(&self) -> &Arc<MemoryStats> {
        &self.stats
    }

    /// Probes system memory and decides whether the high watermark is hit.
    ///
    /// Side effects: refreshes the stats limit to `total * ratio` and, when
    /// purging is enabled and the purge interval elapsed, asks the
    /// allocator to release dirty pages.
    pub fn hits_high_watermark(&self) -> Result<bool> {
        if self.opts.high_watermark_ratio >= 1.0 {
            return Ok(false);
        }

        let (total, available) = if self.opts.containerized {
            match self.probe_cgroup()? {
                Some(pair) => pair,
                None => return Ok(false),
            }
        } else {
            match self.probe_meminfo()? {
                Some(pair) => pair,
                None => return Ok(false),
            }
        };

        if total <= 0.0 {
            return Ok(false);
        }

        self.stats
            .set_limit((total * self.opts.high_watermark_ratio) as i64);
        self.maybe_purge();

        let used_ratio = 1.0 - available / total;
        debug!(
            target: "basalt::memory",
            sys_used = (total - available) as i64,
            sys_total = total as i64,
            sys_ratio = used_ratio,
            usr_used = self.stats.amount(),
            usr_limit = self.stats.limit(),
            "memory probe"
        );

        let hits = used_ratio > self.opts.high_watermark_ratio;
        if hits {
            warn!(
                target: "basalt::memory",
                available = available as i64,
                total = total as i64,
                "memory usage has hit the system high watermark"
            );
        }
        Ok(hits)
    }

    /// Host probe: `/proc/meminfo`. Collects the `MemTotal`, `MemAvailable`
    /// and `MemFree` lines (kB), sorts them, and treats the largest as
    /// total and the second-largest as available. `MemAvailable` is absent
    /// on old kernels, in which case `MemFree` stands in.
    fn probe_meminfo(&self) -> Result<Option<(f64, f64)>> {
        let text = read_sys_file(&self.paths.meminfo)?;
        let mut sizes: Vec<u64> = Vec::with_capacity(3);
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let key = match fields.next() {
                Some(k) => k,
                None => continue,
            };
            if key == "MemTotal:" || key == "MemAvailable:" || key == "MemFree:" {
                let kb: u64 = fields
                    .next()
                    .ok_or_else(|| Error::Parse(format!("truncated meminfo line: {line}")))?
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad meminfo value: {line}")))?;
                sizes.push(kb << 10);
            }
        }
        sizes.sort_unstable();
        if sizes.len() < 2 {
            return Ok(None);
        }
        let total = sizes[sizes.len() - 1] as f64;
        let available = sizes[sizes.len() - 2] as f64;
        Ok(Some((total, available)))
    }

    /// Container probe: cgroup memory stat + max + current. Page cache is
    /// reclaimable, so it counts toward `available`.
    fn probe_cgroup(&self) -> Result<Option<(f64, f64)>> {
        let v2 = self.paths.cgroup_v2_controllers.exists();
        let stat_path = if v2 {
            &self.paths.cgroup_v2_stat
        } else {
            &self.paths.cgroup_v1_stat
        };

        let mut cache: u64 = 0;
        for line in read_sys_file(stat_path)?.lines() {
            let mut fields = line.split_whitespace();
            let key = fields.next().unwrap_or("");
            let counted = if v2 {
                key == "inactive_file"
            } else {
                key == "total_cache" || key == "total_inactive_file"
            };
            if counted {
                cache += fields
                    .next()
                    .ok_or_else(|| Error::Parse(format!("truncated cgroup stat line: {line}")))?
                    .parse::<u64>()
                    .map_err(|_| Error::Parse(format!("bad cgroup stat value: {line}")))?;
            }
        }

        let max_path = if v2 {
            &self.paths.cgroup_v2_max
        } else {
            &self.paths.cgroup_v1_max
        };
        let limit = match read_sys_value(max_path)? {
            // cgroup v2 reports "max" for an unlimited group; the ratio is
            // meaningless then, so the watermark never trips.
            None => return Ok(None),
            Some(v) => v,
        };

        let current_path = if v2 {
            &self.paths.cgroup_v2_current
        } else {
            &self.paths.cgroup_v1_current
        };
        let usage = read_sys_value(current_path)?
            .ok_or_else(|| Error::Parse(format!("bad value in {}", current_path.display())))?;

        let total = limit as f64;
        let available = (limit.saturating_sub(usage) + cache) as f64;
        Ok(Some((total, available)))
    }

    fn maybe_purge(&self) {
        if !self.opts.purge_enabled {
            return;
        }
        let mut last = self.last_purge.lock();
        let due = match *last {
            None => true,
            Some(at) => at.elapsed() >= self.opts.purge_interval,
        };
        if due {
            purge_allocator();
            *last = Some(Instant::now());
        }
    }
}

fn read_sys_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(Error::Io)
}

/// Reads a single integer from a system file. `Ok(None)` means the file
/// holds the literal `max` (cgroup v2 "no limit").
fn read_sys_value(path: &Path) -> Result<Option<u64>> {
    let text = read_sys_file(path)?;
    let token = text.split_whitespace().next().unwrap_or("");
    if token == "max" {
        return Ok(None);
    }
    token
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Parse(format!("bad value in {}", path.display())))
}

#[cfg(feature = "jemalloc-purge")]
fn purge_allocator() {
    // MALLCTL_ARENAS_ALL lives at index 4096 in the mallctl namespace.
    if let Err(e) = unsafe { tikv_jemalloc_ctl::raw::write(b"arena.4096.purge\0", ()) } {
        warn!(target: "basalt::memory", error = %e, "jemalloc purge failed");
    }
}

#[cfg(not(feature = "jemalloc-purge"))]
fn purge_allocator() {}

/// Background thread that re-evaluates the watermark on a fixed period and
/// publishes the result. Stops when dropped.
pub struct WatermarkMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl WatermarkMonitor {
    pub fn spawn(tracker: MemoryTracker) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval = tracker.opts.check_interval;
        let handle = thread::Builder::new()
            .name("basalt-mem-watermark".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    match tracker.hits_high_watermark() {
                        Ok(hit) => watermark::publish(hit),
                        Err(e) => {
                            warn!(target: "basalt::memory", error = %e, "watermark probe failed")
                        }
                    }
                    // Sleep in small slices so drop does not stall a full
                    // check interval.
                    let deadline = Instant::now() + interval;
                    while Instant::now() < deadline && !stop_flag.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(50).min(interval));
                    }
                }
            })
            .expect("failed to spawn watermark monitor thread");
        WatermarkMonitor {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for WatermarkMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
