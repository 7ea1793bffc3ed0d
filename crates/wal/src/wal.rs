//! `FileWal`: the per-partition append-only log.
//!
//! One instance owns one directory of `{:019}.wal` files. Appends go to
//! the newest file, rolling to a fresh file when the size budget is
//! exceeded. Opening an existing directory recovers the id range from the
//! file names and record tombstones, scans the newest file end to end to
//! repair a torn tail, and discards any history older than an id gap.

use crate::buffer::LogBuffer;
use crate::config::{DiskManager, PreProcessor, WalPolicy};
use crate::file_info::{parse_wal_file_name, wal_file_name, WalFileInfo};
use crate::iterator::{FileIter, WalIterator};
use crate::record::{self, LogEntry, MSG_OFFSET, RECORD_OVERHEAD};
use basalt_core::{ClusterId, Error, LogId, PartitionId, Result, SpaceId, TermId, NO_LOG};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// How often the disk-full refusal is actually logged.
const NO_SPACE_LOG_EVERY: u64 = 100;

struct ActiveFile {
    first_id: LogId,
    file: File,
}

struct WalCore {
    /// Ordered index from first log id to file metadata. Adjacent files
    /// satisfy `next.first_id == prev.last_id + 1`.
    files: BTreeMap<LogId, WalFileInfo>,
    curr: Option<ActiveFile>,
}

/// The per-partition write-ahead log.
pub struct FileWal {
    dir: PathBuf,
    space: SpaceId,
    part: PartitionId,
    policy: WalPolicy,
    pre_processor: Option<PreProcessor>,
    disk: Option<Arc<dyn DiskManager>>,
    core: Mutex<WalCore>,
    buffer: LogBuffer,
    first_log_id: AtomicU64,
    last_log_id: AtomicU64,
    last_log_term: AtomicU64,
    stopped: AtomicBool,
    /// Readers: appends and new iterators. Writer: rollback/reset.
    rollback_lock: RwLock<()>,
    no_space_count: AtomicU64,
}

impl FileWal {
    /// Opens (creating if needed) the log under `dir` and recovers its
    /// id range from the files found there.
    pub fn open(
        dir: impl Into<PathBuf>,
        space: SpaceId,
        part: PartitionId,
        policy: WalPolicy,
        pre_processor: Option<PreProcessor>,
        disk: Option<Arc<dyn DiskManager>>,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut files = scan_all_wal_files(&dir, space, part)?;

        let mut first = NO_LOG;
        let mut last = NO_LOG;
        let mut last_term = 0;
        let mut curr = None;
        if let Some((&first_key, newest)) = files.iter().next_back() {
            first = files
                .values()
                .next()
                .map(|i| i.first_id())
                .unwrap_or(NO_LOG);
            last = newest.last_id();
            last_term = newest.last_term();
            info!(
                target: "basalt::wal",
                space, part,
                last_log_id = last,
                last_log_term = last_term,
                path = %newest.path().display(),
                "recovered wal"
            );
            let file = OpenOptions::new().append(true).open(newest.path())?;
            curr = Some(ActiveFile {
                first_id: first_key,
                file,
            });
        }

        let buffer = LogBuffer::new(policy.buffer_size);
        Ok(FileWal {
            dir,
            space,
            part,
            policy,
            pre_processor,
            disk,
            core: Mutex::new(WalCore { files, curr }),
            buffer,
            first_log_id: AtomicU64::new(first),
            last_log_id: AtomicU64::new(last),
            last_log_term: AtomicU64::new(last_term),
            stopped: AtomicBool::new(false),
            rollback_lock: RwLock::new(()),
            no_space_count: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn first_log_id(&self) -> LogId {
        self.first_log_id.load(Ordering::Acquire)
    }

    pub fn last_log_id(&self) -> LogId {
        self.last_log_id.load(Ordering::Acquire)
    }

    pub fn last_log_term(&self) -> TermId {
        self.last_log_term.load(Ordering::Acquire)
    }

    /// Stops accepting appends and closes the open file.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut core = self.core.lock();
        Self::close_curr(&self.policy, &mut core);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Appends one record. Fails without touching state on `Stopped`,
    /// `LogGap`, `PreprocessorRejected`, and `NoSpace`.
    pub fn append_log(
        &self,
        id: LogId,
        term: TermId,
        cluster: ClusterId,
        msg: &[u8],
    ) -> Result<()> {
        self.check_disk()?;
        self.append_internal(id, term, cluster, msg)
    }

    /// Batched append. Atomicity is per record: a mid-batch failure leaves
    /// the earlier records durable.
    pub fn append_logs<I>(&self, logs: I) -> Result<()>
    where
        I: IntoIterator<Item = LogEntry>,
    {
        self.check_disk()?;
        for entry in logs {
            self.append_internal(entry.id, entry.term, entry.cluster, &entry.msg)?;
        }
        Ok(())
    }

    fn check_disk(&self) -> Result<()> {
        if let Some(disk) = &self.disk {
            if !disk.has_enough_space(self.space, self.part) {
                let n = self.no_space_count.fetch_add(1, Ordering::Relaxed);
                if n % NO_SPACE_LOG_EVERY == 0 {
                    warn!(
                        target: "basalt::wal",
                        space = self.space,
                        part = self.part,
                        "append refused, not enough disk space"
                    );
                }
                return Err(Error::NoSpace(self.space, self.part));
            }
        }
        Ok(())
    }

    fn append_internal(
        &self,
        id: LogId,
        term: TermId,
        cluster: ClusterId,
        msg: &[u8],
    ) -> Result<()> {
        if self.is_stopped() {
            warn!(target: "basalt::wal", space = self.space, part = self.part,
                  "wal has stopped, not accepting logs");
            return Err(Error::Stopped);
        }

        let last = self.last_log_id();
        if last != NO_LOG && id != last + 1 {
            warn!(
                target: "basalt::wal",
                space = self.space,
                part = self.part,
                last_log_id = last,
                appending = id,
                "gap in appended log ids"
            );
            return Err(Error::LogGap {
                last,
                appending: id,
            });
        }

        if let Some(pre) = &self.pre_processor {
            if !pre(id, term, cluster, msg) {
                warn!(target: "basalt::wal", space = self.space, part = self.part, id,
                      "pre-processor rejected log");
                return Err(Error::PreprocessorRejected(id));
            }
        }

        let mut buf = Vec::with_capacity(RECORD_OVERHEAD + msg.len());
        record::encode_record(id, term, cluster, msg, &mut buf);

        let _guard = self.rollback_lock.read();
        {
            let mut core = self.core.lock();

            let needs_new = match &core.curr {
                None => true,
                Some(active) => {
                    let size = core
                        .files
                        .get(&active.first_id)
                        .map(|i| i.size())
                        .unwrap_or(0);
                    size + buf.len() as u64 > self.policy.file_size
                }
            };
            if needs_new {
                Self::close_curr(&self.policy, &mut core);
                self.prepare_new_file(&mut core, id)?;
            }

            let active = core.curr.as_mut().ok_or_else(|| {
                Error::Corruption("no writable wal file after rollover".into())
            })?;
            if let Err(e) = active.file.write_all(&buf) {
                // A short or failed write leaves an undefined tail; the
                // log stops and the owner decides how to recover.
                self.stopped.store(true, Ordering::Release);
                return Err(Error::Io(e));
            }
            if self.policy.sync {
                if let Err(e) = active.file.sync_data() {
                    warn!(target: "basalt::wal", error = %e, "wal fsync failed");
                }
            }

            let first_id = active.first_id;
            if let Some(info) = core.files.get_mut(&first_id) {
                info.set_size(info.size() + buf.len() as u64);
                info.set_last_id(id);
                info.set_last_term(term);
            }
        }

        self.last_log_id.store(id, Ordering::Release);
        self.last_log_term.store(term, Ordering::Release);
        if self.first_log_id() == NO_LOG {
            self.first_log_id.store(id, Ordering::Release);
        }

        self.buffer
            .push(LogEntry::new(id, term, cluster, msg.to_vec()));
        Ok(())
    }

    fn prepare_new_file(&self, core: &mut WalCore, start_id: LogId) -> Result<()> {
        let path = self.dir.join(wal_file_name(start_id));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;
        let mut info = WalFileInfo::new(path, start_id);
        info.set_mtime(now_secs());
        core.files.insert(start_id, info);
        core.curr = Some(ActiveFile {
            first_id: start_id,
            file,
        });
        Ok(())
    }

    /// Closes the open file, committing its mtime so TTL cleanup measures
    /// from close time.
    fn close_curr(policy: &WalPolicy, core: &mut WalCore) {
        let Some(active) = core.curr.take() else {
            return;
        };
        if !policy.sync {
            if let Err(e) = active.file.sync_data() {
                warn!(target: "basalt::wal", error = %e, "wal fsync on close failed");
            }
        }
        drop(active.file);
        let now = now_secs();
        if let Some(info) = core.files.get_mut(&active.first_id) {
            info.set_mtime(now);
            commit_mtime(info.path(), now);
        }
    }

    /// An iterator over `[first, last]`, served from the in-memory buffer
    /// when the whole range is still resident, otherwise from the files.
    pub fn iterator(&self, first: LogId, last: LogId) -> WalIterator {
        let _guard = self.rollback_lock.read();
        if let Some(entries) = self.buffer.get_range(first, last) {
            return WalIterator::from_buffer(entries);
        }
        WalIterator::from_files(FileIter::new(self, first, last))
    }

    /// Snapshot of the file metadata whose ranges may intersect an
    /// iterator starting at `start`: every file from the newest down to
    /// the first file with `first_id <= start`, returned oldest-first.
    pub(crate) fn files_for(&self, start: LogId) -> Vec<WalFileInfo> {
        let core = self.core.lock();
        let mut out = Vec::new();
        for info in core.files.values().rev() {
            out.push(info.clone());
            if info.first_id() <= start {
                break;
            }
        }
        out.reverse();
        out
    }

    /// Walks file metadata newest to oldest until `f` returns false.
    /// Returns how many files were visited.
    pub fn access_all_info(&self, mut f: impl FnMut(&WalFileInfo) -> bool) -> usize {
        let core = self.core.lock();
        let mut count = 0;
        for info in core.files.values().rev() {
            count += 1;
            if !f(info) {
                break;
            }
        }
        count
    }

    /// Truncates the log back to `id`: every record after it is removed
    /// and the next append must carry `id + 1`. Rolling back to
    /// `first_log_id - 1` empties the log. Exclusive against appends and
    /// new iterators; an existing iterator past the target observes EOF.
    pub fn rollback_to_log(&self, id: LogId) -> Result<()> {
        let first = self.first_log_id();
        let last = self.last_log_id();
        if (first != NO_LOG && id + 1 < first) || id > last {
            warn!(
                target: "basalt::wal",
                space = self.space, part = self.part,
                id, first, last,
                "rollback target out of range"
            );
            return Err(Error::OutOfRange { id, first, last });
        }

        let _guard = self.rollback_lock.write();
        {
            let mut core = self.core.lock();
            Self::close_curr(&self.policy, &mut core);

            // Drop every file whose whole range is past the target.
            let doomed = core.files.split_off(&(id + 1));
            for info in doomed.values() {
                info!(target: "basalt::wal", path = %info.path().display(), "removing wal file");
                remove_file_logged(info.path());
            }

            if core.files.is_empty() {
                debug_assert!(id + 1 == first || id == NO_LOG);
                self.first_log_id.store(NO_LOG, Ordering::Release);
                self.last_log_id.store(NO_LOG, Ordering::Release);
                self.last_log_term.store(0, Ordering::Release);
            } else {
                let (&key, _) = core
                    .files
                    .iter()
                    .next_back()
                    .ok_or_else(|| Error::Corruption("wal index emptied during rollback".into()))?;
                let info = core.files.get_mut(&key).ok_or_else(|| {
                    Error::Corruption("wal index entry vanished during rollback".into())
                })?;
                let term = rollback_in_file(info, id)?;
                self.last_log_id.store(id, Ordering::Release);
                self.last_log_term.store(term, Ordering::Release);
                info!(target: "basalt::wal", space = self.space, part = self.part, id,
                      "rolled back wal");
            }
        }
        self.buffer.reset();
        Ok(())
    }

    /// Drops every record and file; the log becomes brand new.
    pub fn reset(&self) -> Result<()> {
        let _guard = self.rollback_lock.write();
        self.buffer.reset();
        {
            let mut core = self.core.lock();
            Self::close_curr(&self.policy, &mut core);
            core.files.clear();
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if parse_wal_file_name(&name.to_string_lossy()).is_some() {
                info!(target: "basalt::wal", path = %entry.path().display(), "removing wal file");
                std::fs::remove_file(entry.path())?;
            }
        }
        self.first_log_id.store(NO_LOG, Ordering::Release);
        self.last_log_id.store(NO_LOG, Ordering::Release);
        self.last_log_term.store(0, Ordering::Release);
        Ok(())
    }

    /// TTL cleanup. The newest two files are always kept: the newest is
    /// being written, and keeping one more avoids snapshot transfers when
    /// a follower is only a handful of records behind.
    pub fn clean_expired(&self) {
        let mut core = self.core.lock();
        let total = core.files.len();
        if total < 2 {
            return;
        }
        let now = now_secs();
        let ttl = self.policy.ttl.as_secs() as i64;
        let keys: Vec<LogId> = core.files.keys().copied().collect();
        let mut removed = 0;
        for (index, key) in keys.iter().enumerate() {
            if index + 2 >= total {
                break;
            }
            let expired = core
                .files
                .get(key)
                .map(|i| now - i.mtime() > ttl)
                .unwrap_or(false);
            if expired {
                if let Some(info) = core.files.remove(key) {
                    remove_file_logged(info.path());
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            info!(target: "basalt::wal", space = self.space, part = self.part, removed,
                  "cleaned expired wal files");
        }
        if let Some(info) = core.files.values().next() {
            self.first_log_id.store(info.first_id(), Ordering::Release);
        }
    }

    /// Removes every file whose whole range is before `id`. Silent when
    /// `id` is beyond the newest log.
    pub fn clean_before(&self, id: LogId) {
        let mut core = self.core.lock();
        if core.files.is_empty() {
            return;
        }
        if let Some(newest) = core.files.values().next_back() {
            if newest.last_id() < id {
                warn!(
                    target: "basalt::wal",
                    id,
                    last_log_id = newest.last_id(),
                    "asked to clean past the newest wal record"
                );
                return;
            }
        }
        let keys: Vec<LogId> = core.files.keys().copied().collect();
        for key in keys {
            let done = match core.files.get(&key) {
                Some(info) if info.last_id() < id => {
                    if let Some(info) = core.files.remove(&key) {
                        remove_file_logged(info.path());
                    }
                    false
                }
                _ => true,
            };
            if done {
                break;
            }
        }
        if let Some(info) = core.files.values().next() {
            self.first_log_id.store(info.first_id(), Ordering::Release);
        }
    }

    /// Hardlinks every wal file under `new_dir`, for snapshot shipping.
    /// The current file is closed first so its mtime and size are
    /// committed. An existing `new_dir` is cleared.
    pub fn link_current(&self, new_dir: &Path) -> Result<()> {
        let mut core = self.core.lock();
        Self::close_curr(&self.policy, &mut core);
        if core.files.is_empty() {
            info!(target: "basalt::wal", space = self.space, part = self.part,
                  "no wal files, skipping link");
            return Ok(());
        }
        if new_dir.exists() {
            std::fs::remove_dir_all(new_dir)?;
        }
        std::fs::create_dir_all(new_dir)?;
        for (&first_id, info) in core.files.iter() {
            let target = new_dir.join(wal_file_name(first_id));
            std::fs::hard_link(info.path(), &target)?;
            info!(
                target: "basalt::wal",
                src = %info.path().display(),
                dst = %target.display(),
                "linked wal file"
            );
        }
        Ok(())
    }
}

impl Drop for FileWal {
    fn drop(&mut self) {
        let mut core = self.core.lock();
        Self::close_curr(&self.policy, &mut core);
    }
}

/// Walks the survivor file to the record with `logId == id`, truncates
/// everything after it, and returns that record's term.
fn rollback_in_file(info: &mut WalFileInfo, id: LogId) -> Result<TermId> {
    let file = OpenOptions::new().read(true).write(true).open(info.path())?;
    let mut pos: u64 = 0;
    let mut found_term: Option<TermId> = None;
    loop {
        let mut head = [0u8; 20];
        if file.read_exact_at(&mut head, pos).is_err() {
            break;
        }
        let rec_id = LogId::from_le_bytes(head[0..8].try_into().unwrap_or_default());
        let term = TermId::from_le_bytes(head[8..16].try_into().unwrap_or_default());
        let len = i32::from_le_bytes(head[16..20].try_into().unwrap_or_default());
        if len < 0 {
            break;
        }
        pos += record::encoded_len(len as usize) as u64;
        if rec_id == id {
            found_term = Some(term);
            break;
        }
    }

    let term = found_term.ok_or_else(|| {
        Error::Corruption(format!(
            "log {} not found in {} during rollback",
            id,
            info.path().display()
        ))
    })?;

    let disk_size = std::fs::metadata(info.path())?.len();
    if pos < disk_size {
        info!(
            target: "basalt::wal",
            path = %info.path().display(),
            offset = pos,
            "truncating wal file for rollback"
        );
        file.set_len(pos)?;
    }
    info.set_size(pos);
    info.set_last_id(id);
    info.set_last_term(term);
    Ok(term)
}

/// Lists and validates the wal files in `dir`, repairing the newest one.
fn scan_all_wal_files(
    dir: &Path,
    space: SpaceId,
    part: PartitionId,
) -> Result<BTreeMap<LogId, WalFileInfo>> {
    let mut files: BTreeMap<LogId, WalFileInfo> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".wal") {
            continue;
        }
        let Some(start_id) = parse_wal_file_name(&name) else {
            warn!(target: "basalt::wal", file = %name, "ignoring bad wal file name");
            continue;
        };

        let path = entry.path();
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!(target: "basalt::wal", file = %name, error = %e,
                      "cannot stat wal file, ignoring");
                continue;
            }
        };
        let mut info = WalFileInfo::new(path.clone(), start_id);
        info.set_size(meta.len());
        info.set_mtime(file_mtime_secs(&meta));

        if meta.len() == 0 {
            warn!(target: "basalt::wal", file = %name, "found empty wal file");
            files.insert(start_id, info);
            continue;
        }

        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!(target: "basalt::wal", file = %name, error = %e,
                      "cannot open wal file, ignoring");
                continue;
            }
        };

        // The first record's id must match the name.
        let mut id_buf = [0u8; 8];
        if file.read_exact_at(&mut id_buf, 0).is_err() {
            warn!(target: "basalt::wal", file = %name, "cannot read first log id");
            files.insert(start_id, info);
            continue;
        }
        let first_in_file = LogId::from_le_bytes(id_buf);
        if first_in_file != start_id {
            warn!(
                target: "basalt::wal",
                file = %name,
                first_in_file,
                "first log id does not match the file name, ignoring"
            );
            continue;
        }

        // Cheap tail recovery through the footer tombstone; a bad
        // tombstone leaves last_id at 0 so the file reads as needs-scan.
        if let Some((last_id, last_term)) = read_tail_tombstone(&file, meta.len()) {
            info.set_last_id(last_id);
            info.set_last_term(last_term);
        } else {
            warn!(target: "basalt::wal", file = %name,
                  "tail tombstone unreadable, file needs a scan");
        }
        files.insert(start_id, info);
    }

    // The newest file may have a torn tail regardless of its tombstone:
    // scan it record by record and truncate at the first bad offset.
    let newest_key = files.keys().next_back().copied();
    if let Some(key) = newest_key {
        let remove = match files.get_mut(&key) {
            Some(info) => {
                scan_last_file(info)?;
                if info.last_id() == NO_LOG {
                    warn!(target: "basalt::wal", path = %info.path().display(),
                          "newest wal file holds no valid record, removing");
                    remove_file_logged(info.path());
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if remove {
            files.remove(&key);
        }
    }

    // A mid-log gap makes everything before it unreachable history.
    let mut gap_after: Option<LogId> = None;
    let mut prev_last: Option<LogId> = None;
    for info in files.values() {
        if let Some(prev) = prev_last {
            if info.first_id() > prev + 1 {
                warn!(
                    target: "basalt::wal",
                    space, part,
                    gap_before = info.first_id(),
                    prev_last_id = prev,
                    "found a log id gap"
                );
                gap_after = Some(info.first_id());
            }
        }
        prev_last = Some(info.last_id());
    }
    if let Some(boundary) = gap_after {
        let keys: Vec<LogId> = files.range(..boundary).map(|(&k, _)| k).collect();
        for key in keys {
            if let Some(info) = files.remove(&key) {
                info!(target: "basalt::wal", path = %info.path().display(),
                      "removing wal file before the gap");
                remove_file_logged(info.path());
            }
        }
    }

    Ok(files)
}

/// Recovers `(last_id, last_term)` from the record footer at the tail.
/// `None` when the tombstone is missing, implausible, or disagrees with
/// the header length.
fn read_tail_tombstone(file: &File, size: u64) -> Option<(LogId, TermId)> {
    if size < RECORD_OVERHEAD as u64 {
        return None;
    }
    let mut len_buf = [0u8; 4];
    file.read_exact_at(&mut len_buf, size - 4).ok()?;
    let foot = i32::from_le_bytes(len_buf);
    if foot < 0 {
        return None;
    }
    let record_len = record::encoded_len(foot as usize) as u64;
    if record_len > size {
        return None;
    }
    let record_start = size - record_len;

    file.read_exact_at(&mut len_buf, record_start + 16).ok()?;
    let head = i32::from_le_bytes(len_buf);
    if head != foot {
        return None;
    }

    let mut id_term = [0u8; 16];
    file.read_exact_at(&mut id_term, record_start).ok()?;
    let last_id = LogId::from_le_bytes(id_term[0..8].try_into().ok()?);
    let last_term = TermId::from_le_bytes(id_term[8..16].try_into().ok()?);
    Some((last_id, last_term))
}

/// Walks the newest file from the front: ids must be consecutive from the
/// file name and every record's header and footer lengths must agree.
/// Truncates at the first bad offset.
fn scan_last_file(info: &mut WalFileInfo) -> Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(info.path())?;
    let mut expected = info.first_id();
    let mut pos: u64 = 0;
    info.set_last_id(NO_LOG);
    info.set_last_term(0);

    loop {
        let mut head = [0u8; 20];
        if file.read_exact_at(&mut head, pos).is_err() {
            break;
        }
        let id = LogId::from_le_bytes(head[0..8].try_into().unwrap_or_default());
        if id != expected {
            warn!(
                target: "basalt::wal",
                path = %info.path().display(),
                found = id,
                expected,
                "log id not consecutive"
            );
            break;
        }
        let term = TermId::from_le_bytes(head[8..16].try_into().unwrap_or_default());
        let head_len = i32::from_le_bytes(head[16..20].try_into().unwrap_or_default());
        if head_len < 0 {
            break;
        }

        let mut foot_buf = [0u8; 4];
        if file
            .read_exact_at(&mut foot_buf, pos + MSG_OFFSET + head_len as u64)
            .is_err()
        {
            break;
        }
        let foot_len = i32::from_le_bytes(foot_buf);
        if head_len != foot_len {
            warn!(
                target: "basalt::wal",
                path = %info.path().display(),
                head_len, foot_len,
                "message length mismatch"
            );
            break;
        }

        info.set_last_id(id);
        info.set_last_term(term);
        pos += record::encoded_len(head_len as usize) as u64;
        expected += 1;
    }

    let disk_size = std::fs::metadata(info.path())?.len();
    if pos < disk_size {
        warn!(
            target: "basalt::wal",
            path = %info.path().display(),
            offset = pos,
            "truncating torn wal tail"
        );
        file.set_len(pos)?;
        info.set_size(pos);
    }
    Ok(())
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(target: "basalt::wal", path = %path.display(), error = %e,
              "failed to remove wal file");
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn file_mtime_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Rewrites a file's atime/mtime, so a freshly closed file carries its
/// close time even on filesystems with lazy mtime updates.
fn commit_mtime(path: &Path, secs: i64) {
    let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
        return;
    };
    let times = libc::utimbuf {
        actime: secs,
        modtime: secs,
    };
    let rc = unsafe { libc::utime(cpath.as_ptr(), &times) };
    if rc != 0 {
        warn!(
            target: "basalt::wal",
            path = %path.display(),
            error = %std::io::Error::last_os_error(),
            "failed to set wal file mtime"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    fn open_wal(dir: &Path, policy: WalPolicy) -> FileWal {
        FileWal::open(dir, 1, 1, policy, None, None).unwrap()
    }

    fn append_n(wal: &FileWal, from: LogId, count: u64, term: TermId, msg_len: usize) {
        for id in from..from + count {
            let msg = vec![(id % 251) as u8; msg_len];
            wal.append_log(id, term, 0, &msg).unwrap();
        }
    }

    fn wal_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.ends_with(".wal"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());

        wal.append_log(1, 1, 0, b"a").unwrap();
        wal.append_log(2, 1, 0, b"bb").unwrap();
        wal.append_log(3, 2, 0, b"ccc").unwrap();

        assert_eq!(wal.last_log_id(), 3);
        assert_eq!(wal.last_log_term(), 2);
        assert_eq!(wal.first_log_id(), 1);

        let entries: Vec<LogEntry> = wal.iterator(1, 3).map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], LogEntry::new(1, 1, 0, b"a".to_vec()));
        assert_eq!(entries[1], LogEntry::new(2, 1, 0, b"bb".to_vec()));
        assert_eq!(entries[2], LogEntry::new(3, 2, 0, b"ccc".to_vec()));
    }

    #[test]
    fn iterator_reads_from_files_when_buffer_missed() {
        let dir = tempfile::tempdir().unwrap();
        // Buffer holds barely one record, so earlier records get evicted.
        let policy = WalPolicy {
            buffer_size: 64,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        append_n(&wal, 1, 10, 1, 20);

        let entries: Vec<LogEntry> = wal.iterator(1, 10).map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 10);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.id, i as u64 + 1);
            assert_eq!(e.msg, vec![(e.id % 251) as u8; 20]);
        }
    }

    #[test]
    fn rollover_splits_files_and_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            file_size: 64,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        append_n(&wal, 1, 10, 1, 20);

        let files = wal_files(dir.path());
        assert!(files.len() >= 3, "expected at least 3 files, got {files:?}");
        assert_eq!(files[0], wal_file_name(1));

        // Adjacent files: next.first == prev.last + 1.
        let mut infos = Vec::new();
        wal.access_all_info(|info| {
            infos.push((info.first_id(), info.last_id()));
            true
        });
        infos.reverse();
        for pair in infos.windows(2) {
            assert_eq!(pair[1].0, pair[0].1 + 1);
        }

        // Concatenating the files reproduces the input.
        let entries: Vec<LogEntry> = wal.iterator(1, 10).map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 10);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.id, i as u64 + 1);
        }
    }

    #[test]
    fn gap_append_fails_and_leaves_state() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());
        append_n(&wal, 1, 3, 1, 4);

        let err = wal.append_log(5, 1, 0, b"gap").unwrap_err();
        assert!(matches!(
            err,
            Error::LogGap {
                last: 3,
                appending: 5
            }
        ));
        assert_eq!(wal.last_log_id(), 3);
        assert_eq!(wal.iterator(1, 3).count(), 3);
    }

    #[test]
    fn reopen_after_clean_close() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = open_wal(dir.path(), WalPolicy::default());
            append_n(&wal, 1, 5, 3, 8);
        }
        let wal = open_wal(dir.path(), WalPolicy::default());
        assert_eq!(wal.first_log_id(), 1);
        assert_eq!(wal.last_log_id(), 5);
        assert_eq!(wal.last_log_term(), 3);

        // And the log keeps going.
        wal.append_log(6, 3, 0, b"next").unwrap();
        assert_eq!(wal.last_log_id(), 6);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = open_wal(dir.path(), WalPolicy::default());
            wal.append_log(1, 1, 0, b"a").unwrap();
            wal.append_log(2, 1, 0, b"bb").unwrap();
            wal.append_log(3, 2, 0, b"ccc").unwrap();
        }

        // Tear 5 bytes off the tail: record 3 is now incomplete.
        let path = dir.path().join(wal_file_name(1));
        let size = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(size - 5).unwrap();
        drop(file);

        let wal = open_wal(dir.path(), WalPolicy::default());
        assert_eq!(wal.last_log_id(), 2);
        assert_eq!(wal.last_log_term(), 1);

        // The file ends exactly after record 2's footer.
        let expected = (record::encoded_len(1) + record::encoded_len(2)) as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);

        let entries: Vec<LogEntry> = wal.iterator(1, 2).map(|r| r.unwrap()).collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn first_id_name_mismatch_ignores_file() {
        let dir = tempfile::tempdir().unwrap();
        {
            let wal = open_wal(dir.path(), WalPolicy::default());
            wal.append_log(1, 1, 0, b"abc").unwrap();
        }
        // Corrupt the very first record's id.
        let path = dir.path().join(wal_file_name(1));
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&[0xFF; 8], 0).unwrap();
        drop(file);

        // The name/first-id mismatch drops the file from the index; the
        // log comes up empty.
        let wal = open_wal(dir.path(), WalPolicy::default());
        assert_eq!(wal.first_log_id(), NO_LOG);
        assert_eq!(wal.last_log_id(), NO_LOG);
    }

    #[test]
    fn gap_between_files_drops_older_history() {
        let dir = tempfile::tempdir().unwrap();

        // Two files with a hole between them: records 1..=2 and 100..=101.
        let write_file = |start: LogId| {
            let mut buf = Vec::new();
            record::encode_record(start, 1, 0, b"one", &mut buf);
            record::encode_record(start + 1, 1, 0, b"two", &mut buf);
            std::fs::write(dir.path().join(wal_file_name(start)), &buf).unwrap();
        };
        write_file(1);
        write_file(100);

        let wal = open_wal(dir.path(), WalPolicy::default());
        assert_eq!(wal.first_log_id(), 100);
        assert_eq!(wal.last_log_id(), 101);
        assert_eq!(wal_files(dir.path()), vec![wal_file_name(100)]);
    }

    #[test]
    fn rollback_truncates_and_invalidates_iterators() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());
        wal.append_log(1, 1, 0, b"a").unwrap();
        wal.append_log(2, 1, 0, b"bb").unwrap();
        wal.append_log(3, 2, 0, b"ccc").unwrap();

        wal.rollback_to_log(2).unwrap();
        assert_eq!(wal.last_log_id(), 2);
        assert_eq!(wal.last_log_term(), 1);

        assert_eq!(wal.iterator(3, 3).count(), 0);

        let path = dir.path().join(wal_file_name(1));
        let expected = (record::encoded_len(1) + record::encoded_len(2)) as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected);

        // The log continues from the rollback point.
        wal.append_log(3, 5, 0, b"replacement").unwrap();
        assert_eq!(wal.last_log_id(), 3);
        assert_eq!(wal.last_log_term(), 5);
    }

    #[test]
    fn rollback_across_files_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            file_size: 64,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        append_n(&wal, 1, 10, 1, 20);
        assert!(wal_files(dir.path()).len() >= 3);

        wal.rollback_to_log(1).unwrap();
        assert_eq!(wal.last_log_id(), 1);
        assert_eq!(wal_files(dir.path()), vec![wal_file_name(1)]);
    }

    #[test]
    fn rollback_to_before_first_empties_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());
        append_n(&wal, 1, 3, 1, 4);

        wal.rollback_to_log(0).unwrap();
        assert_eq!(wal.first_log_id(), NO_LOG);
        assert_eq!(wal.last_log_id(), NO_LOG);

        // A fresh epoch may start at any id.
        wal.append_log(7, 1, 0, b"restart").unwrap();
        assert_eq!(wal.first_log_id(), 7);
    }

    #[test]
    fn rollback_out_of_range_fails() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());
        append_n(&wal, 5, 3, 1, 4); // ids 5..=7 (fresh log may start anywhere)

        assert!(matches!(
            wal.rollback_to_log(8),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            wal.rollback_to_log(3),
            Err(Error::OutOfRange { .. })
        ));
        // first - 1 is allowed.
        wal.rollback_to_log(4).unwrap();
        assert_eq!(wal.last_log_id(), NO_LOG);
    }

    #[test]
    fn reset_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            file_size: 64,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        append_n(&wal, 1, 10, 1, 20);

        wal.reset().unwrap();
        assert_eq!(wal.first_log_id(), NO_LOG);
        assert_eq!(wal.last_log_id(), NO_LOG);
        assert!(wal_files(dir.path()).is_empty());
    }

    #[test]
    fn ttl_cleanup_keeps_newest_two() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            file_size: 64,
            ttl: std::time::Duration::from_secs(3600),
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy.clone());
        append_n(&wal, 1, 10, 1, 20);
        let before = wal_files(dir.path());
        assert!(before.len() > 2);

        // Age every file's recorded mtime far past the TTL.
        let ancient = now_secs() - 7200;
        for name in &before {
            commit_mtime(&dir.path().join(name), ancient);
        }
        // Recorded mtimes come from the scan, so reopen.
        drop(wal);
        let wal = open_wal(dir.path(), policy);
        wal.clean_expired();

        let after = wal_files(dir.path());
        assert_eq!(after.len(), 2);
        assert_eq!(after, before[before.len() - 2..].to_vec());

        // firstLogId tracks the first surviving file.
        let survivor_first = parse_wal_file_name(&after[0]).unwrap();
        assert_eq!(wal.first_log_id(), survivor_first);
    }

    #[test]
    fn clean_before_removes_wholly_older_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            file_size: 64,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        append_n(&wal, 1, 10, 1, 20);

        let mut ranges = Vec::new();
        wal.access_all_info(|info| {
            ranges.push((info.first_id(), info.last_id()));
            true
        });
        ranges.reverse();
        assert!(ranges.len() >= 3);

        // Clean up to the second file's first id: only the first file goes.
        let target = ranges[1].0;
        wal.clean_before(target);
        assert_eq!(wal.first_log_id(), target);

        // Beyond the newest record: silent no-op.
        let files_before = wal_files(dir.path());
        wal.clean_before(1000);
        assert_eq!(wal_files(dir.path()), files_before);
    }

    #[test]
    fn link_current_hardlinks_byte_identical_files() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            file_size: 64,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        append_n(&wal, 1, 6, 1, 20);

        let snap = dir.path().join("snapshot");
        wal.link_current(&snap).unwrap();

        for name in wal_files(dir.path()) {
            let mut src = Vec::new();
            File::open(dir.path().join(&name))
                .unwrap()
                .read_to_end(&mut src)
                .unwrap();
            let mut dst = Vec::new();
            File::open(snap.join(&name))
                .unwrap()
                .read_to_end(&mut dst)
                .unwrap();
            assert_eq!(src, dst, "snapshot of {name} differs");
        }

        // Appends keep working after the link.
        wal.append_log(7, 1, 0, b"after-link").unwrap();
        assert_eq!(wal.last_log_id(), 7);
    }

    #[test]
    fn preprocessor_can_reject() {
        let dir = tempfile::tempdir().unwrap();
        let pre: PreProcessor = Box::new(|id, _, _, _| id != 2);
        let wal = FileWal::open(dir.path(), 1, 1, WalPolicy::default(), Some(pre), None).unwrap();

        wal.append_log(1, 1, 0, b"ok").unwrap();
        assert!(matches!(
            wal.append_log(2, 1, 0, b"no"),
            Err(Error::PreprocessorRejected(2))
        ));
        assert_eq!(wal.last_log_id(), 1);
    }

    #[test]
    fn disk_manager_refusal_is_no_space() {
        struct FullDisk;
        impl DiskManager for FullDisk {
            fn has_enough_space(&self, _: SpaceId, _: PartitionId) -> bool {
                false
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::open(
            dir.path(),
            1,
            1,
            WalPolicy::default(),
            None,
            Some(Arc::new(FullDisk)),
        )
        .unwrap();
        assert!(matches!(
            wal.append_log(1, 1, 0, b"x"),
            Err(Error::NoSpace(1, 1))
        ));
    }

    #[test]
    fn stopped_wal_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());
        wal.append_log(1, 1, 0, b"x").unwrap();
        wal.stop();
        assert!(matches!(
            wal.append_log(2, 1, 0, b"y"),
            Err(Error::Stopped)
        ));
    }

    #[test]
    fn append_logs_batch() {
        let dir = tempfile::tempdir().unwrap();
        let wal = open_wal(dir.path(), WalPolicy::default());
        let batch = (1..=4)
            .map(|id| LogEntry::new(id, 1, 0, vec![id as u8]))
            .collect::<Vec<_>>();
        wal.append_logs(batch).unwrap();
        assert_eq!(wal.last_log_id(), 4);
        assert_eq!(wal.iterator(1, 4).count(), 4);
    }

    #[test]
    fn fsync_policy_writes_are_readable_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let policy = WalPolicy {
            sync: true,
            ..WalPolicy::default()
        };
        let wal = open_wal(dir.path(), policy);
        wal.append_log(1, 1, 7, b"synced").unwrap();

        // Verify the bytes really are on disk, not just in the buffer.
        let mut raw = Vec::new();
        let mut f = File::open(dir.path().join(wal_file_name(1))).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut raw).unwrap();
        let (entry, used) = record::decode_record(&raw).unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(entry, LogEntry::new(1, 1, 7, b"synced".to_vec()));
    }
}
