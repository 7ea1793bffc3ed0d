//! Key-value separation: the blob log.
//!
//! Values past the separation threshold are spilled into append-only blob
//! files at flush time; the table then stores a fixed 16-byte [`BlobRef`]
//! instead of the value, so compaction shuffles small records without
//! rewriting the large payloads.
//!
//! Blob frame: `[raw_len u32][disk_len u32][crc32 u32][payload]`, payload
//! compressed with the blob codec. A ref addresses the whole frame.
//!
//! Garbage collection rides on full compactions: the store rotates to a
//! fresh file, every live ref gets rewritten into it, and the files before
//! the boundary are retired.

use crate::table::{compress, decompress};
use crate::tuning::CompressionKind;
use basalt_core::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Rotate the active blob file past this size.
const BLOB_FILE_TARGET_BYTES: u64 = 64 * 1024 * 1024;

const FRAME_HEADER_BYTES: u32 = 12;

/// Fixed-size pointer a table record stores instead of a large value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobRef {
    pub file_no: u32,
    pub offset: u64,
    pub len: u32,
}

impl BlobRef {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.write_u32::<LittleEndian>(self.file_no).unwrap();
        out.write_u64::<LittleEndian>(self.offset).unwrap();
        out.write_u32::<LittleEndian>(self.len).unwrap();
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != 16 {
            return Err(Error::Corruption(format!(
                "blob ref must be 16 bytes, got {}",
                buf.len()
            )));
        }
        Ok(BlobRef {
            file_no: buf.read_u32::<LittleEndian>()?,
            offset: buf.read_u64::<LittleEndian>()?,
            len: buf.read_u32::<LittleEndian>()?,
        })
    }
}

struct ActiveBlob {
    file_no: u32,
    file: File,
    offset: u64,
}

/// Append-only store of separated values.
pub struct BlobStore {
    dir: PathBuf,
    codec: CompressionKind,
    active: Mutex<ActiveBlob>,
    readers: Mutex<HashMap<u32, File>>,
}

fn blob_file_name(file_no: u32) -> String {
    format!("{:06}.blob", file_no)
}

fn parse_blob_file_name(name: &str) -> Option<u32> {
    name.strip_suffix(".blob")?.parse().ok()
}

impl BlobStore {
    pub fn open(dir: impl Into<PathBuf>, codec: CompressionKind) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut newest: u32 = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(no) = parse_blob_file_name(&entry.file_name().to_string_lossy()) {
                newest = newest.max(no);
            }
        }
        let file_no = newest.max(1);
        let path = dir.join(blob_file_name(file_no));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let offset = file.metadata()?.len();

        Ok(BlobStore {
            dir,
            codec,
            active: Mutex::new(ActiveBlob {
                file_no,
                file,
                offset,
            }),
            readers: Mutex::new(HashMap::new()),
        })
    }

    /// Appends one value, returning the ref a table should store.
    pub fn append(&self, value: &[u8]) -> Result<BlobRef> {
        let payload = compress(self.codec, value)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES as usize + payload.len());
        frame.write_u32::<LittleEndian>(value.len() as u32)?;
        frame.write_u32::<LittleEndian>(payload.len() as u32)?;
        frame.write_u32::<LittleEndian>(crc)?;
        frame.extend_from_slice(&payload);

        let mut active = self.active.lock();
        if active.offset + frame.len() as u64 > BLOB_FILE_TARGET_BYTES && active.offset > 0 {
            self.rotate_locked(&mut active)?;
        }
        let blob_ref = BlobRef {
            file_no: active.file_no,
            offset: active.offset,
            len: frame.len() as u32,
        };
        active.file.write_all(&frame)?;
        active.offset += frame.len() as u64;
        Ok(blob_ref)
    }

    /// Resolves a ref back to the value bytes.
    pub fn read(&self, blob_ref: &BlobRef) -> Result<Vec<u8>> {
        if blob_ref.len < FRAME_HEADER_BYTES {
            return Err(Error::Corruption(format!(
                "blob frame of {} bytes is shorter than its header",
                blob_ref.len
            )));
        }
        let mut frame = vec![0u8; blob_ref.len as usize];
        self.with_reader(blob_ref.file_no, |file| {
            file.read_exact_at(&mut frame, blob_ref.offset)
                .map_err(Error::Io)
        })?;

        let mut rdr: &[u8] = &frame;
        let raw_len = rdr.read_u32::<LittleEndian>()? as usize;
        let disk_len = rdr.read_u32::<LittleEndian>()? as usize;
        let crc = rdr.read_u32::<LittleEndian>()?;
        if disk_len != rdr.len() {
            return Err(Error::Corruption("blob frame length mismatch".into()));
        }
        let mut hasher = Crc32::new();
        hasher.update(rdr);
        if hasher.finalize() != crc {
            return Err(Error::Corruption("blob frame crc mismatch".into()));
        }
        decompress(self.codec, rdr, raw_len)
    }

    fn with_reader<T>(&self, file_no: u32, f: impl FnOnce(&File) -> Result<T>) -> Result<T> {
        let mut readers = self.readers.lock();
        if !readers.contains_key(&file_no) {
            let file = File::open(self.dir.join(blob_file_name(file_no)))?;
            readers.insert(file_no, file);
        }
        let file = readers
            .get(&file_no)
            .ok_or_else(|| Error::Corruption("blob reader vanished".into()))?;
        f(file)
    }

    /// Makes appended frames durable.
    pub fn sync(&self) -> Result<()> {
        self.active.lock().file.sync_data()?;
        Ok(())
    }

    /// Starts a rewrite epoch: rotates to a fresh file and returns its
    /// number. Everything appended from here on lands at or past it.
    pub fn begin_rewrite(&self) -> Result<u32> {
        let mut active = self.active.lock();
        if active.offset > 0 {
            self.rotate_locked(&mut active)?;
        }
        Ok(active.file_no)
    }

    /// Deletes blob files older than `boundary`; valid only after every
    /// live ref has been rewritten past it.
    pub fn retire_before(&self, boundary: u32) -> Result<()> {
        let active_no = self.active.lock().file_no;
        let mut readers = self.readers.lock();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(no) = parse_blob_file_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if no < boundary && no != active_no {
                readers.remove(&no);
                info!(target: "basalt::engine", path = %entry.path().display(),
                      "retiring blob file");
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn rotate_locked(&self, active: &mut ActiveBlob) -> Result<()> {
        active.file.sync_data()?;
        let file_no = active.file_no + 1;
        let path = self.dir.join(blob_file_name(file_no));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        *active = ActiveBlob {
            file_no,
            file,
            offset: 0,
        };
        Ok(())
    }
}
