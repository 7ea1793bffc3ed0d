//! The engine-internal journal.
//!
//! Every batch is one self-contained frame, so batch atomicity falls out
//! of the framing: a frame either replays whole or not at all.
//!
//! ```text
//! [frame_len: u32 LE][crc32: u32 LE][body ...]
//! body: [seq: u64][count: u32] then per op:
//!   put: [0: u8][key_len: u32][key][val_len: u32][value]
//!   del: [1: u8][key_len: u32][key]
//! ```
//!
//! `frame_len` counts the CRC and the body but not itself. A truncated
//! tail frame (crash mid-write) replays as a clean EOF; a CRC mismatch in
//! the middle of the file is corruption.

use basalt_core::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Upper bound on one frame; anything larger reads as corruption.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// One write in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

impl BatchOp {
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put(k, _) => k,
            BatchOp::Delete(k) => k,
        }
    }
}

/// Append-only journal writer.
pub struct JournalWriter {
    file: File,
    path: PathBuf,
    sync: bool,
    buf: Vec<u8>,
}

impl JournalWriter {
    /// Opens (or creates) the journal in append mode.
    pub fn open(path: impl Into<PathBuf>, sync: bool) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(JournalWriter {
            file,
            path,
            sync,
            buf: Vec::with_capacity(4 * 1024),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one batch as a single frame and optionally fsyncs.
    pub fn append_batch(&mut self, seq: u64, ops: &[BatchOp]) -> Result<()> {
        self.buf.clear();
        // Frame header is filled in after the body is known.
        self.buf.extend_from_slice(&[0u8; 8]);

        self.buf.write_u64::<LittleEndian>(seq)?;
        self.buf.write_u32::<LittleEndian>(ops.len() as u32)?;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    self.buf.write_u8(0)?;
                    self.buf.write_u32::<LittleEndian>(key.len() as u32)?;
                    self.buf.extend_from_slice(key);
                    self.buf.write_u32::<LittleEndian>(value.len() as u32)?;
                    self.buf.extend_from_slice(value);
                }
                BatchOp::Delete(key) => {
                    self.buf.write_u8(1)?;
                    self.buf.write_u32::<LittleEndian>(key.len() as u32)?;
                    self.buf.extend_from_slice(key);
                }
            }
        }

        let body_len = self.buf.len() - 8;
        let frame_len = body_len as u64 + 4;
        if frame_len > MAX_FRAME_BYTES as u64 {
            return Err(Error::InvalidArgument(format!(
                "journal batch of {frame_len} bytes exceeds the frame cap"
            )));
        }
        let mut hasher = Crc32::new();
        hasher.update(&self.buf[8..]);
        let crc = hasher.finalize();
        self.buf[0..4].copy_from_slice(&(frame_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        self.file.write_all(&self.buf)?;
        if self.sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Forces buffered frames onto disk.
    pub fn sync_to_disk(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Replays every complete batch, calling `apply(seq, ops)` for each.
/// Returns the highest sequence number seen. A missing file replays as
/// empty.
pub fn replay(path: &Path, mut apply: impl FnMut(u64, Vec<BatchOp>)) -> Result<u64> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(Error::Io(e)),
    };
    let mut rdr = BufReader::new(file);
    let mut max_seq = 0u64;
    let mut body = Vec::with_capacity(4 * 1024);

    loop {
        let frame_len = match rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(max_seq),
            Err(e) => return Err(Error::Io(e)),
        };
        if frame_len <= 4 || frame_len > MAX_FRAME_BYTES {
            return Err(Error::Corruption(format!(
                "journal frame length {frame_len} out of bounds"
            )));
        }
        let crc = match rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(max_seq),
            Err(e) => return Err(Error::Io(e)),
        };

        body.clear();
        body.resize((frame_len - 4) as usize, 0);
        match rdr.read_exact(&mut body) {
            Ok(()) => {}
            // Torn tail: everything before it already replayed.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(max_seq),
            Err(e) => return Err(Error::Io(e)),
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            return Err(Error::Corruption("journal frame crc mismatch".into()));
        }

        let mut br: &[u8] = &body;
        let seq = br.read_u64::<LittleEndian>()?;
        let count = br.read_u32::<LittleEndian>()? as usize;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            let op = br.read_u8()?;
            let key_len = br.read_u32::<LittleEndian>()? as usize;
            if key_len > br.len() {
                return Err(Error::Corruption("journal key overruns frame".into()));
            }
            let mut key = vec![0u8; key_len];
            br.read_exact(&mut key)?;
            match op {
                0 => {
                    let val_len = br.read_u32::<LittleEndian>()? as usize;
                    if val_len > br.len() {
                        return Err(Error::Corruption("journal value overruns frame".into()));
                    }
                    let mut value = vec![0u8; val_len];
                    br.read_exact(&mut value)?;
                    ops.push(BatchOp::Put(key, value));
                }
                1 => ops.push(BatchOp::Delete(key)),
                other => {
                    return Err(Error::Corruption(format!(
                        "unknown journal op code {other}"
                    )))
                }
            }
        }
        max_seq = max_seq.max(seq);
        apply(seq, ops);
    }
}
