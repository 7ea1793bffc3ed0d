//! The command a partition logs before applying.
//!
//! One WAL record carries one whole batch, so log-then-apply keeps batch
//! atomicity: the engine applies the batch with one atomic write after the
//! record is durable.
//!
//! ```text
//! [op: u8][count: u32] then per entry:
//!   multi-put:    [key_len u32][key][val_len u32][value]
//!   multi-remove: [key_len u32][key]
//! ```

use basalt_core::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const OP_MULTI_PUT: u8 = 1;
const OP_MULTI_REMOVE: u8 = 2;

/// A logged state-machine command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalCommand {
    MultiPut(Vec<(Vec<u8>, Vec<u8>)>),
    MultiRemove(Vec<Vec<u8>>),
}

impl WalCommand {
    /// Serializes the command into a WAL message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        match self {
            WalCommand::MultiPut(kvs) => {
                out.write_u8(OP_MULTI_PUT).unwrap();
                out.write_u32::<LittleEndian>(kvs.len() as u32).unwrap();
                for (key, value) in kvs {
                    out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
                    out.extend_from_slice(key);
                    out.write_u32::<LittleEndian>(value.len() as u32).unwrap();
                    out.extend_from_slice(value);
                }
            }
            WalCommand::MultiRemove(keys) => {
                out.write_u8(OP_MULTI_REMOVE).unwrap();
                out.write_u32::<LittleEndian>(keys.len() as u32).unwrap();
                for key in keys {
                    out.write_u32::<LittleEndian>(key.len() as u32).unwrap();
                    out.extend_from_slice(key);
                }
            }
        }
        out
    }

    /// Parses a WAL message back into a command, for replay.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let op = buf.read_u8()?;
        let count = buf.read_u32::<LittleEndian>()? as usize;
        match op {
            OP_MULTI_PUT => {
                let mut kvs = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = read_chunk(&mut buf)?;
                    let value = read_chunk(&mut buf)?;
                    kvs.push((key, value));
                }
                Ok(WalCommand::MultiPut(kvs))
            }
            OP_MULTI_REMOVE => {
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(read_chunk(&mut buf)?);
                }
                Ok(WalCommand::MultiRemove(keys))
            }
            other => Err(Error::Corruption(format!(
                "unknown wal command op {other}"
            ))),
        }
    }
}

fn read_chunk(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = buf.read_u32::<LittleEndian>()? as usize;
    if len > buf.len() {
        return Err(Error::Corruption(
            "wal command chunk overruns the message".into(),
        ));
    }
    let chunk = buf[..len].to_vec();
    *buf = &buf[len..];
    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_put_roundtrip() {
        let cmd = WalCommand::MultiPut(vec![
            (b"k1".to_vec(), b"v1".to_vec()),
            (b"k2".to_vec(), Vec::new()),
        ]);
        assert_eq!(WalCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn multi_remove_roundtrip() {
        let cmd = WalCommand::MultiRemove(vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(WalCommand::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn truncated_message_is_corruption() {
        let cmd = WalCommand::MultiPut(vec![(b"key".to_vec(), b"value".to_vec())]);
        let bytes = cmd.encode();
        assert!(matches!(
            WalCommand::decode(&bytes[..bytes.len() - 2]),
            Err(Error::Corruption(_)) | Err(Error::Io(_))
        ));
    }

    #[test]
    fn unknown_op_is_corruption() {
        assert!(matches!(
            WalCommand::decode(&[9, 0, 0, 0, 0]),
            Err(Error::Corruption(_))
        ));
    }
}
