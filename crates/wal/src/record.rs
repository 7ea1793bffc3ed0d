//! The on-disk record codec.
//!
//! A record is the concatenation
//!
//! ```text
//! [ 8 bytes logId ][ 8 bytes termId ][ 4 bytes msgLen ]
//! [ 8 bytes clusterId ][ msgLen bytes msg ]
//! [ 4 bytes msgLen ]
//! ```
//!
//! with every integer little-endian. The trailing length duplicates the
//! header length; a record is valid iff both are present, equal, and the
//! file is long enough. Files are exactly concatenated records with no
//! header or padding.

use basalt_core::{ClusterId, Error, LogId, Result, TermId};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Fixed bytes around the message: id + term + msgLen + clusterId + msgLen.
pub const RECORD_OVERHEAD: usize = 8 + 8 + 4 + 8 + 4;

/// Byte offset of the message length field inside a record.
pub const MSG_LEN_OFFSET: u64 = 16;

/// Byte offset of the cluster id field inside a record.
pub const CLUSTER_OFFSET: u64 = 20;

/// Byte offset of the message bytes inside a record.
pub const MSG_OFFSET: u64 = 28;

/// One log record, owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: LogId,
    pub term: TermId,
    pub cluster: ClusterId,
    pub msg: Vec<u8>,
}

impl LogEntry {
    pub fn new(id: LogId, term: TermId, cluster: ClusterId, msg: Vec<u8>) -> Self {
        LogEntry {
            id,
            term,
            cluster,
            msg,
        }
    }

    /// Total record size on disk.
    pub fn encoded_len(&self) -> usize {
        RECORD_OVERHEAD + self.msg.len()
    }
}

/// Record size for a message of `msg_len` bytes.
pub fn encoded_len(msg_len: usize) -> usize {
    RECORD_OVERHEAD + msg_len
}

/// Serializes one record into `out`. The buffer is appended to, not
/// cleared, so a batch can be packed into one write.
pub fn encode_record(id: LogId, term: TermId, cluster: ClusterId, msg: &[u8], out: &mut Vec<u8>) {
    out.reserve(encoded_len(msg.len()));
    // Writes into a Vec cannot fail.
    out.write_u64::<LittleEndian>(id).unwrap();
    out.write_u64::<LittleEndian>(term).unwrap();
    out.write_i32::<LittleEndian>(msg.len() as i32).unwrap();
    out.write_i64::<LittleEndian>(cluster).unwrap();
    out.extend_from_slice(msg);
    out.write_i32::<LittleEndian>(msg.len() as i32).unwrap();
}

/// Parses one record from the front of `buf`.
///
/// Returns the entry and the bytes consumed. Fails with `Corruption` when
/// the buffer is too short or the header and footer lengths disagree.
pub fn decode_record(buf: &[u8]) -> Result<(LogEntry, usize)> {
    if buf.len() < RECORD_OVERHEAD {
        return Err(Error::Corruption(format!(
            "record truncated: {} bytes, need at least {}",
            buf.len(),
            RECORD_OVERHEAD
        )));
    }
    let mut rdr = buf;
    let id = rdr.read_u64::<LittleEndian>()?;
    let term = rdr.read_u64::<LittleEndian>()?;
    let head = rdr.read_i32::<LittleEndian>()?;
    let cluster = rdr.read_i64::<LittleEndian>()?;
    if head < 0 {
        return Err(Error::Corruption(format!("negative message length {head}")));
    }
    let msg_len = head as usize;
    let total = encoded_len(msg_len);
    if buf.len() < total {
        return Err(Error::Corruption(format!(
            "record truncated: {} bytes, need {}",
            buf.len(),
            total
        )));
    }
    let msg = buf[MSG_OFFSET as usize..MSG_OFFSET as usize + msg_len].to_vec();
    let foot = (&buf[MSG_OFFSET as usize + msg_len..])
        .read_i32::<LittleEndian>()?;
    if foot != head {
        return Err(Error::Corruption(format!(
            "length mismatch: header {head}, footer {foot}"
        )));
    }
    Ok((LogEntry::new(id, term, cluster, msg), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_is_bit_exact() {
        let mut buf = Vec::new();
        encode_record(0x0102030405060708, 0x1112131415161718, -2, b"xyz", &mut buf);

        assert_eq!(buf.len(), RECORD_OVERHEAD + 3);
        // logId, little-endian
        assert_eq!(&buf[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        // termId
        assert_eq!(&buf[8..16], &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]);
        // msgLen header
        assert_eq!(&buf[16..20], &[3, 0, 0, 0]);
        // clusterId -2, two's complement little-endian
        assert_eq!(&buf[20..28], &[0xFE, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        // msg
        assert_eq!(&buf[28..31], b"xyz");
        // msgLen footer
        assert_eq!(&buf[31..35], &[3, 0, 0, 0]);
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut buf = Vec::new();
        encode_record(1, 1, 0, b"abcd", &mut buf);
        let foot_at = buf.len() - 4;
        buf[foot_at] ^= 0x01;
        assert!(matches!(decode_record(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn decode_rejects_truncation() {
        let mut buf = Vec::new();
        encode_record(1, 1, 0, b"abcd", &mut buf);
        buf.truncate(buf.len() - 5);
        assert!(matches!(decode_record(&buf), Err(Error::Corruption(_))));
    }

    #[test]
    fn batch_packs_into_one_buffer() {
        let mut buf = Vec::new();
        encode_record(1, 1, 0, b"a", &mut buf);
        encode_record(2, 1, 0, b"bb", &mut buf);

        let (first, used) = decode_record(&buf).unwrap();
        assert_eq!(first.id, 1);
        let (second, _) = decode_record(&buf[used..]).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.msg, b"bb");
    }

    proptest! {
        #[test]
        fn roundtrip(id in 1u64..u64::MAX, term in 0u64..u64::MAX,
                     cluster in any::<i64>(), msg in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = Vec::new();
            encode_record(id, term, cluster, &msg, &mut buf);
            let (entry, used) = decode_record(&buf).unwrap();
            prop_assert_eq!(used, buf.len());
            prop_assert_eq!(entry, LogEntry::new(id, term, cluster, msg));
        }
    }
}
