//! WAL record wire format
//!
//! Records are written back-to-back with no padding:
//!
//! ```text
//! magic (u32 LE) | version (u32 LE) | lsn (u64 LE) | txn_id (u64 LE)
//! op_type (u8) | flags (u8) | reserved (u16 LE) | payload_len (u32 LE)
//! header_checksum (u32 LE)          -- CRC32 of the preceding 32 bytes
//! payload (payload_len bytes)       -- bincode-encoded WalPayload
//! record_checksum (u32 LE)          -- CRC32 of header + payload
//! ```
//!
//! A record is durable iff its byte range has been fsynced.

use serde::{Deserialize, Serialize};

use crate::error::{MantisError, MantisResult};

/// Log Sequence Number - strictly monotonic record identifier
pub type LSN = u64;

/// Transaction identifier; monotonic, so the highest id is the youngest
pub type TxnId = u64;

/// Header magic: "WAL\0"
pub const WAL_MAGIC: u32 = 0x5741_4C00;
/// Wire format version
pub const WAL_VERSION: u32 = 1;
/// Fixed header length in bytes
pub const HEADER_LEN: usize = 36;
/// Trailing record checksum length in bytes
pub const TRAILER_LEN: usize = 4;

/// Operations captured in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Insert,
    Update,
    Delete,
    Commit,
    Abort,
}

impl WalOp {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
            Self::Commit => 3,
            Self::Abort => 4,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            3 => Some(Self::Commit),
            4 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Variable-length record body
///
/// Commit records carry the commit timestamp so a wall-clock recovery
/// target can be mapped to an LSN.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalPayload {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub prev_value: Option<Vec<u8>>,
    pub timestamp_micros: i64,
}

impl WalPayload {
    pub fn mutation(key: impl Into<String>, value: Option<Vec<u8>>, prev_value: Option<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value,
            prev_value,
            timestamp_micros: 0,
        }
    }

    pub fn control(timestamp_micros: i64) -> Self {
        Self {
            key: String::new(),
            value: None,
            prev_value: None,
            timestamp_micros,
        }
    }
}

/// One WAL record - the fundamental unit of the log
#[derive(Debug, Clone, PartialEq)]
pub struct WALRecord {
    pub lsn: LSN,
    pub txn_id: TxnId,
    pub op: WalOp,
    pub payload: WalPayload,
}

impl WALRecord {
    pub fn new(lsn: LSN, txn_id: TxnId, op: WalOp, payload: WalPayload) -> Self {
        Self {
            lsn,
            txn_id,
            op,
            payload,
        }
    }

    /// Serialize to the wire format, computing both checksums
    pub fn encode(&self) -> MantisResult<Vec<u8>> {
        let payload = bincode::serialize(&self.payload)?;
        let payload_len = u32::try_from(payload.len()).map_err(|_| {
            MantisError::invalid(format!(
                "WAL payload for LSN {} exceeds u32 length",
                self.lsn
            ))
        })?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
        buf.extend_from_slice(&WAL_MAGIC.to_le_bytes());
        buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.txn_id.to_le_bytes());
        buf.push(self.op.as_u8());
        buf.push(0); // flags
        buf.extend_from_slice(&0u16.to_le_bytes()); // reserved
        buf.extend_from_slice(&payload_len.to_le_bytes());
        let header_checksum = crc32fast::hash(&buf[..HEADER_LEN - 4]);
        buf.extend_from_slice(&header_checksum.to_le_bytes());

        buf.extend_from_slice(&payload);
        let record_checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&record_checksum.to_le_bytes());
        Ok(buf)
    }
}

/// Outcome of decoding one record at an offset
#[derive(Debug)]
pub enum Decoded {
    /// A verified record; `next` is the offset of the following record
    Record { record: WALRecord, next: usize },
    /// Clean end of log exactly at a record boundary
    End,
    /// The buffer ends mid-header or mid-payload (torn write)
    Torn { offset: usize },
    /// Magic, version or header checksum is damaged; replay cannot resync
    BadHeader { offset: usize, detail: String },
    /// Header verified but the record checksum (or payload decoding)
    /// failed; `next` allows skipping exactly this record
    BadChecksum { lsn: LSN, offset: usize, next: usize },
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Decode the record starting at `offset`, verifying both checksums
pub fn decode_at(buf: &[u8], offset: usize) -> Decoded {
    if offset == buf.len() {
        return Decoded::End;
    }
    if offset + HEADER_LEN > buf.len() {
        return Decoded::Torn { offset };
    }

    let header = &buf[offset..offset + HEADER_LEN];
    let magic = read_u32(header, 0);
    if magic != WAL_MAGIC {
        return Decoded::BadHeader {
            offset,
            detail: format!("bad magic {:#010x}", magic),
        };
    }
    let version = read_u32(header, 4);
    if version != WAL_VERSION {
        return Decoded::BadHeader {
            offset,
            detail: format!("unsupported version {}", version),
        };
    }
    let stored_header_checksum = read_u32(header, HEADER_LEN - 4);
    let computed_header_checksum = crc32fast::hash(&header[..HEADER_LEN - 4]);
    if stored_header_checksum != computed_header_checksum {
        return Decoded::BadHeader {
            offset,
            detail: "header checksum mismatch".to_string(),
        };
    }

    let lsn = read_u64(header, 8);
    let txn_id = read_u64(header, 16);
    let op_type = header[24];
    let payload_len = read_u32(header, 28) as usize;

    let payload_start = offset + HEADER_LEN;
    let trailer_start = payload_start + payload_len;
    let next = trailer_start + TRAILER_LEN;
    if next > buf.len() {
        return Decoded::Torn { offset };
    }

    let stored_record_checksum = read_u32(buf, trailer_start);
    let computed_record_checksum = crc32fast::hash(&buf[offset..trailer_start]);
    if stored_record_checksum != computed_record_checksum {
        return Decoded::BadChecksum { lsn, offset, next };
    }

    let op = match WalOp::from_u8(op_type) {
        Some(op) => op,
        None => return Decoded::BadChecksum { lsn, offset, next },
    };
    let payload: WalPayload = match bincode::deserialize(&buf[payload_start..trailer_start]) {
        Ok(payload) => payload,
        Err(_) => return Decoded::BadChecksum { lsn, offset, next },
    };

    Decoded::Record {
        record: WALRecord {
            lsn,
            txn_id,
            op,
            payload,
        },
        next,
    }
}
