//! Snapshot streaming
//!
//! Serializes a snapshot's anchor view into the on-disk format, feeding a
//! SHA-256 hasher and the destination writer through a tee. The header is
//! written plain; the data section runs through the configured compression.
//!
//! ```text
//! MANTIS_SNAPSHOT_V1\n
//! ID: <uuid>\n
//! LSN: <anchor lsn>\n
//! TIMESTAMP: <unix secs>\n
//! COMPRESSION: none|gzip|lz4\n
//! ---DATA---\n
//! %08d<key>%08d<value> ...   (compressed per the header)
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::destination::DestinationWriter;
use crate::error::{MantisError, MantisResult};
use crate::storage::wal::LSN;

pub const SNAPSHOT_MAGIC: &str = "MANTIS_SNAPSHOT_V1";
const DATA_SENTINEL: &str = "---DATA---";
const MAX_FIELD_LEN: usize = 99_999_999;

/// Compression applied to the snapshot data section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Lz4,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Lz4 => "lz4",
        }
    }

    pub fn from_name(name: &str) -> MantisResult<Self> {
        match name {
            "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "lz4" => Ok(Self::Lz4),
            other => Err(MantisError::invalid(format!(
                "unknown compression scheme: {}",
                other
            ))),
        }
    }
}

/// Header fields of a snapshot artifact
#[derive(Debug, Clone)]
pub struct SnapshotHeader {
    pub id: Uuid,
    pub anchor_lsn: LSN,
    pub timestamp_secs: i64,
    pub compression: Compression,
}

/// Observable streaming progress
#[derive(Debug, Default)]
pub struct StreamProgress {
    pub pages_total: AtomicU64,
    pub pages_streamed: AtomicU64,
    pub bytes_streamed: AtomicU64,
}

impl StreamProgress {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.pages_total.load(Ordering::Relaxed),
            self.pages_streamed.load(Ordering::Relaxed),
            self.bytes_streamed.load(Ordering::Relaxed),
        )
    }
}

/// Tee stage: every published byte goes through the hasher and the
/// destination; the final checksum is the hash of exactly what was
/// written.
struct Tee<'a> {
    hasher: Sha256,
    writer: &'a mut dyn DestinationWriter,
    bytes: u64,
}

impl<'a> Tee<'a> {
    fn new(writer: &'a mut dyn DestinationWriter) -> Self {
        Self {
            hasher: Sha256::new(),
            writer,
            bytes: 0,
        }
    }

    async fn publish(&mut self, data: &[u8]) -> MantisResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.hasher.update(data);
        self.writer.write(data).await?;
        self.bytes += data.len() as u64;
        Ok(())
    }

    fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

enum DataEncoder {
    Plain,
    Gzip(flate2::write::GzEncoder<Vec<u8>>),
    Lz4(Box<lz4_flex::frame::FrameEncoder<Vec<u8>>>),
}

impl DataEncoder {
    fn new(compression: Compression) -> Self {
        match compression {
            Compression::None => Self::Plain,
            Compression::Gzip => Self::Gzip(flate2::write::GzEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
            Compression::Lz4 => Self::Lz4(Box::new(lz4_flex::frame::FrameEncoder::new(Vec::new()))),
        }
    }

    /// Feed bytes; returns whatever compressed output is ready now
    fn push(&mut self, data: &[u8]) -> MantisResult<Vec<u8>> {
        match self {
            Self::Plain => Ok(data.to_vec()),
            Self::Gzip(encoder) => {
                encoder
                    .write_all(data)
                    .map_err(|e| MantisError::Io(std::io::Error::other(e)))?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            Self::Lz4(encoder) => {
                encoder
                    .write_all(data)
                    .map_err(|e| MantisError::Io(std::io::Error::other(e)))?;
                Ok(std::mem::take(encoder.get_mut()))
            }
        }
    }

    fn finish(self) -> MantisResult<Vec<u8>> {
        match self {
            Self::Plain => Ok(Vec::new()),
            Self::Gzip(encoder) => encoder
                .finish()
                .map_err(|e| MantisError::Io(std::io::Error::other(e))),
            Self::Lz4(encoder) => encoder
                .finish()
                .map_err(|e| MantisError::Io(std::io::Error::other(e))),
        }
    }
}

fn encode_field(buf: &mut Vec<u8>, field: &[u8]) -> MantisResult<()> {
    if field.len() > MAX_FIELD_LEN {
        return Err(MantisError::CapacityExceeded(format!(
            "snapshot field of {} bytes exceeds the 8-digit length prefix",
            field.len()
        )));
    }
    buf.extend_from_slice(format!("{:08}", field.len()).as_bytes());
    buf.extend_from_slice(field);
    Ok(())
}

fn header_bytes(header: &SnapshotHeader) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(SNAPSHOT_MAGIC.as_bytes());
    buf.push(b'\n');
    buf.extend_from_slice(format!("ID: {}\n", header.id).as_bytes());
    buf.extend_from_slice(format!("LSN: {}\n", header.anchor_lsn).as_bytes());
    buf.extend_from_slice(format!("TIMESTAMP: {}\n", header.timestamp_secs).as_bytes());
    buf.extend_from_slice(format!("COMPRESSION: {}\n", header.compression.as_str()).as_bytes());
    buf.extend_from_slice(DATA_SENTINEL.as_bytes());
    buf.push(b'\n');
    buf
}

/// Stream `pages` (already resolved to the anchor view, in stable order)
/// into `writer`. Returns the SHA-256 of the streamed bytes. Cancellation
/// is checked once per page.
pub async fn stream_snapshot(
    header: &SnapshotHeader,
    pages: &[(String, Vec<u8>)],
    writer: &mut dyn DestinationWriter,
    progress: &StreamProgress,
    cancel: &CancellationToken,
) -> MantisResult<(String, u64)> {
    progress
        .pages_total
        .store(pages.len() as u64, Ordering::Relaxed);

    let mut tee = Tee::new(writer);
    tee.publish(&header_bytes(header)).await?;

    let mut encoder = DataEncoder::new(header.compression);
    for (key, value) in pages {
        if cancel.is_cancelled() {
            return Err(MantisError::Cancelled(format!(
                "snapshot {} stream cancelled",
                header.id
            )));
        }
        let mut chunk = Vec::with_capacity(16 + key.len() + value.len());
        encode_field(&mut chunk, key.as_bytes())?;
        encode_field(&mut chunk, value)?;
        let ready = encoder.push(&chunk)?;
        tee.publish(&ready).await?;
        progress.pages_streamed.fetch_add(1, Ordering::Relaxed);
        progress
            .bytes_streamed
            .store(tee.bytes, Ordering::Relaxed);
    }
    let tail = encoder.finish()?;
    tee.publish(&tail).await?;
    progress.bytes_streamed.store(tee.bytes, Ordering::Relaxed);

    let (checksum, bytes) = tee.finish();
    debug!(
        "Streamed snapshot {}: {} page(s), {} byte(s), sha256 {}",
        header.id,
        pages.len(),
        bytes,
        checksum
    );
    Ok((checksum, bytes))
}

/// Decode a snapshot artifact (verification, restore tooling, tests)
pub fn decode_snapshot(bytes: &[u8]) -> MantisResult<(SnapshotHeader, Vec<(String, Vec<u8>)>)> {
    let corrupt = |detail: &str| MantisError::CorruptionDetected {
        location: "snapshot artifact".to_string(),
        detail: detail.to_string(),
    };

    let mut offset = 0usize;
    let next_line = |bytes: &[u8], offset: &mut usize| -> MantisResult<String> {
        let start = *offset;
        while *offset < bytes.len() && bytes[*offset] != b'\n' {
            *offset += 1;
        }
        if *offset >= bytes.len() {
            return Err(corrupt("unterminated header line"));
        }
        let line = String::from_utf8_lossy(&bytes[start..*offset]).into_owned();
        *offset += 1;
        Ok(line)
    };

    if next_line(bytes, &mut offset)? != SNAPSHOT_MAGIC {
        return Err(corrupt("bad snapshot magic"));
    }
    let mut id = None;
    let mut lsn = None;
    let mut timestamp = 0i64;
    let mut compression = Compression::None;
    loop {
        let line = next_line(bytes, &mut offset)?;
        if line == DATA_SENTINEL {
            break;
        }
        if let Some((key, value)) = line.split_once(": ") {
            match key {
                "ID" => id = Uuid::parse_str(value).ok(),
                "LSN" => lsn = value.parse().ok(),
                "TIMESTAMP" => timestamp = value.parse().unwrap_or(0),
                "COMPRESSION" => compression = Compression::from_name(value)?,
                _ => {}
            }
        }
    }
    let header = SnapshotHeader {
        id: id.ok_or_else(|| corrupt("missing snapshot id"))?,
        anchor_lsn: lsn.ok_or_else(|| corrupt("missing anchor lsn"))?,
        timestamp_secs: timestamp,
        compression,
    };

    let data = match compression {
        Compression::None => bytes[offset..].to_vec(),
        Compression::Gzip => {
            use std::io::Read;
            let mut decoder = flate2::read::GzDecoder::new(&bytes[offset..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| corrupt("gzip data section damaged"))?;
            out
        }
        Compression::Lz4 => {
            use std::io::Read;
            let mut decoder = lz4_flex::frame::FrameDecoder::new(&bytes[offset..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| corrupt("lz4 data section damaged"))?;
            out
        }
    };

    let mut pairs = Vec::new();
    let mut at = 0usize;
    let read_field = |data: &[u8], at: &mut usize| -> MantisResult<Vec<u8>> {
        if *at + 8 > data.len() {
            return Err(corrupt("truncated length prefix"));
        }
        let len: usize = std::str::from_utf8(&data[*at..*at + 8])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| corrupt("invalid length prefix"))?;
        *at += 8;
        if *at + len > data.len() {
            return Err(corrupt("truncated field"));
        }
        let field = data[*at..*at + len].to_vec();
        *at += len;
        Ok(field)
    };
    while at < data.len() {
        let key = read_field(&data, &mut at)?;
        let value = read_field(&data, &mut at)?;
        pairs.push((
            String::from_utf8(key).map_err(|_| corrupt("non-UTF-8 key"))?,
            value,
        ));
    }
    Ok((header, pairs))
}
