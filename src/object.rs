//! Streaming Object (SO) Format
//!
//! An SO is one stream's chunk of history: a fixed header followed by packed
//! log records. The same bytes live in the stream's durable buffer while the
//! SO is in progress and in the backing store once it is cut over.
//!
//! ## Header (24 bytes, little-endian)
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ magic: "LGSO" (4 bytes)          │
//! │ container_id: u32                │
//! │ stream_id: u32                   │
//! │ seq: u64                         │
//! │ header_checksum: u32 (CRC32)     │
//! └──────────────────────────────────┘
//! ```
//!
//! Backing-store key: `SO_<stream-id>_<sequence-number>`.

use crate::error::{JournalError, JournalResult};
use crate::record::{tombstone_in_place, RecordIter};

/// SO magic number
pub const SO_MAGIC: [u8; 4] = *b"LGSO";
/// Fixed SO header size
pub const SO_HEADER_SIZE: usize = 24;

/// Decoded SO header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoHeader {
    pub container_id: u32,
    pub stream_id: u32,
    pub seq: u64,
}

impl SoHeader {
    pub fn new(container_id: u32, stream_id: u32, seq: u64) -> Self {
        SoHeader {
            container_id,
            stream_id,
            seq,
        }
    }

    fn compute_checksum(bytes: &[u8]) -> u32 {
        crc32fast::hash(&bytes[..20])
    }

    /// Serialize header to bytes (fixed size)
    pub fn to_bytes(&self) -> [u8; SO_HEADER_SIZE] {
        let mut buf = [0u8; SO_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SO_MAGIC);
        buf[4..8].copy_from_slice(&self.container_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.seq.to_le_bytes());
        let checksum = Self::compute_checksum(&buf);
        buf[20..24].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and validate a header
    pub fn from_bytes(data: &[u8]) -> JournalResult<Self> {
        if data.len() < SO_HEADER_SIZE {
            return Err(JournalError::Corruption(
                "streaming object too short for header".to_string(),
            ));
        }
        if data[0..4] != SO_MAGIC {
            return Err(JournalError::Corruption(format!(
                "invalid SO magic: {:?}",
                &data[0..4]
            )));
        }
        let stored = u32::from_le_bytes(
            data[20..24]
                .try_into()
                .expect("length validated: SO_HEADER_SIZE >= 24"),
        );
        let actual = Self::compute_checksum(data);
        if stored != actual {
            return Err(JournalError::Corruption(format!(
                "SO header checksum mismatch: expected {:08x}, got {:08x}",
                actual, stored
            )));
        }
        Ok(SoHeader {
            container_id: u32::from_le_bytes(
                data[4..8].try_into().expect("length validated: SO_HEADER_SIZE >= 8"),
            ),
            stream_id: u32::from_le_bytes(
                data[8..12].try_into().expect("length validated: SO_HEADER_SIZE >= 12"),
            ),
            seq: u64::from_le_bytes(
                data[12..20].try_into().expect("length validated: SO_HEADER_SIZE >= 20"),
            ),
        })
    }
}

/// Backing-store key for an SO
pub fn so_key(stream_id: u32, seq: u64) -> String {
    format!("SO_{}_{}", stream_id, seq)
}

/// Parse `(stream_id, seq)` from a backing-store key
pub fn parse_so_key(key: &str) -> Option<(u32, u64)> {
    let rest = key.strip_prefix("SO_")?;
    let (stream, seq) = rest.split_once('_')?;
    Some((stream.parse().ok()?, seq.parse().ok()?))
}

/// Owned SO image: header plus packed records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingObject {
    header: SoHeader,
    bytes: Vec<u8>,
}

impl StreamingObject {
    /// An empty SO holding only its header
    pub fn empty(header: SoHeader) -> Self {
        StreamingObject {
            header,
            bytes: header.to_bytes().to_vec(),
        }
    }

    /// Wrap bytes read from a store or buffer, validating the header
    pub fn from_bytes(bytes: Vec<u8>) -> JournalResult<Self> {
        let header = SoHeader::from_bytes(&bytes)?;
        Ok(StreamingObject { header, bytes })
    }

    pub fn header(&self) -> &SoHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Bytes after the header
    pub fn record_region(&self) -> &[u8] {
        &self.bytes[SO_HEADER_SIZE..]
    }

    /// Iterate the records in this SO
    pub fn records(&self) -> RecordIter<'_> {
        RecordIter::new(self.record_region())
    }

    /// Whether the SO holds any records
    pub fn has_records(&self) -> bool {
        self.bytes.len() > SO_HEADER_SIZE
    }

    /// Rewrite the record at `record_offset` (relative to the record region)
    /// as a tombstone
    pub fn tombstone(&mut self, record_offset: usize) {
        tombstone_in_place(&mut self.bytes[SO_HEADER_SIZE..], record_offset);
    }
}
