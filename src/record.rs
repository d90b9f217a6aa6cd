//! Log Record Framing
//!
//! ## Layout (little-endian, tightly packed)
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ kind: u8                         │
//! │ reserved: u8                     │
//! │ key_len: u16                     │
//! │ data_len: u32                    │
//! │ trx_id: u64                      │
//! │ counter: u64                     │
//! ├──────────────────────────────────┤
//! │ key: [u8; key_len]               │
//! │ data: [u8; data_len]             │
//! └──────────────────────────────────┘
//! ```
//!
//! A record's size is a pure function of its header lengths, so a record can
//! be rewritten in place as a `Tombstone` without moving anything after it.

use crate::error::{JournalError, JournalResult};
use bytes::BufMut;

/// Fixed record header size
pub const RECORD_HEADER_SIZE: usize = 24;

/// Record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    Write = 0,
    Delete = 1,
    Trim = 2,
    Tombstone = 3,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RecordKind::Write),
            1 => Some(RecordKind::Delete),
            2 => Some(RecordKind::Trim),
            3 => Some(RecordKind::Tombstone),
            _ => None,
        }
    }

    /// Whether records of this kind count toward placement-group aging
    pub fn is_live_kind(&self) -> bool {
        !matches!(self, RecordKind::Tombstone)
    }
}

/// Owned log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub trx_id: u64,
    pub counter: u64,
    pub key: String,
    pub data: Vec<u8>,
}

impl LogRecord {
    pub fn write(trx_id: u64, counter: u64, key: &str, data: &[u8]) -> Self {
        LogRecord {
            kind: RecordKind::Write,
            trx_id,
            counter,
            key: key.to_string(),
            data: data.to_vec(),
        }
    }

    pub fn delete(trx_id: u64, counter: u64, key: &str) -> Self {
        LogRecord {
            kind: RecordKind::Delete,
            trx_id,
            counter,
            key: key.to_string(),
            data: Vec::new(),
        }
    }

    pub fn trim(trx_id: u64, counter: u64, key: &str) -> Self {
        LogRecord {
            kind: RecordKind::Trim,
            trx_id,
            counter,
            key: key.to_string(),
            data: Vec::new(),
        }
    }

    /// Encoded size
    pub fn encoded_len(&self) -> usize {
        record_len(self.key.len(), self.data.len())
    }

    /// Append the encoded record to `out`
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        debug_assert!(self.key.len() <= u16::MAX as usize, "Precondition: key fits u16");
        debug_assert!(self.data.len() <= u32::MAX as usize, "Precondition: data fits u32");

        let start = out.len();
        out.reserve(self.encoded_len());
        out.put_u8(self.kind as u8);
        out.put_u8(0);
        out.put_u16_le(self.key.len() as u16);
        out.put_u32_le(self.data.len() as u32);
        out.put_u64_le(self.trx_id);
        out.put_u64_le(self.counter);
        out.put_slice(self.key.as_bytes());
        out.put_slice(&self.data);

        debug_assert_eq!(
            out.len() - start,
            self.encoded_len(),
            "Postcondition: encoded size must match expected"
        );
    }

    /// Encode into a fresh buffer
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}

/// Size of a record with the given key and data lengths
pub fn record_len(key_len: usize, data_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + data_len
}

/// Borrowed view of one record inside a byte region
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    pub kind: RecordKind,
    pub trx_id: u64,
    pub counter: u64,
    pub key: &'a [u8],
    pub data: &'a [u8],
    /// Offset of the record header within the scanned region
    pub offset: usize,
}

impl<'a> RecordView<'a> {
    /// Key as text; records are only ever written from `&str` keys
    pub fn key_str(&self) -> JournalResult<&'a str> {
        std::str::from_utf8(self.key)
            .map_err(|_| JournalError::Corruption(format!("non-UTF-8 key at {}", self.offset)))
    }

    /// Encoded length of this record
    pub fn encoded_len(&self) -> usize {
        record_len(self.key.len(), self.data.len())
    }

    pub fn to_owned_record(&self) -> JournalResult<LogRecord> {
        Ok(LogRecord {
            kind: self.kind,
            trx_id: self.trx_id,
            counter: self.counter,
            key: self.key_str()?.to_string(),
            data: self.data.to_vec(),
        })
    }
}

/// Decode the record starting at `offset`
pub fn decode_at(region: &[u8], offset: usize) -> JournalResult<RecordView<'_>> {
    let data = &region[offset..];
    if data.len() < RECORD_HEADER_SIZE {
        return Err(JournalError::Corruption(format!(
            "truncated record header at {}",
            offset
        )));
    }
    let kind = RecordKind::from_u8(data[0]).ok_or_else(|| {
        JournalError::Corruption(format!("unknown record kind {} at {}", data[0], offset))
    })?;
    let key_len = u16::from_le_bytes([data[2], data[3]]) as usize;
    let data_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let trx_id = u64::from_le_bytes(
        data[8..16]
            .try_into()
            .expect("length validated: RECORD_HEADER_SIZE >= 16"),
    );
    let counter = u64::from_le_bytes(
        data[16..24]
            .try_into()
            .expect("length validated: RECORD_HEADER_SIZE >= 24"),
    );

    let total = record_len(key_len, data_len);
    if data.len() < total {
        return Err(JournalError::Corruption(format!(
            "truncated record body at {}: need {}, have {}",
            offset,
            total,
            data.len()
        )));
    }
    let key_end = RECORD_HEADER_SIZE + key_len;
    Ok(RecordView {
        kind,
        trx_id,
        counter,
        key: &data[RECORD_HEADER_SIZE..key_end],
        data: &data[key_end..total],
        offset,
    })
}

/// Rewrite the record at `offset` as a tombstone; size is unchanged
pub fn tombstone_in_place(region: &mut [u8], offset: usize) {
    assert!(
        offset + RECORD_HEADER_SIZE <= region.len(),
        "tombstone target outside region"
    );
    region[offset] = RecordKind::Tombstone as u8;
}

/// Iterator over the records packed in a byte region
pub struct RecordIter<'a> {
    region: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> RecordIter<'a> {
    pub fn new(region: &'a [u8]) -> Self {
        RecordIter {
            region,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = JournalResult<RecordView<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.region.len() {
            return None;
        }
        match decode_at(self.region, self.offset) {
            Ok(view) => {
                self.offset += view.encoded_len();
                Some(Ok(view))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
