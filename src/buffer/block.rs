//! Block Framing
//!
//! Every block of a durable buffer carries a fixed header in front of its
//! payload:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ checksum: u64 (xxh3)             │  covers lsn, live and payload[..live]
//! │ lsn: u64                         │  0 = never written
//! │ live: u32                        │  payload bytes in use
//! ├──────────────────────────────────┤
//! │ payload: [u8; block_size - 20]   │
//! └──────────────────────────────────┘
//! ```
//!
//! Because `lsn` and `live` sit directly after the checksum, the checksummed
//! bytes are the contiguous range `block[8..20 + live]`.

use xxhash_rust::xxh3::xxh3_64;

/// Fixed block header size
pub const BLOCK_HEADER_SIZE: usize = 20;

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub checksum: u64,
    pub lsn: u64,
    pub live: u32,
}

impl BlockHeader {
    /// Decode the header at the start of `block`
    pub fn decode(block: &[u8]) -> Self {
        debug_assert!(block.len() >= BLOCK_HEADER_SIZE, "Precondition: block holds a header");
        BlockHeader {
            checksum: u64::from_le_bytes(
                block[0..8].try_into().expect("length validated: header is 20 bytes"),
            ),
            lsn: u64::from_le_bytes(
                block[8..16].try_into().expect("length validated: header is 20 bytes"),
            ),
            live: u32::from_le_bytes(
                block[16..20].try_into().expect("length validated: header is 20 bytes"),
            ),
        }
    }

    fn encode(&self, block: &mut [u8]) {
        block[0..8].copy_from_slice(&self.checksum.to_le_bytes());
        block[8..16].copy_from_slice(&self.lsn.to_le_bytes());
        block[16..20].copy_from_slice(&self.live.to_le_bytes());
    }
}

/// Result of inspecting one on-media block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Never written (lsn 0)
    Unwritten,
    /// Header and checksum agree
    Valid(BlockHeader),
    /// Checksum mismatch or impossible live count
    Corrupt(BlockHeader),
}

fn checksum_of(block: &[u8], live: usize) -> u64 {
    xxh3_64(&block[8..BLOCK_HEADER_SIZE + live])
}

/// Stamp `block` with `lsn` and `live`, computing its checksum
pub fn seal(block: &mut [u8], lsn: u64, live: u32) {
    debug_assert!(lsn > 0, "Precondition: sealed blocks carry a non-zero lsn");
    debug_assert!(
        BLOCK_HEADER_SIZE + live as usize <= block.len(),
        "Precondition: live bytes fit the block"
    );

    block[8..16].copy_from_slice(&lsn.to_le_bytes());
    block[16..20].copy_from_slice(&live.to_le_bytes());
    let header = BlockHeader {
        checksum: checksum_of(block, live as usize),
        lsn,
        live,
    };
    header.encode(block);
}

/// Classify an on-media block
pub fn inspect(block: &[u8]) -> BlockState {
    let header = BlockHeader::decode(block);
    if header.lsn == 0 {
        return BlockState::Unwritten;
    }
    let live = header.live as usize;
    if BLOCK_HEADER_SIZE + live > block.len() {
        return BlockState::Corrupt(header);
    }
    if checksum_of(block, live) == header.checksum {
        BlockState::Valid(header)
    } else {
        BlockState::Corrupt(header)
    }
}
