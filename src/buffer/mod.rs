//! Durable buffers in battery-backed memory
//!
//! - `block`: on-media block header and checksum
//! - `device`: raw device trait with memory and file implementations
//! - `pool`: buffer free list, write/sync protocol, restart recovery

pub mod block;
pub mod device;
pub mod pool;

pub use block::BLOCK_HEADER_SIZE;
#[cfg(unix)]
pub use device::FileDevice;
pub use device::{MemoryDevice, RawDevice};
pub use pool::{Alignment, BufferId, DurableBufferPool, PoolStatsSnapshot, RecoveredBuffer};
