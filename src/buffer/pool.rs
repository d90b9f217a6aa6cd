//! Durable Buffer Pool
//!
//! Fixed-size buffers in battery-backed memory, each split into blocks with a
//! checksummed header. A buffer holds the in-progress image of one stream's
//! current streaming object.
//!
//! ## Addressing
//!
//! Writers see a flat logical byte range. Logical offset `L` lives in block
//! `L / payload` at byte `L % payload` of that block's payload, where
//! `payload = block_size - BLOCK_HEADER_SIZE`. Buffer `i` occupies bytes
//! `i * buffer_size .. (i + 1) * buffer_size` of every mirror partition.
//!
//! ## Sync protocol
//!
//! At most one flush leader per buffer. The leader stamps the covered blocks
//! with fresh, globally ascending log-sequence-numbers while holding the
//! buffer lock, copies them out, and writes the copy to every partition with
//! the lock released. Writers keep appending behind it; their bytes land in
//! the next flush. Later blocks in a buffer therefore always carry higher
//! sequence numbers than earlier ones, which is what `read` relies on.
//!
//! Any device error disables the pool for the life of the process.

use super::block::{self, BlockState, BLOCK_HEADER_SIZE};
use super::device::RawDevice;
use crate::config::BufferConfig;
use crate::error::{JournalError, JournalResult};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use std::io::Error as IoError;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Index of a buffer within the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// How `sync` rounds its target to a block boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Flush through the end of the block holding the target (capped at the
    /// written offset)
    Up,
    /// Flush only whole blocks below the target; falls back to `Up` when that
    /// would make no progress
    Down,
}

struct BufferState {
    image: Vec<u8>,
    written: usize,
    durable: usize,
    syncing: bool,
}

struct Buffer {
    state: Mutex<BufferState>,
    synced: Condvar,
}

/// Pool-level counters
#[derive(Debug, Default)]
struct PoolStats {
    device_flushes: AtomicU64,
    blocks_written: AtomicU64,
    syncs_already_durable: AtomicU64,
}

/// Point-in-time copy of the pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    /// Flushes issued to the mirror set
    pub device_flushes: u64,
    /// Blocks written, counted once per flush regardless of mirror count
    pub blocks_written: u64,
    /// `sync` calls satisfied without touching the device
    pub syncs_already_durable: u64,
}

/// Buffer image found non-empty at restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredBuffer {
    pub id: BufferId,
    pub bytes: Vec<u8>,
}

/// Fixed pool of checksummed, mirrored durable buffers
pub struct DurableBufferPool {
    config: BufferConfig,
    devices: Vec<Arc<dyn RawDevice>>,
    buffers: Vec<Buffer>,
    free: Mutex<Vec<usize>>,
    free_cv: Condvar,
    next_lsn: AtomicU64,
    mirror_cursor: AtomicUsize,
    disabled: AtomicBool,
    recovered: Mutex<Vec<RecoveredBuffer>>,
    stats: PoolStats,
}

impl std::fmt::Debug for DurableBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBufferPool")
            .field("buffers", &self.buffers.len())
            .field("mirrors", &self.devices.len())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

impl DurableBufferPool {
    /// Build a pool over zeroed devices. Use `restart_recover` for media that
    /// may hold data from an earlier run.
    pub fn new(config: BufferConfig, devices: Vec<Arc<dyn RawDevice>>) -> JournalResult<Self> {
        if devices.len() != config.mirrors {
            return Err(JournalError::DeviceFailure(format!(
                "expected {} mirror partitions, got {}",
                config.mirrors,
                devices.len()
            )));
        }
        let needed = config.partition_size();
        if let Some(short) = devices.iter().find(|d| d.size() < needed) {
            return Err(JournalError::DeviceFailure(format!(
                "partition holds {} bytes, pool needs {}",
                short.size(),
                needed
            )));
        }

        let buffers = (0..config.buffer_count)
            .map(|_| Buffer {
                state: Mutex::new(BufferState {
                    image: vec![0u8; config.buffer_size],
                    written: 0,
                    durable: 0,
                    syncing: false,
                }),
                synced: Condvar::new(),
            })
            .collect();
        // Stack: buffer 0 is handed out first
        let free = (0..config.buffer_count).rev().collect();

        Ok(DurableBufferPool {
            config,
            devices,
            buffers,
            free: Mutex::new(free),
            free_cv: Condvar::new(),
            next_lsn: AtomicU64::new(1),
            mirror_cursor: AtomicUsize::new(0),
            disabled: AtomicBool::new(false),
            recovered: Mutex::new(Vec::new()),
            stats: PoolStats::default(),
        })
    }

    /// Rebuild the pool from media after a restart.
    ///
    /// Every partition's copy of every block is checked. A checksum mismatch
    /// leaves the pool permanently disabled. Otherwise each block position
    /// takes the copy with the highest sequence number, and buffers whose
    /// image is non-empty are held back from the free list until claimed via
    /// `take_recovered`.
    pub fn restart_recover(
        config: BufferConfig,
        devices: Vec<Arc<dyn RawDevice>>,
    ) -> JournalResult<Self> {
        let pool = Self::new(config, devices)?;
        let partition = pool.config.partition_size() as usize;
        let bs = pool.config.block_size;

        let copies: Result<Vec<Vec<u8>>, IoError> = pool
            .devices
            .iter()
            .map(|device| {
                let mut image = vec![0u8; partition];
                device.pread(&mut image, 0).map(|()| image)
            })
            .collect();
        let copies = match copies {
            Ok(copies) => copies,
            Err(e) => {
                pool.disable(&format!("restart read failed: {}", e));
                return Ok(pool);
            }
        };

        let mut max_lsn = 0u64;
        let mut recovered = Vec::new();
        let mut free = Vec::new();
        let mut corrupt = None;

        'scan: for (index, buffer) in pool.buffers.iter().enumerate() {
            let mut st = buffer.state.lock();
            let base = index * pool.config.buffer_size;
            for b in 0..pool.config.blocks_per_buffer() {
                let pos = base + b * bs;
                let mut best: Option<(u64, usize)> = None;
                for (partition_index, copy) in copies.iter().enumerate() {
                    match block::inspect(&copy[pos..pos + bs]) {
                        BlockState::Unwritten => {}
                        BlockState::Valid(h) => {
                            if best.map_or(true, |(lsn, _)| h.lsn > lsn) {
                                best = Some((h.lsn, partition_index));
                            }
                        }
                        BlockState::Corrupt(h) => {
                            corrupt = Some(format!(
                                "checksum mismatch in buffer {} block {} of partition {} (lsn {})",
                                index, b, partition_index, h.lsn
                            ));
                            break 'scan;
                        }
                    }
                }
                if let Some((lsn, partition_index)) = best {
                    st.image[b * bs..(b + 1) * bs]
                        .copy_from_slice(&copies[partition_index][pos..pos + bs]);
                    max_lsn = max_lsn.max(lsn);
                }
            }

            let bytes = walk_image(&pool.config, &st.image);
            if bytes.is_empty() {
                st.image.fill(0);
                free.push(index);
            } else {
                st.written = bytes.len();
                st.durable = bytes.len();
                recovered.push(RecoveredBuffer {
                    id: BufferId(index),
                    bytes,
                });
            }
        }

        if let Some(reason) = corrupt {
            pool.disable(&reason);
            return Ok(pool);
        }

        pool.next_lsn.store(max_lsn + 1, Ordering::SeqCst);
        free.reverse();
        *pool.free.lock() = free;

        tracing::info!(
            recovered = recovered.len(),
            next_lsn = max_lsn + 1,
            "durable buffer pool recovered"
        );
        *pool.recovered.lock() = recovered;
        Ok(pool)
    }

    // ========================================================================
    // Free list
    // ========================================================================

    /// Take a free buffer, blocking until one is released
    pub fn acquire(&self) -> JournalResult<BufferId> {
        let mut free = self.free.lock();
        loop {
            self.check_enabled()?;
            if let Some(index) = free.pop() {
                return Ok(BufferId(index));
            }
            self.free_cv.wait(&mut free);
        }
    }

    /// Return a buffer to the free list. The buffer must have been reset.
    pub fn release(&self, id: BufferId) {
        {
            let st = self.buffers[id.0].state.lock();
            assert!(
                st.written == 0 || self.is_disabled(),
                "released buffer {} still holds {} bytes",
                id.0,
                st.written
            );
        }
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&id.0), "Precondition: buffer not already free");
        free.push(id.0);
        self.free_cv.notify_one();
    }

    /// Buffers that came back non-empty from `restart_recover`; each is
    /// handed out once
    pub fn take_recovered(&self) -> Vec<RecoveredBuffer> {
        std::mem::take(&mut *self.recovered.lock())
    }

    // ========================================================================
    // Data path
    // ========================================================================

    /// Append `bytes` at the buffer's logical write offset, skipping block
    /// headers. Returns the new write offset.
    pub fn write_partial(&self, id: BufferId, bytes: &[u8], want_sync: bool) -> JournalResult<usize> {
        self.check_enabled()?;
        let new_offset = {
            let mut st = self.buffers[id.0].state.lock();
            if st.written + bytes.len() > self.config.buffer_capacity() {
                return Err(JournalError::NoSpace);
            }
            let payload = self.config.block_payload();
            let bs = self.config.block_size;
            let mut src = bytes;
            let mut offset = st.written;
            while !src.is_empty() {
                let within = offset % payload;
                let n = (payload - within).min(src.len());
                let pos = (offset / payload) * bs + BLOCK_HEADER_SIZE + within;
                st.image[pos..pos + n].copy_from_slice(&src[..n]);
                src = &src[n..];
                offset += n;
            }
            st.written = offset;
            offset
        };
        if want_sync {
            self.sync(id, new_offset, Alignment::Up)?;
        }
        Ok(new_offset)
    }

    /// Make the buffer durable through at least `offset` (or, with
    /// `Alignment::Down`, through the last whole block below it). Returns the
    /// durable offset reached.
    pub fn sync(&self, id: BufferId, offset: usize, align: Alignment) -> JournalResult<usize> {
        let buffer = &self.buffers[id.0];
        let mut st = buffer.state.lock();
        loop {
            self.check_enabled()?;
            if st.durable >= offset {
                self.stats.syncs_already_durable.fetch_add(1, Ordering::Relaxed);
                return Ok(st.durable);
            }
            if !st.syncing {
                break;
            }
            buffer.synced.wait(&mut st);
        }
        assert!(
            offset <= st.written,
            "sync target {} past written offset {}",
            offset,
            st.written
        );

        let target = self.flush_target(&st, offset, align);
        let payload = self.config.block_payload();
        let bs = self.config.block_size;
        let first = st.durable / payload;
        let last = (target - 1) / payload;
        for b in first..=last {
            let live = target.min((b + 1) * payload) - b * payload;
            let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
            block::seal(&mut st.image[b * bs..(b + 1) * bs], lsn, live as u32);
        }
        let snapshot = st.image[first * bs..(last + 1) * bs].to_vec();
        let physical = (id.0 * self.config.buffer_size + first * bs) as u64;

        st.syncing = true;
        let result = MutexGuard::unlocked(&mut st, || self.write_mirrors(&snapshot, physical));
        st.syncing = false;

        let outcome = match result {
            Ok(()) => {
                st.durable = st.durable.max(target);
                debug_assert!(st.durable <= st.written, "Postcondition: durable <= written");
                Ok(st.durable)
            }
            Err(e) => {
                self.disable(&format!("flush of buffer {} failed: {}", id.0, e));
                Err(JournalError::DeviceFailure(e.to_string()))
            }
        };
        buffer.synced.notify_all();
        outcome
    }

    /// Durable contents of a buffer: block payloads from the start, stopping
    /// at an empty block, a non-increasing sequence number, a bad checksum or
    /// after a partially filled block
    pub fn read(&self, id: BufferId) -> JournalResult<Vec<u8>> {
        self.check_enabled()?;
        let st = self.buffers[id.0].state.lock();
        Ok(walk_image(&self.config, &st.image))
    }

    /// Durably empty a buffer: block 0 is rewritten with zero live bytes
    pub fn reset(&self, id: BufferId) -> JournalResult<()> {
        let buffer = &self.buffers[id.0];
        let mut st = buffer.state.lock();
        while st.syncing {
            buffer.synced.wait(&mut st);
        }
        self.check_enabled()?;

        let bs = self.config.block_size;
        st.image.fill(0);
        st.written = 0;
        st.durable = 0;
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        block::seal(&mut st.image[..bs], lsn, 0);
        let first_block = st.image[..bs].to_vec();
        let physical = (id.0 * self.config.buffer_size) as u64;

        st.syncing = true;
        let result = MutexGuard::unlocked(&mut st, || self.write_mirrors(&first_block, physical));
        st.syncing = false;
        buffer.synced.notify_all();

        result.map_err(|e| {
            self.disable(&format!("reset of buffer {} failed: {}", id.0, e));
            JournalError::DeviceFailure(e.to_string())
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Logical write offset
    pub fn written(&self, id: BufferId) -> usize {
        self.buffers[id.0].state.lock().written
    }

    /// Logical durable offset
    pub fn durable(&self, id: BufferId) -> usize {
        self.buffers[id.0].state.lock().durable
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            device_flushes: self.stats.device_flushes.load(Ordering::Relaxed),
            blocks_written: self.stats.blocks_written.load(Ordering::Relaxed),
            syncs_already_durable: self.stats.syncs_already_durable.load(Ordering::Relaxed),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_enabled(&self) -> JournalResult<()> {
        if self.is_disabled() {
            return Err(JournalError::DeviceFailure(
                "durable buffer pool disabled".to_string(),
            ));
        }
        Ok(())
    }

    fn disable(&self, reason: &str) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::error!(reason, "durable buffer pool disabled (fail-stop)");
        }
        let _free = self.free.lock();
        self.free_cv.notify_all();
    }

    fn flush_target(&self, st: &BufferState, offset: usize, align: Alignment) -> usize {
        let payload = self.config.block_payload();
        let up = ((offset + payload - 1) / payload * payload).min(st.written);
        match align {
            Alignment::Up => up,
            Alignment::Down => {
                let down = offset / payload * payload;
                if down > st.durable {
                    down
                } else {
                    up
                }
            }
        }
    }

    fn write_mirrors(&self, data: &[u8], offset: u64) -> Result<(), IoError> {
        let n = self.devices.len();
        let start = self.mirror_cursor.fetch_add(1, Ordering::Relaxed) % n;
        for i in 0..n {
            let device = &self.devices[(start + i) % n];
            device.pwrite(data, offset)?;
            if self.config.force_durability {
                device.force_durability()?;
            }
        }
        self.stats.device_flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .blocks_written
            .fetch_add((data.len() / self.config.block_size) as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Accepted payload bytes of a physical buffer image
fn walk_image(config: &BufferConfig, image: &[u8]) -> Vec<u8> {
    let bs = config.block_size;
    let payload = config.block_payload();
    let mut out = Vec::new();
    let mut prev_lsn = 0u64;
    for b in 0..config.blocks_per_buffer() {
        let block = &image[b * bs..(b + 1) * bs];
        let header = match block::inspect(block) {
            BlockState::Valid(h) => h,
            BlockState::Unwritten | BlockState::Corrupt(_) => break,
        };
        if header.live == 0 || header.lsn <= prev_lsn {
            break;
        }
        let live = header.live as usize;
        out.extend_from_slice(&block[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + live]);
        prev_lsn = header.lsn;
        if live < payload {
            break;
        }
    }
    out
}
