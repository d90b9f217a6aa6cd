//! Stream Manager
//!
//! A stream is one append-only log partition of a container. Its in-progress
//! streaming object (SO) is held in memory and mirrored byte for byte into a
//! durable buffer; when the image is full it is cut over to the backing store
//! under `SO_<stream>_<seq>` and a fresh image starts at `seq + 1`.
//!
//! Persisted SOs are `seq_oldest .. seq_next`; `seq_next` is the in-progress
//! one. The status of the oldest persisted SO (newest transaction id in it,
//! and the placement groups it touches) decides whether it can be reclaimed.

use crate::buffer::{Alignment, BufferId, DurableBufferPool};
use crate::commit::{CommitCoordinator, CommitSnapshot, CommitTarget, Rotated};
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::key::DecodedKey;
use crate::object::{so_key, SoHeader, StreamingObject, SO_HEADER_SIZE};
use crate::placement::{PgId, PlacementIndex};
use crate::record::{LogRecord, RecordKind, RecordView};
use crate::stats::JournalStats;
use crate::store::BackingStore;
use crate::transaction::TransactionRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Collaborators shared by every stream of a container
pub struct StreamEnv<'a> {
    pub container: u32,
    pub config: &'a JournalConfig,
    pub pool: &'a DurableBufferPool,
    pub store: &'a dyn BackingStore,
    pub transactions: &'a TransactionRegistry,
    pub stats: &'a Arc<JournalStats>,
}

// ============================================================================
// StreamBuffer - in-progress image, guarded by the stream buffer lock
// ============================================================================

/// In-progress SO image and the durable buffer mirroring it
#[derive(Debug)]
pub struct StreamBuffer {
    buffer: Option<BufferId>,
    image: Vec<u8>,
    seq: u64,
    capacity: usize,
    device_failed: bool,
}

impl StreamBuffer {
    fn new(header: SoHeader, buffer: Option<BufferId>, capacity: usize) -> Self {
        let mut image = Vec::with_capacity(capacity);
        image.extend_from_slice(&header.to_bytes());
        StreamBuffer {
            buffer,
            image,
            seq: header.seq,
            capacity,
            device_failed: buffer.is_none(),
        }
    }

    pub fn fits(&self, len: usize) -> bool {
        self.image.len() + len <= self.capacity
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn has_records(&self) -> bool {
        self.image.len() > SO_HEADER_SIZE
    }

    fn live_buffer(&self) -> Option<BufferId> {
        if self.device_failed {
            None
        } else {
            self.buffer
        }
    }

    fn mark_device_failed(&mut self, container: u32, stream: u32, reason: &JournalError) {
        if !self.device_failed {
            self.device_failed = true;
            tracing::warn!(
                container,
                stream,
                error = %reason,
                "durable buffer unavailable, committing directly to backing store"
            );
        }
    }

    /// Copy `bytes` into the image and the durable buffer
    fn append(&mut self, pool: &DurableBufferPool, bytes: &[u8], ids: (u32, u32)) -> JournalResult<usize> {
        debug_assert!(self.fits(bytes.len()), "Precondition: caller checked fit");
        self.image.extend_from_slice(bytes);
        if let Some(buffer) = self.live_buffer() {
            match pool.write_partial(buffer, bytes, false) {
                Ok(offset) => {
                    debug_assert_eq!(offset, self.image.len(), "Invariant: buffer mirrors image")
                }
                Err(e @ JournalError::DeviceFailure(_)) => self.mark_device_failed(ids.0, ids.1, &e),
                Err(e) => {
                    self.image.truncate(self.image.len() - bytes.len());
                    return Err(e);
                }
            }
        }
        Ok(self.image.len())
    }

    /// Replace the image with a fresh one for `header`; returns the old image
    /// and the durable offset of the new one
    fn install(&mut self, pool: &DurableBufferPool, header: SoHeader, ids: (u32, u32)) -> (Vec<u8>, usize) {
        let mut image = Vec::with_capacity(self.capacity);
        image.extend_from_slice(&header.to_bytes());
        let old = std::mem::replace(&mut self.image, image);
        self.seq = header.seq;
        let durable = self.reset_device(pool, ids);
        (old, durable)
    }

    /// Durably clear the buffer and write the current header into it
    fn reset_device(&mut self, pool: &DurableBufferPool, ids: (u32, u32)) -> usize {
        let Some(buffer) = self.live_buffer() else {
            return 0;
        };
        let result = pool
            .reset(buffer)
            .and_then(|()| pool.write_partial(buffer, &self.image, true));
        match result {
            Ok(offset) => offset,
            Err(e) => {
                self.mark_device_failed(ids.0, ids.1, &e);
                0
            }
        }
    }
}

// ============================================================================
// StreamShared - reachable without the container lock
// ============================================================================

/// The part of a stream writers use after dropping the container lock
#[derive(Debug)]
pub struct StreamShared {
    container: u32,
    id: u32,
    buffer: Mutex<StreamBuffer>,
    commit: CommitCoordinator,
}

impl StreamShared {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Copy an encoded record if it fits. `None` means the image is full
    /// and the caller must rotate.
    pub fn try_copy(
        &self,
        pool: &DurableBufferPool,
        bytes: &[u8],
        will_sync: bool,
    ) -> JournalResult<Option<CommitTarget>> {
        let mut buf = self.buffer.lock();
        if !buf.fits(bytes.len()) {
            return Ok(None);
        }
        self.commit.begin_copy();
        let result = buf.append(pool, bytes, (self.container, self.id));
        self.commit.end_copy(will_sync && result.is_ok());
        let offset = result?;
        Ok(Some(CommitTarget {
            generation: buf.seq,
            offset,
        }))
    }

    /// Register for a barrier without copying (multi-put)
    pub fn enter_sync(&self) {
        self.commit.enter_sync();
    }

    /// Block until `target` is durable
    pub fn barrier(
        &self,
        target: CommitTarget,
        pool: &DurableBufferPool,
        store: &dyn BackingStore,
        stats: &JournalStats,
    ) -> JournalResult<()> {
        self.commit
            .barrier(target, || self.flush(pool, store, stats))
    }

    /// Flush everything written so far. Falls back to writing the image
    /// straight to the backing store once the durable buffer is gone.
    fn flush(&self, pool: &DurableBufferPool, store: &dyn BackingStore, stats: &JournalStats) -> JournalResult<usize> {
        let (buffer, written) = {
            let buf = self.buffer.lock();
            (buf.live_buffer(), buf.image.len())
        };
        if let Some(buffer) = buffer {
            match pool.sync(buffer, written, Alignment::Up) {
                Ok(durable) => return Ok(durable),
                Err(e @ JournalError::DeviceFailure(_)) => {
                    self.buffer.lock().mark_device_failed(self.container, self.id, &e);
                }
                Err(e) => return Err(e),
            }
        }

        let buf = self.buffer.lock();
        store.put(self.container, &so_key(self.id, buf.seq), &buf.image)?;
        stats.record_direct_commit();
        Ok(buf.image.len())
    }

    /// Copy of the in-progress image
    pub fn image(&self) -> Vec<u8> {
        self.buffer.lock().image.clone()
    }

    pub fn commit_snapshot(&self) -> CommitSnapshot {
        self.commit.snapshot()
    }
}

// ============================================================================
// Stream - reclamation state, guarded by the container lock
// ============================================================================

/// Comparable view of one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSnapshot {
    pub id: u32,
    pub seq_oldest: u64,
    pub seq_next: u64,
    pub newest_trx: Option<u64>,
    /// Names of the placement groups linked to the oldest SO, sorted
    pub aging: Vec<String>,
}

/// One stream of a container
#[derive(Debug)]
pub struct Stream {
    shared: Arc<StreamShared>,
    seq_oldest: u64,
    seq_next: u64,
    newest_trx: Option<u64>,
    aging: Vec<PgId>,
    /// Newest trim record per group found in the oldest SO
    held_trims: Vec<(PgId, LogRecord)>,
}

impl Stream {
    /// Start a stream whose in-progress SO is `seq_next`. Takes a durable
    /// buffer from the pool and writes the SO header into it; a disabled pool
    /// leaves the stream in direct-commit mode.
    pub fn create(env: &StreamEnv<'_>, id: u32, seq_oldest: u64, seq_next: u64) -> JournalResult<Self> {
        debug_assert!(seq_oldest <= seq_next, "Precondition: seq_oldest <= seq_next");
        let buffer = match env.pool.acquire() {
            Ok(buffer) => Some(buffer),
            Err(JournalError::DeviceFailure(_)) => None,
            Err(e) => return Err(e),
        };
        let header = SoHeader::new(env.container, id, seq_next);
        let mut stream_buffer = StreamBuffer::new(header, buffer, env.config.buffer.buffer_capacity());
        let durable = stream_buffer.reset_device(env.pool, (env.container, id));

        Ok(Stream {
            shared: Arc::new(StreamShared {
                container: env.container,
                id,
                buffer: Mutex::new(stream_buffer),
                commit: CommitCoordinator::new(
                    seq_next,
                    durable,
                    env.config.journal.group_commit,
                    Arc::clone(env.stats),
                ),
            }),
            seq_oldest,
            seq_next,
            newest_trx: None,
            aging: Vec::new(),
            held_trims: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn shared(&self) -> &Arc<StreamShared> {
        &self.shared
    }

    pub fn seq_oldest(&self) -> u64 {
        self.seq_oldest
    }

    pub fn seq_next(&self) -> u64 {
        self.seq_next
    }

    /// Persisted SOs not yet reclaimed
    pub fn persisted_count(&self) -> u64 {
        self.seq_next - self.seq_oldest
    }

    /// Append an encoded record, rotating first if it does not fit. Returns the
    /// caller's durability target; with `will_sync` the caller is registered
    /// for a barrier.
    pub fn append(
        &mut self,
        env: &StreamEnv<'_>,
        index: &mut PlacementIndex,
        bytes: &[u8],
        will_sync: bool,
    ) -> JournalResult<CommitTarget> {
        if SO_HEADER_SIZE + bytes.len() > env.config.buffer.buffer_capacity() {
            return Err(JournalError::NoSpace);
        }
        if let Some(target) = self.shared.try_copy(env.pool, bytes, will_sync)? {
            return Ok(target);
        }
        self.rotate(env, index)?;
        self.shared
            .try_copy(env.pool, bytes, will_sync)?
            .ok_or(JournalError::NoSpace)
    }

    /// Cut the in-progress SO over to the backing store and start the next
    pub fn rotate(&mut self, env: &StreamEnv<'_>, index: &mut PlacementIndex) -> JournalResult<()> {
        let shared = Arc::clone(&self.shared);
        let ids = (env.container, shared.id);
        let rotated_out = shared.commit.rotate(|| {
            let mut buf = shared.buffer.lock();
            let seq = buf.seq;
            env.store.put(env.container, &so_key(shared.id, seq), &buf.image)?;
            let header = SoHeader::new(env.container, shared.id, seq + 1);
            let (old, durable) = buf.install(env.pool, header, ids);
            Ok((
                Rotated {
                    generation: seq + 1,
                    durable,
                },
                old,
            ))
        })?;

        self.seq_next += 1;
        env.stats.record_rotation();
        tracing::debug!(
            container = env.container,
            stream = shared.id,
            seq = self.seq_next - 1,
            bytes = rotated_out.len(),
            "streaming object rotated"
        );

        if self.persisted_count() == 1 {
            let so = StreamingObject::from_bytes(rotated_out)?;
            self.compute_status(&so, index)?;
        }
        Ok(())
    }

    /// Scan the oldest persisted SO: newest transaction id, and link every
    /// placement group it touches into the aging set
    pub fn compute_status(&mut self, so: &StreamingObject, index: &mut PlacementIndex) -> JournalResult<()> {
        let stream = self.shared.id as usize;
        for view in so.records() {
            let view = view?;
            if !view.kind.is_live_kind() {
                continue;
            }
            self.newest_trx = Some(self.newest_trx.map_or(view.trx_id, |n| n.max(view.trx_id)));
            let key = DecodedKey::parse(view.key_str()?, usize::MAX)?;
            let pg = index.lookup_or_create(&key, || Some(stream))?;
            let group = index.get_mut(pg);
            if group.link_aging() {
                self.aging.push(pg);
            }
            group.observe_counter(key.counter());
            if view.kind == RecordKind::Trim {
                group.advance_trim(key.counter());
                self.hold_trim(pg, &view)?;
            }
        }
        Ok(())
    }

    fn hold_trim(&mut self, pg: PgId, view: &RecordView<'_>) -> JournalResult<()> {
        match self.held_trims.iter_mut().find(|(id, _)| *id == pg) {
            Some((_, held)) if held.counter >= view.counter => {}
            Some((_, held)) => *held = view.to_owned_record()?,
            None => self.held_trims.push((pg, view.to_owned_record()?)),
        }
        Ok(())
    }

    /// Whether the oldest persisted SO holds only obsolete records
    pub fn is_reclaimable(&self, oldest_active: u64, index: &PlacementIndex) -> bool {
        self.newest_trx.map_or(true, |n| n < oldest_active)
            && self.aging.iter().all(|&pg| index.get(pg).is_obsolete())
    }

    fn clear_aging(&mut self, index: &mut PlacementIndex) {
        for pg in self.aging.drain(..) {
            index.get_mut(pg).clear_aging();
        }
        self.held_trims.clear();
        self.newest_trx = None;
    }

    /// Re-append the oldest SO's trim records that still define their
    /// group's trim position, and wait until the copies are durable.
    /// Returns false, copying nothing, when they do not fit in the
    /// in-progress image.
    fn carry_trims(&mut self, env: &StreamEnv<'_>, index: &PlacementIndex) -> JournalResult<bool> {
        let carried: Vec<Vec<u8>> = self
            .held_trims
            .iter()
            .filter(|(pg, record)| index.get(*pg).trim_position() == Some(record.counter))
            .map(|(_, record)| record.encode())
            .collect();
        if carried.is_empty() {
            return Ok(true);
        }
        let Some(target) = self.shared.try_copy(env.pool, &carried.concat(), true)? else {
            return Ok(false);
        };
        self.shared.barrier(target, env.pool, env.store, env.stats)?;
        tracing::debug!(
            container = env.container,
            stream = self.shared.id,
            records = carried.len(),
            "trim records carried forward"
        );
        Ok(true)
    }

    /// Delete oldest SOs while they are reclaimable and another persisted SO
    /// remains. Trim records that still define a group's trim position are
    /// carried into the in-progress image first. Returns the number deleted.
    pub fn sweep(&mut self, env: &StreamEnv<'_>, index: &mut PlacementIndex) -> JournalResult<usize> {
        let oldest_active = env.transactions.oldest_active();
        let id = self.shared.id;
        let mut reclaimed = 0;
        while self.persisted_count() > 1 && self.is_reclaimable(oldest_active, index) {
            if !self.carry_trims(env, index)? {
                tracing::debug!(
                    container = env.container,
                    stream = id,
                    seq = self.seq_oldest,
                    "no room to carry trim records, reclamation deferred"
                );
                break;
            }
            let next_seq = self.seq_oldest + 1;
            let next = StreamingObject::from_bytes(env.store.get(env.container, &so_key(id, next_seq))?)?;
            env.store.delete(env.container, &so_key(id, self.seq_oldest))?;
            self.seq_oldest = next_seq;
            self.clear_aging(index);
            self.compute_status(&next, index)?;
            env.stats.record_reclaimed();
            reclaimed += 1;
        }
        if reclaimed > 0 {
            tracing::debug!(
                container = env.container,
                stream = id,
                reclaimed,
                seq_oldest = self.seq_oldest,
                "streaming objects reclaimed"
            );
        }
        Ok(reclaimed)
    }

    /// Every SO of this stream in log order: persisted ones from the backing
    /// store, then the in-progress image
    pub fn objects(&self, env: &StreamEnv<'_>) -> JournalResult<Vec<StreamingObject>> {
        let mut out = Vec::with_capacity(self.persisted_count() as usize + 1);
        for seq in self.seq_oldest..self.seq_next {
            let bytes = env.store.get(env.container, &so_key(self.shared.id, seq))?;
            out.push(StreamingObject::from_bytes(bytes)?);
        }
        out.push(StreamingObject::from_bytes(self.shared.image())?);
        Ok(out)
    }

    /// Persist a non-empty in-progress SO, then clear and release the
    /// durable buffer. Runs as a final rotation so writers still waiting on a
    /// barrier see their records as durable.
    pub fn close(self, env: &StreamEnv<'_>) -> JournalResult<()> {
        let shared = &self.shared;
        shared.commit.rotate(|| {
            let mut buf = shared.buffer.lock();
            if buf.has_records() {
                env.store.put(env.container, &so_key(shared.id, buf.seq), &buf.image)?;
            }
            if let Some(buffer) = buf.buffer.take() {
                if !buf.device_failed {
                    if let Err(e) = env.pool.reset(buffer) {
                        buf.mark_device_failed(env.container, shared.id, &e);
                    }
                }
                env.pool.release(buffer);
            }
            buf.device_failed = true;
            Ok((
                Rotated {
                    generation: buf.seq + 1,
                    durable: 0,
                },
                (),
            ))
        })
    }

    pub fn snapshot(&self, index: &PlacementIndex) -> StreamSnapshot {
        let mut aging: Vec<String> = self
            .aging
            .iter()
            .map(|&pg| String::from_utf8_lossy(index.get(pg).name()).into_owned())
            .collect();
        aging.sort();
        StreamSnapshot {
            id: self.shared.id,
            seq_oldest: self.seq_oldest,
            seq_next: self.seq_next,
            newest_trx: self.newest_trx,
            aging,
        }
    }
}
