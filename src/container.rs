//! Logging Container
//!
//! A container owns its streams and placement-group index behind one
//! reader/writer lock. Writes to a resident placement group whose stream has
//! room take the fast path under the read lock; everything else (group
//! creation, rotation, reclamation) takes the write lock. Durability is
//! always awaited after the container lock is dropped.

use crate::buffer::DurableBufferPool;
use crate::commit::CommitTarget;
use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use crate::key::{DecodedKey, Key};
use crate::object::SO_HEADER_SIZE;
use crate::placement::{PgId, PgSnapshot, PlacementIndex};
use crate::record::{LogRecord, RecordKind, RecordView};
use crate::stats::{JournalStats, StatsSnapshot};
use crate::store::BackingStore;
use crate::stream::{Stream, StreamEnv, StreamShared, StreamSnapshot};
use crate::transaction::TransactionRegistry;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Collaborators shared by every container of a registry
#[derive(Clone)]
pub struct JournalContext {
    pub config: Arc<JournalConfig>,
    pub pool: Arc<DurableBufferPool>,
    pub store: Arc<dyn BackingStore>,
    pub transactions: TransactionRegistry,
}

impl std::fmt::Debug for JournalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalContext")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Comparable view of a container's streams and placement groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSnapshot {
    pub id: u32,
    pub streams: Vec<StreamSnapshot>,
    pub groups: Vec<PgSnapshot>,
}

#[derive(Debug)]
struct ContainerState {
    index: PlacementIndex,
    streams: Vec<Stream>,
    next_stream: usize,
    rotations: u64,
}

impl ContainerState {
    fn check_open(&self, id: u32) -> JournalResult<()> {
        if self.streams.is_empty() {
            return Err(JournalError::ContainerUnknown(id));
        }
        Ok(())
    }

    /// Stream for `key`, creating its group round-robin on first sight
    fn place(&mut self, key: &DecodedKey<'_>) -> JournalResult<(PgId, usize)> {
        let count = self.streams.len();
        let cursor = &mut self.next_stream;
        let mut next = || {
            let stream = *cursor % count;
            *cursor = cursor.wrapping_add(1);
            stream
        };
        let pg = self.index.lookup_or_create(key, || Some(next()))?;
        let group = self.index.get_mut(pg);
        let stream = match group.stream() {
            Some(stream) => stream,
            None => {
                let stream = next();
                group.assign_stream(stream);
                stream
            }
        };
        Ok((pg, stream))
    }
}

/// One logging container
#[derive(Debug)]
pub struct Container {
    id: u32,
    ctx: JournalContext,
    stats: Arc<JournalStats>,
    state: RwLock<ContainerState>,
}

impl Container {
    /// Assemble a container from recovered parts
    pub(crate) fn assemble(
        id: u32,
        ctx: JournalContext,
        stats: Arc<JournalStats>,
        index: PlacementIndex,
        streams: Vec<Stream>,
    ) -> Self {
        debug_assert!(!streams.is_empty(), "Precondition: at least one stream");
        debug_assert!(
            streams.iter().enumerate().all(|(i, s)| s.id() as usize == i),
            "Invariant: stream ids are their positions"
        );
        Container {
            id,
            ctx,
            stats,
            state: RwLock::new(ContainerState {
                index,
                streams,
                next_stream: 0,
                rotations: 0,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn env(&self) -> StreamEnv<'_> {
        StreamEnv {
            container: self.id,
            config: &self.ctx.config,
            pool: &self.ctx.pool,
            store: &*self.ctx.store,
            transactions: &self.ctx.transactions,
            stats: &self.stats,
        }
    }

    fn decode<'a>(&self, key: &'a str) -> JournalResult<DecodedKey<'a>> {
        DecodedKey::parse(key, self.ctx.config.journal.max_key_len)
    }

    fn encode(&self, record: &LogRecord) -> JournalResult<Vec<u8>> {
        if SO_HEADER_SIZE + record.encoded_len() > self.ctx.config.buffer.buffer_capacity() {
            return Err(JournalError::NoSpace);
        }
        Ok(record.encode())
    }

    // ========================================================================
    // Client operations
    // ========================================================================

    /// Durably write `data` under `key`
    pub fn write(&self, key: &str, data: &[u8]) -> JournalResult<()> {
        let decoded = self.decode(key)?;
        self.ctx.transactions.with_transaction(|trx| {
            let record = LogRecord::write(trx, decoded.counter(), key, data);
            self.commit_record(&decoded, &record).map(|_| ())
        })
    }

    /// Durably mark `key` deleted
    pub fn delete(&self, key: &str) -> JournalResult<()> {
        let decoded = self.decode(key)?;
        self.ctx.transactions.with_transaction(|trx| {
            let record = LogRecord::delete(trx, decoded.counter(), key);
            self.commit_record(&decoded, &record).map(|_| ())
        })
    }

    /// Durably trim the key's placement group through the key's counter
    pub fn trim(&self, key: &str) -> JournalResult<()> {
        let decoded = self.decode(key)?;
        let pg = self.ctx.transactions.with_transaction(|trx| {
            let record = LogRecord::trim(trx, decoded.counter(), key);
            self.commit_record(&decoded, &record)
        })?;
        self.state.read().index.get(pg).advance_trim(decoded.counter());
        Ok(())
    }

    /// Newest visible value of `key`
    pub fn read(&self, key: &str) -> JournalResult<Vec<u8>> {
        let decoded = self.decode(key)?;
        let st = self.state.read();
        st.check_open(self.id)?;
        let Some(pg) = st.index.lookup_readonly(&decoded) else {
            return Err(JournalError::ObjectUnknown);
        };
        let group = st.index.get(pg);
        if group.is_trimmed(decoded.counter()) {
            return Err(JournalError::ObjectDeleted);
        }
        let Some(stream) = group.stream() else {
            return Err(JournalError::ObjectUnknown);
        };

        let mut newest: Option<(RecordKind, Vec<u8>)> = None;
        self.scan_group(&st, stream, decoded.name(), |view, key| {
            if key == decoded {
                newest = Some((view.kind, view.data.to_vec()));
            }
        })?;
        match newest {
            Some((RecordKind::Write, data)) => Ok(data),
            Some(_) => Err(JournalError::ObjectDeleted),
            None => Err(JournalError::ObjectUnknown),
        }
    }

    /// Snapshot the visible keys of placement group `name`, ordered by
    /// counter then key
    pub fn enumerate_start(&self, name: &str) -> JournalResult<EnumerationCursor> {
        let st = self.state.read();
        st.check_open(self.id)?;
        let Some(pg) = st.index.find_by_name(name.as_bytes()) else {
            return Ok(EnumerationCursor::default());
        };
        let group = st.index.get(pg);
        let Some(stream) = group.stream() else {
            return Ok(EnumerationCursor::default());
        };

        let mut latest: BTreeMap<Key, Option<Vec<u8>>> = BTreeMap::new();
        self.scan_group(&st, stream, name.as_bytes(), |view, key| {
            let value = (view.kind == RecordKind::Write).then(|| view.data.to_vec());
            latest.insert(key.to_key(), value);
        })?;
        let entries: Vec<(Key, Vec<u8>)> = latest
            .into_iter()
            .filter(|(key, _)| !group.is_trimmed(key.counter))
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect();
        Ok(EnumerationCursor {
            entries: entries.into_iter(),
        })
    }

    /// Next entry of an enumeration
    pub fn enumerate_next(&self, cursor: &mut EnumerationCursor) -> Option<(Key, Vec<u8>)> {
        cursor.next_entry()
    }

    /// Drop an enumeration
    pub fn enumerate_finish(&self, cursor: EnumerationCursor) {
        cursor.finish();
    }

    /// Durably write a batch in order. Every key, record size and new
    /// placement group is checked before anything is appended; each touched
    /// stream is synced once.
    pub fn multi_put(&self, batch: &[(&str, &[u8])]) -> JournalResult<()> {
        let keys = batch
            .iter()
            .map(|(key, _)| self.decode(key))
            .collect::<JournalResult<Vec<_>>>()?;

        self.ctx.transactions.with_transaction(|trx| {
            let records = keys
                .iter()
                .zip(batch)
                .map(|(decoded, (key, data))| {
                    self.encode(&LogRecord::write(trx, decoded.counter(), key, data))
                })
                .collect::<JournalResult<Vec<_>>>()?;

            let mut touched: BTreeMap<usize, (Arc<StreamShared>, CommitTarget)> = BTreeMap::new();
            {
                let mut guard = self.state.write();
                let st = &mut *guard;
                st.check_open(self.id)?;
                st.index.ensure_room(&keys)?;
                let env = self.env();
                for (decoded, bytes) in keys.iter().zip(&records) {
                    let (_, stream) = st.place(decoded)?;
                    let target = self.append_locked(st, &env, stream, bytes, false)?;
                    let entry = touched
                        .entry(stream)
                        .or_insert_with(|| (Arc::clone(st.streams[stream].shared()), target));
                    entry.1 = entry.1.max(target);
                }
                self.stats.record_slow_path();
            }

            for (shared, target) in touched.into_values() {
                shared.enter_sync();
                shared.barrier(target, &self.ctx.pool, &*self.ctx.store, &self.stats)?;
            }
            Ok(())
        })
    }

    /// Reclaim every reclaimable SO now. Returns the number deleted.
    pub fn reclaim(&self) -> JournalResult<usize> {
        let mut guard = self.state.write();
        let st = &mut *guard;
        st.check_open(self.id)?;
        let env = self.env();
        let mut total = 0;
        for stream in st.streams.iter_mut() {
            total += stream.sweep(&env, &mut st.index)?;
        }
        Ok(total)
    }

    /// Whether the oldest persisted SO of `stream` could be reclaimed now
    pub fn oldest_reclaimable(&self, stream: usize) -> JournalResult<bool> {
        let st = self.state.read();
        st.check_open(self.id)?;
        let stream = st
            .streams
            .get(stream)
            .ok_or(JournalError::ObjectUnknown)?;
        Ok(stream.persisted_count() > 1
            && stream.is_reclaimable(self.ctx.transactions.oldest_active(), &st.index))
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        let st = self.state.read();
        ContainerSnapshot {
            id: self.id,
            streams: st.streams.iter().map(|s| s.snapshot(&st.index)).collect(),
            groups: st.index.snapshot(),
        }
    }

    /// Persist in-progress SOs and return buffers to the pool. Later
    /// operations fail with `ContainerUnknown`.
    pub fn close(&self) -> JournalResult<()> {
        let mut st = self.state.write();
        let env = self.env();
        let streams = std::mem::take(&mut st.streams);
        let count = streams.len();
        let mut first_err = None;
        for stream in streams {
            if let Err(e) = stream.close(&env) {
                first_err.get_or_insert(e);
            }
        }
        tracing::info!(container = self.id, streams = count, "container closed");
        first_err.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Append one record and wait until it is durable. Returns the record's
    /// placement group.
    fn commit_record(&self, key: &DecodedKey<'_>, record: &LogRecord) -> JournalResult<PgId> {
        let bytes = self.encode(record)?;
        let (pg, shared, target) = match self.try_fast_path(key, &bytes)? {
            Some(copied) => copied,
            None => self.slow_path(key, &bytes)?,
        };
        shared.barrier(target, &self.ctx.pool, &*self.ctx.store, &self.stats)?;
        Ok(pg)
    }

    fn try_fast_path(
        &self,
        key: &DecodedKey<'_>,
        bytes: &[u8],
    ) -> JournalResult<Option<(PgId, Arc<StreamShared>, CommitTarget)>> {
        let st = self.state.read();
        st.check_open(self.id)?;
        let Some(pg) = st.index.lookup_readonly(key) else {
            return Ok(None);
        };
        let Some(stream) = st.index.get(pg).stream() else {
            return Ok(None);
        };
        let shared = st.streams[stream].shared();
        let Some(target) = shared.try_copy(&self.ctx.pool, bytes, true)? else {
            return Ok(None);
        };
        self.stats.record_fast_path();
        Ok(Some((pg, Arc::clone(shared), target)))
    }

    fn slow_path(&self, key: &DecodedKey<'_>, bytes: &[u8]) -> JournalResult<(PgId, Arc<StreamShared>, CommitTarget)> {
        let mut guard = self.state.write();
        let st = &mut *guard;
        st.check_open(self.id)?;
        let env = self.env();
        let (pg, stream) = st.place(key)?;
        let target = self.append_locked(st, &env, stream, bytes, true)?;
        self.stats.record_slow_path();
        Ok((pg, Arc::clone(st.streams[stream].shared()), target))
    }

    /// Append under the container write lock, sweeping every
    /// `reclaim_interval` rotations
    fn append_locked(
        &self,
        st: &mut ContainerState,
        env: &StreamEnv<'_>,
        stream: usize,
        bytes: &[u8],
        will_sync: bool,
    ) -> JournalResult<CommitTarget> {
        let before = st.streams[stream].seq_next();
        let target = st.streams[stream].append(env, &mut st.index, bytes, will_sync)?;
        let rotated = st.streams[stream].seq_next() - before;
        if rotated == 0 {
            return Ok(target);
        }

        st.rotations += rotated;
        if st.rotations % self.ctx.config.journal.reclaim_interval == 0 {
            // The record is already copied; a failed sweep is retried later
            if let Err(e) = st.streams[stream].sweep(env, &mut st.index) {
                tracing::warn!(container = self.id, stream, error = %e, "reclamation sweep failed");
            }
        }
        Ok(target)
    }

    /// Visit every Write/Delete record of placement group `name` in log order
    fn scan_group(
        &self,
        st: &ContainerState,
        stream: usize,
        name: &[u8],
        mut visit: impl FnMut(&RecordView<'_>, DecodedKey<'_>),
    ) -> JournalResult<()> {
        let env = self.env();
        for so in st.streams[stream].objects(&env)? {
            for view in so.records() {
                let view = view?;
                if !matches!(view.kind, RecordKind::Write | RecordKind::Delete) {
                    continue;
                }
                let key = DecodedKey::parse(view.key_str()?, usize::MAX)?;
                if key.name() == name {
                    visit(&view, key);
                }
            }
        }
        Ok(())
    }
}

/// Snapshot of one placement group's visible keys
#[derive(Debug, Default)]
pub struct EnumerationCursor {
    entries: std::vec::IntoIter<(Key, Vec<u8>)>,
}

impl EnumerationCursor {
    pub fn next_entry(&mut self) -> Option<(Key, Vec<u8>)> {
        self.entries.next()
    }

    pub fn remaining(&self) -> usize {
        self.entries.len()
    }

    pub fn finish(self) {}
}

impl Iterator for EnumerationCursor {
    type Item = (Key, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}
