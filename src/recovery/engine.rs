//! Container-open recovery
//!
//! Rebuilds a container's streams and placement-group index from the
//! backing store:
//!
//! 1. Fold durable buffer images left by a crash into the store as the SO
//!    for their sequence number, unless that SO already exists.
//! 2. Scan every SO. Records written by a rolled-back transaction are
//!    rewritten in place as tombstones and the SO is written back; every
//!    other record registers its placement group (Trim records also move
//!    the trim position).
//! 3. Pad the stream set up to the configured count, start each stream at
//!    its next sequence number and compute the status of its oldest SO.
//!    Streams found beyond the configured count still need a free buffer
//!    each; the open fails with `NoSpace` instead of waiting for one.
//! 4. Delete the container's reversion packet. Until then a crash repeats
//!    the whole pass, which is idempotent.

use super::reversion::ReversionList;
use crate::buffer::{BufferId, RecoveredBuffer};
use crate::container::{Container, JournalContext};
use crate::error::{JournalError, JournalResult};
use crate::key::DecodedKey;
use crate::object::{parse_so_key, so_key, StreamingObject};
use crate::placement::PlacementIndex;
use crate::record::RecordKind;
use crate::stats::JournalStats;
use crate::stream::{Stream, StreamEnv};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What one container open found and changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub objects_scanned: u64,
    pub records_tombstoned: u64,
    pub objects_rewritten: u64,
    pub buffers_folded: u64,
    pub buffers_dropped: u64,
    pub streams: u32,
    pub groups: usize,
}

/// Persisted SO range of one stream, with its oldest SO kept for the
/// status computation
struct StreamExtent {
    oldest_seq: u64,
    newest_seq: u64,
    oldest: StreamingObject,
}

/// Rebuilds containers from the backing store
pub struct RecoveryEngine<'a> {
    ctx: &'a JournalContext,
}

impl<'a> RecoveryEngine<'a> {
    pub fn new(ctx: &'a JournalContext) -> Self {
        RecoveryEngine { ctx }
    }

    /// Recover container `id`. `images` are the durable buffer images whose
    /// SO header names this container; each buffer is reset and returned to
    /// the pool.
    pub fn open(&self, id: u32, images: Vec<RecoveredBuffer>) -> JournalResult<(Container, RecoveryReport)> {
        let config = &*self.ctx.config;
        let store = &*self.ctx.store;
        store.create_container(id)?;

        let reversion_path = config.reversion_path(id);
        let reversion = ReversionList::load(&reversion_path)?;
        let mut report = RecoveryReport::default();

        self.fold_images(id, images, &reversion, &mut report)?;

        let mut index = PlacementIndex::new(
            config.journal.pg_buckets,
            config.journal.max_placement_groups,
            config.journal.max_key_len,
        );
        let mut extents: BTreeMap<u32, StreamExtent> = BTreeMap::new();
        for (key, bytes) in store.enumerate(id)? {
            let Some((stream, seq)) = parse_so_key(&key) else {
                tracing::warn!(container = id, key = %key, "ignoring foreign object");
                continue;
            };
            let mut so = StreamingObject::from_bytes(bytes)?;
            let header = *so.header();
            if header.container_id != id || header.stream_id != stream || header.seq != seq {
                return Err(JournalError::Corruption(format!(
                    "object {} of container {} carries header {:?}",
                    key, id, header
                )));
            }
            report.objects_scanned += 1;

            let reverted = revert(&mut so, &reversion)?;
            if reverted > 0 {
                store.put(id, &key, so.as_bytes())?;
                report.records_tombstoned += reverted as u64;
                report.objects_rewritten += 1;
            }
            self.register_records(&so, stream as usize, &mut index)?;

            match extents.get_mut(&stream) {
                Some(extent) => {
                    extent.newest_seq = extent.newest_seq.max(seq);
                    if seq < extent.oldest_seq {
                        extent.oldest_seq = seq;
                        extent.oldest = so;
                    }
                }
                None => {
                    extents.insert(
                        stream,
                        StreamExtent {
                            oldest_seq: seq,
                            newest_seq: seq,
                            oldest: so,
                        },
                    );
                }
            }
        }

        let configured = config.journal.streams_per_container;
        let found = extents.keys().next_back().map_or(0, |&max| max + 1);
        let count = configured.max(found);
        // Opens are serialized by the registry, so the free count is exact
        let free = self.ctx.pool.free_count();
        if !self.ctx.pool.is_disabled() && free < count as usize {
            tracing::error!(
                container = id,
                streams = count,
                configured,
                free,
                "not enough free durable buffers for the recovered streams"
            );
            return Err(JournalError::NoSpace);
        }

        for pg in index.ids() {
            let group = index.get_mut(pg);
            if group.stream().is_none() {
                group.assign_stream(pg % count as usize);
            }
        }

        let stats = Arc::new(JournalStats::default());
        let env = StreamEnv {
            container: id,
            config,
            pool: &self.ctx.pool,
            store,
            transactions: &self.ctx.transactions,
            stats: &stats,
        };
        let mut streams = Vec::with_capacity(count as usize);
        for sid in 0..count {
            let stream = match extents.get(&sid) {
                Some(extent) => {
                    let mut stream = Stream::create(&env, sid, extent.oldest_seq, extent.newest_seq + 1)?;
                    stream.compute_status(&extent.oldest, &mut index)?;
                    stream
                }
                None => Stream::create(&env, sid, 0, 0)?,
            };
            streams.push(stream);
        }

        match std::fs::remove_file(&reversion_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        report.streams = count;
        report.groups = index.len();
        tracing::info!(
            container = id,
            objects = report.objects_scanned,
            tombstoned = report.records_tombstoned,
            rewritten = report.objects_rewritten,
            folded = report.buffers_folded,
            streams = count,
            groups = report.groups,
            "container recovered"
        );

        Ok((Container::assemble(id, self.ctx.clone(), stats, index, streams), report))
    }

    /// Write crash-surviving buffer images to the store, then recycle the
    /// buffers
    fn fold_images(
        &self,
        id: u32,
        images: Vec<RecoveredBuffer>,
        reversion: &ReversionList,
        report: &mut RecoveryReport,
    ) -> JournalResult<()> {
        let store = &*self.ctx.store;
        for image in images {
            let buffer = image.id;
            let folded = match StreamingObject::from_bytes(image.bytes) {
                Ok(mut so) if so.has_records() => {
                    debug_assert_eq!(so.header().container_id, id, "Precondition: image belongs here");
                    let key = so_key(so.header().stream_id, so.header().seq);
                    if store.exists(id, &key)? {
                        false
                    } else {
                        report.records_tombstoned += revert(&mut so, reversion)? as u64;
                        store.put(id, &key, so.as_bytes())?;
                        true
                    }
                }
                Ok(_) => false,
                Err(e) => {
                    tracing::warn!(container = id, buffer = buffer.index(), error = %e, "dropping unreadable buffer image");
                    false
                }
            };
            if folded {
                report.buffers_folded += 1;
            } else {
                report.buffers_dropped += 1;
            }
            recycle(self.ctx, buffer);
        }
        Ok(())
    }

    /// Register the placement group of every live record and keep the
    /// transaction id allocator ahead of ids on media
    fn register_records(&self, so: &StreamingObject, stream: usize, index: &mut PlacementIndex) -> JournalResult<()> {
        for view in so.records() {
            let view = view?;
            self.ctx.transactions.observe(view.trx_id);
            if !view.kind.is_live_kind() {
                continue;
            }
            let key = DecodedKey::parse(view.key_str()?, usize::MAX)?;
            let pg = index.lookup_or_create(&key, || Some(stream))?;
            if view.kind == RecordKind::Trim {
                index.get(pg).advance_trim(key.counter());
            }
        }
        Ok(())
    }
}

/// Tombstone every record of a rolled-back transaction. Returns the number
/// rewritten.
fn revert(so: &mut StreamingObject, reversion: &ReversionList) -> JournalResult<usize> {
    if reversion.is_empty() {
        return Ok(0);
    }
    let mut offsets = Vec::new();
    for view in so.records() {
        let view = view?;
        if view.kind.is_live_kind() && reversion.contains(view.trx_id) {
            offsets.push(view.offset);
        }
    }
    let len = so.as_bytes().len();
    for &offset in &offsets {
        so.tombstone(offset);
    }
    debug_assert_eq!(so.as_bytes().len(), len, "Postcondition: size unchanged");
    Ok(offsets.len())
}

/// Durably clear a buffer and put it back on the free list
pub(crate) fn recycle(ctx: &JournalContext, buffer: BufferId) {
    if let Err(e) = ctx.pool.reset(buffer) {
        tracing::warn!(buffer = buffer.index(), error = %e, "could not reset recovered buffer");
    }
    ctx.pool.release(buffer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{DurableBufferPool, MemoryDevice, RawDevice};
    use crate::config::JournalConfig;
    use crate::object::SoHeader;
    use crate::record::LogRecord;
    use crate::store::{BackingStore, InMemoryBackingStore};
    use crate::transaction::TransactionRegistry;

    struct Fixture {
        ctx: JournalContext,
        store: InMemoryBackingStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JournalConfig::test();
        config.journal.crash_recovery_dir = dir.path().to_path_buf();
        let device = MemoryDevice::new(config.buffer.partition_size());
        let devices: Vec<Arc<dyn RawDevice>> = vec![Arc::new(device)];
        let pool = DurableBufferPool::new(config.buffer.clone(), devices).unwrap();
        let store = InMemoryBackingStore::new();
        Fixture {
            ctx: JournalContext {
                config: Arc::new(config),
                pool: Arc::new(pool),
                store: Arc::new(store.clone()),
                transactions: TransactionRegistry::new(),
            },
            store,
            _dir: dir,
        }
    }

    fn so_with(container: u32, stream: u32, seq: u64, records: &[LogRecord]) -> Vec<u8> {
        let mut bytes = SoHeader::new(container, stream, seq).to_bytes().to_vec();
        for record in records {
            record.encode_into(&mut bytes);
        }
        bytes
    }

    #[test]
    fn test_open_empty_container() {
        let fx = fixture();
        let (container, report) = RecoveryEngine::new(&fx.ctx).open(2, Vec::new()).unwrap();
        assert_eq!(report.objects_scanned, 0);
        assert_eq!(report.streams, 1);
        let snap = container.snapshot();
        assert_eq!(snap.streams[0].seq_next, 0);
        assert!(fx.store.containers().unwrap().contains(&2));
    }

    #[test]
    fn test_open_rebuilds_streams_and_groups() {
        let fx = fixture();
        fx.store
            .put(1, "SO_0_3", &so_with(1, 0, 3, &[LogRecord::write(5, 1, "1_pg_a", b"v1")]))
            .unwrap();
        fx.store
            .put(
                1,
                "SO_0_4",
                &so_with(1, 0, 4, &[LogRecord::write(6, 2, "2_pg_b", b"v2"), LogRecord::trim(7, 1, "1_pg")]),
            )
            .unwrap();
        fx.store
            .put(1, "SO_2_0", &so_with(1, 2, 0, &[LogRecord::write(8, 1, "1_other", b"x")]))
            .unwrap();

        let (container, report) = RecoveryEngine::new(&fx.ctx).open(1, Vec::new()).unwrap();

        assert_eq!(report.objects_scanned, 3);
        assert_eq!(report.streams, 3);
        let snap = container.snapshot();
        assert_eq!((snap.streams[0].seq_oldest, snap.streams[0].seq_next), (3, 5));
        assert_eq!((snap.streams[1].seq_oldest, snap.streams[1].seq_next), (0, 0));
        assert_eq!((snap.streams[2].seq_oldest, snap.streams[2].seq_next), (0, 1));
        assert_eq!(snap.streams[0].newest_trx, Some(5));

        let pg = snap.groups.iter().find(|g| g.name == "pg").unwrap();
        assert_eq!(pg.trim, Some(1));
        assert_eq!(pg.stream, Some(0));
        assert!(pg.aging);
        assert_eq!(snap.groups.iter().find(|g| g.name == "other").unwrap().stream, Some(2));

        assert!(matches!(container.read("1_pg_a"), Err(JournalError::ObjectDeleted)));
        assert_eq!(container.read("2_pg_b").unwrap(), b"v2");
        // Ids on media are never handed out again
        assert!(fx.ctx.transactions.peek_next() > 8);
    }

    #[test]
    fn test_rollback_tombstones_in_place() {
        let fx = fixture();
        let original = so_with(
            0,
            0,
            0,
            &[LogRecord::write(10, 1, "1_pg_a", b"keep"), LogRecord::write(11, 2, "2_pg_b", b"undo")],
        );
        fx.store.put(0, "SO_0_0", &original).unwrap();
        let path = fx.ctx.config.reversion_path(0);
        ReversionList::from_ids([11]).store(&path).unwrap();

        let (container, report) = RecoveryEngine::new(&fx.ctx).open(0, Vec::new()).unwrap();

        assert_eq!(report.records_tombstoned, 1);
        assert_eq!(report.objects_rewritten, 1);
        assert!(!path.exists());
        let rewritten = fx.store.get(0, "SO_0_0").unwrap();
        assert_eq!(rewritten.len(), original.len());
        assert_eq!(container.read("1_pg_a").unwrap(), b"keep");
        assert!(matches!(container.read("2_pg_b"), Err(JournalError::ObjectUnknown)));
    }

    #[test]
    fn test_corrupt_header_is_rejected() {
        let fx = fixture();
        fx.store.put(0, "SO_0_1", &so_with(0, 0, 2, &[])).unwrap();
        assert!(matches!(
            RecoveryEngine::new(&fx.ctx).open(0, Vec::new()),
            Err(JournalError::Corruption(_))
        ));
    }

    #[test]
    fn test_fold_skips_sequences_already_stored() {
        let fx = fixture();
        let stored = so_with(0, 0, 0, &[LogRecord::write(1, 1, "1_pg_a", b"stored")]);
        fx.store.put(0, "SO_0_0", &stored).unwrap();

        let a = fx.ctx.pool.acquire().unwrap();
        let b = fx.ctx.pool.acquire().unwrap();
        let c = fx.ctx.pool.acquire().unwrap();
        let images = vec![
            RecoveredBuffer {
                id: a,
                bytes: so_with(0, 0, 0, &[LogRecord::write(1, 1, "1_pg_a", b"stale")]),
            },
            RecoveredBuffer {
                id: b,
                bytes: so_with(0, 0, 1, &[LogRecord::write(2, 2, "2_pg_b", b"folded")]),
            },
            RecoveredBuffer {
                id: c,
                bytes: vec![0xAB; 40],
            },
        ];
        let free_before = fx.ctx.pool.free_count();

        let (container, report) = RecoveryEngine::new(&fx.ctx).open(0, images).unwrap();

        assert_eq!(report.buffers_folded, 1);
        assert_eq!(report.buffers_dropped, 2);
        assert_eq!(fx.store.get(0, "SO_0_0").unwrap(), stored);
        assert_eq!(container.read("2_pg_b").unwrap(), b"folded");
        assert_eq!(container.snapshot().streams[0].seq_next, 2);
        // Three recycled, one taken by the stream
        assert_eq!(fx.ctx.pool.free_count(), free_before + 3 - 1);
    }

    #[test]
    fn test_open_is_idempotent() {
        let fx = fixture();
        fx.store
            .put(
                0,
                "SO_0_0",
                &so_with(0, 0, 0, &[LogRecord::write(3, 1, "1_pg_a", b"a"), LogRecord::write(4, 2, "2_pg_b", b"b")]),
            )
            .unwrap();
        fx.store
            .put(0, "SO_0_1", &so_with(0, 0, 1, &[LogRecord::write(5, 3, "3_pg_c", b"c")]))
            .unwrap();
        ReversionList::from_ids([4]).store(&fx.ctx.config.reversion_path(0)).unwrap();

        let (first, _) = RecoveryEngine::new(&fx.ctx).open(0, Vec::new()).unwrap();
        let first_snap = first.snapshot();
        first.close().unwrap();
        let (second, report) = RecoveryEngine::new(&fx.ctx).open(0, Vec::new()).unwrap();

        assert_eq!(second.snapshot(), first_snap);
        assert_eq!(report.records_tombstoned, 0);
    }
}
