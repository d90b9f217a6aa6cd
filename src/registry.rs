//! Container Registry
//!
//! The fixed set of container slots (`0..max_containers`). Starting the
//! registry recovers the durable buffer pool and distributes the master
//! reversion packet; each container is then recovered when first opened.
//!
//! The slot table lock is taken for reading by ordinary operations and for
//! writing by open, close and delete.

use crate::buffer::{DurableBufferPool, RawDevice, RecoveredBuffer};
use crate::config::JournalConfig;
use crate::container::{Container, JournalContext};
use crate::error::{JournalError, JournalResult};
use crate::object::SoHeader;
use crate::recovery::{distribute_reversion_packets, recycle, RecoveryEngine};
use crate::store::BackingStore;
use crate::transaction::TransactionRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Registry of logging containers
#[derive(Debug)]
pub struct ContainerRegistry {
    ctx: JournalContext,
    slots: RwLock<Vec<Option<Arc<Container>>>>,
    /// Buffer images from the last run, waiting for their container to open
    pending: Mutex<BTreeMap<u32, Vec<RecoveredBuffer>>>,
}

impl ContainerRegistry {
    /// Bring the journal up over `devices` (one per mirror) and `store`
    pub fn start(
        config: JournalConfig,
        store: Arc<dyn BackingStore>,
        devices: Vec<Arc<dyn RawDevice>>,
    ) -> JournalResult<Self> {
        config.validate()?;
        let pool = DurableBufferPool::restart_recover(config.buffer.clone(), devices)?;
        let ctx = JournalContext {
            config: Arc::new(config),
            pool: Arc::new(pool),
            store,
            transactions: TransactionRegistry::new(),
        };
        let max = ctx.config.journal.max_containers;

        let mut pending: BTreeMap<u32, Vec<RecoveredBuffer>> = BTreeMap::new();
        for image in ctx.pool.take_recovered() {
            match SoHeader::from_bytes(&image.bytes) {
                Ok(header) if header.container_id < max => {
                    pending.entry(header.container_id).or_default().push(image);
                }
                _ => {
                    tracing::warn!(buffer = image.id.index(), "recovered buffer has no owner, clearing it");
                    recycle(&ctx, image.id);
                }
            }
        }

        let mut known: BTreeSet<u32> = ctx.store.containers()?.into_iter().collect();
        known.extend(pending.keys().copied());
        let known: Vec<u32> = known.into_iter().filter(|&id| id < max).collect();
        distribute_reversion_packets(&ctx.config, &known)?;

        tracing::info!(
            max_containers = max,
            existing = known.len(),
            pending_images = pending.values().map(Vec::len).sum::<usize>(),
            buffer_pool_enabled = !ctx.pool.is_disabled(),
            "journal started"
        );

        Ok(ContainerRegistry {
            slots: RwLock::new(vec![None; max as usize]),
            pending: Mutex::new(pending),
            ctx,
        })
    }

    fn check_id(&self, id: u32) -> JournalResult<usize> {
        if id >= self.ctx.config.journal.max_containers {
            return Err(JournalError::ContainerUnknown(id));
        }
        Ok(id as usize)
    }

    /// Open (recovering if needed) container `id`. Opening an open
    /// container returns the live instance.
    pub fn open(&self, id: u32) -> JournalResult<Arc<Container>> {
        let slot = self.check_id(id)?;
        let mut slots = self.slots.write();
        if let Some(container) = &slots[slot] {
            return Ok(Arc::clone(container));
        }

        let images = self.pending.lock().remove(&id).unwrap_or_default();
        let (container, report) = RecoveryEngine::new(&self.ctx).open(id, images)?;
        tracing::info!(container = id, streams = report.streams, "container opened");

        let container = Arc::new(container);
        slots[slot] = Some(Arc::clone(&container));
        Ok(container)
    }

    /// The open container `id`
    pub fn get(&self, id: u32) -> JournalResult<Arc<Container>> {
        let slot = self.check_id(id)?;
        self.slots.read()[slot]
            .as_ref()
            .map(Arc::clone)
            .ok_or(JournalError::ContainerUnknown(id))
    }

    /// Run `f` against open container `id` while holding the table read lock
    pub fn with_container<T>(&self, id: u32, f: impl FnOnce(&Container) -> JournalResult<T>) -> JournalResult<T> {
        let slot = self.check_id(id)?;
        let slots = self.slots.read();
        match &slots[slot] {
            Some(container) => f(container),
            None => Err(JournalError::ContainerUnknown(id)),
        }
    }

    /// Close container `id`, persisting its in-progress SOs
    pub fn close(&self, id: u32) -> JournalResult<()> {
        let slot = self.check_id(id)?;
        let container = self.slots.write()[slot]
            .take()
            .ok_or(JournalError::ContainerUnknown(id))?;
        container.close()
    }

    /// Remove container `id` and everything it stored
    pub fn delete(&self, id: u32) -> JournalResult<()> {
        let slot = self.check_id(id)?;
        let mut slots = self.slots.write();
        if let Some(container) = slots[slot].take() {
            container.close()?;
        }
        for image in self.pending.lock().remove(&id).unwrap_or_default() {
            recycle(&self.ctx, image.id);
        }
        self.ctx.store.delete_container(id)?;
        match std::fs::remove_file(self.ctx.config.reversion_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(container = id, "container deleted");
        Ok(())
    }

    /// Close every open container; returns the first error
    pub fn close_all(&self) -> JournalResult<()> {
        let open: Vec<Arc<Container>> = self.slots.write().iter_mut().filter_map(Option::take).collect();
        let mut first_err = None;
        for container in open {
            if let Err(e) = container.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Ids of open containers, ascending
    pub fn open_ids(&self) -> Vec<u32> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    pub fn config(&self) -> &JournalConfig {
        &self.ctx.config
    }

    pub fn pool(&self) -> &DurableBufferPool {
        &self.ctx.pool
    }

    pub fn transactions(&self) -> &TransactionRegistry {
        &self.ctx.transactions
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.ctx.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MemoryDevice;
    use crate::store::InMemoryBackingStore;

    struct Media {
        config: JournalConfig,
        device: MemoryDevice,
        store: InMemoryBackingStore,
        _dir: tempfile::TempDir,
    }

    impl Media {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = JournalConfig::test();
            config.journal.crash_recovery_dir = dir.path().to_path_buf();
            Media {
                device: MemoryDevice::new(config.buffer.partition_size()),
                store: InMemoryBackingStore::new(),
                config,
                _dir: dir,
            }
        }

        fn start(&self) -> ContainerRegistry {
            let devices: Vec<Arc<dyn RawDevice>> = vec![Arc::new(self.device.clone())];
            ContainerRegistry::start(self.config.clone(), Arc::new(self.store.clone()), devices).unwrap()
        }
    }

    #[test]
    fn test_open_get_close() {
        let media = Media::new();
        let registry = media.start();
        assert!(matches!(registry.get(1), Err(JournalError::ContainerUnknown(1))));

        let a = registry.open(1).unwrap();
        let b = registry.open(1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.open_ids(), vec![1]);
        registry
            .with_container(1, |c| c.write("1_pg_a", b"v"))
            .unwrap();

        registry.close(1).unwrap();
        assert!(registry.open_ids().is_empty());
        assert!(matches!(registry.close(1), Err(JournalError::ContainerUnknown(1))));
    }

    #[test]
    fn test_ids_outside_table_are_unknown() {
        let media = Media::new();
        let registry = media.start();
        let max = media.config.journal.max_containers;
        assert!(matches!(registry.open(max), Err(JournalError::ContainerUnknown(_))));
    }

    #[test]
    fn test_reopen_after_close_keeps_data() {
        let media = Media::new();
        {
            let registry = media.start();
            let c = registry.open(0).unwrap();
            c.write("1_pg_a", b"v1").unwrap();
            registry.close_all().unwrap();
        }
        let registry = media.start();
        assert_eq!(registry.open(0).unwrap().read("1_pg_a").unwrap(), b"v1");
    }

    #[test]
    fn test_crash_keeps_acknowledged_writes() {
        let media = Media::new();
        {
            let registry = media.start();
            let c = registry.open(0).unwrap();
            c.write("1_pg_a", b"v1").unwrap();
            c.write("2_pg_b", b"v2").unwrap();
            // dropped without close: only the durable buffer holds the records
        }
        assert!(media.store.keys(0).is_empty());

        let registry = media.start();
        let c = registry.open(0).unwrap();
        assert_eq!(c.read("1_pg_a").unwrap(), b"v1");
        assert_eq!(c.read("2_pg_b").unwrap(), b"v2");
        assert!(media.store.exists(0, "SO_0_0").unwrap());
        assert_eq!(c.snapshot().streams[0].seq_next, 1);
    }

    #[test]
    fn test_corrupt_buffer_disables_pool() {
        let media = Media::new();
        {
            let registry = media.start();
            registry.open(0).unwrap().write("1_pg_a", b"v1").unwrap();
        }
        // Flip a byte inside the first block's payload
        media.device.corrupt(30);

        let registry = media.start();
        assert!(registry.pool().is_disabled());
        let c = registry.open(0).unwrap();
        c.write("2_pg_b", b"v2").unwrap();
        assert_eq!(c.read("2_pg_b").unwrap(), b"v2");
        assert_eq!(c.stats().direct_commits, 1);
    }

    #[test]
    fn test_delete_removes_everything() {
        let media = Media::new();
        let registry = media.start();
        let c = registry.open(2).unwrap();
        c.write("1_pg_a", b"v1").unwrap();
        registry.close(2).unwrap();
        registry.open(2).unwrap();
        let free_before = registry.pool().free_count();

        registry.delete(2).unwrap();

        assert!(media.store.keys(2).is_empty());
        assert!(!media.store.containers().unwrap().contains(&2));
        assert_eq!(registry.pool().free_count(), free_before + 1);
        let reopened = registry.open(2).unwrap();
        assert!(matches!(reopened.read("1_pg_a"), Err(JournalError::ObjectUnknown)));
    }

    #[test]
    fn test_start_distributes_master_packet() {
        let media = Media::new();
        {
            let registry = media.start();
            registry.open(0).unwrap();
            registry.open(3).unwrap();
            registry.close_all().unwrap();
        }
        crate::recovery::ReversionList::from_ids([7])
            .store(&media.config.master_reversion_path())
            .unwrap();

        let _registry = media.start();

        assert!(!media.config.master_reversion_path().exists());
        assert!(media.config.reversion_path(0).exists());
        assert!(media.config.reversion_path(3).exists());
        assert!(!media.config.reversion_path(1).exists());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let media = Media::new();
        let mut config = media.config.clone();
        config.buffer.block_size = 7;
        let devices: Vec<Arc<dyn RawDevice>> = vec![Arc::new(media.device.clone())];
        let err = ContainerRegistry::start(config, Arc::new(media.store.clone()), devices).unwrap_err();
        assert!(matches!(err, JournalError::Config(_)));
    }
}
