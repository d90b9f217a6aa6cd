use super::BackingStore;
use crate::error::{JournalError, JournalResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    containers: BTreeSet<u32>,
    objects: BTreeMap<(u32, String), Vec<u8>>,
}

/// In-memory backing store for unit tests and deterministic simulation.
/// Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackingStore {
    inner: Arc<RwLock<Inner>>,
    fail_puts: Arc<AtomicBool>,
    puts: Arc<AtomicU64>,
    deletes: Arc<AtomicU64>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects across all containers
    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().objects.is_empty()
    }

    /// Keys stored for one container, sorted
    pub fn keys(&self, container: u32) -> Vec<String> {
        self.inner
            .read()
            .objects
            .range((container, String::new())..)
            .take_while(|((c, _), _)| *c == container)
            .map(|((_, k), _)| k.clone())
            .collect()
    }

    /// Make every later `put` fail with `NoSpace`
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Successful `put` calls
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// `delete` calls that removed an object
    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }
}

impl BackingStore for InMemoryBackingStore {
    fn create_container(&self, container: u32) -> JournalResult<()> {
        self.inner.write().containers.insert(container);
        Ok(())
    }

    fn put(&self, container: u32, key: &str, data: &[u8]) -> JournalResult<()> {
        debug_assert!(!key.is_empty(), "Precondition: key must not be empty");
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(JournalError::NoSpace);
        }
        let mut inner = self.inner.write();
        inner.containers.insert(container);
        inner.objects.insert((container, key.to_string()), data.to_vec());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, container: u32, key: &str) -> JournalResult<Vec<u8>> {
        self.inner
            .read()
            .objects
            .get(&(container, key.to_string()))
            .cloned()
            .ok_or(JournalError::ObjectUnknown)
    }

    fn exists(&self, container: u32, key: &str) -> JournalResult<bool> {
        Ok(self
            .inner
            .read()
            .objects
            .contains_key(&(container, key.to_string())))
    }

    fn delete(&self, container: u32, key: &str) -> JournalResult<()> {
        if self
            .inner
            .write()
            .objects
            .remove(&(container, key.to_string()))
            .is_some()
        {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn enumerate(&self, container: u32) -> JournalResult<Vec<(String, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .objects
            .range((container, String::new())..)
            .take_while(|((c, _), _)| *c == container)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn containers(&self) -> JournalResult<Vec<u32>> {
        Ok(self.inner.read().containers.iter().copied().collect())
    }

    fn delete_container(&self, container: u32) -> JournalResult<()> {
        let mut inner = self.inner.write();
        inner.containers.remove(&container);
        inner.objects.retain(|(c, _), _| *c != container);
        Ok(())
    }
}
