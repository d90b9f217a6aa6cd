//! Backing Flash Store Abstraction
//!
//! The journal hands whole streaming objects to this store once they are cut
//! over, and reads them back at container open. Objects are namespaced by
//! container id.
//!
//! Implementations:
//! - `InMemoryBackingStore`: For unit tests and DST
//! - `LocalFsBackingStore`: One directory per container on a local filesystem

mod local;
mod memory;

pub use local::LocalFsBackingStore;
pub use memory::InMemoryBackingStore;

use crate::error::JournalResult;

/// Backing store trait
pub trait BackingStore: Send + Sync + 'static {
    /// Record that a container exists, even before it holds any object
    fn create_container(&self, container: u32) -> JournalResult<()>;

    /// Put an object (create or overwrite)
    fn put(&self, container: u32, key: &str, data: &[u8]) -> JournalResult<()>;

    /// Get an object's contents; `ObjectUnknown` if absent
    fn get(&self, container: u32, key: &str) -> JournalResult<Vec<u8>>;

    /// Check if an object exists
    fn exists(&self, container: u32, key: &str) -> JournalResult<bool>;

    /// Delete an object; deleting a missing object succeeds
    fn delete(&self, container: u32, key: &str) -> JournalResult<()>;

    /// Every object of a container as `(key, bytes)`, sorted by key
    fn enumerate(&self, container: u32) -> JournalResult<Vec<(String, Vec<u8>)>>;

    /// Ids of all existing containers, ascending
    fn containers(&self) -> JournalResult<Vec<u32>>;

    /// Remove a container and everything in it
    fn delete_container(&self, container: u32) -> JournalResult<()>;
}
