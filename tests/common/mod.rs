//! Shared fixtures: memory-backed media that survive a simulated crash

#![allow(dead_code)]

use flash_journal::{BackingStore, ContainerRegistry, InMemoryBackingStore, JournalConfig, MemoryDevice, RawDevice};
use std::sync::Arc;

pub struct Media {
    pub config: JournalConfig,
    pub device: MemoryDevice,
    pub store: InMemoryBackingStore,
    _dir: tempfile::TempDir,
}

impl Media {
    pub fn new() -> Self {
        Self::with_config(JournalConfig::test())
    }

    pub fn with_config(mut config: JournalConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.journal.crash_recovery_dir = dir.path().to_path_buf();
        Media {
            device: MemoryDevice::new(config.buffer.partition_size()),
            store: InMemoryBackingStore::new(),
            config,
            _dir: dir,
        }
    }

    /// Start a registry over this media. Dropping it without `close_all`
    /// simulates a crash.
    pub fn start(&self) -> ContainerRegistry {
        self.start_with(self.config.clone())
    }

    /// Start over this media with a different configuration
    pub fn start_with(&self, config: JournalConfig) -> ContainerRegistry {
        let devices: Vec<Arc<dyn RawDevice>> = vec![Arc::new(self.device.clone())];
        let store: Arc<dyn BackingStore> = Arc::new(self.store.clone());
        ContainerRegistry::start(config, store, devices).unwrap()
    }
}
