//! Journal Configuration
//!
//! One immutable value built at subsystem construction and shared by `Arc`
//! with every component. Loaded from TOML or taken from presets.
//!
//! ```toml
//! [journal]
//! max_containers = 16
//! streams_per_container = 1
//! group_commit = true
//!
//! [buffer]
//! buffer_size = 65536
//! block_size = 4096
//! buffer_count = 32
//! mirrors = 2
//!
//! [logging]
//! level = "info"
//! ```

use crate::buffer::BLOCK_HEADER_SIZE;
use crate::error::ConfigError;
use crate::object::SO_HEADER_SIZE;
use crate::record::RECORD_HEADER_SIZE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Container, stream and placement-group geometry
    pub journal: StreamConfig,
    /// Durable buffer pool geometry
    pub buffer: BufferConfig,
    /// Log output settings
    pub logging: LoggingConfig,
}

/// Container/stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Number of container slots (ids `0..max_containers`)
    pub max_containers: u32,
    /// Streams per container (1 = single-stream mode)
    pub streams_per_container: u32,
    /// Combine concurrent writers' syncs into one device flush
    pub group_commit: bool,
    /// Maximum placement groups per container
    pub max_placement_groups: usize,
    /// Hash buckets in the placement-group index
    pub pg_buckets: usize,
    /// Run a reclamation sweep every N rotations
    pub reclaim_interval: u64,
    /// Longest accepted key in bytes
    pub max_key_len: usize,
    /// Directory holding reversion packet files
    pub crash_recovery_dir: PathBuf,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            max_containers: 16,
            streams_per_container: 1,
            group_commit: true,
            max_placement_groups: 4096,
            pg_buckets: 1024,
            reclaim_interval: 4,
            max_key_len: 256,
            crash_recovery_dir: PathBuf::from("/var/lib/flash-journal/recovery"),
        }
    }
}

/// Durable buffer pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes per buffer (multiple of `block_size`)
    pub buffer_size: usize,
    /// Bytes per block, header included
    pub block_size: usize,
    /// Number of buffers in the pool
    pub buffer_count: usize,
    /// Number of mirror partitions each flush is written to
    pub mirrors: usize,
    /// Issue a hardware durability barrier after every flush
    pub force_durability: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        BufferConfig {
            buffer_size: 64 * 1024, // 64KB
            block_size: 4096,
            buffer_count: 32,
            mirrors: 1,
            force_durability: true,
        }
    }
}

impl BufferConfig {
    /// Blocks per buffer
    pub fn blocks_per_buffer(&self) -> usize {
        self.buffer_size / self.block_size
    }

    /// Payload bytes per block
    pub fn block_payload(&self) -> usize {
        self.block_size - BLOCK_HEADER_SIZE
    }

    /// Payload bytes per buffer (the logical capacity of one SO image)
    pub fn buffer_capacity(&self) -> usize {
        self.blocks_per_buffer() * self.block_payload()
    }

    /// Bytes each mirror partition must hold
    pub fn partition_size(&self) -> u64 {
        (self.buffer_size as u64) * (self.buffer_count as u64)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter (`RUST_LOG` overrides)
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl JournalConfig {
    /// Configuration for testing (small buffers, fast rotation)
    pub fn test() -> Self {
        JournalConfig {
            journal: StreamConfig {
                max_containers: 4,
                streams_per_container: 1,
                group_commit: true,
                max_placement_groups: 64,
                pg_buckets: 16,
                reclaim_interval: 1,
                max_key_len: 64,
                crash_recovery_dir: std::env::temp_dir().join("flash-journal-test"),
            },
            buffer: BufferConfig {
                buffer_size: 1024,
                block_size: 256,
                buffer_count: 8,
                mirrors: 1,
                force_durability: true,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                json: false,
            },
        }
    }

    /// Parse a TOML document and validate it
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: JournalConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Largest key a record can carry given the buffer geometry
    pub fn record_key_budget(&self) -> usize {
        self.buffer
            .buffer_capacity()
            .saturating_sub(SO_HEADER_SIZE + RECORD_HEADER_SIZE)
            .min(u16::MAX as usize)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.buffer;
        let j = &self.journal;

        if b.block_size <= BLOCK_HEADER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "block_size {} must exceed the {}-byte block header",
                b.block_size, BLOCK_HEADER_SIZE
            )));
        }
        if b.buffer_size == 0 || b.buffer_size % b.block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "buffer_size {} must be a non-zero multiple of block_size {}",
                b.buffer_size, b.block_size
            )));
        }
        if b.mirrors == 0 {
            return Err(ConfigError::Invalid("mirrors must be at least 1".to_string()));
        }
        if j.max_containers == 0 || j.streams_per_container == 0 {
            return Err(ConfigError::Invalid(
                "max_containers and streams_per_container must be non-zero".to_string(),
            ));
        }
        let streams = j.max_containers as usize * j.streams_per_container as usize;
        if b.buffer_count < streams {
            return Err(ConfigError::Invalid(format!(
                "buffer_count {} cannot back {} streams",
                b.buffer_count, streams
            )));
        }
        if j.pg_buckets == 0 || j.max_placement_groups == 0 {
            return Err(ConfigError::Invalid(
                "placement group table must have buckets and capacity".to_string(),
            ));
        }
        if j.max_placement_groups < j.streams_per_container as usize {
            return Err(ConfigError::Invalid(
                "max_placement_groups smaller than the stream count".to_string(),
            ));
        }
        if j.reclaim_interval == 0 {
            return Err(ConfigError::Invalid("reclaim_interval must be at least 1".to_string()));
        }
        if j.max_key_len == 0 || j.max_key_len > self.record_key_budget() {
            return Err(ConfigError::Invalid(format!(
                "max_key_len {} outside 1..={}",
                j.max_key_len,
                self.record_key_budget()
            )));
        }
        Ok(())
    }

    /// Path of the per-container reversion packet
    pub fn reversion_path(&self, container: u32) -> PathBuf {
        self.journal
            .crash_recovery_dir
            .join(format!("reversion.{}", container))
    }

    /// Path of the master reversion packet
    pub fn master_reversion_path(&self) -> PathBuf {
        self.journal.crash_recovery_dir.join("reversion.master")
    }
}
