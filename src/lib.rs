//! flash-journal: the logging layer of a flash key-value store
//!
//! Writes land as log records in per-container streams. Each stream mirrors
//! its in-progress streaming object (SO) into a battery-backed buffer, so a
//! record is durable once its buffer blocks are flushed, long before the SO
//! reaches the backing object store. Full SOs rotate into the store; SOs
//! whose placement groups are all trimmed are reclaimed. After a crash the
//! buffer images are folded back into the store and each container is
//! rebuilt from its SOs, rolling back the transactions named in the
//! reversion packet.
//!
//! Entry point is [`ContainerRegistry`].

pub mod buffer;
pub mod commit;
pub mod config;
pub mod container;
pub mod dst;
pub mod error;
pub mod key;
pub mod object;
pub mod observability;
pub mod placement;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod stats;
pub mod store;
pub mod stream;
pub mod transaction;

#[cfg(test)]
mod stateright;

#[cfg(unix)]
pub use buffer::FileDevice;
pub use buffer::{DurableBufferPool, MemoryDevice, RawDevice};
pub use config::{BufferConfig, JournalConfig, LoggingConfig, StreamConfig};
pub use container::{Container, ContainerSnapshot, EnumerationCursor};
pub use dst::{run_dst_batch, summarize_dst_batch, JournalDSTConfig, JournalDSTHarness, JournalDSTResult};
pub use error::{ConfigError, JournalError, JournalResult};
pub use key::Key;
pub use recovery::{RecoveryEngine, RecoveryReport, ReversionList};
pub use registry::ContainerRegistry;
pub use stats::StatsSnapshot;
pub use store::{BackingStore, InMemoryBackingStore, LocalFsBackingStore};
pub use transaction::TransactionRegistry;
