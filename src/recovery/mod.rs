//! Recovery Engine
//!
//! Container-open reconstruction of streams and placement groups, and the
//! reversion packets that carry rolled-back transaction ids across a crash.

mod engine;
mod reversion;

pub use engine::{RecoveryEngine, RecoveryReport};
pub(crate) use engine::recycle;
pub use reversion::{distribute_reversion_packets, ReversionList};
