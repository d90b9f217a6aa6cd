//! Reversion Packets
//!
//! A reversion packet lists the transaction ids rolled back by the last
//! crash, as whitespace-separated decimal integers. One master packet is
//! written per process crash; at start-up it is copied once per container
//! and each container consumes its own copy during recovery.

use crate::config::JournalConfig;
use crate::error::{JournalError, JournalResult};
use fnv::FnvHashSet;
use std::path::Path;

/// Transaction ids undone by the last crash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReversionList {
    ids: FnvHashSet<u64>,
}

impl ReversionList {
    pub fn from_ids(ids: impl IntoIterator<Item = u64>) -> Self {
        ReversionList {
            ids: ids.into_iter().collect(),
        }
    }

    /// Parse packet text
    pub fn parse(text: &str) -> JournalResult<Self> {
        let ids = text
            .split_whitespace()
            .map(|token| {
                token.parse::<u64>().map_err(|_| {
                    JournalError::Corruption(format!("bad transaction id {:?} in reversion packet", token))
                })
            })
            .collect::<JournalResult<FnvHashSet<u64>>>()?;
        Ok(ReversionList { ids })
    }

    /// Load a packet; a missing file is an empty list
    pub fn load(path: &Path) -> JournalResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a packet, one id per line, ascending
    pub fn store(&self, path: &Path) -> JournalResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut ids: Vec<u64> = self.ids.iter().copied().collect();
        ids.sort_unstable();
        let mut text = String::with_capacity(ids.len() * 8);
        for id in ids {
            text.push_str(&id.to_string());
            text.push('\n');
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn contains(&self, trx_id: u64) -> bool {
        self.ids.contains(&trx_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Copy the master packet to every listed container that has no unconsumed
/// copy of its own, then delete the master. Returns the number of copies
/// written.
pub fn distribute_reversion_packets(config: &JournalConfig, containers: &[u32]) -> JournalResult<usize> {
    let master_path = config.master_reversion_path();
    if !master_path.exists() {
        return Ok(0);
    }
    let master = ReversionList::load(&master_path)?;

    let mut copies = 0;
    for &container in containers {
        let path = config.reversion_path(container);
        if path.exists() {
            tracing::info!(
                container,
                "container still holds an unconsumed reversion packet, keeping it"
            );
            continue;
        }
        master.store(&path)?;
        copies += 1;
    }
    std::fs::remove_file(&master_path)?;

    tracing::info!(
        transactions = master.len(),
        copies,
        "reversion packets distributed"
    );
    Ok(copies)
}
