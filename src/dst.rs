//! Journal Deterministic Simulation Testing Harness
//!
//! Verifies the journal's durability guarantees under crashes and device
//! faults:
//!
//! - **Acknowledged writes survive**: every write, delete and trim that
//!   returned `Ok` before the crash is visible after restart
//! - **Fail-stop fallback**: a durable-device fault mid-run loses nothing
//!   that was acknowledged
//! - **Rollback**: records of a transaction listed in the reversion packet
//!   are gone after restart
//!
//! ## DST Methodology
//!
//! 1. Start a registry over memory devices and an in-memory backing store
//! 2. Run a seeded workload of writes, overwrites, deletes and trims,
//!    tracking what was acknowledged in a shadow model
//! 3. Optionally fail the durable device and, later, crash (drop everything
//!    without closing)
//! 4. Restart over the same media and compare every key with the model

use crate::buffer::{MemoryDevice, RawDevice};
use crate::config::JournalConfig;
use crate::error::JournalError;
use crate::recovery::ReversionList;
use crate::registry::ContainerRegistry;
use crate::store::{BackingStore, InMemoryBackingStore};
use rand::Rng;
use serde::Serialize;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Configuration for the journal DST harness
#[derive(Debug, Clone)]
pub struct JournalDSTConfig {
    /// Operations per run
    pub num_ops: usize,
    /// Containers the workload spreads over
    pub containers: u32,
    /// Placement groups per container
    pub groups_per_container: usize,
    /// Streams per container
    pub streams_per_container: u32,
    /// Mirror partitions of the buffer pool
    pub mirrors: usize,
    /// Largest value written (small values rotate less)
    pub max_value_len: usize,
    /// Percent of operations that are deletes
    pub delete_pct: u32,
    /// Percent of operations that are trims
    pub trim_pct: u32,
    /// Percent of operations that overwrite an existing key
    pub overwrite_pct: u32,
    /// Crash at a random point instead of shutting down cleanly
    pub simulate_crash: bool,
    /// Fail the first mirror's writes at a random point
    pub device_fault: bool,
    /// Leave a transaction open at the crash and roll it back on restart
    /// (only with `simulate_crash`)
    pub rollback: bool,
    /// Use group commit
    pub group_commit: bool,
}

impl Default for JournalDSTConfig {
    fn default() -> Self {
        JournalDSTConfig {
            num_ops: 200,
            containers: 2,
            groups_per_container: 4,
            streams_per_container: 1,
            mirrors: 1,
            max_value_len: 200,
            delete_pct: 10,
            trim_pct: 5,
            overwrite_pct: 15,
            simulate_crash: true,
            device_fault: false,
            rollback: false,
            group_commit: true,
        }
    }
}

impl JournalDSTConfig {
    /// No faults, no crash: baseline correctness
    pub fn baseline() -> Self {
        JournalDSTConfig {
            simulate_crash: false,
            ..Default::default()
        }
    }

    /// Crash without device faults
    pub fn crash_only() -> Self {
        JournalDSTConfig::default()
    }

    /// Crash, device fault and rollback, over mirrored multi-stream
    /// containers
    pub fn chaos() -> Self {
        JournalDSTConfig {
            streams_per_container: 2,
            mirrors: 2,
            device_fault: true,
            rollback: true,
            ..Default::default()
        }
    }

    fn journal_config(&self, recovery_dir: PathBuf) -> JournalConfig {
        let mut config = JournalConfig::test();
        config.journal.max_containers = self.containers;
        config.journal.streams_per_container = self.streams_per_container;
        config.journal.group_commit = self.group_commit;
        config.journal.crash_recovery_dir = recovery_dir;
        config.buffer.mirrors = self.mirrors;
        config.buffer.buffer_count = (self.containers * self.streams_per_container) as usize * 2;
        config
    }
}

/// Result of a single DST run
#[derive(Debug, Serialize)]
pub struct JournalDSTResult {
    pub seed: u64,
    /// Operations issued before the crash or shutdown
    pub total_ops: usize,
    pub acknowledged_ops: usize,
    pub failed_ops: usize,
    pub crashed_at: Option<usize>,
    pub device_fault_at: Option<usize>,
    pub rolled_back_writes: usize,
    pub verified_keys: usize,
    pub violations: usize,
    pub passed: bool,
    pub error_message: Option<String>,
}

impl JournalDSTResult {
    fn new(seed: u64, total_ops: usize) -> Self {
        JournalDSTResult {
            seed,
            total_ops,
            acknowledged_ops: 0,
            failed_ops: 0,
            crashed_at: None,
            device_fault_at: None,
            rolled_back_writes: 0,
            verified_keys: 0,
            violations: 0,
            passed: false,
            error_message: None,
        }
    }

    fn fail(mut self, message: String) -> Self {
        self.passed = false;
        self.error_message = Some(message);
        self
    }
}

// ============================================================================
// Shadow model
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expect {
    Value(Vec<u8>),
    Deleted,
    /// The operation failed; either outcome is acceptable
    Uncertain,
}

#[derive(Debug)]
struct GroupModel {
    container: u32,
    name: String,
    next_counter: u64,
    keys: BTreeMap<String, (u64, Expect)>,
}

impl GroupModel {
    fn live_keys(&self) -> Vec<String> {
        self.keys
            .iter()
            .filter(|(_, (_, e))| matches!(e, Expect::Value(_)))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

enum Operation {
    Write,
    Overwrite,
    Delete,
    Trim,
}

/// Journal DST Harness
pub struct JournalDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: JournalDSTConfig,
}

impl JournalDSTHarness {
    pub fn new(seed: u64, config: JournalDSTConfig) -> Self {
        JournalDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> JournalDSTResult {
        let run = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let recovery_dir = std::env::temp_dir().join(format!(
            "flash-journal-dst-{}-{}-{}",
            std::process::id(),
            self.seed,
            run
        ));
        let result = self.run_in(recovery_dir.clone());
        let _ = std::fs::remove_dir_all(&recovery_dir);
        result
    }

    fn run_in(&mut self, recovery_dir: PathBuf) -> JournalDSTResult {
        let cfg = self.config.clone();
        let mut result = JournalDSTResult::new(self.seed, cfg.num_ops);
        let config = cfg.journal_config(recovery_dir);

        let devices: Vec<MemoryDevice> = (0..cfg.mirrors)
            .map(|_| MemoryDevice::new(config.buffer.partition_size()))
            .collect();
        let store = InMemoryBackingStore::new();
        let start = |config: &JournalConfig| {
            let raw: Vec<Arc<dyn RawDevice>> = devices
                .iter()
                .map(|d| Arc::new(d.clone()) as Arc<dyn RawDevice>)
                .collect();
            let store: Arc<dyn BackingStore> = Arc::new(store.clone());
            ContainerRegistry::start(config.clone(), store, raw)
        };

        let registry = match start(&config) {
            Ok(r) => r,
            Err(e) => return result.fail(format!("Failed to start journal: {}", e)),
        };
        for id in 0..cfg.containers {
            if let Err(e) = registry.open(id) {
                return result.fail(format!("Failed to open container {}: {}", id, e));
            }
        }

        let mut groups: Vec<GroupModel> = (0..cfg.containers)
            .flat_map(|container| {
                (0..cfg.groups_per_container).map(move |g| GroupModel {
                    container,
                    name: format!("pg{}", g),
                    next_counter: 1,
                    keys: BTreeMap::new(),
                })
            })
            .collect();

        let crash_at = if cfg.simulate_crash {
            self.rng.gen_range(1..=cfg.num_ops)
        } else {
            cfg.num_ops
        };
        let fault_at = if cfg.device_fault {
            Some(self.rng.gen_range(0..crash_at))
        } else {
            None
        };
        result.total_ops = crash_at;

        // Phase 1: workload, interrupted by the crash
        for op in 0..crash_at {
            if fault_at == Some(op) {
                devices[0].set_fail_writes(true);
                result.device_fault_at = Some(op);
            }
            let g = self.rng.gen_range(0..groups.len());
            let acked = self.apply(&registry, &mut groups[g], op);
            if acked {
                result.acknowledged_ops += 1;
            } else {
                result.failed_ops += 1;
            }
        }

        // Phase 2: a transaction left open by the crash, then crash or
        // clean shutdown
        let mut rolled_back: Vec<(u32, String)> = Vec::new();
        let mut reverted_trx = None;
        if cfg.simulate_crash {
            if cfg.rollback {
                let trx = registry.transactions().begin();
                for i in 0..3u64 {
                    let key = format!("{}_rollback_{}", i + 1, self.seed);
                    let container = (i as u32) % cfg.containers;
                    if registry
                        .with_container(container, |c| c.write(&key, b"never"))
                        .is_ok()
                    {
                        rolled_back.push((container, key));
                    }
                }
                reverted_trx = Some(trx);
                result.rolled_back_writes = rolled_back.len();
            }
            result.crashed_at = Some(crash_at);
        } else if let Err(e) = registry.close_all() {
            return result.fail(format!("Clean shutdown failed: {}", e));
        }
        drop(registry);

        // Phase 3: restart over the same media
        for device in &devices {
            device.set_fail_writes(false);
        }
        if let Some(trx) = reverted_trx {
            if let Err(e) = ReversionList::from_ids([trx]).store(&config.master_reversion_path()) {
                return result.fail(format!("Failed to write reversion packet: {}", e));
            }
        }
        let registry = match start(&config) {
            Ok(r) => r,
            Err(e) => return result.fail(format!("Restart failed: {}", e)),
        };
        for id in 0..cfg.containers {
            if let Err(e) = registry.open(id) {
                return result.fail(format!("Recovery of container {} failed: {}", id, e));
            }
        }

        // Phase 4: verify
        let mut problems: Vec<String> = Vec::new();
        for group in &groups {
            self.verify_group(&registry, group, &mut result, &mut problems);
        }
        for (container, key) in &rolled_back {
            result.verified_keys += 1;
            match registry.with_container(*container, |c| c.read(key)) {
                Err(JournalError::ObjectUnknown) | Err(JournalError::ObjectDeleted) => {}
                other => problems.push(format!("rolled back {} still readable: {:?}", key, other)),
            }
        }
        if let Err(e) = registry.close_all() {
            problems.push(format!("close after verification failed: {}", e));
        }

        result.violations = problems.len();
        result.passed = problems.is_empty();
        if !result.passed {
            problems.truncate(10);
            result.error_message = Some(format!(
                "INVARIANT VIOLATION: {} problems after recovery (first 10): {:?}",
                result.violations, problems
            ));
        }
        result
    }

    fn next_op(&mut self) -> Operation {
        let roll = self.rng.gen_range(0..100u32);
        let cfg = &self.config;
        if roll < cfg.delete_pct {
            Operation::Delete
        } else if roll < cfg.delete_pct + cfg.trim_pct {
            Operation::Trim
        } else if roll < cfg.delete_pct + cfg.trim_pct + cfg.overwrite_pct {
            Operation::Overwrite
        } else {
            Operation::Write
        }
    }

    fn value(&mut self, op: usize) -> Vec<u8> {
        let len = self.rng.gen_range(1..=self.config.max_value_len);
        let mut value = format!("{}-{}:", self.seed, op).into_bytes();
        value.resize(len.max(value.len()), b'a' + (op % 26) as u8);
        value
    }

    /// Apply one operation to `group`; returns whether it was acknowledged
    fn apply(&mut self, registry: &ContainerRegistry, group: &mut GroupModel, op: usize) -> bool {
        let container = group.container;
        match self.next_op() {
            Operation::Delete => {
                let live = group.live_keys();
                if live.is_empty() {
                    return self.write_new(registry, group, op);
                }
                let key = live[self.rng.gen_range(0..live.len())].clone();
                let acked = registry.with_container(container, |c| c.delete(&key)).is_ok();
                let expect = if acked { Expect::Deleted } else { Expect::Uncertain };
                if let Some(entry) = group.keys.get_mut(&key) {
                    entry.1 = expect;
                }
                acked
            }
            Operation::Trim => {
                let through = self.rng.gen_range(0..group.next_counter);
                let key = format!("{}_{}", through, group.name);
                let acked = registry.with_container(container, |c| c.trim(&key)).is_ok();
                for (counter, expect) in group.keys.values_mut() {
                    if *counter <= through {
                        *expect = if acked { Expect::Deleted } else { Expect::Uncertain };
                    }
                }
                acked
            }
            Operation::Overwrite => {
                let live = group.live_keys();
                if live.is_empty() {
                    return self.write_new(registry, group, op);
                }
                let key = live[self.rng.gen_range(0..live.len())].clone();
                let value = self.value(op);
                let acked = registry.with_container(container, |c| c.write(&key, &value)).is_ok();
                if let Some(entry) = group.keys.get_mut(&key) {
                    entry.1 = if acked { Expect::Value(value) } else { Expect::Uncertain };
                }
                acked
            }
            Operation::Write => self.write_new(registry, group, op),
        }
    }

    fn write_new(&mut self, registry: &ContainerRegistry, group: &mut GroupModel, op: usize) -> bool {
        let counter = group.next_counter;
        group.next_counter += 1 + self.rng.gen_range(0..2u64);
        let key = format!("{}_{}_k{}", counter, group.name, op);
        let value = self.value(op);
        let acked = registry
            .with_container(group.container, |c| c.write(&key, &value))
            .is_ok();
        let expect = if acked { Expect::Value(value) } else { Expect::Uncertain };
        group.keys.insert(key, (counter, expect));
        acked
    }

    fn verify_group(
        &self,
        registry: &ContainerRegistry,
        group: &GroupModel,
        result: &mut JournalDSTResult,
        problems: &mut Vec<String>,
    ) {
        for (key, (_, expect)) in &group.keys {
            result.verified_keys += 1;
            let read = registry.with_container(group.container, |c| c.read(key));
            let ok = match (expect, &read) {
                (Expect::Uncertain, _) => true,
                (Expect::Value(v), Ok(got)) => v == got,
                (Expect::Deleted, Err(JournalError::ObjectDeleted | JournalError::ObjectUnknown)) => true,
                _ => false,
            };
            if !ok {
                problems.push(format!(
                    "container {} key {}: expected {:?}, read {:?}",
                    group.container,
                    key,
                    expect,
                    read.map(|v| String::from_utf8_lossy(&v).into_owned())
                ));
            }
        }

        let listed = match registry.with_container(group.container, |c| c.enumerate_start(&group.name)) {
            Ok(cursor) => cursor,
            Err(e) => {
                problems.push(format!("enumerate {} failed: {}", group.name, e));
                return;
            }
        };
        let mut seen = BTreeSet::new();
        for (key, value) in listed {
            let key = key.encode();
            match group.keys.get(&key) {
                Some((_, Expect::Value(v))) if *v == value => {}
                Some((_, Expect::Uncertain)) => {}
                other => problems.push(format!("enumerated {} unexpectedly: model {:?}", key, other)),
            }
            seen.insert(key);
        }
        for key in group.live_keys() {
            if !seen.contains(&key) {
                problems.push(format!("live key {} missing from enumeration", key));
            }
        }
    }
}

/// Run a batch of DST runs across multiple seeds
pub fn run_dst_batch(seeds: std::ops::Range<u64>, config: JournalDSTConfig) -> Vec<JournalDSTResult> {
    seeds
        .map(|seed| JournalDSTHarness::new(seed, config.clone()).run())
        .collect()
}

/// Summarize batch results
pub fn summarize_dst_batch(results: &[JournalDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let total_ops: usize = results.iter().map(|r| r.total_ops).sum();
    let acked: usize = results.iter().map(|r| r.acknowledged_ops).sum();
    let verified: usize = results.iter().map(|r| r.verified_keys).sum();
    let crashes = results.iter().filter(|r| r.crashed_at.is_some()).count();
    let faults = results.iter().filter(|r| r.device_fault_at.is_some()).count();

    let mut summary = format!(
        "Journal DST Batch: {}/{} passed ({} failed)\n\
         Ops: {}, Acknowledged: {}, Keys verified: {}, Crashes: {}, Device faults: {}",
        passed, total, failed, total_ops, acked, verified, crashes, faults
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}
