//! Batch Commit Coordinator
//!
//! Group commit for one stream. Writers copy their record into the stream
//! buffer, then call `barrier` with the offset they need durable. One writer
//! at a time becomes the syncer and flushes everything written so far; the
//! others either find their offset already durable or wait for the flush in
//! progress. A full buffer takes exclusive control through `rotate`, which
//! drains waiting writers before persisting the image.
//!
//! ## Phases
//!
//! ```text
//!            barrier (no syncer, no copies pending)
//!   Idle ────────────────────────────────────────────▶ Syncing
//!    ▲ ▲                                                  │
//!    │ └──────────────── flush returns ───────────────────┘
//!    │
//!    │  rotate: wait for Idle, then sync_count == 0
//!    └──────────────── RotatingFull ◀─────────────── Idle
//! ```
//!
//! Counters: `io_count` is writers mid-copy, `sync_count` is writers that
//! have copied and not yet returned from `barrier`. Three conditions:
//! `sync_done` (a flush finished or a copy completed), `flush_done`
//! (`sync_count` reached zero) and `rotation_done`.
//!
//! A `CommitTarget` names an offset within one image generation (the SO
//! sequence number). A target from an older generation is already durable:
//! the rotation that ended its generation persisted it.

use crate::error::JournalResult;
use crate::stats::JournalStats;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitPhase {
    Idle,
    Syncing,
    RotatingFull,
}

/// Durability requirement of one writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitTarget {
    pub generation: u64,
    pub offset: usize,
}

/// New image installed by a rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotated {
    pub generation: u64,
    /// Offset of the new image already durable (its header)
    pub durable: usize,
}

#[derive(Debug)]
struct CommitState {
    phase: CommitPhase,
    io_count: usize,
    sync_count: usize,
    generation: u64,
    durable: usize,
}

/// Observable coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSnapshot {
    pub phase: CommitPhase,
    pub io_count: usize,
    pub sync_count: usize,
    pub generation: u64,
    pub durable: usize,
}

/// Per-stream group-commit state machine
#[derive(Debug)]
pub struct CommitCoordinator {
    group_commit: bool,
    state: Mutex<CommitState>,
    sync_done: Condvar,
    flush_done: Condvar,
    rotation_done: Condvar,
    stats: Arc<JournalStats>,
}

impl CommitCoordinator {
    /// `group_commit == false` only stops syncers from waiting for writers
    /// that are still copying
    pub fn new(generation: u64, durable: usize, group_commit: bool, stats: Arc<JournalStats>) -> Self {
        CommitCoordinator {
            group_commit,
            state: Mutex::new(CommitState {
                phase: CommitPhase::Idle,
                io_count: 0,
                sync_count: 0,
                generation,
                durable,
            }),
            sync_done: Condvar::new(),
            flush_done: Condvar::new(),
            rotation_done: Condvar::new(),
            stats,
        }
    }

    /// A writer starts copying into the buffer
    pub fn begin_copy(&self) {
        self.state.lock().io_count += 1;
    }

    /// A writer finished copying. With `will_sync` it also registers for a
    /// later `barrier`.
    pub fn end_copy(&self, will_sync: bool) {
        let mut st = self.state.lock();
        debug_assert!(st.io_count > 0, "Precondition: a copy is in progress");
        if will_sync {
            st.sync_count += 1;
        }
        st.io_count -= 1;
        if st.io_count == 0 {
            self.sync_done.notify_all();
        }
    }

    /// Register for a `barrier` without a preceding copy
    pub fn enter_sync(&self) {
        self.state.lock().sync_count += 1;
    }

    /// Block until `target` is durable. `flush` makes everything written so
    /// far durable (or as much as block alignment allows) and returns the
    /// durable offset it reached in the current generation.
    ///
    /// The caller must have registered via `end_copy(true)` or `enter_sync`.
    pub fn barrier(
        &self,
        target: CommitTarget,
        mut flush: impl FnMut() -> JournalResult<usize>,
    ) -> JournalResult<()> {
        let mut st = self.state.lock();
        debug_assert!(st.sync_count > 0, "Precondition: caller registered for sync");
        let mut flushed = false;
        loop {
            if Self::is_durable(&st, target) {
                if !flushed {
                    self.stats.record_sync_saved();
                }
                self.leave_sync(&mut st);
                return Ok(());
            }
            match st.phase {
                CommitPhase::Syncing => {
                    self.sync_done.wait(&mut st);
                    continue;
                }
                CommitPhase::RotatingFull => {
                    // Step aside so the rotation can drain, then retry
                    self.leave_sync(&mut st);
                    while st.phase == CommitPhase::RotatingFull {
                        self.rotation_done.wait(&mut st);
                    }
                    st.sync_count += 1;
                    continue;
                }
                CommitPhase::Idle => {}
            }
            if self.group_commit && st.io_count > 0 {
                self.sync_done.wait(&mut st);
                continue;
            }

            st.phase = CommitPhase::Syncing;
            flushed = true;
            let generation = st.generation;
            let result = MutexGuard::unlocked(&mut st, &mut flush);
            debug_assert_eq!(st.phase, CommitPhase::Syncing, "Invariant: syncer owns the phase");
            debug_assert_eq!(st.generation, generation, "Invariant: no rotation during sync");
            st.phase = CommitPhase::Idle;
            self.sync_done.notify_all();

            match result {
                Ok(durable) => {
                    self.stats.record_sync_issued();
                    st.durable = st.durable.max(durable);
                }
                Err(e) => {
                    self.leave_sync(&mut st);
                    return Err(e);
                }
            }
        }
    }

    /// Take exclusive control of the stream to replace its image. Waits for
    /// any flush in progress and for every registered writer to leave, then
    /// runs `persist`. On success the new generation is installed; on error
    /// the old one stays current and the error is returned.
    pub fn rotate<T>(
        &self,
        persist: impl FnOnce() -> JournalResult<(Rotated, T)>,
    ) -> JournalResult<T> {
        let mut st = self.state.lock();
        while st.phase != CommitPhase::Idle {
            assert_ne!(
                st.phase,
                CommitPhase::RotatingFull,
                "concurrent rotations of one stream"
            );
            self.sync_done.wait(&mut st);
        }
        st.phase = CommitPhase::RotatingFull;
        self.sync_done.notify_all();
        while st.sync_count > 0 {
            self.flush_done.wait(&mut st);
        }

        let result = MutexGuard::unlocked(&mut st, persist);
        st.phase = CommitPhase::Idle;
        let outcome = match result {
            Ok((rotated, value)) => {
                debug_assert!(
                    rotated.generation > st.generation,
                    "Postcondition: generation advances"
                );
                st.generation = rotated.generation;
                st.durable = rotated.durable;
                Ok(value)
            }
            Err(e) => Err(e),
        };
        self.rotation_done.notify_all();
        self.sync_done.notify_all();
        outcome
    }

    pub fn snapshot(&self) -> CommitSnapshot {
        let st = self.state.lock();
        CommitSnapshot {
            phase: st.phase,
            io_count: st.io_count,
            sync_count: st.sync_count,
            generation: st.generation,
            durable: st.durable,
        }
    }

    fn is_durable(st: &CommitState, target: CommitTarget) -> bool {
        target.generation < st.generation
            || (target.generation == st.generation && st.durable >= target.offset)
    }

    fn leave_sync(&self, st: &mut CommitState) {
        debug_assert!(st.sync_count > 0, "Precondition: caller registered for sync");
        st.sync_count -= 1;
        if st.sync_count == 0 {
            self.flush_done.notify_all();
        }
    }
}
