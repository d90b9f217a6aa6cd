//! Stateright Model for Stream Group Commit
//!
//! Exhaustively verifies the commit protocol of one stream:
//! - AT_MOST_ONE_SYNCER: only one writer flushes the buffer at a time
//! - ROTATION_EXCLUSIVE: no rotation while a flush or a copy is in flight
//! - ACK_IMPLIES_DURABLE: an acknowledged record is durable in the buffer
//!   or persisted in an older generation
//! - CRASH_KEEPS_ACKED: after a crash every acknowledged record survives
//!
//! Writers copy into the current generation, then either flush or wait for
//! another writer's flush to cover their offset. A writer that finds the
//! buffer full rotates once every in-flight sync has drained.

use stateright::{Model, Property};

/// Configuration for the group commit model
#[derive(Clone, Debug)]
pub struct GroupCommitConfig {
    pub writers: usize,
    /// Records that fit in one generation
    pub capacity: u64,
    pub max_generations: u64,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        GroupCommitConfig {
            writers: 3,
            capacity: 2,
            max_generations: 2,
        }
    }
}

/// Where a record landed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub generation: u64,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Writer {
    Idle,
    /// Copied, waiting to become durable
    Copied(Target),
    /// Flushing the buffer up to the captured offset
    Syncing(Target, u64),
    /// Buffer was full
    Full,
    Rotating,
    Acked(Target),
    /// Unacknowledged when the crash happened
    Lost,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StreamState {
    pub writers: Vec<Writer>,
    pub generation: u64,
    /// Bytes copied into the current generation
    pub offset: u64,
    /// Bytes of the current generation known durable
    pub durable: u64,
    /// Writers between copy and acknowledgement
    pub sync_count: usize,
    pub syncers: usize,
    pub rotating: bool,
    pub crashed: bool,
    /// Durable extent of each generation after the crash
    pub surviving: Vec<u64>,
}

impl StreamState {
    pub fn new(writers: usize) -> Self {
        StreamState {
            writers: vec![Writer::Idle; writers],
            generation: 0,
            offset: 0,
            durable: 0,
            sync_count: 0,
            syncers: 0,
            rotating: false,
            crashed: false,
            surviving: Vec::new(),
        }
    }

    pub fn is_durable(&self, target: Target) -> bool {
        target.generation < self.generation
            || (target.generation == self.generation && target.offset <= self.durable)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum GroupCommitAction {
    Copy(usize),
    StartSync(usize),
    FinishSync(usize),
    Ack(usize),
    StartRotate(usize),
    FinishRotate(usize),
    Crash,
}

pub struct GroupCommitModel {
    pub config: GroupCommitConfig,
}

impl GroupCommitModel {
    pub fn new(config: GroupCommitConfig) -> Self {
        GroupCommitModel { config }
    }
}

impl Default for GroupCommitModel {
    fn default() -> Self {
        Self::new(GroupCommitConfig::default())
    }
}

impl Model for GroupCommitModel {
    type State = StreamState;
    type Action = GroupCommitAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![StreamState::new(self.config.writers)]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        if state.crashed {
            return;
        }
        for (w, writer) in state.writers.iter().enumerate() {
            match *writer {
                Writer::Idle if !state.rotating => actions.push(GroupCommitAction::Copy(w)),
                Writer::Copied(target) => {
                    if state.is_durable(target) {
                        actions.push(GroupCommitAction::Ack(w));
                    } else if state.syncers == 0 && !state.rotating {
                        actions.push(GroupCommitAction::StartSync(w));
                    }
                }
                Writer::Syncing(..) => actions.push(GroupCommitAction::FinishSync(w)),
                Writer::Full
                    if !state.rotating
                        && state.sync_count == 0
                        && state.generation + 1 < self.config.max_generations =>
                {
                    actions.push(GroupCommitAction::StartRotate(w))
                }
                Writer::Rotating => actions.push(GroupCommitAction::FinishRotate(w)),
                _ => {}
            }
        }
        actions.push(GroupCommitAction::Crash);
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            GroupCommitAction::Copy(w) => {
                if next.offset >= self.config.capacity {
                    next.writers[w] = Writer::Full;
                } else {
                    next.offset += 1;
                    next.sync_count += 1;
                    next.writers[w] = Writer::Copied(Target {
                        generation: next.generation,
                        offset: next.offset,
                    });
                }
            }
            GroupCommitAction::StartSync(w) => {
                let Writer::Copied(target) = next.writers[w] else {
                    return None;
                };
                next.syncers += 1;
                // Flush everything copied so far, not only this writer's record
                next.writers[w] = Writer::Syncing(target, next.offset);
            }
            GroupCommitAction::FinishSync(w) => {
                let Writer::Syncing(target, upto) = next.writers[w] else {
                    return None;
                };
                next.syncers -= 1;
                next.durable = next.durable.max(upto);
                next.writers[w] = Writer::Copied(target);
            }
            GroupCommitAction::Ack(w) => {
                let Writer::Copied(target) = next.writers[w] else {
                    return None;
                };
                next.sync_count -= 1;
                next.writers[w] = Writer::Acked(target);
            }
            GroupCommitAction::StartRotate(w) => {
                next.rotating = true;
                next.writers[w] = Writer::Rotating;
            }
            GroupCommitAction::FinishRotate(w) => {
                // The full image is persisted; the next generation starts empty
                next.generation += 1;
                next.offset = 0;
                next.durable = 0;
                next.rotating = false;
                next.writers[w] = Writer::Idle;
            }
            GroupCommitAction::Crash => {
                next.crashed = true;
                for writer in next.writers.iter_mut() {
                    if !matches!(writer, Writer::Acked(_)) {
                        *writer = Writer::Lost;
                    }
                }
                next.surviving = (0..next.generation).map(|_| self.config.capacity).collect();
                next.surviving.push(next.durable);
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("at_most_one_syncer", |_: &GroupCommitModel, state: &StreamState| {
                state.syncers <= 1
            }),
            Property::always("rotation_exclusive", |_: &GroupCommitModel, state: &StreamState| {
                !state.rotating || (state.syncers == 0 && state.sync_count == 0)
            }),
            Property::always("ack_implies_durable", |_: &GroupCommitModel, state: &StreamState| {
                state.writers.iter().all(|w| match w {
                    Writer::Acked(target) => state.is_durable(*target),
                    _ => true,
                })
            }),
            Property::always("durable_within_copied", |_: &GroupCommitModel, state: &StreamState| {
                state.durable <= state.offset
            }),
            Property::always("crash_keeps_acked", |_: &GroupCommitModel, state: &StreamState| {
                !state.crashed
                    || state.writers.iter().all(|w| match w {
                        Writer::Acked(t) => state
                            .surviving
                            .get(t.generation as usize)
                            .map_or(false, |&extent| t.offset <= extent),
                        _ => true,
                    })
            }),
            Property::sometimes("ack_without_own_sync", |_: &GroupCommitModel, state: &StreamState| {
                // Two writers acknowledged by a single flush
                state.generation == 0
                    && state.durable == 2
                    && state.writers.iter().filter(|w| matches!(w, Writer::Acked(_))).count() == 2
                    && state.syncers == 0
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(model: &GroupCommitModel, state: &StreamState, action: GroupCommitAction) -> StreamState {
        let mut enabled = Vec::new();
        model.actions(state, &mut enabled);
        assert!(enabled.contains(&action), "{:?} not enabled in {:?}", action, state);
        model.next_state(state, action).unwrap()
    }

    #[test]
    fn test_one_flush_covers_two_writers() {
        let model = GroupCommitModel::default();
        let mut s = StreamState::new(3);
        s = step(&model, &s, GroupCommitAction::Copy(0));
        s = step(&model, &s, GroupCommitAction::Copy(1));
        s = step(&model, &s, GroupCommitAction::StartSync(0));

        // Second writer cannot start its own flush
        let mut enabled = Vec::new();
        model.actions(&s, &mut enabled);
        assert!(!enabled.contains(&GroupCommitAction::StartSync(1)));

        s = step(&model, &s, GroupCommitAction::FinishSync(0));
        s = step(&model, &s, GroupCommitAction::Ack(1));
        s = step(&model, &s, GroupCommitAction::Ack(0));
        assert_eq!(s.durable, 2);
        assert_eq!(s.sync_count, 0);
    }

    #[test]
    fn test_rotation_waits_for_pending_syncs() {
        let model = GroupCommitModel::default();
        let mut s = StreamState::new(3);
        s = step(&model, &s, GroupCommitAction::Copy(0));
        s = step(&model, &s, GroupCommitAction::Copy(1));
        s = step(&model, &s, GroupCommitAction::Copy(2));
        assert_eq!(s.writers[2], Writer::Full);

        let mut enabled = Vec::new();
        model.actions(&s, &mut enabled);
        assert!(!enabled.contains(&GroupCommitAction::StartRotate(2)));

        s = step(&model, &s, GroupCommitAction::StartSync(1));
        s = step(&model, &s, GroupCommitAction::FinishSync(1));
        s = step(&model, &s, GroupCommitAction::Ack(0));
        s = step(&model, &s, GroupCommitAction::Ack(1));
        s = step(&model, &s, GroupCommitAction::StartRotate(2));
        s = step(&model, &s, GroupCommitAction::FinishRotate(2));
        assert_eq!(s.generation, 1);
        assert_eq!(s.writers[2], Writer::Idle);
    }

    #[test]
    fn test_crash_loses_only_unacked() {
        let model = GroupCommitModel::default();
        let mut s = StreamState::new(2);
        s = step(&model, &s, GroupCommitAction::Copy(0));
        s = step(&model, &s, GroupCommitAction::StartSync(0));
        s = step(&model, &s, GroupCommitAction::FinishSync(0));
        s = step(&model, &s, GroupCommitAction::Ack(0));
        s = step(&model, &s, GroupCommitAction::Copy(1));
        s = step(&model, &s, GroupCommitAction::Crash);

        assert_eq!(s.writers[1], Writer::Lost);
        assert_eq!(s.surviving, vec![1]);
        let mut enabled = Vec::new();
        model.actions(&s, &mut enabled);
        assert!(enabled.is_empty());
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_group_commit -- --ignored --nocapture
    fn stateright_group_commit_model_check() {
        use stateright::Checker;

        let model = GroupCommitModel::default();
        let checker = model.checker().spawn_bfs().join();

        println!("States explored: {}", checker.unique_state_count());

        checker.assert_properties();
    }
}
