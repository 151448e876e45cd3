//! In-flight deduplication by cache key
//!
//! The first task to launch for a key leads; tasks popped for the same key
//! while it runs are parked behind it and never occupy a slot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kiln_cache::HashKeyGenerator;
use kiln_core::{CompileTask, TaskId};

/// Outcome of trying to launch a task
#[derive(Debug)]
pub(crate) enum Claim {
    /// No other task runs this key; launch it
    Lead(CompileTask),
    /// Parked behind the given leader
    Parked { leader: TaskId },
}

#[derive(Debug)]
struct KeyState {
    leader: TaskId,
    followers: Vec<CompileTask>,
}

#[derive(Debug, Default)]
pub(crate) struct InFlight {
    keys: DashMap<String, KeyState>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead `task`'s key, or park behind the task already leading it.
    ///
    /// Tasks without a key, or with a fallback key, always lead.
    pub fn claim(&self, task: CompileTask) -> Claim {
        let Some(key) = task.cache_key.clone() else {
            return Claim::Lead(task);
        };
        if HashKeyGenerator::is_fallback_key(&key) {
            return Claim::Lead(task);
        }
        match self.keys.entry(key) {
            Entry::Occupied(mut occupied) => {
                let leader = occupied.get().leader;
                occupied.get_mut().followers.push(task);
                Claim::Parked { leader }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(KeyState {
                    leader: task.id,
                    followers: Vec::new(),
                });
                Claim::Lead(task)
            }
        }
    }

    /// End `leader`'s run of `key`, handing back its parked followers in
    /// arrival order
    pub fn release(&self, key: &str, leader: TaskId) -> Vec<CompileTask> {
        self.keys
            .remove_if(key, |_, state| state.leader == leader)
            .map(|(_, state)| state.followers)
            .unwrap_or_default()
    }

    /// Take a parked task out of whichever wait list holds it
    pub fn remove_follower(&self, id: TaskId) -> Option<CompileTask> {
        for mut state in self.keys.iter_mut() {
            if let Some(pos) = state.followers.iter().position(|t| t.id == id) {
                return Some(state.followers.remove(pos));
            }
        }
        None
    }

    #[cfg(test)]
    pub fn is_parked(&self, id: TaskId) -> bool {
        self.keys
            .iter()
            .any(|state| state.followers.iter().any(|t| t.id == id))
    }

    pub fn parked_count(&self) -> usize {
        self.keys.iter().map(|state| state.followers.len()).sum()
    }

    /// Empty every wait list, returning the parked tasks
    pub fn drain_followers(&self) -> Vec<CompileTask> {
        let mut drained = Vec::new();
        for mut state in self.keys.iter_mut() {
            drained.append(&mut state.followers);
        }
        drained
    }
}
