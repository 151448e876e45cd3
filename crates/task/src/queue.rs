//! Priority queue of waiting tasks
//!
//! Higher priority tiers pop first; within a tier tasks pop in the order
//! they were pushed.

use kiln_core::{CompileTask, Error, Priority, Result, TaskId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

struct QueueEntry {
    priority: Priority,
    sequence: u64,
    task: CompileTask,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // max-heap: higher priority first, then the lower sequence number
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
}

/// Thread-safe queue of `Queued` tasks
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `task`. Tasks already in a terminal state are rejected.
    pub fn push(&self, task: CompileTask) -> Result<()> {
        if task.is_terminal() {
            return Err(Error::InvalidTransition {
                task_id: task.id.to_string(),
                from: task.status,
                to: kiln_core::TaskStatus::Queued,
            });
        }
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(QueueEntry {
            priority: task.priority,
            sequence,
            task,
        });
        Ok(())
    }

    pub fn pop(&self) -> Option<CompileTask> {
        self.state.lock().heap.pop().map(|entry| entry.task)
    }

    /// Priority of the task that would pop next
    pub fn peek_priority(&self) -> Option<Priority> {
        self.state.lock().heap.peek().map(|entry| entry.priority)
    }

    pub fn remove(&self, id: TaskId) -> Option<CompileTask> {
        let mut state = self.state.lock();
        if !state.heap.iter().any(|entry| entry.task.id == id) {
            return None;
        }
        let mut removed = None;
        let entries = std::mem::take(&mut state.heap).into_vec();
        state.heap = entries
            .into_iter()
            .filter_map(|entry| {
                if entry.task.id == id {
                    removed = Some(entry.task);
                    None
                } else {
                    Some(entry)
                }
            })
            .collect();
        removed
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.state.lock().heap.iter().any(|entry| entry.task.id == id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().heap.is_empty()
    }

    /// Remove every task, in pop order
    pub fn drain(&self) -> Vec<CompileTask> {
        let heap = std::mem::take(&mut self.state.lock().heap);
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|entry| entry.task)
            .collect()
    }

    /// Copies of the queued tasks, in pop order
    pub fn snapshot(&self) -> Vec<CompileTask> {
        let state = self.state.lock();
        let mut entries: Vec<&QueueEntry> = state.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.task.clone()).collect()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.len()).finish()
    }
}
