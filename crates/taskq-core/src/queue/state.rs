//! Mutable scheduler state, guarded by the queue's single mutex.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use super::dependency::DependencyGraph;
use super::handler::{CoalescingHandler, TaskHandler};
use super::Task;
use crate::domain::{QueuePriority, ServiceClass, TaskId, TaskState, TaskType};

/// Ready heap entry: highest priority first, then service class, then FIFO.
struct ReadyEntry {
    priority: QueuePriority,
    service_class: ServiceClass,
    seq: u64,
    task: Task,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.service_class.cmp(&other.service_class))
            // Reverse: earlier submissions win among equals
            .then(other.seq.cmp(&self.seq))
    }
}

pub(crate) struct QueueState {
    /// Live index: every admitted task that is not terminal yet.
    pub live: HashMap<TaskId, Task>,

    pub graph: DependencyGraph,

    pub handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,

    pub coalescers: HashMap<TaskType, Arc<dyn CoalescingHandler>>,

    /// Tasks currently holding a worker slot.
    pub running: usize,

    ready: BinaryHeap<ReadyEntry>,
    next_seq: u64,
}

impl QueueState {
    pub fn new(
        handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
        coalescers: HashMap<TaskType, Arc<dyn CoalescingHandler>>,
    ) -> Self {
        Self {
            live: HashMap::new(),
            graph: DependencyGraph::new(),
            handlers,
            coalescers,
            running: 0,
            ready: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Is this exact task instance the one registered under its ID?
    pub fn is_registered(&self, task: &Task) -> bool {
        self.live
            .get(task.id())
            .is_some_and(|live| live.ptr_eq(task))
    }

    pub fn push_ready(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.ready.push(ReadyEntry {
            priority: task.queue_priority(),
            service_class: task.service_class(),
            seq,
            task,
        });
    }

    /// Next dispatchable task, skipping entries that were cancelled while
    /// waiting in the heap.
    pub fn pop_ready(&mut self) -> Option<Task> {
        while let Some(entry) = self.ready.pop() {
            if self.is_registered(&entry.task) && entry.task.state() == TaskState::Ready {
                return Some(entry.task);
            }
        }
        None
    }

    /// Idle, dependency-free live tasks of `task_type`, oldest first.
    pub fn coalescing_candidates(&self, task_type: &TaskType) -> Vec<Task> {
        let mut candidates: Vec<Task> = self
            .live
            .values()
            .filter(|t| {
                t.task_type() == task_type
                    && t.state().is_idle()
                    && !self.graph.has_dependencies(t.id())
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.created().cmp(&b.created()).then(a.id().cmp(b.id())));
        candidates
    }
}
