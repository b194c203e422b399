//! Dependency graph for managing task dependencies.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync
//!
//! An edge only says "must terminate first": success and failure of the
//! dependency release the dependent alike.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use crate::domain::TaskId;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on (waits for)
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it (waiting tasks)
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(task_b, task_a) means "B waits for A"
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.reverse_edges
            .entry(depends_on.clone())
            .or_default()
            .insert(task.clone());
        self.edges.entry(task).or_default().insert(depends_on);
    }

    /// Remove a dependency: `task` no longer depends on `depends_on`.
    pub fn remove_dependency(&mut self, task: &TaskId, depends_on: &TaskId) {
        if let Entry::Occupied(mut e) = self.edges.entry(task.clone()) {
            e.get_mut().remove(depends_on);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
        if let Entry::Occupied(mut e) = self.reverse_edges.entry(depends_on.clone()) {
            e.get_mut().remove(task);
            if e.get().is_empty() {
                e.remove_entry();
            }
        }
    }

    /// Drop a terminated task from the graph.
    ///
    /// Returns the tasks that were waiting on it and now have no dependency
    /// left. Its own outgoing edges (if it was cancelled while blocked) are
    /// removed as well.
    pub fn remove_task(&mut self, task: &TaskId) -> Vec<TaskId> {
        for dep in self.get_dependencies(task) {
            self.remove_dependency(task, &dep);
        }

        let mut unblocked = Vec::new();
        for waiting in self.get_waiting_tasks(task) {
            self.remove_dependency(&waiting, task);
            if !self.has_dependencies(&waiting) {
                unblocked.push(waiting);
            }
        }
        unblocked
    }

    /// Get all tasks waiting for `task`, even if they have other dependencies.
    pub fn get_waiting_tasks(&self, task: &TaskId) -> Vec<TaskId> {
        self.reverse_edges
            .get(task)
            .map(|waiting| waiting.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if `task` has any unresolved dependencies.
    pub fn has_dependencies(&self, task: &TaskId) -> bool {
        self.edges
            .get(task)
            .map(|deps| !deps.is_empty())
            .unwrap_or(false)
    }

    pub fn get_dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        self.edges
            .get(task)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Would `task -> depends_on` close a cycle?
    ///
    /// True when `task` is already reachable from `depends_on` by following
    /// dependency edges (or when both are the same task).
    pub fn would_create_cycle(&self, task: &TaskId, depends_on: &TaskId) -> bool {
        let mut stack = vec![depends_on];
        let mut visited: HashSet<&TaskId> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == task {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(deps) = self.edges.get(node) {
                stack.extend(deps.iter());
            }
        }
        false
    }
}
