//! Ordered task queue: which task runs next, and the per-task state that
//! survives across iterations.

use crate::phase::Phase;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Issue,
    Pr,
}

impl ItemKind {
    fn as_str(self) -> &'static str {
        match self {
            ItemKind::Issue => "issue",
            ItemKind::Pr => "pr",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a task by kind and id; renders as `"type:id"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub kind: ItemKind,
    pub id: u64,
}

impl TaskKey {
    pub fn new(kind: ItemKind, id: u64) -> Self {
        Self { kind, id }
    }

    pub fn issue(id: u64) -> Self {
        Self::new(ItemKind::Issue, id)
    }

    pub fn pr(id: u64) -> Self {
        Self::new(ItemKind::Pr, id)
    }

    pub fn as_string(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// Mutable per-task state, keyed by `TaskKey` in the owning `TaskQueue`.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub id: u64,
    pub kind: ItemKind,
    pub phase: Phase,
    pub phase_iteration: u32,
    pub max_phase_iterations: u32,
    pub parent_branch: Option<String>,
    pub last_reviewer_feedback: Option<String>,
    pub last_judge_verdict: Option<String>,
    pub last_judge_feedback: Option<String>,
    pub test_retries: u32,
    pub pr_number: Option<u64>,
    pub judge_overrode_reviewer: bool,
    pub sub_items_expanded: bool,
}

impl TaskState {
    pub fn new(key: TaskKey, initial_phase: Phase, max_phase_iterations: u32) -> Self {
        Self {
            id: key.id,
            kind: key.kind,
            phase: initial_phase,
            phase_iteration: 0,
            max_phase_iterations,
            parent_branch: None,
            last_reviewer_feedback: None,
            last_judge_verdict: None,
            last_judge_feedback: None,
            test_retries: 0,
            pr_number: None,
            judge_overrode_reviewer: false,
            sub_items_expanded: false,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.kind, self.id)
    }
}

/// An ordered run list plus the per-task state each entry owns.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    order: Vec<TaskKey>,
    states: HashMap<TaskKey, TaskState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: TaskState) {
        let key = state.key();
        if !self.states.contains_key(&key) {
            self.order.push(key);
        }
        self.states.insert(key, state);
    }

    pub fn get(&self, key: TaskKey) -> Option<&TaskState> {
        self.states.get(&key)
    }

    pub fn get_mut(&mut self, key: TaskKey) -> Option<&mut TaskState> {
        self.states.get_mut(&key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// First queued task not already in a terminal phase.
    pub fn next_pending(&self) -> Option<&TaskState> {
        self.order
            .iter()
            .filter_map(|k| self.states.get(k))
            .find(|s| !s.phase.is_terminal())
    }

    /// Replace the run order wholesale — typically with a dependency graph's
    /// topological order. Any existing key not present in `sorted_ids` keeps
    /// its relative position appended at the end; unknown ids are ignored.
    pub fn reorder(&mut self, sorted_keys: &[TaskKey]) {
        let mut new_order: Vec<TaskKey> = sorted_keys
            .iter()
            .copied()
            .filter(|k| self.states.contains_key(k))
            .collect();
        for key in &self.order {
            if !new_order.contains(key) {
                new_order.push(*key);
            }
        }
        self.order = new_order;
    }

    /// Insert newly discovered sub-items directly after `after`, preserving
    /// the relative order of `items`. If `after` is absent the items are
    /// appended to the end.
    pub fn insert_after(&mut self, after: TaskKey, items: Vec<TaskState>) {
        let insert_pos = self
            .order
            .iter()
            .position(|&k| k == after)
            .map(|p| p + 1)
            .unwrap_or(self.order.len());

        let mut new_keys = Vec::with_capacity(items.len());
        for item in items {
            let key = item.key();
            new_keys.push(key);
            self.states.insert(key, item);
        }
        self.order.splice(insert_pos..insert_pos, new_keys);
    }

    /// Reorder only the given subset of keys to the supplied order, leaving
    /// every other entry's position untouched. Keys not present in the queue
    /// are ignored; keys present in the queue but absent from `ids` keep
    /// their existing relative position.
    pub fn reorder_subset(&mut self, ids: &[TaskKey]) {
        let subset: std::collections::HashSet<TaskKey> = ids.iter().copied().collect();
        let mut replacement = ids.iter().copied().filter(|k| self.states.contains_key(k));
        self.order = self
            .order
            .iter()
            .map(|&k| {
                if subset.contains(&k) {
                    replacement.next().unwrap_or(k)
                } else {
                    k
                }
            })
            .collect();
    }

    pub fn keys_in_order(&self) -> &[TaskKey] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(id: u64, phase: Phase) -> TaskState {
        TaskState::new(TaskKey::issue(id), phase, 3)
    }

    #[test]
    fn task_key_string_form() {
        assert_eq!(TaskKey::issue(42).as_string(), "issue:42");
        assert_eq!(TaskKey::pr(7).as_string(), "pr:7");
    }

    #[test]
    fn next_pending_skips_terminal_tasks() {
        let mut q = TaskQueue::new();
        q.push(state(1, Phase::Complete));
        q.push(state(2, Phase::Plan));
        assert_eq!(q.next_pending().unwrap().id, 2);
    }

    #[test]
    fn next_pending_none_when_all_terminal() {
        let mut q = TaskQueue::new();
        q.push(state(1, Phase::Complete));
        q.push(state(2, Phase::Blocked));
        assert!(q.next_pending().is_none());
    }

    #[test]
    fn reorder_applies_sorted_order_and_keeps_unknown_keys_appended() {
        let mut q = TaskQueue::new();
        q.push(state(3, Phase::Plan));
        q.push(state(1, Phase::Plan));
        q.push(state(2, Phase::Plan));

        q.reorder(&[TaskKey::issue(1), TaskKey::issue(2), TaskKey::issue(3)]);
        let ids: Vec<u64> = q.keys_in_order().iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    /// Invariant 6 / S4: newly discovered sub-items are spliced in directly
    /// after their parent, preserving their own relative order.
    #[test]
    fn insert_after_splices_sub_items_in_place() {
        let mut q = TaskQueue::new();
        q.push(state(1, Phase::Plan));
        q.push(state(2, Phase::Plan));

        q.insert_after(
            TaskKey::issue(1),
            vec![state(10, Phase::Plan), state(11, Phase::Plan)],
        );

        let ids: Vec<u64> = q.keys_in_order().iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![1, 10, 11, 2]);
        assert!(q.get(TaskKey::issue(10)).is_some());
    }

    #[test]
    fn insert_after_unknown_parent_appends_to_end() {
        let mut q = TaskQueue::new();
        q.push(state(1, Phase::Plan));
        q.insert_after(TaskKey::issue(999), vec![state(5, Phase::Plan)]);
        let ids: Vec<u64> = q.keys_in_order().iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![1, 5]);
    }

    #[test]
    fn reorder_subset_only_touches_named_keys() {
        let mut q = TaskQueue::new();
        q.push(state(1, Phase::Plan));
        q.push(state(2, Phase::Plan));
        q.push(state(3, Phase::Plan));

        q.reorder_subset(&[TaskKey::issue(3), TaskKey::issue(1)]);
        let ids: Vec<u64> = q.keys_in_order().iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn push_is_idempotent_on_same_key() {
        let mut q = TaskQueue::new();
        q.push(state(1, Phase::Plan));
        q.push(state(1, Phase::Implement));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get(TaskKey::issue(1)).unwrap().phase, Phase::Implement);
    }
}
