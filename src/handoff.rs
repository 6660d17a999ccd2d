//! Typed handoff store: what one iteration's worker stage passes forward to
//! later phases and later iterations of the same task.

use crate::phase::Phase;
use std::collections::HashMap;

/// One key into the handoff store: a task, the phase it ran in, and the
/// iteration within that phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandoffKey {
    pub task_id: u64,
    pub phase: Phase,
    pub iteration: u32,
}

impl HandoffKey {
    pub fn new(task_id: u64, phase: Phase, iteration: u32) -> Self {
        Self {
            task_id,
            phase,
            iteration,
        }
    }
}

/// A single stage's recorded output. Every phase contributes at least a
/// worker summary; `PlanOutput` is additionally required before the `PLAN`
/// phase is allowed to advance.
#[derive(Debug, Clone)]
pub enum HandoffValue {
    PlanOutput { markdown: String },
    ImplementOutput { summary: String, files_changed: Vec<String> },
    VerifyOutput { passed: bool, summary: String },
    WorkerOutput { summary: String },
}

/// Keyed store of handoff values, one entry per (task, phase, iteration).
#[derive(Debug, Clone, Default)]
pub struct HandoffStore {
    entries: HashMap<HandoffKey, HandoffValue>,
}

impl HandoffStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: HandoffKey, value: HandoffValue) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &HandoffKey) -> Option<&HandoffValue> {
        self.entries.get(key)
    }

    /// Most recent entry recorded for `task_id` at `phase`, across all
    /// iterations up to and including `up_to_iteration`.
    pub fn latest_for_phase(
        &self,
        task_id: u64,
        phase: &Phase,
        up_to_iteration: u32,
    ) -> Option<&HandoffValue> {
        (1..=up_to_iteration)
            .rev()
            .find_map(|it| self.entries.get(&HandoffKey::new(task_id, phase.clone(), it)))
    }

    /// Whether a `PlanOutput` entry exists anywhere for this task's `PLAN`
    /// phase — the hard gate the `PLAN` phase must clear before advancing.
    pub fn has_plan_output(&self, task_id: u64, up_to_iteration: u32) -> bool {
        (1..=up_to_iteration).any(|it| {
            matches!(
                self.entries.get(&HandoffKey::new(task_id, Phase::Plan, it)),
                Some(HandoffValue::PlanOutput { .. })
            )
        })
    }
}
