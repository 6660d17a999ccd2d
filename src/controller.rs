//! Ties the four core subsystems into the session run loop: pick the next
//! task, resolve its branch, drive its current phase to a verdict, advance
//! or propagate blocking, repeat until the queue is exhausted or cancelled.

use crate::blocked_propagator;
use crate::cancellation::CancellationToken;
use crate::dependency_graph::{DependencyGraph, Item};
use crate::errors::{OrchestratorError, PhaseError};
use crate::forge_client::{BranchState, ForgeCache, ForgeClient};
use crate::handoff::HandoffStore;
use crate::iteration_driver::{IterationContext, IterationDriver, IterationOutcome, NoSignalTracker};
use crate::phase::{BudgetConfig, Phase, PhaseList};
use crate::task_queue::{ItemKind, TaskKey, TaskQueue, TaskState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ControllerConfig {
    pub phase_list: PhaseList,
    pub budgets: BudgetConfig,
    pub plan_skip_enabled: bool,
    pub default_branch: String,
    pub workspace_dir: PathBuf,
}

pub struct Controller {
    pub config: ControllerConfig,
    pub driver: IterationDriver,
    pub forge: Arc<dyn ForgeClient>,
    pub forge_cache: ForgeCache,
}

impl Controller {
    pub fn new(config: ControllerConfig, driver: IterationDriver, forge: Arc<dyn ForgeClient>) -> Self {
        let forge_cache = ForgeCache::new(forge.clone());
        Self { config, driver, forge, forge_cache }
    }

    /// Discover sub-items and blocking dependencies for `task_id` via the
    /// forge and splice any not already in the queue into the run list:
    /// children go directly after the parent (`insert_after`), newly found
    /// blockers are appended then reordered ahead of the task they block
    /// (`reorder_subset`), so they run first.
    async fn expand_sub_items(
        &self,
        queue: &mut TaskQueue,
        task_id: u64,
        cancellation: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let sub_issues = self.forge_cache.cached_sub_issues(task_id, cancellation).await?;
        let blocked_by = self.forge_cache.cached_blocked_by(task_id, cancellation).await?;

        let make_state = |id: u64| {
            let first_phase = self.config.phase_list.first();
            let budget = self.config.budgets.budget_for(&first_phase, false);
            TaskState::new(TaskKey::issue(id), first_phase, budget)
        };

        let new_children: Vec<TaskState> = sub_issues
            .iter()
            .filter(|r| queue.get(TaskKey::issue(r.number)).is_none())
            .map(|r| make_state(r.number))
            .collect();
        if !new_children.is_empty() {
            queue.insert_after(TaskKey::issue(task_id), new_children);
        }

        let new_blockers: Vec<TaskState> = blocked_by
            .iter()
            .filter(|r| queue.get(TaskKey::issue(r.number)).is_none())
            .map(|r| make_state(r.number))
            .collect();
        if !new_blockers.is_empty() {
            let mut subset: Vec<TaskKey> = new_blockers.iter().map(|s| s.key()).collect();
            for state in new_blockers {
                queue.push(state);
            }
            subset.push(TaskKey::issue(task_id));
            queue.reorder_subset(&subset);
        }

        Ok(())
    }

    /// Build the initial queue from a batch of items: a dependency graph
    /// linearizes the batch, the queue is ordered accordingly, and every
    /// item gets a fresh `TaskState` starting at the phase list's first
    /// phase.
    pub fn build_queue(&self, items: &[Item]) -> (DependencyGraph, TaskQueue) {
        let graph = DependencyGraph::build(items);
        let mut queue = TaskQueue::new();
        for &id in graph.sorted_issue_ids() {
            let first_phase = self.config.phase_list.first();
            let budget = self
                .config
                .budgets
                .budget_for(&first_phase, false);
            queue.push(TaskState::new(TaskKey::issue(id), first_phase, budget));
        }
        (graph, queue)
    }

    /// Resolve the branch this task should build on top of, per §4.3's
    /// parent-branch resolution rules. Returns `Ok(None)` when the task must
    /// transition straight to `BLOCKED` instead of activating.
    pub async fn resolve_parent_branch(
        &self,
        graph: &DependencyGraph,
        queue: &TaskQueue,
        task_id: u64,
        cancellation: &CancellationToken,
    ) -> Result<Option<String>, PhaseError> {
        let parents = graph.parents_of(task_id);
        if parents.is_empty() {
            return Ok(Some(self.config.default_branch.clone()));
        }

        for &parent_id in parents {
            let in_batch = queue.get(TaskKey::issue(parent_id));
            match in_batch {
                Some(parent_state) => match &parent_state.phase {
                    Phase::Complete => {
                        return Ok(Some(
                            parent_state
                                .parent_branch
                                .clone()
                                .unwrap_or_else(|| self.config.default_branch.clone()),
                        ));
                    }
                    Phase::NothingToDo => return Ok(Some(self.config.default_branch.clone())),
                    Phase::Blocked => return Ok(None),
                    _ => continue, // not yet terminal: caller should defer activation
                },
                None => {
                    let state = self
                        .forge
                        .branch_state(parent_id, cancellation)
                        .await
                        .map_err(|source| PhaseError::ParentBranchResolution {
                            task_id: task_id.to_string(),
                            source,
                        })?;
                    match state {
                        BranchState::Merged { .. } => return Ok(Some(self.config.default_branch.clone())),
                        BranchState::Open { branch } => return Ok(Some(branch)),
                        BranchState::None => return Ok(None),
                    }
                }
            }
        }
        Ok(Some(self.config.default_branch.clone()))
    }

    /// Whether this task's activation should be deferred because an in-batch
    /// parent hasn't reached a terminal phase yet.
    pub fn is_blocked_on_pending_parent(&self, graph: &DependencyGraph, queue: &TaskQueue, task_id: u64) -> bool {
        graph.parents_of(task_id).iter().any(|&parent_id| {
            queue
                .get(TaskKey::issue(parent_id))
                .map(|s| !s.phase.is_terminal())
                .unwrap_or(false)
        })
    }

    /// Run one phase iteration for `task_id` and apply its outcome: advance
    /// the phase, mark blocked (propagating to descendants), or stay put
    /// for another iteration.
    pub async fn step_task(
        &self,
        graph: &DependencyGraph,
        queue: &mut TaskQueue,
        handoff: &mut HandoffStore,
        no_signal: &mut NoSignalTracker,
        item_body: &str,
        task_id: u64,
        cancellation: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let key = TaskKey::issue(task_id);

        if self.is_blocked_on_pending_parent(graph, queue, task_id) {
            return Ok(());
        }

        if queue.get(key).map(|s| !s.sub_items_expanded).unwrap_or(false) {
            self.expand_sub_items(queue, task_id, cancellation).await?;
            if let Some(state) = queue.get_mut(key) {
                state.sub_items_expanded = true;
            }
        }

        if queue.get(key).and_then(|s| s.parent_branch.clone()).is_none() {
            match self.resolve_parent_branch(graph, queue, task_id, cancellation).await? {
                Some(branch) => {
                    if let Some(state) = queue.get_mut(key) {
                        state.parent_branch = Some(branch);
                    }
                }
                None => {
                    if let Some(state) = queue.get_mut(key) {
                        state.phase = Phase::Blocked;
                    }
                    self.propagate_blocked(graph, queue, task_id);
                    return Ok(());
                }
            }
        }

        let Some(state) = queue.get(key) else {
            return Ok(());
        };
        if state.phase.is_terminal() {
            return Ok(());
        }

        let phase = state.phase.clone();
        let phase_iteration = state.phase_iteration + 1;
        let max_phase_iterations = state.max_phase_iterations;
        let previous_feedback = state.last_reviewer_feedback.clone();

        let ctx = IterationContext {
            task_id,
            phase: phase.clone(),
            phase_iteration,
            max_phase_iterations,
            item_body,
            is_simple_task: false,
            plan_skip_enabled: self.config.plan_skip_enabled,
            worker_prompt_base: "",
            previous_reviewer_feedback: previous_feedback.as_deref(),
            workspace_dir: self.config.workspace_dir.clone(),
        };

        let outcome = self
            .driver
            .run_iteration(&ctx, handoff, no_signal, cancellation)
            .await?;

        let Some(state) = queue.get_mut(key) else {
            return Ok(());
        };
        state.phase_iteration = phase_iteration;

        match outcome {
            IterationOutcome::Advance => {
                let next = self.config.phase_list.advance(&phase);
                info!(task_id, from = %phase, to = %next, "phase advanced");
                state.phase = next.clone();
                state.phase_iteration = 0;
                state.max_phase_iterations = self.config.budgets.budget_for(&next, false);
                state.last_judge_verdict = Some("ADVANCE".to_string());
            }
            IterationOutcome::Iterate { feedback } => {
                state.last_reviewer_feedback = Some(feedback.clone());
                state.last_judge_verdict = Some("ITERATE".to_string());
                state.last_judge_feedback = Some(feedback);
            }
            IterationOutcome::Blocked { reason } => {
                warn!(task_id, reason = %crate::errors::redact(&reason), "task blocked");
                state.phase = Phase::Blocked;
                state.last_judge_verdict = Some("BLOCKED".to_string());
                state.last_judge_feedback = Some(reason);
                self.propagate_blocked(graph, queue, task_id);
            }
        }
        Ok(())
    }

    fn propagate_blocked(&self, graph: &DependencyGraph, queue: &mut TaskQueue, task_id: u64) {
        let blocked_ids = blocked_propagator::propagate(graph, task_id, |id| {
            queue
                .get(TaskKey::issue(id))
                .map(|s| s.phase.clone())
                .unwrap_or(Phase::Plan)
        });
        for id in blocked_ids {
            if let Some(state) = queue.get_mut(TaskKey::issue(id)) {
                state.phase = Phase::Blocked;
            }
        }
    }
}
