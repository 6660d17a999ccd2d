//! The worker/reviewer/judge loop: the hardest subsystem. One call to
//! `run_iteration` drives exactly one phase iteration for one task.

use crate::agent_runner::{AgentOutput, AgentRunner, RunRequest};
use crate::cancellation::CancellationToken;
use crate::errors::{self, AgentRunnerError, IterationError};
use crate::forge_client::ForgeClient;
use crate::handoff::{HandoffKey, HandoffStore, HandoffValue};
use crate::phase::{self, Phase};
use crate::signals::{ReviewMode, Verdict};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-stage skip configuration. The three conditional reasons are evaluated
/// against the worker's output; `always` unconditionally skips the stage.
#[derive(Debug, Clone, Default)]
pub struct StageSkipConfig {
    pub on_empty_output: bool,
    pub on_simple_output: bool,
    pub on_no_code_changes: bool,
    pub always: bool,
}

impl StageSkipConfig {
    fn should_skip(&self, worker_output: &AgentOutput) -> bool {
        self.always
            || (self.on_empty_output && worker_output.assistant_text.trim().is_empty())
            || (self.on_simple_output && worker_output.signals.review_mode == Some(ReviewMode::Simple))
            || (self.on_no_code_changes && worker_output.signals.handoff_json.is_none())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SkipConfig {
    pub reviewer: StageSkipConfig,
    pub judge: StageSkipConfig,
}

/// Tracks, per `(task_id, phase)`, how many consecutive iterations produced
/// no parsed judge signal. Any parsed signal resets the counter to zero.
#[derive(Debug, Clone, Default)]
pub struct NoSignalTracker {
    counts: HashMap<(u64, Phase), u32>,
}

impl NoSignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this iteration's signal outcome and report whether the
    /// configured limit has now been reached.
    fn record(&mut self, task_id: u64, phase: &Phase, signal_found: bool, limit: u32) -> bool {
        let entry = self.counts.entry((task_id, phase.clone())).or_insert(0);
        if signal_found {
            *entry = 0;
            false
        } else {
            *entry += 1;
            if *entry >= limit {
                *entry = 0;
                true
            } else {
                false
            }
        }
    }
}

/// The driver's verdict for one iteration, after skip rules, hard gates, and
/// the no-signal fail-safe have all been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Advance,
    Iterate { feedback: String },
    Blocked { reason: String },
}

/// Everything one `run_iteration` call needs about the task it is driving.
pub struct IterationContext<'a> {
    pub task_id: u64,
    pub phase: Phase,
    pub phase_iteration: u32,
    pub max_phase_iterations: u32,
    pub item_body: &'a str,
    pub is_simple_task: bool,
    pub plan_skip_enabled: bool,
    pub worker_prompt_base: &'a str,
    pub previous_reviewer_feedback: Option<&'a str>,
    pub workspace_dir: PathBuf,
}

const PLAN_GATE_FEEDBACK: &str =
    "PLAN cannot advance without a structured plan handoff; re-run and emit AGENTIUM_PLAN_START/END.";

pub struct IterationDriver {
    pub agent_runner: Arc<dyn AgentRunner>,
    pub forge: Arc<dyn ForgeClient>,
    pub no_signal_limit: u32,
    pub skip_config: SkipConfig,
}

impl IterationDriver {
    pub fn new(agent_runner: Arc<dyn AgentRunner>, forge: Arc<dyn ForgeClient>) -> Self {
        Self {
            agent_runner,
            forge,
            no_signal_limit: 2,
            skip_config: SkipConfig::default(),
        }
    }

    pub async fn run_iteration(
        &self,
        ctx: &IterationContext<'_>,
        handoff: &mut HandoffStore,
        no_signal: &mut NoSignalTracker,
        cancellation: &CancellationToken,
    ) -> Result<IterationOutcome, IterationError> {
        // Plan-skip rule: skip the worker entirely and treat the body as the
        // phase output. An observability comment records that the skip fired,
        // since no worker/reviewer/judge transcript exists for this iteration.
        let worker_output = if phase::should_skip_plan_iteration(
            &ctx.phase,
            ctx.phase_iteration,
            ctx.plan_skip_enabled,
            ctx.item_body,
        ) {
            let _ = self
                .forge
                .post_comment(
                    ctx.task_id,
                    "Item body already contains a plan; skipping the PLAN worker call.",
                    cancellation,
                )
                .await;
            AgentOutput::from_raw_text(0, ctx.item_body.to_string())
        } else {
            match self.run_worker(ctx, cancellation).await {
                Ok(output) => output,
                Err(err) => return self.handle_stage_failure(ctx, handoff, no_signal, "worker", err, cancellation).await,
            }
        };

        self.extract_handoff(ctx, handoff, &worker_output).await?;

        if self.skip_config.reviewer.should_skip(&worker_output) {
            return Ok(self
                .finish_iteration(ctx, handoff, Verdict::Advance, String::new(), true, no_signal, cancellation)
                .await);
        }

        let _reviewer_output = match self.run_reviewer(ctx, cancellation, &worker_output).await {
            Ok(output) => output,
            Err(err) => return self.handle_stage_failure(ctx, handoff, no_signal, "reviewer", err, cancellation).await,
        };

        if self.skip_config.judge.should_skip(&worker_output) {
            return Ok(self
                .finish_iteration(ctx, handoff, Verdict::Advance, String::new(), true, no_signal, cancellation)
                .await);
        }

        let judge_output = match self.run_judge(ctx, cancellation, &worker_output).await {
            Ok(output) => output,
            Err(err) => return self.handle_stage_failure(ctx, handoff, no_signal, "judge", err, cancellation).await,
        };
        let judge_eval = judge_output.signals.judge_eval.clone();

        let (verdict, feedback, signal_found) = match judge_eval {
            Some(result) => (result.verdict, result.feedback, result.signal_found),
            None => (Verdict::Iterate, String::new(), false),
        };

        // Iteration exhaustion: force advance regardless of verdict once the
        // phase budget is spent. This is an unconditional guarantee distinct
        // from a judge-parsed ADVANCE, so it bypasses `finish_iteration` (and
        // with it the PLAN hard gate) entirely, the same way the no-signal
        // limit below does.
        if ctx.phase_iteration >= ctx.max_phase_iterations && verdict != Verdict::Blocked {
            let _ = self
                .forge
                .post_comment(
                    ctx.task_id,
                    &format!(
                        "{} exhausted its iteration budget ({} iterations); forcing advance.",
                        ctx.phase, ctx.max_phase_iterations
                    ),
                    cancellation,
                )
                .await;
            return Ok(IterationOutcome::Advance);
        }

        let limit_reached = no_signal.record(ctx.task_id, &ctx.phase, signal_found, self.no_signal_limit);
        if limit_reached {
            return Ok(IterationOutcome::Advance);
        }

        Ok(self
            .finish_iteration(ctx, handoff, verdict, feedback, signal_found, no_signal, cancellation)
            .await)
    }

    /// Agent container failure (spawn or non-zero exit) for any of the three
    /// stages is not fatal for the iteration: log it, record a no-signal
    /// event, and default to ADVANCE so repeated container faults don't wedge
    /// the loop. Cancellation is the one `AgentRunnerError` that still
    /// unwinds immediately rather than failing open.
    async fn handle_stage_failure(
        &self,
        ctx: &IterationContext<'_>,
        handoff: &HandoffStore,
        no_signal: &mut NoSignalTracker,
        stage: &str,
        err: IterationError,
        cancellation: &CancellationToken,
    ) -> Result<IterationOutcome, IterationError> {
        if matches!(err, IterationError::AgentRunner(AgentRunnerError::Cancelled)) {
            return Err(IterationError::Cancelled);
        }
        if !matches!(err, IterationError::AgentRunner(_)) {
            return Err(err);
        }
        let redacted = errors::redact(&err.to_string());
        tracing::warn!(task_id = ctx.task_id, phase = %ctx.phase, stage, error = %redacted, "agent container failure, defaulting to fail-open advance");
        no_signal.record(ctx.task_id, &ctx.phase, false, self.no_signal_limit);
        Ok(self
            .finish_iteration(ctx, handoff, Verdict::Advance, String::new(), false, no_signal, cancellation)
            .await)
    }

    /// Apply the PLAN hard gate, post the extracted plan as a comment when
    /// PLAN genuinely advances, then translate a raw verdict into the public
    /// `IterationOutcome`. `signal_found` here reflects what should be fed to
    /// the no-signal tracker's already-recorded state, not recorded again —
    /// this helper never calls `no_signal.record` itself.
    async fn finish_iteration(
        &self,
        ctx: &IterationContext<'_>,
        handoff: &HandoffStore,
        verdict: Verdict,
        feedback: String,
        _signal_found: bool,
        _no_signal: &mut NoSignalTracker,
        cancellation: &CancellationToken,
    ) -> IterationOutcome {
        if ctx.phase == Phase::Plan
            && verdict == Verdict::Advance
            && !handoff.has_plan_output(ctx.task_id, ctx.phase_iteration)
        {
            return IterationOutcome::Iterate {
                feedback: PLAN_GATE_FEEDBACK.to_string(),
            };
        }

        if ctx.phase == Phase::Plan
            && verdict == Verdict::Advance
            && let Some(HandoffValue::PlanOutput { markdown }) =
                handoff.latest_for_phase(ctx.task_id, &Phase::Plan, ctx.phase_iteration)
        {
            let _ = self.forge.post_comment(ctx.task_id, markdown, cancellation).await;
        }

        match verdict {
            Verdict::Advance => IterationOutcome::Advance,
            Verdict::Iterate => IterationOutcome::Iterate { feedback },
            Verdict::Blocked => IterationOutcome::Blocked {
                reason: if feedback.is_empty() {
                    "judge returned BLOCKED".to_string()
                } else {
                    feedback
                },
            },
        }
    }

    async fn run_worker(
        &self,
        ctx: &IterationContext<'_>,
        cancellation: &CancellationToken,
    ) -> Result<AgentOutput, IterationError> {
        let mut prompt = String::new();
        prompt.push_str(ctx.worker_prompt_base);
        prompt.push_str("\n\n## Item\n");
        prompt.push_str(ctx.item_body);
        if let Some(feedback) = ctx.previous_reviewer_feedback {
            prompt.push_str("\n\n## Feedback from previous iteration\n");
            prompt.push_str(feedback);
        }

        let request = RunRequest {
            task_id: ctx.task_id,
            phase: ctx.phase.to_string(),
            stage: "worker".to_string(),
            prompt,
            workspace_dir: ctx.workspace_dir.clone(),
        };
        Ok(self.agent_runner.run(request, cancellation.clone()).await?)
    }

    async fn run_reviewer(
        &self,
        ctx: &IterationContext<'_>,
        cancellation: &CancellationToken,
        worker_output: &AgentOutput,
    ) -> Result<AgentOutput, IterationError> {
        let mut prompt = String::new();
        prompt.push_str("Review the following worker output.\n\n");
        prompt.push_str(&worker_output.assistant_text);
        if let Some(feedback) = ctx.previous_reviewer_feedback {
            prompt.push_str("\n\n## Previous reviewer feedback\n");
            prompt.push_str(feedback);
        }

        let request = RunRequest {
            task_id: ctx.task_id,
            phase: ctx.phase.to_string(),
            stage: "reviewer".to_string(),
            prompt,
            workspace_dir: ctx.workspace_dir.clone(),
        };
        Ok(self.agent_runner.run(request, cancellation.clone()).await?)
    }

    async fn run_judge(
        &self,
        ctx: &IterationContext<'_>,
        cancellation: &CancellationToken,
        worker_output: &AgentOutput,
    ) -> Result<AgentOutput, IterationError> {
        let mut prompt = String::new();
        prompt.push_str("Emit exactly one AGENTIUM_EVAL line for this iteration.\n\n");
        prompt.push_str(&worker_output.summary);

        let request = RunRequest {
            task_id: ctx.task_id,
            phase: ctx.phase.to_string(),
            stage: "judge".to_string(),
            prompt,
            workspace_dir: ctx.workspace_dir.clone(),
        };
        Ok(self.agent_runner.run(request, cancellation.clone()).await?)
    }

    async fn extract_handoff(
        &self,
        ctx: &IterationContext<'_>,
        handoff: &mut HandoffStore,
        worker_output: &AgentOutput,
    ) -> Result<(), IterationError> {
        let key = HandoffKey::new(ctx.task_id, ctx.phase.clone(), ctx.phase_iteration);

        if ctx.phase == Phase::Plan {
            if let Some(markdown) = &worker_output.signals.plan_markdown {
                let plan_path = ctx.workspace_dir.join(".agentium").join(format!("plan-{}.md", ctx.task_id));
                if let Some(parent) = plan_path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| IterationError::PlanWrite(e.to_string()))?;
                }
                tokio::fs::write(&plan_path, markdown)
                    .await
                    .map_err(|e| IterationError::PlanWrite(e.to_string()))?;
                handoff.insert(
                    key,
                    HandoffValue::PlanOutput {
                        markdown: markdown.clone(),
                    },
                );
                return Ok(());
            }
        }

        handoff.insert(
            key,
            HandoffValue::WorkerOutput {
                summary: worker_output.summary.clone(),
            },
        );
        Ok(())
    }
}
