//! The `AgentRunner` collaborator: whatever process actually runs a
//! worker/reviewer/judge turn.

use crate::cancellation::CancellationToken;
use crate::errors::AgentRunnerError;
use crate::signals::{self, JudgeResult, ReviewMode};
use crate::stream::{self, ContentBlock, StreamEvent};
use crate::util;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// What one worker/reviewer/judge invocation needs to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: u64,
    pub phase: String,
    pub stage: String,
    pub prompt: String,
    pub workspace_dir: std::path::PathBuf,
}

/// Out-of-band signals recovered from one invocation's raw output.
#[derive(Debug, Clone, Default)]
pub struct ParsedSignals {
    pub status: Option<String>,
    pub handoff_json: Option<String>,
    pub plan_markdown: Option<String>,
    pub judge_eval: Option<JudgeResult>,
    pub review_mode: Option<ReviewMode>,
    pub memory_entries: Vec<(String, String)>,
    pub prs_created: Vec<u64>,
}

impl ParsedSignals {
    pub fn parse(raw_text: &str) -> Self {
        Self {
            status: signals::extract_status(raw_text),
            // The marker only locates the line; the payload itself may be a
            // multi-line JSON object, so re-extract with brace counting from
            // that point on rather than trusting a single line of text.
            handoff_json: signals::extract_handoff_json(raw_text)
                .and_then(|marked| util::extract_json_object(&marked).or(Some(marked))),
            plan_markdown: signals::extract_plan_markdown(raw_text),
            judge_eval: {
                let result = signals::parse_judge_eval(raw_text);
                if result.signal_found { Some(result) } else { None }
            },
            review_mode: signals::extract_review_mode(raw_text),
            memory_entries: signals::extract_memory_entries(raw_text),
            prs_created: signals::extract_prs_created(raw_text),
        }
    }
}

/// The result of one `AgentRunner::run` invocation.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub exit_code: i32,
    pub raw_text: String,
    pub assistant_text: String,
    pub summary: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub signals: ParsedSignals,
}

impl AgentOutput {
    /// `raw_text` is all model output, including a textual rendering of any
    /// tool-use blocks; `assistant_text` is the text-only subset with
    /// tool-call results filtered out, per the agent invocation contract.
    pub fn new(exit_code: i32, raw_text: String, assistant_text: String) -> Self {
        let signals = ParsedSignals::parse(&raw_text);
        Self {
            exit_code,
            summary: assistant_text.lines().next().unwrap_or_default().to_string(),
            input_tokens: 0,
            output_tokens: 0,
            raw_text,
            assistant_text,
            signals,
        }
    }

    /// Convenience constructor for fixtures where no tool-use blocks exist to
    /// render separately, so `raw_text` and `assistant_text` coincide.
    pub fn from_raw_text(exit_code: i32, raw_text: String) -> Self {
        Self::new(exit_code, raw_text.clone(), raw_text)
    }
}

#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        cancellation: CancellationToken,
    ) -> Result<AgentOutput, AgentRunnerError>;
}

/// Subprocess-backed runner: shells out to an external agent CLI, draining
/// stdout and stderr concurrently so neither pipe's kernel buffer can stall
/// the other while the process is writing.
pub struct ClaudeAgentRunner {
    pub claude_cmd: String,
    pub extra_args: Vec<String>,
}

impl ClaudeAgentRunner {
    pub fn new(claude_cmd: impl Into<String>) -> Self {
        Self {
            claude_cmd: claude_cmd.into(),
            extra_args: Vec::new(),
        }
    }
}

#[async_trait]
impl AgentRunner for ClaudeAgentRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancellation: CancellationToken,
    ) -> Result<AgentOutput, AgentRunnerError> {
        let mut command = Command::new(&self.claude_cmd);
        command
            .args(&self.extra_args)
            .current_dir(&request.workspace_dir)
            .arg("--print")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg(&request.prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| AgentRunnerError::Spawn(e.to_string()))?;

        let stdout = child.stdout.take().expect("stdout piped above");
        let stderr = child.stderr.take().expect("stderr piped above");

        let stdout_events = drain_stream_events(stdout, request.task_id, &request.stage);
        let stderr_lines = drain_lines(stderr);

        let wait = async {
            tokio::select! {
                result = child.wait() => result.map_err(|e| AgentRunnerError::Spawn(e.to_string())),
                _ = cancellation.cancelled() => {
                    let _ = child.start_kill();
                    Err(AgentRunnerError::Cancelled)
                }
            }
        };

        let ((raw_text, assistant_text), err_lines, status) = tokio::join!(stdout_events, stderr_lines, wait);
        let status = status?;

        let stderr_text = err_lines.join("\n");

        if !status.success() {
            return Err(AgentRunnerError::NonZeroExit(format!(
                "exit status {:?}: {}",
                status.code(),
                stderr_text
            )));
        }

        Ok(AgentOutput::new(status.code().unwrap_or(0), raw_text, assistant_text))
    }
}

async fn drain_lines<R: tokio::io::AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        out.push(line);
    }
    out
}

/// Reads `claude --output-format stream-json` events line by line, logging a
/// one-line description per tool use and building both text variants the
/// rest of the pipeline needs: `raw_text` (every block, tool uses rendered as
/// text) is what the signal grammar parses against, since a worker could in
/// principle emit a marker line as a tool argument; `assistant_text` is the
/// text-only subset handed to the reviewer/judge prompts. Lines that aren't a
/// recognized event (blank lines, stray non-JSON noise) are skipped rather
/// than failing the whole run.
async fn drain_stream_events<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    task_id: u64,
    stage: &str,
) -> (String, String) {
    let mut lines = BufReader::new(reader).lines();
    let mut raw_text = String::new();
    let mut assistant_text = String::new();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<StreamEvent>(&line) else {
            continue;
        };
        if let StreamEvent::Assistant { message, .. } = event {
            for block in message.content {
                match block {
                    ContentBlock::Text { text } => {
                        if !raw_text.is_empty() {
                            raw_text.push('\n');
                        }
                        raw_text.push_str(&text);
                        if !assistant_text.is_empty() {
                            assistant_text.push('\n');
                        }
                        assistant_text.push_str(&text);
                    }
                    ContentBlock::ToolUse { name, input, .. } => {
                        let description = stream::describe_tool_use(&name, &input);
                        tracing::debug!(
                            task_id,
                            stage,
                            tool = %stream::tool_emoji(&name),
                            "{}",
                            description
                        );
                        if !raw_text.is_empty() {
                            raw_text.push('\n');
                        }
                        raw_text.push_str(&description);
                    }
                }
            }
        }
    }

    (raw_text, assistant_text)
}

/// Test fake: replays a fixed queue of outputs regardless of the request,
/// one per call, in FIFO order.
pub struct ScriptedAgentRunner {
    scripted: Mutex<VecDeque<AgentOutput>>,
}

impl ScriptedAgentRunner {
    pub fn new(outputs: Vec<AgentOutput>) -> Self {
        Self {
            scripted: Mutex::new(outputs.into_iter().collect()),
        }
    }

    pub fn from_raw_texts(texts: Vec<&str>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| AgentOutput::from_raw_text(0, t.to_string()))
                .collect(),
        )
    }
}

#[async_trait]
impl AgentRunner for ScriptedAgentRunner {
    async fn run(
        &self,
        _request: RunRequest,
        _cancellation: CancellationToken,
    ) -> Result<AgentOutput, AgentRunnerError> {
        self.scripted
            .lock()
            .expect("scripted runner mutex poisoned")
            .pop_front()
            .ok_or_else(|| AgentRunnerError::Spawn("scripted outputs exhausted".to_string()))
    }
}
