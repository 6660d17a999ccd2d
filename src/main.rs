use agentium_controller::agent_runner::ClaudeAgentRunner;
use agentium_controller::cancellation::CancellationToken;
use agentium_controller::config::Config;
use agentium_controller::controller::{Controller, ControllerConfig};
use agentium_controller::dependency_graph::Item;
use agentium_controller::errors::{self, OrchestratorError};
use agentium_controller::forge_client::NullForgeClient;
use agentium_controller::handoff::HandoffStore;
use agentium_controller::iteration_driver::{IterationDriver, NoSignalTracker};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "agentium", version, about = "Task controller for an automated coding-agent orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive every non-terminal task in the project to completion or a
    /// terminal verdict, one task at a time.
    Run {
        #[arg(long, default_value = ".")]
        project_dir: PathBuf,
    },
}

/// Installs an stdout layer plus a non-blocking rolling file writer under
/// `log_dir`. The returned guard must be kept alive for the life of the
/// process — dropping it stops flushing the file writer.
fn init_logging(log_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(log_dir, "agentium.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter()))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false).with_filter(filter()))
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let project_dir = match &cli.command {
        Commands::Run { project_dir } => project_dir.clone(),
    };
    let log_dir = project_dir.join(".agentium").join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let _logging_guard = init_logging(&log_dir);

    match cli.command {
        Commands::Run { project_dir } => run(project_dir).await,
    }
}

async fn run(project_dir: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&project_dir).map_err(|e| anyhow::anyhow!(e))?;

    let cancellation = CancellationToken::new();
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("received interrupt signal, cancelling");
                cancellation.cancel();
            }
        });
    }

    let started_at = chrono::Utc::now();
    tracing::info!(project_dir = %project_dir.display(), %started_at, "starting run");

    let agent_runner = Arc::new(ClaudeAgentRunner::new(config.claude_cmd.clone()));
    let forge = Arc::new(NullForgeClient);

    let mut driver = IterationDriver::new(agent_runner, forge.clone());
    driver.no_signal_limit = config.no_signal_limit;

    let controller_config = ControllerConfig {
        phase_list: config.phase_list.clone(),
        budgets: config.budgets.clone(),
        plan_skip_enabled: config.plan_skip_enabled,
        default_branch: config.default_branch.clone(),
        workspace_dir: config.project_dir.clone(),
    };
    let controller = Controller::new(controller_config, driver, forge);

    // A real session fetches its batch from the forge; with no concrete
    // forge wired up by default there is nothing to run yet.
    let items: Vec<Item> = Vec::new();
    let (graph, mut queue) = controller.build_queue(&items);
    let mut handoff = HandoffStore::new();
    let mut no_signal = NoSignalTracker::new();

    while let Some(task) = queue.next_pending().cloned() {
        if cancellation.is_cancelled() {
            tracing::info!("run loop cancelled");
            break;
        }
        let result: Result<(), OrchestratorError> = controller
            .step_task(&graph, &mut queue, &mut handoff, &mut no_signal, "", task.id, &cancellation)
            .await;
        if let Err(err) = result {
            tracing::error!(task_id = task.id, error = %errors::redact(&err.to_string()), "task step failed");
            break;
        }
    }

    tracing::info!(tasks = queue.len(), "run complete");
    Ok(())
}
