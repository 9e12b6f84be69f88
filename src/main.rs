use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use agentflow::config::Config;
use agentflow::orchestration::{
    registry_from_config, CancelOutcome, EventKind, JsonlSink, KeywordSequenceProvider,
    WorkflowExecutor,
};
use agentflow::state::FileStore;
use agentflow::workflow::{
    ClarificationResponse, Decision, PlanId, RequestId, SessionId, TaskSubmission, TranscriptEntry,
};
use agentflow::{ExecutorConfig, Result};

/// Agentflow - multi-agent workflow runner with human checkpoints
#[derive(Parser, Debug)]
#[command(name = "agentflow")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    AGENTFLOW_DEBUG=1   Enable debug logging (alternative to --debug)\n    RUST_LOG            Override the log filter")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.agentflow/agentflow.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file to use instead of ~/.agentflow/agentflow.toml
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Write the default config to ~/.agentflow/agentflow.toml
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Submit a task and run it to the plan-approval checkpoint
    Submit {
        /// The task description in natural language
        task: String,

        /// Session to group the plan under
        #[arg(long)]
        session: Option<String>,
    },

    /// Show one plan in detail, or list all plans
    Status {
        /// Plan ID or unique prefix
        plan_id: Option<String>,
    },

    /// Answer the checkpoint a plan is waiting on
    Respond {
        /// Plan ID or unique prefix
        plan_id: String,

        /// approve, revise or abort
        decision: Decision,

        /// Revision note (required for revise)
        #[arg(long, short = 't')]
        text: Option<String>,

        /// Request ID to answer (defaults to the open checkpoint)
        #[arg(long)]
        request: Option<String>,
    },

    /// Cancel a plan
    Cancel {
        /// Plan ID or unique prefix
        plan_id: String,
    },

    /// Re-register open checkpoints and report interrupted plans
    Recover,

    /// Continue a plan that was interrupted mid-step
    Resume {
        /// Plan ID or unique prefix
        plan_id: String,
    },

    /// Print the event log of a plan
    Events {
        /// Plan ID or unique prefix
        plan_id: String,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    agentflow::log::init_with_debug(cli.debug);

    if let Command::Init { force } = cli.command {
        return run_init(force);
    }

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    tracing::debug!(command = ?cli.command, "agentflow starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let executor = build_executor(&config)?;

        let result = match cli.command {
            Command::Init { .. } => Ok(()),
            Command::Submit { task, session } => run_submit(&executor, task, session).await,
            Command::Status { plan_id } => run_status(&executor, plan_id).await,
            Command::Respond {
                plan_id,
                decision,
                text,
                request,
            } => run_respond(&executor, plan_id, decision, text, request).await,
            Command::Cancel { plan_id } => run_cancel(&executor, plan_id).await,
            Command::Recover => run_recover(&executor).await,
            Command::Resume { plan_id } => run_resume(&executor, plan_id).await,
            Command::Events { plan_id, json } => run_events(&executor, &config, plan_id, json).await,
        };
        executor.shutdown().await;
        result
    })
}

fn build_executor(config: &Config) -> Result<WorkflowExecutor> {
    let agents = registry_from_config(config)?;
    let sequencer = KeywordSequenceProvider::from_config(config)?;
    let store = FileStore::new(config.plans_dir()?);
    let sink = JsonlSink::new(config.events_dir()?);
    Ok(WorkflowExecutor::new(
        Arc::new(agents),
        Arc::new(sequencer),
        Arc::new(store),
        Arc::new(sink),
        ExecutorConfig::from(&config.executor),
    ))
}

fn run_init(force: bool) -> Result<()> {
    let path = Config::config_path()?;
    if path.exists() && !force {
        println!("Config already exists at {} (use --force to overwrite)", path.display());
        return Ok(());
    }
    Config::default().save()?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn run_submit(executor: &WorkflowExecutor, task: String, session: Option<String>) -> Result<()> {
    let mut submission = TaskSubmission::new(task);
    if let Some(session) = session {
        let session_id: SessionId = session
            .parse()
            .map_err(|e| agentflow::Error::Validation(format!("Invalid session ID '{session}': {e}")))?;
        submission = submission.in_session(session_id);
    }

    let receipt = executor.submit(submission).await?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    if let Some(request) = executor.pending_request(receipt.plan_id).await? {
        println!();
        println!("Awaiting {} ({})", request.kind, request.request_id.short());
        println!("{}", serde_json::to_string_pretty(&request.presented_payload)?);
    }
    Ok(())
}

async fn run_status(executor: &WorkflowExecutor, plan_id: Option<String>) -> Result<()> {
    let Some(plan_id) = plan_id else {
        let plans = executor.plans().await?;
        if plans.is_empty() {
            println!("No plans");
            return Ok(());
        }
        println!("{:<10} {:<24} {:>7}  UPDATED", "PLAN", "STATUS", "VERSION");
        for plan in plans {
            println!(
                "{:<10} {:<24} {:>7}  {}",
                plan.plan_id.short(),
                plan.status.to_string(),
                plan.version,
                plan.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
        return Ok(());
    };

    let plan_id = parse_plan_id(executor, &plan_id).await?;
    let snapshot = executor.snapshot(plan_id).await?;
    let plan = &snapshot.plan;
    let context = &snapshot.context;

    println!();
    println!("  ID:          {}", plan.plan_id);
    println!("  Session:     {}", plan.session_id.short());
    println!("  Task:        {}", truncate_string(&plan.task_description, 60));
    println!("  Status:      {}", plan.status);
    if let Some(reason) = &plan.terminal_reason {
        println!("  Reason:      {}", reason);
    }
    println!("  Created:     {}", plan.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Updated:     {}", plan.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Sequence:    {}", context.agent_ids().join(" -> "));
    println!("  Step:        {}/{}", context.current_step_index.min(context.sequence.len()), context.sequence.len());
    println!(
        "  Revisions:   {} step, {} plan",
        context.revision_count, context.plan_revision_count
    );
    if context.restarts > 0 {
        println!("  Restarts:    {}", context.restarts);
    }
    println!();

    for entry in context.transcript() {
        match entry {
            TranscriptEntry::Record(record) => {
                let marker = if record.is_failure() { "!" } else { "*" };
                println!(
                    "  {} {} #{} (attempts: {}) {}",
                    marker,
                    record.agent_id,
                    record.iteration,
                    record.attempts,
                    truncate_string(&record.result_message.to_string(), 60)
                );
            }
            TranscriptEntry::Revision(revision) => {
                println!(
                    "  > {} revision: {}",
                    revision.agent_id.as_deref().unwrap_or("plan"),
                    truncate_string(&revision.text, 60)
                );
            }
        }
    }

    if let Some(request) = executor.pending_request(plan_id).await? {
        println!();
        println!("  Awaiting {} (request {})", request.kind, request.request_id);
        println!("{}", serde_json::to_string_pretty(&request.presented_payload)?);
    }
    Ok(())
}

async fn run_respond(
    executor: &WorkflowExecutor,
    plan_id: String,
    decision: Decision,
    text: Option<String>,
    request: Option<String>,
) -> Result<()> {
    let plan_id = parse_plan_id(executor, &plan_id).await?;
    // Each invocation is a fresh process; the checkpoint has to be made
    // answerable again before it can be responded to.
    executor.recover_plan(plan_id).await?;
    let request_id = match request {
        Some(id) => id
            .parse::<RequestId>()
            .map_err(|e| agentflow::Error::Validation(format!("Invalid request ID '{id}': {e}")))?,
        None => executor
            .pending_request(plan_id)
            .await?
            .map(|r| r.request_id)
            .ok_or_else(|| {
                agentflow::Error::Validation(format!("Plan {} has no open checkpoint", plan_id.short()))
            })?,
    };

    let response = ClarificationResponse {
        request_id,
        plan_id,
        decision,
        revision_text: text,
    };
    let ack = executor.respond(response).await?;
    println!("{}", serde_json::to_string_pretty(&ack)?);
    if !ack.is_accepted() {
        return Err(agentflow::Error::StaleCheckpoint { request_id });
    }

    if let Some(next) = executor.pending_request(plan_id).await? {
        println!();
        println!("Awaiting {} ({})", next.kind, next.request_id.short());
        println!("{}", serde_json::to_string_pretty(&next.presented_payload)?);
    }
    Ok(())
}

async fn run_cancel(executor: &WorkflowExecutor, plan_id: String) -> Result<()> {
    let plan_id = parse_plan_id(executor, &plan_id).await?;
    match executor.cancel(plan_id).await? {
        CancelOutcome::Rejected => println!("Plan {} cancelled", plan_id.short()),
        CancelOutcome::Signalled => {
            println!("Plan {} will be cancelled when its running step returns", plan_id.short())
        }
    }
    Ok(())
}

async fn run_recover(executor: &WorkflowExecutor) -> Result<()> {
    let report = executor.recover().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_resume(executor: &WorkflowExecutor, plan_id: String) -> Result<()> {
    let plan_id = parse_plan_id(executor, &plan_id).await?;
    let status = executor.resume(plan_id).await?;
    println!("Plan {} is {}", plan_id.short(), status);
    Ok(())
}

async fn run_events(executor: &WorkflowExecutor, config: &Config, plan_id: String, json: bool) -> Result<()> {
    let plan_id = parse_plan_id(executor, &plan_id).await?;
    let events = JsonlSink::read(&config.events_dir()?, plan_id).await?;
    for event in events {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        let detail = match &event.kind {
            EventKind::PlanCreated { task_description, .. } => truncate_string(task_description, 50),
            EventKind::PlanApprovalRequested { sequence, .. } => sequence.join(" -> "),
            EventKind::StepStarted {
                agent_id, iteration, ..
            } => format!("{agent_id} #{iteration}"),
            EventKind::StepStreaming { agent_id, chunk, .. } => {
                format!("{agent_id}: {}", truncate_string(chunk, 50))
            }
            EventKind::StepCompleted {
                agent_id, iteration, ..
            } => format!("{agent_id} #{iteration}"),
            EventKind::PostAgentReviewRequested {
                agent_id, error, ..
            } => match error {
                Some(failure) => format!("{agent_id} ({})", failure.kind),
                None => agent_id.clone(),
            },
            EventKind::PlanCompleted => String::new(),
            EventKind::PlanRejected { reason } | EventKind::PlanFailed { reason } => reason.clone(),
        };
        println!(
            "{:>4}  {}  {:<28} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S"),
            event.name(),
            detail
        );
    }
    Ok(())
}

/// Parse a full plan UUID or a unique prefix of one.
async fn parse_plan_id(executor: &WorkflowExecutor, id: &str) -> Result<PlanId> {
    if let Ok(plan_id) = id.parse::<PlanId>() {
        return Ok(plan_id);
    }

    let plans = executor.plans().await?;
    let matches: Vec<_> = plans
        .iter()
        .filter(|p| p.plan_id.to_string().starts_with(id))
        .collect();

    match matches.len() {
        0 => Err(agentflow::Error::Validation(format!("No plan matching '{}'", id))),
        1 => Ok(matches[0].plan_id),
        _ => Err(agentflow::Error::Validation(format!(
            "Ambiguous plan ID '{}' matches {} plans",
            id,
            matches.len()
        ))),
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
