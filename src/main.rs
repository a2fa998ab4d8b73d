mod echo;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use swarmflow_core::config::{AppConfig, BackendKind};
use swarmflow_core::permission::ApprovalDecision;
use swarmflow_core::spec::WorkflowSpec;
use swarmflow_core::types::{ResumeAction, RunEvent, RunId, RunStatus, TraceKind};
use swarmflow_engine::{HandlerRegistry, WorkflowRuntime};
use swarmflow_graph::GraphBuilder;
use swarmflow_store::{CheckpointManager, SqliteBackend};

use crate::echo::{EchoHandler, EchoInvoker};

#[derive(Parser)]
#[command(name = "swarmflow", version, about = "Graph-compiled multi-agent workflow engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "swarmflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow spec and print its compiled graph
    Validate {
        /// Spec file (.json or .toml)
        spec: PathBuf,
        /// Print the compiled graph as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a spec with echo participants
    Run {
        spec: PathBuf,
        /// Approve every capability request and gate without asking
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Rebuild a run from its checkpoints and finish it
    Recover {
        run_id: String,
        spec: PathBuf,
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// List the checkpoints of a run
    Checkpoints { run_id: String },
    /// Field-level changes between two checkpoints
    Diff { run_id: String, from: u64, to: u64 },
    /// Print the newest JSONL trace of a run
    Trace { run_id: String },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("swarmflow=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "swarmflow", &mut std::io::stdout());
        }
        Commands::Validate { spec, json } => validate(&spec, json)?,
        Commands::Config => {
            let config = load_config(&config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run { spec, yes } => {
            let config = load_config(&config_path)?;
            let spec = WorkflowSpec::load(&spec)?;
            let runtime = Arc::new(build_runtime(&config, &spec)?);
            let id = runtime.submit_spec(spec).await?;
            println!("run {}", id);
            execute(runtime, id, yes).await?;
        }
        Commands::Recover { run_id, spec, yes } => {
            let config = load_config(&config_path)?;
            let spec = WorkflowSpec::load(&spec)?;
            let runtime = Arc::new(build_runtime(&config, &spec)?);
            let id = RunId::from_string(&run_id);
            let status = runtime.recover(&id, spec).await?;
            println!("run {} recovered ({})", id, status);
            if status == RunStatus::Ready {
                execute(runtime, id, yes).await?;
            }
        }
        Commands::Checkpoints { run_id } => {
            let manager = open_checkpoints(&load_config(&config_path)?)?;
            let list = manager.list(&RunId::from_string(&run_id))?;
            if list.is_empty() {
                bail!("no checkpoints for run {}", run_id);
            }
            for meta in list {
                println!(
                    "#{:<4} {}  graph {}  schema {}{}",
                    meta.sequence,
                    meta.timestamp
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "-".into()),
                    meta.graph_id
                        .as_deref()
                        .map(|g| &g[..g.len().min(12)])
                        .unwrap_or("-"),
                    meta.schema_version
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "-".into()),
                    if meta.intact { "" } else { "  CORRUPT" },
                );
            }
        }
        Commands::Diff { run_id, from, to } => {
            let manager = open_checkpoints(&load_config(&config_path)?)?;
            let changes = manager.diff(&RunId::from_string(&run_id), from, to)?;
            if changes.is_empty() {
                println!("no changes between #{} and #{}", from, to);
            }
            for change in changes {
                match (change.before, change.after) {
                    (None, Some(after)) => println!("+ {} = {}", change.path, after),
                    (Some(before), None) => println!("- {} = {}", change.path, before),
                    (Some(before), Some(after)) => {
                        println!("~ {}: {} -> {}", change.path, before, after)
                    }
                    (None, None) => {}
                }
            }
        }
        Commands::Trace { run_id } => {
            let dir = load_config(&config_path)?.log_dir().join(&run_id);
            let path = newest_log(&dir)?;
            print!("{}", std::fs::read_to_string(&path)?);
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    let home_config = dirs_home().map(|h| h.join(".swarmflow").join("config.toml"));
    match home_config {
        Some(ref path) if path.exists() => {
            info!(path = %path.display(), "Loading config from home directory");
            Ok(AppConfig::load(path)?)
        }
        _ => {
            warn!(path = %path.display(), "No config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn validate(path: &Path, as_json: bool) -> anyhow::Result<()> {
    let spec = WorkflowSpec::load(path)?;
    let graph = GraphBuilder::compile(&spec)
        .with_context(|| format!("{} does not compile", path.display()))?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
        return Ok(());
    }
    println!(
        "{} (revision {}) → graph {}",
        graph.name,
        graph.revision,
        graph.short_id()
    );
    println!("entry: {}", graph.entry);
    println!("steps:");
    for step in &graph.steps {
        match &step.participant {
            Some(p) if p != &step.id => println!("  {:<24} {} [{}]", step.id, step.kind, p),
            _ => println!("  {:<24} {}", step.id, step.kind),
        }
    }
    println!("edges:");
    for edge in &graph.edges {
        println!("  {} -> {}  {:?}", edge.from, edge.to, edge.guard);
    }
    Ok(())
}

/// One echo handler per participant, carrying its declared capabilities.
fn build_runtime(config: &AppConfig, spec: &WorkflowSpec) -> anyhow::Result<WorkflowRuntime> {
    let mut handlers = HandlerRegistry::new();
    for participant in &spec.participants {
        handlers.register(
            participant.id.clone(),
            Arc::new(EchoHandler::new(participant.capabilities.clone())),
        );
    }
    Ok(WorkflowRuntime::from_config(
        config,
        handlers,
        Arc::new(EchoInvoker),
    )?)
}

fn open_checkpoints(config: &AppConfig) -> anyhow::Result<CheckpointManager> {
    if config.checkpoint.backend == BackendKind::Memory {
        bail!("the memory checkpoint backend keeps nothing between invocations");
    }
    let path = config.checkpoint_path();
    if !path.exists() {
        bail!("checkpoint database not found: {}", path.display());
    }
    Ok(CheckpointManager::new(Arc::new(SqliteBackend::open(&path)?)))
}

fn newest_log(dir: &Path) -> anyhow::Result<PathBuf> {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("no trace logs in {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|x| x == "jsonl"))
        .collect();
    logs.sort();
    logs.pop()
        .with_context(|| format!("no trace logs in {}", dir.display()))
}

/// Drive a run to a terminal status, answering approvals and gates on the
/// terminal (or automatically with `--yes`).
async fn execute(runtime: Arc<WorkflowRuntime>, id: RunId, yes: bool) -> anyhow::Result<()> {
    let mut rx = runtime.subscribe();
    let printer_runtime = runtime.clone();
    let printer_id = id.clone();
    let printer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            if event.run_id().is_some_and(|r| r != &printer_id) {
                continue;
            }
            match event {
                RunEvent::Trace(record) => match record.kind {
                    TraceKind::StepCompleted { step, outcome } => {
                        eprintln!("[step] {} ({:?})", step, outcome)
                    }
                    TraceKind::StepRetried { step, attempt, error, .. } => {
                        eprintln!("[retry] {} attempt {}: {}", step, attempt + 1, error)
                    }
                    TraceKind::PermissionDenied { participant, capability } => {
                        eprintln!("[denied] {} → {}", participant, capability)
                    }
                    TraceKind::HotSwapApplied { to_graph, remap, .. } => {
                        eprintln!("[swap] now on {} ({:?})", &to_graph[..to_graph.len().min(12)], remap)
                    }
                    _ => {}
                },
                RunEvent::ApprovalRequested { request } => {
                    eprintln!(
                        "\n[APPROVAL] {} wants {}: \"{}\"",
                        request.participant, request.capability, request.params_summary
                    );
                    let approved = yes || confirm("Allow?").await;
                    let decision = if approved {
                        ApprovalDecision::Approved
                    } else {
                        ApprovalDecision::Denied {
                            reason: "denied by user".into(),
                        }
                    };
                    printer_runtime.respond_approval(&request.id, decision).await;
                }
                RunEvent::StatusChanged { to, .. } if to.is_terminal() => break,
                _ => {}
            }
        }
    });

    let status = loop {
        let status = runtime.drive(&id).await?;
        match status {
            RunStatus::AwaitingInterrupt | RunStatus::Paused => {
                let cursor = runtime.state(&id).await?.control.cursor.unwrap_or_default();
                eprintln!("\n[{}] at {}", status, cursor);
                let action = if yes || confirm("Continue?").await {
                    ResumeAction::Continue
                } else {
                    ResumeAction::Abort {
                        reason: "stopped by user".into(),
                    }
                };
                runtime.resume(&id, action).await?;
                let now = runtime.status(&id).await?;
                if now.is_terminal() {
                    break now;
                }
            }
            terminal => break terminal,
        }
    };
    printer.await.ok();

    match status {
        RunStatus::Completed => {
            let state = runtime.state(&id).await?;
            println!(
                "run {} completed: {} steps, {} messages, {} checkpoints",
                id,
                state.completed_steps.values().sum::<u32>(),
                state.messages.len(),
                runtime.list_checkpoints(&id)?.len()
            );
            Ok(())
        }
        other => bail!(
            "run {} ended {}: {}",
            id,
            other,
            runtime.failure(&id).await?.unwrap_or_default()
        ),
    }
}

async fn confirm(prompt: &'static str) -> bool {
    tokio::task::spawn_blocking(move || {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
