mod config;

use clap::{Parser, Subcommand};
use config::SwitchyardConfig;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use switchyard_bus::MessageBus;
use switchyard_core::Capability;
use switchyard_orchestrator::{
    FileStateStore, HealthMonitor, Orchestrator, TaskOutcome, TaskRequest, WorkflowDefinition,
};
use switchyard_sandbox::SandboxExecutor;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard: multi-agent orchestration with a SQL sandbox")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one statement in the sandbox
    Query {
        sql: String,
        /// Keep the statement's effects
        #[arg(long)]
        commit: bool,
        /// JSON array of positional parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// Check whether a statement would be accepted
    Validate { sql: String },
    /// List tables and columns
    Schema,
    /// Apply a SQL file to the sandbox database
    Seed { file: PathBuf },
    /// Run a workflow definition (TOML or JSON)
    Workflow {
        file: PathBuf,
        /// Workflow input as JSON
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Show registered agents and system health
    Agents,
    /// List workflow executions known to this process (including recovered ones)
    Executions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let config = SwitchyardConfig::load(&cli.config).map_err(|e| {
        anyhow::anyhow!("Failed to load config '{}': {e}", cli.config.display())
    })?;

    let bus = MessageBus::new(config.bus.clone());
    let restored = bus.restore().await?;
    if restored > 0 {
        info!(restored, "Queued messages restored from snapshot");
    }
    bus.start()?;
    let orchestrator = match &config.state_dir {
        Some(dir) => {
            let store = Arc::new(FileStateStore::new(dir).await?);
            let orchestrator =
                Orchestrator::with_store(bus.clone(), config.orchestrator.clone(), store)?;
            let recovered = orchestrator.recover().await?;
            info!(recovered, state_dir = %dir.display(), "Persistent state loaded");
            orchestrator
        }
        None => Orchestrator::new(bus.clone(), config.orchestrator.clone())?,
    };

    let sandbox = Arc::new(SandboxExecutor::open(&config.sandbox)?);
    let registered =
        switchyard_builtins::register_builtins(&orchestrator, Arc::clone(&sandbox)).await?;
    info!(count = registered.len(), "Built-in agents registered");

    let monitor = Arc::new(HealthMonitor::new(
        orchestrator.clone(),
        config.health.clone(),
    )?);
    let monitor_task = Arc::clone(&monitor).start();

    let result = run(cli.command, &orchestrator, &sandbox).await;

    monitor.stop();
    let _ = monitor_task.await;
    orchestrator.shutdown().await;
    sandbox.flush_audit().await;
    bus.stop().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    command: Commands,
    orchestrator: &Orchestrator,
    sandbox: &SandboxExecutor,
) -> anyhow::Result<Value> {
    match command {
        Commands::Query {
            sql,
            commit,
            params,
        } => {
            let params: Value = match params {
                Some(raw) => serde_json::from_str(&raw)?,
                None => json!([]),
            };
            let outcome = orchestrator
                .submit(TaskRequest::Capability {
                    capability: Capability::ExecuteQuery,
                    payload: json!({"sql": sql, "params": params, "commit": commit}),
                })
                .await;
            Ok(serde_json::to_value(outcome)?)
        }
        Commands::Validate { sql } => {
            let outcome = orchestrator
                .submit(TaskRequest::Capability {
                    capability: Capability::ValidateSyntax,
                    payload: json!({ "sql": sql }),
                })
                .await;
            Ok(serde_json::to_value(outcome)?)
        }
        Commands::Schema => {
            let outcome = orchestrator
                .submit(TaskRequest::Capability {
                    capability: Capability::IntrospectSchema,
                    payload: json!({}),
                })
                .await;
            Ok(serde_json::to_value(outcome)?)
        }
        Commands::Seed { file } => {
            let sql = tokio::fs::read_to_string(&file).await.map_err(|e| {
                anyhow::anyhow!("Failed to read seed file '{}': {e}", file.display())
            })?;
            sandbox.seed(&sql).await?;
            Ok(json!({"seeded": file.display().to_string()}))
        }
        Commands::Workflow { file, input } => {
            let definition = read_workflow(&file).await?;
            let input: Value = serde_json::from_str(&input)?;
            let outcome = orchestrator
                .submit(TaskRequest::Workflow { definition, input })
                .await;
            let execution = match outcome {
                TaskOutcome::Pending(id) => orchestrator.workflows().wait(id).await?,
                other => return Ok(serde_json::to_value(other)?),
            };
            Ok(serde_json::to_value(execution)?)
        }
        Commands::Agents => Ok(json!({
            "agents": orchestrator.descriptors().await,
            "health": orchestrator.health().await,
        })),
        Commands::Executions => Ok(serde_json::to_value(orchestrator.workflows().executions())?),
    }
}

async fn read_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read workflow '{}': {e}", path.display())
    })?;
    let definition = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)?,
        _ => toml::from_str(&text)?,
    };
    Ok(definition)
}
