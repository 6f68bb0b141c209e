use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use sluice_client::Client;
use sluice_core::model::{ExecutionStatus, NodeSpec, WorkflowDefinition};
use sluice_orchestrator::{Orchestrator, OrchestratorConfig};
use sluice_reaper::{Reaper, ReaperConfig};
use sluice_state::{
    DefinitionStore, DlqStore, MemoryDefinitionStore, MemoryDlqStore, MemoryStore,
    MemoryStoreConfig, StateStore,
};
use sluice_worker::{HandlerError, Worker, WorkerConfig, handler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Distributed DAG workflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file to completion with an embedded engine.
    Run(RunArgs),
    /// Validate a workflow file and print its topological order.
    Validate(ValidateArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    dag_file: PathBuf,
    /// Trigger parameters, exposed to templates as {{_params.key}}.
    #[arg(long)]
    params: Option<String>,
    #[arg(long, default_value_t = 2)]
    workers: usize,
    #[arg(long)]
    timeout_seconds: Option<f64>,
}

#[derive(Args)]
struct ValidateArgs {
    #[arg(long)]
    dag_file: PathBuf,
}

#[derive(serde::Deserialize)]
struct DagFile {
    name: String,
    nodes: Vec<DagFileNode>,
}

#[derive(serde::Deserialize)]
struct DagFileNode {
    id: String,
    handler: String,
    #[serde(default)]
    config: Value,
    #[serde(default)]
    dependencies: Vec<String>,
    condition: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::Validate(args) => validate_command(args).await,
    }
}

async fn load_definition(path: &PathBuf) -> Result<WorkflowDefinition> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let dag_file: DagFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse workflow file {}", path.display()))?;

    let nodes = dag_file
        .nodes
        .into_iter()
        .map(|node| NodeSpec {
            id: node.id,
            handler: node.handler,
            config: node.config,
            dependencies: node.dependencies,
            condition: node.condition,
        })
        .collect();
    Ok(WorkflowDefinition::new(&dag_file.name, nodes))
}

async fn validate_command(args: ValidateArgs) -> Result<()> {
    let definition = load_definition(&args.dag_file).await?;
    let graph = definition
        .validate()
        .map_err(|err| anyhow!("workflow is invalid: {err}"))?;

    println!("workflow {} is valid ({} nodes)", definition.name, graph.len());
    println!("topological order: {}", graph.topological_order().join(" -> "));
    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    let definition = load_definition(&args.dag_file).await?;
    let params = args
        .params
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("invalid --params JSON")?;

    let state = Arc::new(MemoryStore::with_config(MemoryStoreConfig::from_env()));
    let definitions = Arc::new(MemoryDefinitionStore::new());
    let dlq = Arc::new(MemoryDlqStore::new());
    let client = Client::new(
        Arc::clone(&state) as Arc<dyn StateStore>,
        Arc::clone(&definitions) as Arc<dyn DefinitionStore>,
    );

    let (shutdown_tx, _) = watch::channel(false);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&state) as Arc<dyn StateStore>,
        Arc::clone(&definitions) as Arc<dyn DefinitionStore>,
        OrchestratorConfig::from_env(),
    ));
    {
        let shutdown = shutdown_tx.subscribe();
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run(shutdown).await });
    }

    for _ in 0..args.workers.max(1) {
        let mut worker = Worker::new(
            Arc::clone(&state) as Arc<dyn StateStore>,
            Arc::clone(&definitions) as Arc<dyn DefinitionStore>,
            Arc::clone(&dlq) as Arc<dyn DlqStore>,
            WorkerConfig::from_env(),
        );
        register_builtin_handlers(&mut worker);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { worker.run(shutdown).await });
    }

    let reaper = Reaper::new(
        Arc::clone(&state) as Arc<dyn StateStore>,
        Arc::clone(&dlq) as Arc<dyn DlqStore>,
        ReaperConfig::from_env(),
    );
    {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { reaper.run(shutdown).await });
    }

    let execution_id = client.submit(&definition, args.timeout_seconds).await?;
    client.trigger(execution_id, params).await?;
    println!("execution {execution_id} started");

    let final_status = loop {
        let snapshot = client.status(execution_id).await?;
        if snapshot.status.is_terminal() {
            break snapshot.status;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    let snapshot = client.status(execution_id).await?;
    println!("{snapshot}");

    let outputs = client.outputs(execution_id).await?;
    if !outputs.is_empty() {
        println!("Outputs:");
        println!("{}", serde_json::to_string_pretty(&outputs)?);
    }

    let dead_letters = dlq.list(50).await?;
    if !dead_letters.is_empty() {
        println!("Dead-letter entries:");
        for entry in dead_letters {
            println!(
                "  {} node={} handler={} category={} retries={}",
                entry.entry_id,
                entry.node_id,
                entry.handler,
                entry.error.category.as_str(),
                entry.retry_count
            );
        }
    }

    let _ = shutdown_tx.send(true);

    match final_status {
        ExecutionStatus::Completed => Ok(()),
        other => Err(anyhow!("execution finished {}", other.as_str())),
    }
}

/// Demo handlers for embedded runs. Anything unregistered falls back to
/// echo so arbitrary workflow files still execute end to end.
fn register_builtin_handlers(worker: &mut Worker) {
    worker
        .registry_mut()
        .register("echo", handler(|config| async move { Ok(config) }));
    worker.registry_mut().register(
        "uppercase",
        handler(|config| async move {
            let text = config
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::Validation("missing string field: text".to_string()))?;
            Ok(serde_json::json!({"text": text.to_uppercase()}))
        }),
    );
    worker.registry_mut().register(
        "fail",
        handler(|_| async { Err(HandlerError::Failed("simulated handler failure".to_string())) }),
    );
    worker
        .registry_mut()
        .register_fallback(handler(|config| async move { Ok(config) }));
}
