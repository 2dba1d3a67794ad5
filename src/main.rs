#![forbid(unsafe_code)]

//! `flowstate`: inspect checkpoint databases and run the echo demo.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use flowstate::demo::{self, EchoInitiator};
use flowstate::flow::FlowRegistry;
use flowstate::models::flow::{FlowOutcome, InvocationContext};
use flowstate::models::session::Party;
use flowstate::persistence::{db, CheckpointStore, SqliteCheckpointStore};
use flowstate::transport::InMemoryNetwork;
use flowstate::{AppError, FlowNode, NodeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "flowstate", about = "Durable flow state machine engine", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the checkpoints stored in a node's database.
    Status {
        /// Database to inspect instead of the configured `db_path`.
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Run the echo protocol between two in-process nodes.
    Demo {
        /// Text the initiator sends.
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => Some(NodeConfig::load_from_path(path)?),
        None => None,
    };

    match args.command {
        Command::Status { db } => {
            let path = db
                .or_else(|| config.map(|config| config.db_path))
                .ok_or_else(|| AppError::Config("status needs --config or --db".into()))?;
            status(path).await
        }
        Command::Demo { message } => run_demo(message).await,
    }
}

async fn status(path: PathBuf) -> Result<()> {
    if !path.exists() {
        return Err(AppError::NotFound(format!("no database at {}", path.display())));
    }
    let pool = Arc::new(db::connect(&path).await?);
    let store = SqliteCheckpointStore::new(pool);
    let checkpoints = store.list_all().await?;
    let parked = store.list_parked().await?;
    info!(path = %path.display(), checkpoints = checkpoints.len(), parked = parked.len(), "checkpoint database opened");

    println!("{:<36}  {:<28}  {:<12}  {:>8}  updated", "flow", "type", "status", "sequence");
    for checkpoint in &checkpoints {
        println!(
            "{:<36}  {:<28}  {:<12}  {:>8}  {}",
            checkpoint.flow_id,
            checkpoint.flow_type.to_string(),
            checkpoint.status.as_str(),
            checkpoint.sequence,
            checkpoint.updated_at.to_rfc3339(),
        );
        if let Some(reason) = checkpoint.hospital_reason() {
            println!("    hospitalized: {reason}");
        }
    }
    for initiation in &parked {
        println!(
            "parked initiation {} from {}: {}",
            initiation.id, initiation.sender, initiation.reason
        );
    }
    Ok(())
}

async fn run_demo(message: String) -> Result<()> {
    let network = InMemoryNetwork::new();
    let alice = start_demo_node("alice", &network).await?;
    let bob = start_demo_node("bob", &network).await?;

    let manager = alice.manager().clone();
    let flow_id = manager
        .start_flow(
            EchoInitiator::new(Party::new("bob"), message),
            InvocationContext::client("demo"),
        )
        .await?;
    let outcome = manager.wait_for_outcome(flow_id).await;

    alice.shutdown().await;
    bob.shutdown().await;

    match outcome? {
        FlowOutcome::Completed { result } => {
            let reply = result.as_text().unwrap_or_default();
            info!(%flow_id, reply, "echo flow completed");
            println!("{reply}");
            Ok(())
        }
        FlowOutcome::Failed { error } => Err(error.into()),
        FlowOutcome::Hospitalized { reason } => Err(AppError::Hospitalization(reason)),
    }
}

async fn start_demo_node(name: &str, network: &InMemoryNetwork) -> Result<FlowNode> {
    let config = NodeConfig::for_node(name)?;
    let store = Arc::new(SqliteCheckpointStore::new(Arc::new(db::connect_memory().await?)));
    let registry = Arc::new(FlowRegistry::new());
    demo::register(&registry).await;
    let (transport, inbound) = network.attach(config.party()).await;
    FlowNode::start(config, store, transport, inbound, registry).await
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
