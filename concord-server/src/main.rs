use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use concord_common::config::load_config;
use concord_common::logging::init_tracing;
use concord_common::metrics::InMemoryMetrics;
use concord_storage::raft::storage::NodeStorage;
use concord_storage::raft::transport::serve;
use concord_storage::{
    spawn_node, KeyValueStore, LockTable, RaftNode, RaftOptions, StateMachine, TcpTransport,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Runs one member of a concord cluster.
#[derive(Parser)]
#[command(name = "concord-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the cluster config (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Id of this node in the config
    #[arg(short, long)]
    node: String,

    /// State machine the cluster replicates
    #[arg(short, long, value_enum, default_value_t = Service::Kv)]
    service: Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Service {
    /// Key-value store
    Kv,
    /// Named locks
    Lock,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");
    let args = Args::parse();
    match args.service {
        Service::Kv => run(args, KeyValueStore::default()).await,
        Service::Lock => run(args, LockTable::default()).await,
    }
}

async fn run<S: StateMachine>(args: Args, state_machine: S) -> anyhow::Result<()> {
    let config = load_config(&args.config)
        .with_context(|| format!("loading cluster config from {}", args.config.display()))?;
    let address = config
        .address_of(&args.node)
        .with_context(|| format!("node {} is not in the cluster config", args.node))?
        .socket_addr();

    let data_dir = config.data_dir.join(&args.node);
    let storage = NodeStorage::open(&data_dir)
        .with_context(|| format!("opening storage under {}", data_dir.display()))?;

    let metrics = Arc::new(InMemoryMetrics::new());
    let node = RaftNode::new(
        args.node.clone(),
        config.node_ids(),
        storage,
        state_machine,
        RaftOptions::from(&config),
    )?
    .with_metrics(metrics.clone());

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {address}"))?;
    let transport = Arc::new(TcpTransport::new(&config));
    let (handle, driver) = spawn_node(node, transport, &config);
    let server = tokio::spawn(serve(listener, handle.clone()));

    info!(
        node = %args.node,
        service = ?args.service,
        %address,
        data_dir = %data_dir.display(),
        "node running"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    handle.shutdown().await;
    server.abort();
    let outcome = driver.await?;

    info!(
        elections = metrics.counter("elections_started"),
        applied = metrics.counter("entries_applied"),
        snapshots = metrics.counter("snapshots_taken"),
        "final counters"
    );
    if let Err(e) = outcome {
        error!(error = %e, "node stopped abnormally");
        return Err(e.into());
    }
    Ok(())
}
