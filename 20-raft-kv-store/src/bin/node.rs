//! Runs one node of the replicated key-value store.
//!
//! Start a cluster of three on one machine:
//! ```bash
//! cargo run --bin node -- --id node1 ~/node1
//! cargo run --bin node -- --id node2 --haddr localhost:13001 --raddr localhost:14001 \
//!   --join localhost:13000 ~/node2
//! cargo run --bin node -- --id node3 --haddr localhost:13002 --raddr localhost:14002 \
//!   --join localhost:13000 ~/node3
//! ```
//!
//! Then talk to the leader over HTTP:
//! ```bash
//! curl -XPOST localhost:13000/store -d '{"user1": "batman"}' -H 'content-type: application/json'
//! curl localhost:13000/store/user1
//! curl localhost:13000/status
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueHint};
use tokio::net::TcpListener;
use tracing::{error, info};

use raft_kv_store::config::{
    EngineConfig, StoreConfig, DEFAULT_HTTP_ADDR, DEFAULT_RAFT_ADDR, DEFAULT_SNAPSHOT_THRESHOLD,
};
use raft_kv_store::engine::spawn_engine;
use raft_kv_store::fsm::StateMachine;
use raft_kv_store::http::{router, JoinRequest};
use raft_kv_store::kv::Store;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value store node")]
struct Args {
    /// Raft bind address
    #[arg(short = 'r', long, default_value = DEFAULT_RAFT_ADDR, value_hint = ValueHint::Hostname)]
    raddr: String,

    /// HTTP bind address
    #[arg(long, default_value = DEFAULT_HTTP_ADDR, value_hint = ValueHint::Hostname)]
    haddr: String,

    /// HTTP address of a node to join; without it this node starts a new cluster
    #[arg(short = 'j', long, value_hint = ValueHint::Hostname)]
    join: Option<String>,

    /// Node id; defaults to the Raft bind address
    #[arg(long)]
    id: Option<String>,

    /// How long writes and membership changes wait for commit
    #[arg(long, default_value_t = 10_000)]
    apply_timeout_ms: u64,

    /// Applied entries between snapshots and log compactions (0 disables them)
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_THRESHOLD)]
    snapshot_threshold: u64,

    /// Directory for the raft log and snapshot files. A node restarted on
    /// the same directory resumes its place in the cluster
    #[arg(value_hint = ValueHint::DirPath)]
    raft_dir: PathBuf,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    std::fs::create_dir_all(&args.raft_dir)
        .with_context(|| format!("failed to create raft dir {}", args.raft_dir.display()))?;

    let node_id = args.id.clone().unwrap_or_else(|| args.raddr.clone());
    let engine_config = EngineConfig::new(&node_id, &args.raddr)
        .with_bootstrap(args.join.is_none())
        .with_data_dir(&args.raft_dir)
        .with_snapshot_threshold(args.snapshot_threshold);

    let fsm = StateMachine::new();
    let (engine, fatal_rx) = spawn_engine(engine_config, fsm.clone())?;
    let raft_addr = engine.local_addr().to_string();
    let store_config = StoreConfig::new(engine.local_addr())
        .with_apply_timeout(Duration::from_millis(args.apply_timeout_ms));
    let store = Arc::new(Store::new(
        Arc::clone(fsm.state()),
        Arc::new(engine),
        store_config,
    ));

    let listener = TcpListener::bind(&args.haddr)
        .await
        .with_context(|| format!("failed to bind http address {}", args.haddr))?;
    info!(addr = %listener.local_addr()?, node_id = %node_id, "http server listening");
    let server = tokio::spawn(async move { axum::serve(listener, router(store)).await });

    if let Some(join_addr) = &args.join {
        join_cluster(join_addr, &node_id, &raft_addr).await?;
    }

    let fatal = tokio::task::spawn_blocking(move || fatal_rx.recv());
    tokio::select! {
        result = server => {
            result.context("http server task failed")?.context("http server failed")?;
        }
        halted = fatal => {
            return match halted.context("fatal watcher failed")? {
                Ok(err) => {
                    error!(error = %format!("{err:#}"), "node halted");
                    Err(err.context("node halted"))
                }
                Err(_) => Err(anyhow!("raft worker stopped")),
            };
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

/// Asks the node serving HTTP at `join_addr` to add this node as a voter.
async fn join_cluster(join_addr: &str, node_id: &str, raft_addr: &str) -> Result<()> {
    let request = JoinRequest {
        id: node_id.to_string(),
        addr: raft_addr.to_string(),
    };
    let response = reqwest::Client::new()
        .post(format!("http://{join_addr}/join"))
        .json(&request)
        .send()
        .await
        .with_context(|| format!("failed to reach {join_addr}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("join via {join_addr} failed with {status}: {body}");
    }
    info!(join_addr, node_id, raft_addr, "joined cluster");
    Ok(())
}
