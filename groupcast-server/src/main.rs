//! Groupcast daemon.
//!
//! Runs one engine node on a current-thread runtime. Bootstrap a new group
//! on one node with `--bootstrap`, then join the others with `--seed`
//! pointing at any running member. Lines read from stdin are submitted as
//! ordered payloads and every delivery is logged.

use std::rc::Rc;

use bytes::Bytes;
use clap::Parser;
use error_stack::{Report, ResultExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use groupcast_core::error::{OperationContext, WireError, WireResult};
use groupcast_core::{Cargo, GroupId, NodeAddress};
use groupcast_engine::{Engine, config::EngineConfig};
use groupcast_server::app::LogApplication;
use groupcast_server::metrics::{MetricsEncoder, serve_metrics};
use groupcast_server::transport::TcpTransport;

/// Run a groupcast total-order broadcast node
#[derive(Parser, Debug)]
#[command(name = "groupcast")]
#[command(about = "Run a groupcast total-order broadcast node")]
struct Args {
    /// Bind address for the transport listener
    #[arg(short, long, default_value = "0.0.0.0:7100")]
    bind: String,

    /// Address peers use to reach this node (defaults to --bind)
    #[arg(long)]
    advertise: Option<String>,

    /// Group id; all members must agree
    #[arg(short, long, default_value_t = 1)]
    group: u32,

    /// Stable node identity; defaults to the advertised address
    #[arg(long)]
    name: Option<String>,

    /// Initial member as ADDR=NAME; repeat for the whole group.
    /// Required with --bootstrap
    #[arg(long = "member", value_name = "ADDR=NAME")]
    members: Vec<String>,

    /// Bootstrap a brand new group from --member entries
    #[arg(long)]
    bootstrap: bool,

    /// Join an existing group via this member (ADDR=NAME); repeatable
    #[arg(long = "seed", value_name = "ADDR=NAME")]
    seeds: Vec<String>,

    /// Serve Prometheus metrics text on this address
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Slot cache limit in bytes
    #[arg(long)]
    cache_limit: Option<u64>,

    /// Read payload lines from stdin and submit them in order
    #[arg(long)]
    stdin: bool,
}

fn parse_member(s: &str) -> WireResult<NodeAddress> {
    let (addr, name) = s
        .split_once('=')
        .ok_or_else(|| Report::new(WireError::Connect(format!("bad member spec: {s}"))))?;
    Ok(NodeAddress::new(addr, name.as_bytes().to_vec()))
}

fn main() -> WireResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .change_context(WireError::Connect("runtime".into()))?;
    let local = tokio::task::LocalSet::new();
    runtime.block_on(local.run_until(run(args)))
}

async fn run(args: Args) -> WireResult<()> {
    let advertise = args.advertise.clone().unwrap_or_else(|| args.bind.clone());
    let my_uuid = args
        .name
        .clone()
        .unwrap_or_else(|| advertise.clone())
        .into_bytes();
    let group = GroupId(args.group);

    let members: Vec<NodeAddress> = args
        .members
        .iter()
        .map(|m| parse_member(m))
        .collect::<Result<_, _>>()
        .attach(OperationContext::BOOTING)?;
    let seeds: Vec<NodeAddress> = args
        .seeds
        .iter()
        .map(|m| parse_member(m))
        .collect::<Result<_, _>>()
        .attach(OperationContext::CONNECTING)?;

    if args.bootstrap && members.is_empty() {
        return Err(Report::new(WireError::Connect(
            "--bootstrap requires --member entries".into(),
        )));
    }

    let metrics = Rc::new(MetricsEncoder::new());
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let transport = TcpTransport::new(
        advertise.clone(),
        group,
        inbound_tx,
        metrics.clone(),
    );
    let app = Rc::new(LogApplication::new(metrics.clone()));

    let mut cfg = EngineConfig::default();
    if let Some(limit) = args.cache_limit {
        cfg.cache_limit = limit;
    }

    let engine = Engine::new(
        cfg,
        group,
        my_uuid,
        transport.clone(),
        app.clone(),
        inbound_rx,
    );
    let handle = engine.handle();

    let listener = TcpListener::bind(&args.bind)
        .await
        .change_context(WireError::Connect(format!("bind {}", args.bind)))
        .attach(OperationContext::CONNECTING)?;
    tokio::task::spawn_local(transport.clone().listen(listener));

    if let Some(metrics_bind) = &args.metrics_bind {
        let listener = TcpListener::bind(metrics_bind)
            .await
            .change_context(WireError::Connect(format!("bind {metrics_bind}")))?;
        tokio::task::spawn_local(serve_metrics(listener, metrics.clone()));
        info!(addr = %metrics_bind, "metrics listener up");
    }

    // Warm up outbound connections so the first round does not pay the
    // dial latency.
    for node in members.iter().chain(seeds.iter()) {
        transport.connect_peer(&node.address);
    }

    if args.bootstrap {
        let handle = handle.clone();
        let members = members.clone();
        tokio::task::spawn_local(async move {
            match handle.bootstrap(members).await {
                Ok(reply) => info!(?reply.code, "group bootstrapped"),
                Err(e) => error!(error = %e, "bootstrap failed"),
            }
        });
    } else if !seeds.is_empty() {
        handle
            .join(seeds)
            .map_err(|e| Report::new(WireError::Connect(e.to_string())))?;
        info!("joining existing group");
    } else {
        info!("idle until booted over the network");
    }

    if args.stdin {
        let handle = handle.clone();
        tokio::task::spawn_local(async move {
            use tokio::io::{AsyncBufReadExt, BufReader};
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                match handle.submit(Cargo::App(Bytes::from(line.into_bytes()))).await {
                    Ok(reply) => info!(?reply.code, "payload ordered"),
                    Err(e) => {
                        warn!(error = %e, "engine gone, stopping stdin reader");
                        return;
                    }
                }
            }
        });
    }

    {
        let handle = handle.clone();
        tokio::task::spawn_local(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c, shutting down");
                let _ = handle.submit(Cargo::Exit).await;
            }
        });
    }

    engine.run().await;
    info!(delivered = app.delivered_count(), "node stopped");
    Ok(())
}
