// Copyright (c) 2026 Kestrel Contributors. MIT License.
// See LICENSE for details.

//! # Kestrel Node
//!
//! Entry point for the `kestrel-node` binary. Parses CLI arguments, sets up
//! logging, storage and the TCP transport, runs the node event loop, and
//! serves the control channel and the HTTP status/metrics endpoints.
//!
//! - `run`: start the node
//! - `init`: create the data directory and a node key
//! - `status`: query a running node over its control channel
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

use kestrel_protocol::config::{NodeConfig, PROTOCOL_VERSION};
use kestrel_protocol::control::{ControlClient, ControlRequest, ControlServer};
use kestrel_protocol::crypto::NodeKeypair;
use kestrel_protocol::network::Node;
use kestrel_protocol::storage::SledBlockStore;

use cli::{Commands, KestrelCli};
use logging::LogFormat;
use metrics::NodeMetrics;
use transport::TcpTransport;

const KEY_FILE: &str = "node.key";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KestrelCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Merge the config file (if any) with command-line overrides.
fn load_config(args: &cli::RunArgs) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => NodeConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };

    config.bootstrap.extend(args.bootstrap.iter().cloned());
    if args.mine {
        config.mining.enabled = true;
    }
    if let Some(advertise) = &args.advertise {
        config.listen_address = Some(advertise.clone());
        config.is_public = true;
    }
    config.control.listen_address = format!("127.0.0.1:{}", args.control_port);
    config.validate().context("invalid node configuration")?;
    Ok(config)
}

fn load_keypair(args: &cli::RunArgs) -> Result<NodeKeypair> {
    match &args.key {
        Some(hex) => NodeKeypair::from_hex(hex).context("invalid --key"),
        None => {
            let path = args.data_dir.join(KEY_FILE);
            NodeKeypair::load_or_generate(&path)
                .with_context(|| format!("failed to load node key from {}", path.display()))
        }
    }
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(logging::DEFAULT_FILTER, args.log_format)?;

    let config = load_config(&args)?;
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("failed to create data directory {}", args.data_dir.display()))?;
    let keypair = Arc::new(load_keypair(&args)?);
    let peer_id = keypair.peer_id();

    tracing::info!(
        peer = %peer_id,
        p2p_port = args.p2p_port,
        control_port = args.control_port,
        metrics_port = args.metrics_port,
        mining = config.mining.enabled,
        bootstrap = config.bootstrap.len(),
        data_dir = %args.data_dir.display(),
        "starting kestrel-node"
    );

    // --- Storage ---
    let chain_path = args.data_dir.join("chain");
    let store = Arc::new(
        SledBlockStore::open(&chain_path)
            .with_context(|| format!("failed to open chain database at {}", chain_path.display()))?,
    );

    // --- Transport ---
    let p2p_addr = format!("{}:{}", args.host, args.p2p_port);
    let (transport, transport_events) = TcpTransport::bind(peer_id.clone(), &p2p_addr)
        .await
        .with_context(|| format!("failed to bind p2p listener on {p2p_addr}"))?;

    // --- Node ---
    let control_config = config.control.clone();
    let node = Node::new(
        config,
        Arc::clone(&keypair),
        Arc::new(transport.clone()),
        transport_events,
        store,
    )
    .context("failed to build node")?;
    let (handle, mut node_task) = node.spawn();

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let metrics_feed = {
        let metrics = Arc::clone(&node_metrics);
        let mut snapshots = handle.watch();
        tokio::spawn(async move {
            loop {
                metrics.observe(&snapshots.borrow_and_update());
                if snapshots.changed().await.is_err() {
                    break;
                }
            }
        })
    };

    // --- Control channel ---
    let (stop_tx, stop_rx) = watch::channel(false);
    let control_task = if control_config.enabled {
        let server = ControlServer::bind(control_config, handle.clone())
            .await
            .context("failed to bind control channel")?;
        Some(tokio::spawn(server.run(stop_rx)))
    } else {
        None
    };

    // --- HTTP ---
    let router = api::create_router(api::AppState {
        version: format!("{} (protocol {PROTOCOL_VERSION})", env!("CARGO_PKG_VERSION")),
        started_at: chrono::Utc::now(),
        node: handle.clone(),
        metrics: Arc::clone(&node_metrics),
    });
    let http_addr = format!("0.0.0.0:{}", args.metrics_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("failed to bind http listener on {http_addr}"))?;
    tracing::info!(address = %http_addr, "status and metrics server listening");

    // --- Serve ---
    let mut node_done = false;
    tokio::select! {
        res = axum::serve(http_listener, router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "http server error");
            }
        }
        res = &mut node_task => {
            node_done = true;
            match res {
                Ok(Ok(())) => tracing::warn!("node loop exited"),
                Ok(Err(e)) => tracing::error!(error = %e, "node loop failed"),
                Err(e) => tracing::error!(error = %e, "node task panicked"),
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    handle.shutdown();
    let _ = stop_tx.send(true);
    if !node_done {
        match node_task.await {
            Ok(Err(e)) => tracing::error!(error = %e, "node stopped with an error"),
            Err(e) => tracing::error!(error = %e, "node task panicked"),
            Ok(Ok(())) => {}
        }
    }
    if let Some(task) = control_task {
        let _ = task.await;
    }
    metrics_feed.abort();
    transport.close();
    tracing::info!("kestrel-node stopped");
    Ok(())
}

/// Create the data directory and write a fresh node key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("kestrel_node=info", LogFormat::Pretty)?;

    let data_dir = &args.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite it", key_path.display());
    }
    let keypair = NodeKeypair::generate();
    keypair
        .store(&key_path)
        .with_context(|| format!("failed to write node key to {}", key_path.display()))?;
    tracing::info!(key_path = %key_path.display(), "node key generated");

    println!("Node initialized.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Node key       : {}", key_path.display());
    println!("  Peer id        : {}", keypair.peer_id());
    Ok(())
}

/// Print a running node's status as JSON.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let mut client = ControlClient::connect(&args.control)
        .await
        .with_context(|| format!("failed to reach the control channel at {}", args.control))?;
    let reply = client
        .request(ControlRequest::Status)
        .await
        .context("status request failed")?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

fn print_version() {
    println!("kestrel-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {PROTOCOL_VERSION}");
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
