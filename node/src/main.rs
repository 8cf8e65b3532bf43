// Copyright (c) 2026 Murmur Contributors. MIT License.
// See LICENSE for details.

//! # Murmur Node
//!
//! Entry point for the `murmur-node` binary. Parses CLI arguments,
//! initializes logging, binds the runtime, and wires the two external
//! inputs: stdin lines become rumor originations, SIGINT becomes a clean
//! shutdown.
//!
//! Exit code 0 on clean shutdown; non-zero only when argument parsing or
//! the socket bind fails. Once the loops are running, nothing exits the
//! process except the operator.

mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use murmur_protocol::NodeRuntime;

use cli::NodeCli;
use logging::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = NodeCli::parse();

    logging::init_logging("murmur_node=info,murmur_protocol=info", LogFormat::Pretty);

    let config = cli.into_config();
    tracing::info!(
        port = config.port,
        bootstrap = %config.bootstrap_addr,
        fanout = config.fanout,
        ttl = config.ttl,
        peer_limit = config.peer_limit,
        seed = config.seed,
        k_pow = config.k_pow,
        "starting murmur-node"
    );

    // The only fatal path: a bind or sink failure ends the process here,
    // before any loop starts.
    let runtime = Arc::new(
        NodeRuntime::bind(config)
            .await
            .context("node startup failed")?,
    );

    runtime.start().await;
    print_banner(&runtime);

    // Stdin origination: every non-empty line becomes one rumor. EOF just
    // ends origination — the node keeps relaying until SIGINT.
    let stdin_runtime = Arc::clone(&runtime);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            stdin_runtime.originate(&line).await;
        }
        tracing::info!("stdin closed, origination disabled");
    });

    signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    runtime.shutdown().await;
    println!("murmur-node stopped.");
    Ok(())
}

/// Human-readable startup summary. Nothing parses this.
fn print_banner(runtime: &NodeRuntime) {
    let ident = runtime.identity();
    let cfg = runtime.config();
    println!("murmur-node");
    println!("  node id    : {}", ident.node_id);
    println!("  listening  : {}", ident.addr);
    println!("  bootstrap  : {}", cfg.bootstrap_addr);
    println!(
        "  gossip     : fanout={} ttl={} peer_limit={}",
        cfg.fanout, cfg.ttl, cfg.peer_limit
    );
    println!(
        "  liveness   : ping={}s timeout={}s",
        cfg.ping_interval_s, cfg.peer_timeout_s
    );
    println!(
        "  pull       : interval={}s max_ids={}",
        cfg.pull_interval_s, cfg.ids_max_ihave
    );
    if cfg.k_pow > 0 {
        println!("  pow        : k={}", cfg.k_pow);
    }
    match runtime.event_log_path() {
        Some(path) => println!("  event log  : {}", path.display()),
        None => println!("  event log  : disabled"),
    }
    println!("type a line and press enter to originate a rumor.");
}
