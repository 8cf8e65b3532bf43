//! # CLI Interface
//!
//! Defines the command-line argument structure for `murmur-node` using
//! `clap` derive. The surface is a flat flag set — the binary does one
//! thing (run a node), so there are no subcommands. A parse failure exits
//! non-zero before anything binds or logs.

use clap::Parser;
use std::path::PathBuf;

use murmur_protocol::config::{
    DEFAULT_IDS_MAX_IHAVE, DEFAULT_PULL_INTERVAL_S, DISCOVERY_INTERVAL_S,
};
use murmur_protocol::RuntimeConfig;

/// Murmur rumor-dissemination node.
///
/// One process per participant. Joins the network through the bootstrap
/// peer, probes its neighbors for liveness, floods rumors with bounded
/// random forwarding, and repairs missed rumors with periodic pulls.
#[derive(Parser, Debug)]
#[command(name = "murmur-node", about = "Murmur rumor-dissemination node", version)]
pub struct NodeCli {
    /// UDP port to bind on loopback.
    #[arg(long)]
    pub port: u16,

    /// Bootstrap peer address. Pass this node's own address to make it
    /// the network seed.
    #[arg(long, value_name = "IP:PORT")]
    pub bootstrap: String,

    /// Number of peers each new rumor is forwarded to.
    #[arg(long)]
    pub fanout: usize,

    /// Initial hop budget on originated rumors.
    #[arg(long)]
    pub ttl: i64,

    /// Peer table capacity.
    #[arg(long)]
    pub peer_limit: usize,

    /// Seconds between liveness probe rounds.
    #[arg(long, value_name = "SECONDS")]
    pub ping_interval: f64,

    /// Seconds of silence after which a peer is evicted.
    #[arg(long, value_name = "SECONDS")]
    pub peer_timeout: f64,

    /// RNG seed for reproducible runs.
    #[arg(long)]
    pub seed: u64,

    /// Seconds between IHAVE advertisement rounds.
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_PULL_INTERVAL_S)]
    pub pull_interval: f64,

    /// Maximum message ids carried in one IHAVE.
    #[arg(long, default_value_t = DEFAULT_IDS_MAX_IHAVE)]
    pub ids_max_ihave: usize,

    /// Required leading hex zeros on the HELLO proof-of-work. 0 disables.
    #[arg(long, default_value_t = 0)]
    pub k_pow: u32,

    /// Directory for the JSONL event log. Omit to disable event logging.
    #[arg(long, value_name = "PATH")]
    pub log_dir: Option<PathBuf>,
}

impl NodeCli {
    /// Assembles the runtime configuration from the parsed flags.
    pub fn into_config(self) -> RuntimeConfig {
        RuntimeConfig {
            port: self.port,
            bootstrap_addr: self.bootstrap,
            fanout: self.fanout,
            ttl: self.ttl,
            peer_limit: self.peer_limit,
            ping_interval_s: self.ping_interval,
            peer_timeout_s: self.peer_timeout,
            pull_interval_s: self.pull_interval,
            ids_max_ihave: self.ids_max_ihave,
            k_pow: self.k_pow,
            discovery_interval_s: DISCOVERY_INTERVAL_S,
            seed: self.seed,
            log_dir: self.log_dir,
        }
    }
}
