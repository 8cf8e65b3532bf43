//! # Protocol Configuration & Constants
//!
//! Every magic number in murmur lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong.
//!
//! The constants define the wire contract between nodes; [`RuntimeConfig`]
//! carries the per-process knobs the CLI hands to the runtime. Changing a
//! constant changes what counts as a valid datagram, so treat this file as
//! part of the protocol, not as tuning.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Wire Protocol
// ---------------------------------------------------------------------------

/// Envelope `version` field. There is exactly one wire version; anything
/// else is rejected at the decode boundary with `unsupported_version`.
pub const WIRE_VERSION: u64 = 1;

/// Target upper bound for a serialized datagram, in bytes. UDP handles
/// larger payloads via IP fragmentation, but fragmented datagrams die on
/// lossy paths, so senders keep envelopes under this budget.
pub const MAX_DATAGRAM_BYTES: usize = 1200;

/// Cap on gossip `data` length (bytes) applied at origination. Leaves
/// comfortable headroom under [`MAX_DATAGRAM_BYTES`] for the envelope
/// fields, ids, and JSON punctuation.
pub const MAX_GOSSIP_DATA_BYTES: usize = 800;

/// Topic attached to gossip originated from stdin lines.
pub const DEFAULT_TOPIC: &str = "chat";

/// Capabilities a peer must advertise in `HELLO` to be admitted. We speak
/// JSON over UDP; a peer that doesn't claim both has nothing to say to us.
pub const CAPABILITY_UDP: &str = "udp";
pub const CAPABILITY_JSON: &str = "json";

// ---------------------------------------------------------------------------
// Membership & Liveness
// ---------------------------------------------------------------------------

/// Consecutive unmatched probes after which a peer is declared dead.
/// Also the threshold at which the replacement policy may evict an entry
/// to make room for a newcomer.
pub const MAX_PING_FAILURES: u32 = 3;

/// Interval between discovery rounds, in seconds. While the peer table is
/// below its cap, the node periodically asks one random peer for more
/// addresses. Not exposed on the CLI; discovery pressure is not an
/// experiment dimension.
pub const DISCOVERY_INTERVAL_S: f64 = 10.0;

/// The single compiled-in neighbor selection policy. Forward and pull
/// targets are drawn uniformly at random (without replacement) from the
/// eligible peer set. Alternative policies are a sweep dimension with no
/// alternatives compiled in, so the name is the whole policy.
pub const NEIGHBOR_POLICY: &str = "uniform-random";

/// Host component of the node's advertised address. The experiment harness
/// runs every node on loopback; a multi-host deployment would make this a
/// config knob.
pub const LOCAL_HOST: &str = "127.0.0.1";

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default forward degree for fresh gossip.
pub const DEFAULT_FANOUT: usize = 3;

/// Default initial TTL on originated gossip.
pub const DEFAULT_TTL: i64 = 8;

/// Default peer table capacity.
pub const DEFAULT_PEER_LIMIT: usize = 30;

/// Default liveness probe period, seconds.
pub const DEFAULT_PING_INTERVAL_S: f64 = 1.0;

/// Default staleness threshold after which a silent peer is evicted, seconds.
pub const DEFAULT_PEER_TIMEOUT_S: f64 = 6.0;

/// Default period between `IHAVE` advertisement rounds, seconds.
pub const DEFAULT_PULL_INTERVAL_S: f64 = 5.0;

/// Default cap on ids carried in one `IHAVE`.
pub const DEFAULT_IDS_MAX_IHAVE: usize = 64;

// ---------------------------------------------------------------------------
// RuntimeConfig
// ---------------------------------------------------------------------------

/// Per-process configuration, assembled by the CLI layer and handed to the
/// runtime at startup. Field meanings follow the flag names one-to-one.
///
/// All intervals are kept in seconds (what the operator typed) and
/// converted to milliseconds at the use site via the `*_ms` helpers, so
/// nothing downstream does float arithmetic on the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// UDP port to bind on [`LOCAL_HOST`].
    pub port: u16,
    /// Entry peer for bootstrap, `ip:port`. May equal the node's own
    /// address, in which case the node is its own seed and sends nothing.
    pub bootstrap_addr: String,
    /// Target forward degree per new gossip.
    pub fanout: usize,
    /// Initial TTL on originated gossip.
    pub ttl: i64,
    /// Peer table capacity.
    pub peer_limit: usize,
    /// Liveness probe period, seconds.
    pub ping_interval_s: f64,
    /// Staleness threshold for eviction, seconds.
    pub peer_timeout_s: f64,
    /// Period between `IHAVE` rounds, seconds.
    pub pull_interval_s: f64,
    /// Max ids per `IHAVE` advertisement.
    pub ids_max_ihave: usize,
    /// Required leading hex zeros on the HELLO proof-of-work digest.
    /// 0 disables PoW entirely.
    pub k_pow: u32,
    /// Period between discovery rounds, seconds. Defaults to
    /// [`DISCOVERY_INTERVAL_S`]; not exposed on the CLI.
    pub discovery_interval_s: f64,
    /// RNG seed. Two nodes with identical configs, peers, and arrival
    /// order make identical forwarding choices.
    pub seed: u64,
    /// Directory for the JSONL event sink. `None` disables event logging.
    pub log_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    /// The node's advertised `ip:port` address.
    pub fn self_addr(&self) -> String {
        format!("{}:{}", LOCAL_HOST, self.port)
    }

    /// Probe period in milliseconds.
    pub fn ping_interval_ms(&self) -> u64 {
        (self.ping_interval_s * 1000.0) as u64
    }

    /// Staleness threshold in milliseconds.
    pub fn peer_timeout_ms(&self) -> u64 {
        (self.peer_timeout_s * 1000.0) as u64
    }

    /// Pull period in milliseconds.
    pub fn pull_interval_ms(&self) -> u64 {
        (self.pull_interval_s * 1000.0) as u64
    }

    /// Discovery period in milliseconds.
    pub fn discovery_interval_ms(&self) -> u64 {
        (self.discovery_interval_s * 1000.0) as u64
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            bootstrap_addr: format!("{}:5000", LOCAL_HOST),
            fanout: DEFAULT_FANOUT,
            ttl: DEFAULT_TTL,
            peer_limit: DEFAULT_PEER_LIMIT,
            ping_interval_s: DEFAULT_PING_INTERVAL_S,
            peer_timeout_s: DEFAULT_PEER_TIMEOUT_S,
            pull_interval_s: DEFAULT_PULL_INTERVAL_S,
            ids_max_ihave: DEFAULT_IDS_MAX_IHAVE,
            k_pow: 0,
            discovery_interval_s: DISCOVERY_INTERVAL_S,
            seed: 0,
            log_dir: None,
        }
    }
}
