//! # Peer Table
//!
//! Bounded membership view of the network: a deterministic mapping from
//! peer address to [`PeerRecord`], capped at `peer_limit`.
//!
//! ## Invariants
//!
//! - The table never exceeds its cap.
//! - The node's own address is never a member.
//! - Addresses are unique (the map key is the address).
//! - A record with a pending probe always has a probe send timestamp.
//!
//! ## Replacement policy
//!
//! When a newcomer arrives at a full table, the worst current entry is
//! computed by the score tuple `(consecutive_ping_failures, staleness_ms,
//! addr)` under lexicographic order — failure count dominates, staleness
//! breaks failure ties, and the address string breaks exact ties so the
//! outcome is deterministic under a fixed seed. The worst entry is evicted
//! only if it is actually evictable (≥ 3 consecutive failures, or silent
//! beyond the peer timeout); a full table of healthy peers rejects the
//! newcomer instead. Stability wins over novelty.
//!
//! The table is iterated through a `BTreeMap` so sampling pools are always
//! built in the same order; uniform selection then comes from the node's
//! seeded RNG.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::json;

use crate::config::MAX_PING_FAILURES;
use crate::events::EventSink;
use crate::rng::SeededRng;
use crate::wire::PeerEntry;

// ---------------------------------------------------------------------------
// Peer Record
// ---------------------------------------------------------------------------

/// How we first learned about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    /// The configured entry node.
    Bootstrap,
    /// Merged from a `PEERS_LIST` response.
    PeersList,
    /// Admitted through an accepted `HELLO`.
    Hello,
}

impl PeerSource {
    /// Stable name for event records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::PeersList => "peers_list",
            Self::Hello => "hello",
        }
    }
}

/// Everything the node tracks about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// `ip:port`, also the table key.
    pub addr: String,
    /// The peer's node id, unknown until an accepted HELLO or a
    /// PEERS_LIST entry carries it.
    pub node_id: Option<String>,
    /// Epoch ms of the most recent valid inbound activity.
    pub last_seen_ms: u64,
    /// Epoch ms of the most recent outbound probe, if any.
    pub last_ping_sent_ms: Option<u64>,
    /// Probes that went unanswered since the last matched PONG.
    pub consecutive_ping_failures: u32,
    /// Correlation token of the in-flight probe.
    pub pending_ping_id: Option<String>,
    /// Sequence number paired with `pending_ping_id`.
    pub pending_ping_seq: Option<u64>,
    /// Monotonic per-peer probe counter.
    pub next_ping_seq: u64,
    /// Smoothed-enough round-trip estimate: the latest matched probe RTT.
    pub rtt_ms: Option<u64>,
    /// True once a HELLO from this peer passed admission.
    pub is_verified_hello: bool,
    /// Provenance of the entry.
    pub source: PeerSource,
}

impl PeerRecord {
    /// Fresh record. `last_seen_ms = now` gives newcomers one full tick of
    /// grace before the eviction pass can consider them.
    pub fn new(addr: &str, source: PeerSource, now_ms: u64) -> Self {
        Self {
            addr: addr.to_string(),
            node_id: None,
            last_seen_ms: now_ms,
            last_ping_sent_ms: None,
            consecutive_ping_failures: 0,
            pending_ping_id: None,
            pending_ping_seq: None,
            next_ping_seq: 0,
            rtt_ms: None,
            is_verified_hello: false,
            source,
        }
    }

    /// Milliseconds since the last valid inbound activity.
    pub fn staleness_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }

    /// Clears the in-flight probe fields.
    pub fn clear_pending_probe(&mut self) {
        self.pending_ping_id = None;
        self.pending_ping_seq = None;
    }
}

/// Field updates applied by `upsert_existing`. `None` leaves a field
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct PeerPatch {
    pub node_id: Option<String>,
    pub last_seen_ms: Option<u64>,
    pub is_verified_hello: Option<bool>,
    pub source: Option<PeerSource>,
}

// ---------------------------------------------------------------------------
// Eviction & Insertion Outcomes
// ---------------------------------------------------------------------------

/// Why an entry left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    /// Displaced by the replacement policy to admit a newcomer.
    Replaced,
    /// Silent for longer than the peer timeout.
    PeerTimeout,
    /// Accumulated too many consecutive probe failures.
    PingFailures,
}

impl EvictReason {
    /// Stable name for event records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replaced => "replaced",
            Self::PeerTimeout => "peer_timeout",
            Self::PingFailures => "ping_failures",
        }
    }
}

/// Result of [`PeerTable::insert_new`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was added to free capacity.
    Added,
    /// The peer was added after the replacement policy evicted `evicted`.
    Replaced { evicted: String },
    /// The table is full of healthy peers; the newcomer was turned away.
    Rejected,
}

// ---------------------------------------------------------------------------
// Pending Pings
// ---------------------------------------------------------------------------

/// In-flight probe correlation: `(peer_addr, ping_id) → sent_ts_ms`.
///
/// Keyed by the full pair rather than one-per-peer so a duplicate or
/// reordered PONG can never be matched against the wrong probe. Entries
/// are bounded by active probes: removed on match, on timeout accounting,
/// and on eviction of the peer.
#[derive(Debug, Default)]
pub struct PendingPings {
    entries: HashMap<(String, String), u64>,
}

impl PendingPings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outbound probe.
    pub fn insert(&mut self, addr: &str, ping_id: &str, sent_ts_ms: u64) {
        self.entries
            .insert((addr.to_string(), ping_id.to_string()), sent_ts_ms);
    }

    /// Consumes the entry for a PONG, returning when the probe was sent.
    /// `None` means the PONG is unmatched (late, duplicate, or forged).
    pub fn take(&mut self, addr: &str, ping_id: &str) -> Option<u64> {
        self.entries.remove(&(addr.to_string(), ping_id.to_string()))
    }

    /// Drops every entry for `addr`. Used on eviction so a dead peer's
    /// probes cannot leak.
    pub fn clear_peer(&mut self, addr: &str) {
        self.entries.retain(|(a, _), _| a != addr);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Peer Table
// ---------------------------------------------------------------------------

/// The bounded peer membership table.
pub struct PeerTable {
    peers: BTreeMap<String, PeerRecord>,
    limit: usize,
    peer_timeout_ms: u64,
    self_addr: String,
    sink: Arc<EventSink>,
}

impl PeerTable {
    pub fn new(limit: usize, peer_timeout_ms: u64, self_addr: &str, sink: Arc<EventSink>) -> Self {
        Self {
            peers: BTreeMap::new(),
            limit,
            peer_timeout_ms,
            self_addr: self_addr.to_string(),
            sink,
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn get(&self, addr: &str) -> Option<&PeerRecord> {
        self.peers.get(addr)
    }

    pub fn get_mut(&mut self, addr: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(addr)
    }

    /// All member addresses in deterministic (lexicographic) order.
    pub fn addrs(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    /// Iterates records in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Silently refreshes `last_seen_ms` for a known sender. Any valid
    /// inbound envelope counts as liveness evidence; this is not a field
    /// merge, so no `peer_update` record is emitted.
    pub fn touch(&mut self, addr: &str, now_ms: u64) {
        if let Some(rec) = self.peers.get_mut(addr) {
            rec.last_seen_ms = rec.last_seen_ms.max(now_ms);
        }
    }

    /// Applies a field patch to an existing entry. Emits `peer_update`.
    /// Returns false when the address is not a member.
    pub fn upsert_existing(&mut self, addr: &str, patch: PeerPatch) -> bool {
        let Some(rec) = self.peers.get_mut(addr) else {
            return false;
        };
        if let Some(node_id) = patch.node_id {
            rec.node_id = Some(node_id);
        }
        if let Some(last_seen) = patch.last_seen_ms {
            rec.last_seen_ms = rec.last_seen_ms.max(last_seen);
        }
        if let Some(verified) = patch.is_verified_hello {
            rec.is_verified_hello = verified;
        }
        if let Some(source) = patch.source {
            rec.source = source;
        }
        let snapshot = json!({
            "addr": rec.addr,
            "peer_node_id": rec.node_id,
            "verified": rec.is_verified_hello,
            "source": rec.source.as_str(),
        });
        self.sink.emit("peer_update", snapshot);
        true
    }

    /// Admits a new peer, applying the replacement policy at capacity.
    ///
    /// The caller must have checked that `addr` is not already a member;
    /// an insert for a member address is ignored. The node's own address
    /// is refused unconditionally.
    pub fn insert_new(
        &mut self,
        initial: PeerRecord,
        now_ms: u64,
        pending: &mut PendingPings,
    ) -> InsertOutcome {
        let addr = initial.addr.clone();
        if addr == self.self_addr {
            tracing::debug!(addr = %addr, "refusing to insert self address");
            return InsertOutcome::Rejected;
        }
        if self.peers.contains_key(&addr) {
            return InsertOutcome::Rejected;
        }

        if self.peers.len() < self.limit {
            self.sink.emit(
                "peer_add",
                json!({"addr": addr, "source": initial.source.as_str()}),
            );
            self.peers.insert(addr, initial);
            return InsertOutcome::Added;
        }

        match self.replacement_candidate(now_ms) {
            Some(victim) => {
                self.evict(&victim, EvictReason::Replaced, now_ms, pending);
                self.sink.emit(
                    "peer_add",
                    json!({"addr": addr, "source": initial.source.as_str()}),
                );
                self.peers.insert(addr, initial);
                InsertOutcome::Replaced { evicted: victim }
            }
            None => {
                self.sink.emit("peer_limit_reject", json!({"addr": addr}));
                tracing::debug!(addr = %addr, "peer table full of healthy peers, newcomer rejected");
                InsertOutcome::Rejected
            }
        }
    }

    /// Picks the entry the replacement policy may evict, if any.
    ///
    /// The lexicographic maximum of `(failures, staleness, addr)` is the
    /// worst entry; it is returned only when it also passes the eviction
    /// gate. A healthy full table returns `None`.
    fn replacement_candidate(&self, now_ms: u64) -> Option<String> {
        let worst = self
            .peers
            .values()
            .max_by_key(|rec| {
                (
                    rec.consecutive_ping_failures,
                    rec.staleness_ms(now_ms),
                    rec.addr.clone(),
                )
            })?;

        let evictable = worst.consecutive_ping_failures >= MAX_PING_FAILURES
            || worst.staleness_ms(now_ms) > self.peer_timeout_ms;
        evictable.then(|| worst.addr.clone())
    }

    /// Removes an entry and its in-flight probes. Emits `peer_evict` for
    /// replacement, `peer_evict_dead` for liveness eviction.
    pub fn evict(
        &mut self,
        addr: &str,
        reason: EvictReason,
        now_ms: u64,
        pending: &mut PendingPings,
    ) -> Option<PeerRecord> {
        let rec = self.peers.remove(addr)?;
        pending.clear_peer(addr);

        match reason {
            EvictReason::Replaced => {
                self.sink.emit(
                    "peer_evict",
                    json!({"addr": addr, "reason": reason.as_str()}),
                );
            }
            EvictReason::PeerTimeout | EvictReason::PingFailures => {
                self.sink.emit(
                    "peer_evict_dead",
                    json!({
                        "addr": addr,
                        "reason": reason.as_str(),
                        "last_seen_age_ms": rec.staleness_ms(now_ms),
                        "failures": rec.consecutive_ping_failures,
                    }),
                );
            }
        }
        Some(rec)
    }

    /// Uniform sample of up to `k` member addresses, excluding `excluding`.
    /// The pool is built in table order, so the draw sequence depends only
    /// on the seed and the table contents.
    pub fn sample(&self, rng: &mut SeededRng, excluding: &[&str], k: usize) -> Vec<String> {
        let pool: Vec<String> = self
            .peers
            .keys()
            .filter(|addr| !excluding.contains(&addr.as_str()))
            .cloned()
            .collect();
        rng.sample(&pool, k)
    }

    /// Builds the entries for a `PEERS_LIST` response: up to `max` members
    /// excluding the requester (the self address is never a member).
    pub fn entries_for_list(&self, requester: &str, max: usize) -> Vec<PeerEntry> {
        self.peers
            .values()
            .filter(|rec| rec.addr != requester)
            .take(max)
            .map(|rec| PeerEntry {
                node_id: rec.node_id.clone(),
                addr: rec.addr.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for PeerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTable")
            .field("len", &self.peers.len())
            .field("limit", &self.limit)
            .finish()
    }
}
