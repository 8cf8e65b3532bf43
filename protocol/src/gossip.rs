//! # Gossip Engine
//!
//! Epidemic rumor propagation: push-based store-and-forward with
//! deduplication and a strict hop budget. When a rumor arrives for the
//! first time it is recorded and re-sent to a random subset of peers
//! (the fanout); every hop burns one unit of TTL, so propagation is
//! bounded regardless of graph shape.
//!
//! ## Deduplication
//!
//! The seen-set makes processing at-most-once per node: a `msg_id` that
//! has been seen is never stored or forwarded again, which is what stops
//! the broadcast storm on cyclic topologies.
//!
//! ## TTL rule
//!
//! Decrement first, then forward only while the result is strictly
//! positive. A rumor received with `ttl_in = 1` is delivered (first-seen
//! bookkeeping happens) but goes no further.
//!
//! ## No I/O
//!
//! The engine mutates its message store and returns [`Outbound`] values;
//! the runtime owns the socket. This keeps every decision unit-testable
//! on a virtual clock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;

use crate::config::MAX_GOSSIP_DATA_BYTES;
use crate::events::EventSink;
use crate::peer::PeerTable;
use crate::rng::SeededRng;
use crate::wire::{
    parse_payload, Envelope, GossipPayload, MsgType, NodeIdentity, Outbound,
};

// ---------------------------------------------------------------------------
// Message Store
// ---------------------------------------------------------------------------

/// A rumor as stored locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredGossip {
    pub msg_id: String,
    pub topic: String,
    pub data: String,
    pub origin_id: String,
    pub origin_timestamp_ms: u64,
    /// When this node first processed the rumor.
    pub first_seen_ms: u64,
}

/// Capability over the seen-set and known-messages pair.
///
/// The base implementation is unbounded; a bounded LRU or time-window
/// variant can replace it without touching the gossip algorithm, which
/// only ever calls these five operations.
pub trait MessageStore: Send {
    /// True once `msg_id` has been processed (the seen-set).
    fn contains(&self, msg_id: &str) -> bool;
    /// Records a rumor: marks it seen and stores the payload.
    fn insert(&mut self, stored: StoredGossip);
    /// Full stored rumor, when still retained.
    fn get(&self, msg_id: &str) -> Option<&StoredGossip>;
    /// Up to `max` known ids, most recently first-seen first.
    fn recent_ids(&self, max: usize) -> Vec<String>;
    /// Number of retained rumors.
    fn len(&self) -> usize;
}

/// The unbounded in-memory store: every rumor is retained for the node's
/// lifetime. Known ids are a subset of seen ids by construction.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    seen: HashSet<String>,
    known: HashMap<String, StoredGossip>,
    /// Insertion order; the clock is monotonic, so this is first-seen
    /// order and `recent_ids` is a reverse scan.
    order: Vec<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for InMemoryStore {
    fn contains(&self, msg_id: &str) -> bool {
        self.seen.contains(msg_id)
    }

    fn insert(&mut self, stored: StoredGossip) {
        if self.seen.insert(stored.msg_id.clone()) {
            self.order.push(stored.msg_id.clone());
            self.known.insert(stored.msg_id.clone(), stored);
        }
    }

    fn get(&self, msg_id: &str) -> Option<&StoredGossip> {
        self.known.get(msg_id)
    }

    fn recent_ids(&self, max: usize) -> Vec<String> {
        self.order.iter().rev().take(max).cloned().collect()
    }

    fn len(&self) -> usize {
        self.known.len()
    }
}

// ---------------------------------------------------------------------------
// Gossip Engine
// ---------------------------------------------------------------------------

/// Push-gossip state machine: origination and receive-side forwarding.
pub struct GossipEngine {
    fanout: usize,
    initial_ttl: i64,
    store: Box<dyn MessageStore>,
    sink: Arc<EventSink>,
}

impl GossipEngine {
    pub fn new(
        fanout: usize,
        initial_ttl: i64,
        store: Box<dyn MessageStore>,
        sink: Arc<EventSink>,
    ) -> Self {
        Self {
            fanout,
            initial_ttl,
            store,
            sink,
        }
    }

    /// Read access to the message store (the pull engine advertises and
    /// serves from it).
    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    /// Originates a fresh rumor from local input.
    ///
    /// The text is trimmed by the caller; oversized `data` is truncated
    /// here so the envelope stays under the datagram budget. Returns the
    /// envelopes to send — up to `fanout` random peers.
    pub fn originate(
        &mut self,
        topic: &str,
        data: &str,
        ident: &NodeIdentity,
        peers: &PeerTable,
        rng: &mut SeededRng,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let data = truncate_utf8(data, MAX_GOSSIP_DATA_BYTES);
        let msg_id = uuid::Uuid::new_v4().to_string();
        let payload = GossipPayload {
            topic: topic.to_string(),
            data: data.to_string(),
            origin_id: ident.node_id.clone(),
            origin_timestamp_ms: now_ms,
        };

        self.store.insert(StoredGossip {
            msg_id: msg_id.clone(),
            topic: payload.topic.clone(),
            data: payload.data.clone(),
            origin_id: payload.origin_id.clone(),
            origin_timestamp_ms: payload.origin_timestamp_ms,
            first_seen_ms: now_ms,
        });

        self.sink.emit(
            "gossip_originated",
            json!({
                "msg_id": msg_id,
                "origin_ts_ms": now_ms,
                "ttl_initial": self.initial_ttl,
                "text_len": data.len(),
            }),
        );

        let targets = peers.sample(rng, &[], self.fanout);
        tracing::info!(
            msg_id = %msg_id,
            targets = targets.len(),
            "originating gossip"
        );

        let payload_value = serde_json::to_value(&payload).unwrap_or_default();
        targets
            .into_iter()
            .map(|target| {
                let mut env = Envelope::new(
                    MsgType::Gossip,
                    &ident.node_id,
                    &ident.addr,
                    now_ms,
                    Some(self.initial_ttl),
                    payload_value.clone(),
                );
                env.msg_id = msg_id.clone();
                Outbound::new(&target, env)
            })
            .collect()
    }

    /// Processes an inbound `GOSSIP` envelope.
    pub fn handle_gossip(
        &mut self,
        env: &Envelope,
        from_addr: &str,
        ident: &NodeIdentity,
        peers: &PeerTable,
        rng: &mut SeededRng,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let payload: GossipPayload = match parse_payload(&env.payload) {
            Ok(p) => p,
            Err(e) => {
                self.sink.emit(
                    "recv_invalid_schema",
                    json!({
                        "reason": "payload_invalid",
                        "msg_type": "GOSSIP",
                        "detail": e.to_string(),
                    }),
                );
                tracing::debug!(from = from_addr, error = %e, "dropping gossip with bad payload");
                return Vec::new();
            }
        };

        if self.store.contains(&env.msg_id) {
            self.sink.emit(
                "gossip_duplicate_ignored",
                json!({"msg_id": env.msg_id, "from_peer": from_addr}),
            );
            return Vec::new();
        }

        // ttl presence on GOSSIP is guaranteed by the decoder.
        let ttl_in = env.ttl.unwrap_or(0);

        self.store.insert(StoredGossip {
            msg_id: env.msg_id.clone(),
            topic: payload.topic.clone(),
            data: payload.data.clone(),
            origin_id: payload.origin_id.clone(),
            origin_timestamp_ms: payload.origin_timestamp_ms,
            first_seen_ms: now_ms,
        });
        self.sink.emit(
            "gossip_first_seen",
            json!({
                "msg_id": env.msg_id,
                "recv_ts_ms": now_ms,
                "from_peer": from_addr,
                "ttl_in": ttl_in,
            }),
        );

        let ttl_out = ttl_in - 1;
        if ttl_out <= 0 {
            self.sink.emit(
                "gossip_forward_decision",
                json!({
                    "msg_id": env.msg_id,
                    "reason": "ttl_exhausted",
                    "ttl_in": ttl_in,
                }),
            );
            return Vec::new();
        }

        let targets = peers.sample(rng, &[from_addr], self.fanout);
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            let mut fwd = Envelope::new(
                MsgType::Gossip,
                &ident.node_id,
                &ident.addr,
                now_ms,
                Some(ttl_out),
                env.payload.clone(),
            );
            fwd.msg_id = env.msg_id.clone();
            self.sink.emit(
                "gossip_forwarded",
                json!({
                    "msg_id": env.msg_id,
                    "target": target,
                    "ttl_out": ttl_out,
                }),
            );
            out.push(Outbound::new(&target, fwd));
        }
        out
    }
}

impl std::fmt::Debug for GossipEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipEngine")
            .field("fanout", &self.fanout)
            .field("initial_ttl", &self.initial_ttl)
            .field("known", &self.store.len())
            .finish()
    }
}

/// Truncates to at most `max` bytes without splitting a UTF-8 scalar.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerRecord, PeerSource, PendingPings, PeerTable};

    fn ident() -> NodeIdentity {
        NodeIdentity {
            node_id: "self-node".to_string(),
            addr: "127.0.0.1:5000".to_string(),
        }
    }

    fn engine(fanout: usize, ttl: i64) -> GossipEngine {
        GossipEngine::new(
            fanout,
            ttl,
            Box::new(InMemoryStore::new()),
            Arc::new(EventSink::disabled("self-node")),
        )
    }

    fn peers(n: usize) -> PeerTable {
        let mut table = PeerTable::new(
            64,
            6000,
            "127.0.0.1:5000",
            Arc::new(EventSink::disabled("self-node")),
        );
        let mut pending = PendingPings::new();
        for i in 0..n {
            let addr = format!("127.0.0.1:{}", 6000 + i);
            table.insert_new(PeerRecord::new(&addr, PeerSource::PeersList, 0), 0, &mut pending);
        }
        table
    }

    fn gossip_env(msg_id: &str, ttl: i64, from: &str) -> Envelope {
        let mut env = Envelope::new(
            MsgType::Gossip,
            "remote-node",
            from,
            1000,
            Some(ttl),
            serde_json::to_value(GossipPayload {
                topic: "chat".to_string(),
                data: "hello".to_string(),
                origin_id: "remote-node".to_string(),
                origin_timestamp_ms: 900,
            })
            .unwrap(),
        );
        env.msg_id = msg_id.to_string();
        env
    }

    #[test]
    fn originate_stores_and_fans_out() {
        let mut g = engine(3, 8);
        let table = peers(5);
        let mut rng = SeededRng::from_seed(1);
        let out = g.originate("chat", "hello world", &ident(), &table, &mut rng, 1000);

        assert_eq!(out.len(), 3);
        let msg_id = &out[0].envelope.msg_id;
        assert!(g.store().contains(msg_id));
        assert!(out.iter().all(|o| &o.envelope.msg_id == msg_id));
        assert!(out.iter().all(|o| o.envelope.ttl == Some(8)));
        // Pairwise distinct targets.
        let mut targets: Vec<&str> = out.iter().map(|o| o.to.as_str()).collect();
        targets.sort();
        targets.dedup();
        assert_eq!(targets.len(), 3);
    }

    #[test]
    fn originate_with_no_peers_still_records() {
        let mut g = engine(3, 8);
        let table = peers(0);
        let mut rng = SeededRng::from_seed(1);
        let out = g.originate("chat", "lonely", &ident(), &table, &mut rng, 1000);
        assert!(out.is_empty());
        assert_eq!(g.store().len(), 1);
    }

    #[test]
    fn first_seen_then_duplicate() {
        let mut g = engine(2, 8);
        let table = peers(4);
        let mut rng = SeededRng::from_seed(2);
        let env = gossip_env("m-1", 5, "127.0.0.1:6000");

        let first = g.handle_gossip(&env, "127.0.0.1:6000", &ident(), &table, &mut rng, 1000);
        assert_eq!(first.len(), 2);

        let dup = g.handle_gossip(&env, "127.0.0.1:6001", &ident(), &table, &mut rng, 1100);
        assert!(dup.is_empty());
        assert_eq!(g.store().len(), 1);
    }

    #[test]
    fn forward_decrements_ttl() {
        let mut g = engine(2, 8);
        let table = peers(4);
        let mut rng = SeededRng::from_seed(3);
        let env = gossip_env("m-2", 5, "127.0.0.1:6000");
        let out = g.handle_gossip(&env, "127.0.0.1:6000", &ident(), &table, &mut rng, 1000);
        assert!(out.iter().all(|o| o.envelope.ttl == Some(4)));
        assert!(out.iter().all(|o| o.envelope.msg_id == "m-2"));
        assert!(out.iter().all(|o| o.envelope.sender_id == "self-node"));
    }

    #[test]
    fn ttl_one_is_delivered_but_not_forwarded() {
        let mut g = engine(2, 8);
        let table = peers(4);
        let mut rng = SeededRng::from_seed(4);
        let env = gossip_env("m-3", 1, "127.0.0.1:6000");
        let out = g.handle_gossip(&env, "127.0.0.1:6000", &ident(), &table, &mut rng, 1000);
        assert!(out.is_empty());
        assert!(g.store().contains("m-3"));
    }

    #[test]
    fn ttl_zero_is_delivered_but_not_forwarded() {
        let mut g = engine(2, 8);
        let table = peers(4);
        let mut rng = SeededRng::from_seed(5);
        let env = gossip_env("m-4", 0, "127.0.0.1:6000");
        let out = g.handle_gossip(&env, "127.0.0.1:6000", &ident(), &table, &mut rng, 1000);
        assert!(out.is_empty());
    }

    #[test]
    fn forward_excludes_source() {
        let mut g = engine(10, 8);
        let table = peers(4);
        let mut rng = SeededRng::from_seed(6);
        let env = gossip_env("m-5", 5, "127.0.0.1:6002");
        let out = g.handle_gossip(&env, "127.0.0.1:6002", &ident(), &table, &mut rng, 1000);
        // Fanout exceeds candidates: everyone but the source.
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|o| o.to != "127.0.0.1:6002"));
    }

    #[test]
    fn invalid_payload_is_dropped() {
        let mut g = engine(2, 8);
        let table = peers(4);
        let mut rng = SeededRng::from_seed(7);
        let mut env = gossip_env("m-6", 5, "127.0.0.1:6000");
        env.payload = serde_json::json!({"topic": "t"});
        let out = g.handle_gossip(&env, "127.0.0.1:6000", &ident(), &table, &mut rng, 1000);
        assert!(out.is_empty());
        assert!(!g.store().contains("m-6"));
    }

    #[test]
    fn seed_determinism_across_engines() {
        let env = gossip_env("m-7", 5, "127.0.0.1:6000");
        let table = peers(8);

        let run = || {
            let mut g = engine(3, 8);
            let mut rng = SeededRng::from_seed(99);
            g.handle_gossip(&env, "127.0.0.1:6000", &ident(), &table, &mut rng, 1000)
                .into_iter()
                .map(|o| o.to)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn recent_ids_are_most_recent_first() {
        let mut store = InMemoryStore::new();
        for i in 0..5 {
            store.insert(StoredGossip {
                msg_id: format!("m-{}", i),
                topic: "t".to_string(),
                data: "d".to_string(),
                origin_id: "o".to_string(),
                origin_timestamp_ms: 0,
                first_seen_ms: i,
            });
        }
        assert_eq!(store.recent_ids(3), vec!["m-4", "m-3", "m-2"]);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        let t = truncate_utf8(s, 2);
        assert!(t.len() <= 2);
        assert!(s.starts_with(t));
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
