//! # Dispatcher & Control Handlers
//!
//! Pure routing from a decoded envelope to its handler, plus the
//! handlers for the control-plane message types: `HELLO` admission,
//! `GET_PEERS` / `PEERS_LIST` peer exchange, and `PING` / `PONG`
//! probing. `GOSSIP` routes to the gossip engine and `IHAVE` / `IWANT`
//! to the pull engine.
//!
//! Handlers receive `(envelope, from_addr, now_ms)`, mutate node state
//! through the peer table and store operations, and return the envelopes
//! to send. They never touch the socket — the runtime executes the
//! returned [`Outbound`] batch. A handler that drops a message logs the
//! decision and returns an empty batch; nothing in here can fail the
//! receive path.

use serde_json::json;

use crate::config::{CAPABILITY_JSON, CAPABILITY_UDP};
use crate::node::NodeState;
use crate::peer::{InsertOutcome, PeerPatch, PeerRecord, PeerSource};
use crate::pow;
use crate::wire::{
    is_valid_addr, parse_payload, Envelope, GetPeersPayload, HelloPayload, MsgType,
    Outbound, PeersListPayload, ProbePayload,
};

/// Routes one decoded envelope to its handler.
pub fn dispatch(state: &mut NodeState, env: &Envelope, from_addr: &str, now_ms: u64) -> Vec<Outbound> {
    // Any valid envelope is liveness evidence for a known sender.
    state.peers.touch(&env.sender_addr, now_ms);

    match env.msg_type {
        MsgType::Hello => handle_hello(state, env, now_ms),
        MsgType::GetPeers => handle_get_peers(state, env, from_addr, now_ms),
        MsgType::PeersList => handle_peers_list(state, env, from_addr, now_ms),
        MsgType::Ping => handle_ping(state, env, from_addr, now_ms),
        MsgType::Pong => handle_pong(state, env, from_addr, now_ms),
        MsgType::Gossip => {
            let NodeState {
                gossip,
                peers,
                rng,
                ident,
                ..
            } = state;
            gossip.handle_gossip(env, from_addr, ident, peers, rng, now_ms)
        }
        MsgType::Ihave => {
            let NodeState {
                pull,
                gossip,
                ident,
                ..
            } = state;
            pull.handle_ihave(env, from_addr, gossip.store(), ident, now_ms)
        }
        MsgType::Iwant => {
            let NodeState {
                pull,
                gossip,
                ident,
                ..
            } = state;
            pull.handle_iwant(env, from_addr, gossip.store(), ident, now_ms)
        }
    }
}

// ---------------------------------------------------------------------------
// HELLO
// ---------------------------------------------------------------------------

/// Admission control. Rejections are silent on the wire (no response a
/// spoofed source could bounce off us) and loud in the event log.
fn handle_hello(state: &mut NodeState, env: &Envelope, now_ms: u64) -> Vec<Outbound> {
    let reject = |state: &NodeState, reason: &str| {
        state.sink.emit(
            "hello_rejected",
            json!({"from": env.sender_addr, "sender_id": env.sender_id, "reason": reason}),
        );
        tracing::debug!(from = %env.sender_addr, reason, "HELLO rejected");
        Vec::new()
    };

    let Ok(payload) = parse_payload::<HelloPayload>(&env.payload) else {
        return reject(state, "capabilities_invalid");
    };

    let caps = &payload.capabilities;
    if !caps.iter().any(|c| c == CAPABILITY_UDP) || !caps.iter().any(|c| c == CAPABILITY_JSON) {
        return reject(state, "capabilities_invalid");
    }

    if state.cfg.k_pow > 0 {
        match &payload.pow {
            None => return reject(state, "pow_missing"),
            Some(proof) => {
                if let Err(e) = pow::verify(proof, &env.sender_id, state.cfg.k_pow) {
                    tracing::debug!(from = %env.sender_addr, error = %e, "HELLO proof failed");
                    return reject(state, "pow_invalid");
                }
            }
        }
    }

    let addr = env.sender_addr.clone();
    let admitted = if state.peers.contains(&addr) {
        state.peers.upsert_existing(
            &addr,
            PeerPatch {
                node_id: Some(env.sender_id.clone()),
                last_seen_ms: Some(now_ms),
                is_verified_hello: Some(true),
                source: Some(PeerSource::Hello),
            },
        )
    } else {
        let mut rec = PeerRecord::new(&addr, PeerSource::Hello, now_ms);
        rec.node_id = Some(env.sender_id.clone());
        rec.is_verified_hello = true;
        !matches!(
            state.peers.insert_new(rec, now_ms, &mut state.pending),
            InsertOutcome::Rejected
        )
    };

    if admitted {
        state.sink.emit(
            "hello_accepted",
            json!({"peer": addr, "peer_node_id": env.sender_id}),
        );
    }
    Vec::new()
}

// ---------------------------------------------------------------------------
// GET_PEERS / PEERS_LIST
// ---------------------------------------------------------------------------

fn handle_get_peers(
    state: &mut NodeState,
    env: &Envelope,
    from_addr: &str,
    now_ms: u64,
) -> Vec<Outbound> {
    // `max_peers` is an optional hint; a missing or nonsensical value
    // falls back to the table cap.
    let payload: GetPeersPayload = parse_payload(&env.payload).unwrap_or_default();
    let requested = payload
        .max_peers
        .filter(|n| *n >= 1)
        .map(|n| n as usize)
        .unwrap_or(state.cfg.peer_limit);
    let cap = requested.min(state.cfg.peer_limit);

    let entries = state.peers.entries_for_list(&env.sender_addr, cap);
    let count = entries.len();
    let body = serde_json::to_value(PeersListPayload { peers: entries }).unwrap_or_default();

    state.sink.emit(
        "peers_list_sent",
        json!({"target": from_addr, "count": count}),
    );
    vec![Outbound::new(
        from_addr,
        Envelope::new(
            MsgType::PeersList,
            &state.ident.node_id,
            &state.ident.addr,
            now_ms,
            None,
            body,
        ),
    )]
}

fn handle_peers_list(
    state: &mut NodeState,
    env: &Envelope,
    from_addr: &str,
    now_ms: u64,
) -> Vec<Outbound> {
    let payload: PeersListPayload = match parse_payload(&env.payload) {
        Ok(p) => p,
        Err(e) => {
            state.sink.emit(
                "recv_invalid_schema",
                json!({"reason": "payload_invalid", "msg_type": "PEERS_LIST", "detail": e.to_string()}),
            );
            return Vec::new();
        }
    };

    let (mut added, mut updated, mut ignored, mut evicted) = (0u32, 0u32, 0u32, 0u32);
    for entry in payload.peers {
        // Entries are validated independently; one bad entry never
        // poisons the rest of the merge.
        if !is_valid_addr(&entry.addr) || entry.addr == state.ident.addr {
            ignored += 1;
            continue;
        }
        if state.peers.contains(&entry.addr) {
            state.peers.upsert_existing(
                &entry.addr,
                PeerPatch {
                    node_id: entry.node_id,
                    ..PeerPatch::default()
                },
            );
            updated += 1;
            continue;
        }

        let mut rec = PeerRecord::new(&entry.addr, PeerSource::PeersList, now_ms);
        rec.node_id = entry.node_id;
        match state.peers.insert_new(rec, now_ms, &mut state.pending) {
            InsertOutcome::Added => added += 1,
            InsertOutcome::Replaced { .. } => {
                added += 1;
                evicted += 1;
            }
            InsertOutcome::Rejected => ignored += 1,
        }
    }

    state.sink.emit(
        "peers_list_received",
        json!({
            "from": from_addr,
            "added": added,
            "updated": updated,
            "ignored": ignored,
            "evicted": evicted,
        }),
    );
    Vec::new()
}

// ---------------------------------------------------------------------------
// PING / PONG
// ---------------------------------------------------------------------------

fn handle_ping(
    state: &mut NodeState,
    env: &Envelope,
    from_addr: &str,
    now_ms: u64,
) -> Vec<Outbound> {
    let probe: ProbePayload = match parse_payload::<ProbePayload>(&env.payload) {
        Ok(p) if !p.ping_id.is_empty() => p,
        _ => {
            state.sink.emit(
                "recv_invalid_schema",
                json!({"reason": "payload_invalid", "msg_type": "PING"}),
            );
            return Vec::new();
        }
    };

    state.peers.touch(&env.sender_addr, now_ms);
    state.sink.emit(
        "ping_received",
        json!({"from": from_addr, "ping_id": probe.ping_id, "seq": probe.seq}),
    );

    state.sink.emit(
        "pong_sent",
        json!({"target": from_addr, "ping_id": probe.ping_id, "seq": probe.seq}),
    );
    let echo = serde_json::to_value(&probe).unwrap_or_default();
    vec![Outbound::new(
        from_addr,
        Envelope::new(
            MsgType::Pong,
            &state.ident.node_id,
            &state.ident.addr,
            now_ms,
            None,
            echo,
        ),
    )]
}

fn handle_pong(
    state: &mut NodeState,
    env: &Envelope,
    from_addr: &str,
    now_ms: u64,
) -> Vec<Outbound> {
    let probe: ProbePayload = match parse_payload::<ProbePayload>(&env.payload) {
        Ok(p) if !p.ping_id.is_empty() => p,
        _ => {
            state.sink.emit(
                "recv_invalid_schema",
                json!({"reason": "payload_invalid", "msg_type": "PONG"}),
            );
            return Vec::new();
        }
    };

    // The correlation entry and the record's pending token are kept in
    // lockstep, so a PONG that raced a timeout finds no entry here and
    // falls through to unmatched.
    if let Some(sent_ts) = state.pending.take(from_addr, &probe.ping_id) {
        if let Some(rec) = state.peers.get_mut(from_addr) {
            let rtt_ms = now_ms.saturating_sub(sent_ts);
            rec.rtt_ms = Some(rtt_ms);
            rec.consecutive_ping_failures = 0;
            rec.last_seen_ms = rec.last_seen_ms.max(now_ms);
            rec.clear_pending_probe();
            state.sink.emit(
                "pong_received",
                json!({
                    "from": from_addr,
                    "ping_id": probe.ping_id,
                    "seq": probe.seq,
                    "status": "matched",
                    "rtt_ms": rtt_ms,
                }),
            );
            return Vec::new();
        }
    }

    state.sink.emit(
        "pong_received",
        json!({
            "from": from_addr,
            "ping_id": probe.ping_id,
            "seq": probe.seq,
            "status": "unmatched",
        }),
    );
    tracing::debug!(from = from_addr, ping_id = %probe.ping_id, "unmatched PONG ignored");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::node::NodeState;
    use crate::wire::{IhavePayload, PeerEntry};
    use serde_json::json;

    fn state_with(k_pow: u32, peer_limit: usize) -> NodeState {
        let cfg = RuntimeConfig {
            port: 5000,
            peer_limit,
            k_pow,
            ..RuntimeConfig::default()
        };
        NodeState::new(&cfg)
    }

    fn hello_env(sender_id: &str, sender_addr: &str, payload: serde_json::Value) -> Envelope {
        Envelope::new(MsgType::Hello, sender_id, sender_addr, 1000, None, payload)
    }

    fn seed_peer(state: &mut NodeState, addr: &str, now: u64) {
        state.peers.insert_new(
            PeerRecord::new(addr, PeerSource::PeersList, now),
            now,
            &mut state.pending,
        );
    }

    #[test]
    fn hello_with_capabilities_is_admitted() {
        let mut state = state_with(0, 8);
        let env = hello_env(
            "peer-1",
            "127.0.0.1:6001",
            json!({"capabilities": ["udp", "json"]}),
        );
        let out = dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        assert!(out.is_empty());

        let rec = state.peers.get("127.0.0.1:6001").unwrap();
        assert!(rec.is_verified_hello);
        assert_eq!(rec.node_id.as_deref(), Some("peer-1"));
        assert_eq!(rec.source, PeerSource::Hello);
    }

    #[test]
    fn hello_missing_capability_is_rejected_silently() {
        let mut state = state_with(0, 8);
        let env = hello_env(
            "peer-1",
            "127.0.0.1:6001",
            json!({"capabilities": ["udp"]}),
        );
        let out = dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        assert!(out.is_empty());
        assert!(!state.peers.contains("127.0.0.1:6001"));
    }

    #[test]
    fn hello_without_pow_is_rejected_when_required() {
        let mut state = state_with(2, 8);
        let env = hello_env(
            "peer-1",
            "127.0.0.1:6001",
            json!({"capabilities": ["udp", "json"]}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        assert!(!state.peers.contains("127.0.0.1:6001"));
    }

    #[test]
    fn hello_with_valid_pow_is_admitted() {
        let mut state = state_with(2, 8);
        let proof = pow::produce("peer-1", 2);
        let env = hello_env(
            "peer-1",
            "127.0.0.1:6001",
            json!({"capabilities": ["udp", "json"], "pow": proof}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        assert!(state.peers.contains("127.0.0.1:6001"));
    }

    #[test]
    fn hello_with_foreign_pow_is_rejected() {
        let mut state = state_with(2, 8);
        // Proof mined for a different identity: digest check fails.
        let proof = pow::produce("someone-else", 2);
        let env = hello_env(
            "peer-1",
            "127.0.0.1:6001",
            json!({"capabilities": ["udp", "json"], "pow": proof}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        assert!(!state.peers.contains("127.0.0.1:6001"));
    }

    #[test]
    fn repeat_hello_updates_in_place() {
        let mut state = state_with(0, 8);
        let env = hello_env(
            "peer-1",
            "127.0.0.1:6001",
            json!({"capabilities": ["udp", "json"]}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        dispatch(&mut state, &env, "127.0.0.1:6001", 2000);
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peers.get("127.0.0.1:6001").unwrap().last_seen_ms, 2000);
    }

    #[test]
    fn get_peers_returns_list_excluding_requester() {
        let mut state = state_with(0, 8);
        for port in [6001, 6002, 6003] {
            seed_peer(&mut state, &format!("127.0.0.1:{}", port), 1000);
        }
        let env = Envelope::new(
            MsgType::GetPeers,
            "peer-1",
            "127.0.0.1:6001",
            1000,
            None,
            json!({"max_peers": 10}),
        );
        let out = dispatch(&mut state, &env, "127.0.0.1:6001", 1000);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "127.0.0.1:6001");
        assert_eq!(out[0].envelope.msg_type, MsgType::PeersList);
        let body: PeersListPayload = parse_payload(&out[0].envelope.payload).unwrap();
        assert_eq!(body.peers.len(), 2);
        assert!(body.peers.iter().all(|p| p.addr != "127.0.0.1:6001"));
    }

    #[test]
    fn get_peers_caps_at_peer_limit() {
        let mut state = state_with(0, 4);
        for port in 6001..6005 {
            seed_peer(&mut state, &format!("127.0.0.1:{}", port), 1000);
        }
        let env = Envelope::new(
            MsgType::GetPeers,
            "stranger",
            "127.0.0.1:7000",
            1000,
            None,
            json!({"max_peers": 1000}),
        );
        let out = dispatch(&mut state, &env, "127.0.0.1:7000", 1000);
        let body: PeersListPayload = parse_payload(&out[0].envelope.payload).unwrap();
        assert_eq!(body.peers.len(), 4);
    }

    #[test]
    fn peers_list_merge_counts_each_outcome() {
        let mut state = state_with(0, 8);
        seed_peer(&mut state, "127.0.0.1:6001", 1000);

        let payload = serde_json::to_value(PeersListPayload {
            peers: vec![
                // Already present: update.
                PeerEntry {
                    node_id: Some("n-1".into()),
                    addr: "127.0.0.1:6001".into(),
                },
                // New: add.
                PeerEntry {
                    node_id: None,
                    addr: "127.0.0.1:6002".into(),
                },
                // Our own address: ignored.
                PeerEntry {
                    node_id: None,
                    addr: "127.0.0.1:5000".into(),
                },
                // Garbage address: ignored.
                PeerEntry {
                    node_id: None,
                    addr: "not-an-addr".into(),
                },
            ],
        })
        .unwrap();
        let env = Envelope::new(
            MsgType::PeersList,
            "peer-1",
            "127.0.0.1:6001",
            1000,
            None,
            payload,
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1000);

        assert_eq!(state.peers.len(), 2);
        assert_eq!(
            state.peers.get("127.0.0.1:6001").unwrap().node_id.as_deref(),
            Some("n-1")
        );
        assert!(state.peers.contains("127.0.0.1:6002"));
        assert!(!state.peers.contains("127.0.0.1:5000"));
    }

    #[test]
    fn ping_is_echoed_as_pong() {
        let mut state = state_with(0, 8);
        seed_peer(&mut state, "127.0.0.1:6001", 500);
        let env = Envelope::new(
            MsgType::Ping,
            "peer-1",
            "127.0.0.1:6001",
            1000,
            None,
            json!({"ping_id": "p-7", "seq": 3}),
        );
        let out = dispatch(&mut state, &env, "127.0.0.1:6001", 1000);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].envelope.msg_type, MsgType::Pong);
        let echo: ProbePayload = parse_payload(&out[0].envelope.payload).unwrap();
        assert_eq!(echo.ping_id, "p-7");
        assert_eq!(echo.seq, 3);
        // Liveness evidence recorded.
        assert_eq!(state.peers.get("127.0.0.1:6001").unwrap().last_seen_ms, 1000);
    }

    #[test]
    fn ping_with_empty_ping_id_is_dropped() {
        let mut state = state_with(0, 8);
        let env = Envelope::new(
            MsgType::Ping,
            "peer-1",
            "127.0.0.1:6001",
            1000,
            None,
            json!({"ping_id": "", "seq": 0}),
        );
        assert!(dispatch(&mut state, &env, "127.0.0.1:6001", 1000).is_empty());
    }

    #[test]
    fn matched_pong_resets_failures_and_records_rtt() {
        let mut state = state_with(0, 8);
        seed_peer(&mut state, "127.0.0.1:6001", 1000);
        {
            let rec = state.peers.get_mut("127.0.0.1:6001").unwrap();
            rec.consecutive_ping_failures = 2;
            rec.pending_ping_id = Some("p-1".into());
            rec.pending_ping_seq = Some(5);
            rec.last_ping_sent_ms = Some(1000);
        }
        state.pending.insert("127.0.0.1:6001", "p-1", 1000);

        let env = Envelope::new(
            MsgType::Pong,
            "peer-1",
            "127.0.0.1:6001",
            1040,
            None,
            json!({"ping_id": "p-1", "seq": 5}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1040);

        let rec = state.peers.get("127.0.0.1:6001").unwrap();
        assert_eq!(rec.rtt_ms, Some(40));
        assert_eq!(rec.consecutive_ping_failures, 0);
        assert!(rec.pending_ping_id.is_none());
        assert!(state.pending.is_empty());
    }

    #[test]
    fn unmatched_pong_changes_nothing() {
        let mut state = state_with(0, 8);
        seed_peer(&mut state, "127.0.0.1:6001", 1000);
        let env = Envelope::new(
            MsgType::Pong,
            "peer-1",
            "127.0.0.1:6001",
            1040,
            None,
            json!({"ping_id": "never-sent", "seq": 0}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1040);
        let rec = state.peers.get("127.0.0.1:6001").unwrap();
        assert_eq!(rec.rtt_ms, None);
        assert_eq!(rec.consecutive_ping_failures, 0);
    }

    #[test]
    fn duplicate_pong_matches_only_once() {
        let mut state = state_with(0, 8);
        seed_peer(&mut state, "127.0.0.1:6001", 1000);
        {
            let rec = state.peers.get_mut("127.0.0.1:6001").unwrap();
            rec.pending_ping_id = Some("p-1".into());
            rec.pending_ping_seq = Some(0);
            rec.last_ping_sent_ms = Some(1000);
        }
        state.pending.insert("127.0.0.1:6001", "p-1", 1000);

        let env = Envelope::new(
            MsgType::Pong,
            "peer-1",
            "127.0.0.1:6001",
            1040,
            None,
            json!({"ping_id": "p-1", "seq": 0}),
        );
        dispatch(&mut state, &env, "127.0.0.1:6001", 1040);
        let rtt_after_first = state.peers.get("127.0.0.1:6001").unwrap().rtt_ms;
        dispatch(&mut state, &env, "127.0.0.1:6001", 2000);
        // Second copy is unmatched; RTT is untouched.
        assert_eq!(state.peers.get("127.0.0.1:6001").unwrap().rtt_ms, rtt_after_first);
    }

    #[test]
    fn ihave_routes_to_pull_engine() {
        let mut state = state_with(0, 8);
        let env = Envelope::new(
            MsgType::Ihave,
            "peer-1",
            "127.0.0.1:6001",
            1000,
            None,
            serde_json::to_value(IhavePayload {
                ids: vec!["m-1".into()],
                max_ids: 64,
            })
            .unwrap(),
        );
        let out = dispatch(&mut state, &env, "127.0.0.1:6001", 1000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].envelope.msg_type, MsgType::Iwant);
    }
}
