//! # Liveness Scheduler
//!
//! Detects and removes dead peers. Each peer cycles through a tiny state
//! machine: idle → probing (a `PING` with a fresh correlation token) →
//! back to idle on a matched `PONG`, or one recorded failure when the
//! probe is still pending at the next tick. Failures are counted
//! consecutively; a matched `PONG` resets the count (that reset lives in
//! the PONG handler).
//!
//! Every tick runs three passes in a fixed order:
//!
//! 1. **Timeout** — probes pending for a full interval are declared
//!    failed: pending state is cleared and the failure count bumps.
//! 2. **Eviction** — peers silent beyond the timeout, or with too many
//!    consecutive failures, are removed from the table.
//! 3. **Probe** — every surviving peer without an in-flight probe gets a
//!    new one.
//!
//! The order matters: a probe that just timed out can push its peer over
//! the failure threshold and be evicted in the same tick, and a peer
//! evicted in pass 2 must not receive a fresh probe in pass 3.
//!
//! A failure is only ever declared at a tick boundary — there are no
//! per-send timers. Fresh peers enter the table with `last_seen_ms = now`
//! so they always survive the tick after their insertion.

use std::sync::Arc;

use serde_json::json;

use crate::config::MAX_PING_FAILURES;
use crate::events::EventSink;
use crate::peer::{EvictReason, PeerTable, PendingPings};
use crate::wire::{Envelope, MsgType, NodeIdentity, Outbound, ProbePayload};

/// Periodic probe/evict driver over the peer table.
pub struct LivenessScheduler {
    ping_interval_ms: u64,
    peer_timeout_ms: u64,
    sink: Arc<EventSink>,
}

impl LivenessScheduler {
    pub fn new(ping_interval_ms: u64, peer_timeout_ms: u64, sink: Arc<EventSink>) -> Self {
        Self {
            ping_interval_ms,
            peer_timeout_ms,
            sink,
        }
    }

    /// Runs one full tick and returns the probes to send.
    pub fn tick(
        &self,
        peers: &mut PeerTable,
        pending: &mut PendingPings,
        ident: &NodeIdentity,
        now_ms: u64,
    ) -> Vec<Outbound> {
        self.timeout_pass(peers, pending, now_ms);
        self.eviction_pass(peers, pending, now_ms);
        self.probe_pass(peers, pending, ident, now_ms)
    }

    /// Pass 1: account every probe that has been pending for a full
    /// interval as one failure.
    fn timeout_pass(&self, peers: &mut PeerTable, pending: &mut PendingPings, now_ms: u64) {
        for addr in peers.addrs() {
            let Some(rec) = peers.get_mut(&addr) else {
                continue;
            };
            let (Some(ping_id), Some(sent_ms)) =
                (rec.pending_ping_id.clone(), rec.last_ping_sent_ms)
            else {
                continue;
            };
            if now_ms.saturating_sub(sent_ms) < self.ping_interval_ms {
                continue;
            }

            rec.clear_pending_probe();
            rec.consecutive_ping_failures += 1;
            let failures = rec.consecutive_ping_failures;
            pending.take(&addr, &ping_id);

            self.sink.emit(
                "ping_timeout",
                json!({"addr": addr, "ping_id": ping_id, "failures": failures}),
            );
            tracing::debug!(addr = %addr, failures, "probe timed out");
        }
    }

    /// Pass 2: evict peers that are stale or persistently unresponsive.
    fn eviction_pass(&self, peers: &mut PeerTable, pending: &mut PendingPings, now_ms: u64) {
        for addr in peers.addrs() {
            let Some(rec) = peers.get(&addr) else {
                continue;
            };
            let reason = if rec.consecutive_ping_failures >= MAX_PING_FAILURES {
                Some(EvictReason::PingFailures)
            } else if rec.staleness_ms(now_ms) > self.peer_timeout_ms {
                Some(EvictReason::PeerTimeout)
            } else {
                None
            };
            if let Some(reason) = reason {
                peers.evict(&addr, reason, now_ms, pending);
            }
        }
    }

    /// Pass 3: start a probe toward every peer without one in flight.
    fn probe_pass(
        &self,
        peers: &mut PeerTable,
        pending: &mut PendingPings,
        ident: &NodeIdentity,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        for addr in peers.addrs() {
            let Some(rec) = peers.get_mut(&addr) else {
                continue;
            };
            if rec.pending_ping_id.is_some() {
                continue;
            }

            let ping_id = uuid::Uuid::new_v4().to_string();
            let seq = rec.next_ping_seq;
            rec.next_ping_seq += 1;
            rec.last_ping_sent_ms = Some(now_ms);
            rec.pending_ping_id = Some(ping_id.clone());
            rec.pending_ping_seq = Some(seq);
            pending.insert(&addr, &ping_id, now_ms);

            self.sink.emit(
                "ping_sent",
                json!({"target": addr, "ping_id": ping_id, "seq": seq}),
            );
            let payload = serde_json::to_value(ProbePayload {
                ping_id,
                seq,
            })
            .unwrap_or_default();
            out.push(Outbound::new(
                &addr,
                Envelope::new(
                    MsgType::Ping,
                    &ident.node_id,
                    &ident.addr,
                    now_ms,
                    None,
                    payload,
                ),
            ));
        }
        out
    }
}

impl std::fmt::Debug for LivenessScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessScheduler")
            .field("ping_interval_ms", &self.ping_interval_ms)
            .field("peer_timeout_ms", &self.peer_timeout_ms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{PeerRecord, PeerSource};

    const INTERVAL: u64 = 1000;
    const TIMEOUT: u64 = 6000;

    fn setup(n: usize, now: u64) -> (LivenessScheduler, PeerTable, PendingPings, NodeIdentity) {
        let sink = Arc::new(EventSink::disabled("self-node"));
        let scheduler = LivenessScheduler::new(INTERVAL, TIMEOUT, Arc::clone(&sink));
        let mut peers = PeerTable::new(64, TIMEOUT, "127.0.0.1:5000", sink);
        let mut pending = PendingPings::new();
        for i in 0..n {
            let addr = format!("127.0.0.1:{}", 6000 + i);
            peers.insert_new(PeerRecord::new(&addr, PeerSource::PeersList, now), now, &mut pending);
        }
        let ident = NodeIdentity {
            node_id: "self-node".to_string(),
            addr: "127.0.0.1:5000".to_string(),
        };
        (scheduler, peers, pending, ident)
    }

    #[test]
    fn first_tick_probes_every_peer() {
        let (s, mut peers, mut pending, ident) = setup(3, 1000);
        let out = s.tick(&mut peers, &mut pending, &ident, 1000);

        assert_eq!(out.len(), 3);
        assert_eq!(pending.len(), 3);
        for o in &out {
            assert_eq!(o.envelope.msg_type, MsgType::Ping);
        }
        for rec in peers.iter() {
            assert!(rec.pending_ping_id.is_some());
            assert_eq!(rec.pending_ping_seq, Some(0));
            assert_eq!(rec.last_ping_sent_ms, Some(1000));
            assert_eq!(rec.next_ping_seq, 1);
        }
    }

    #[test]
    fn pending_probe_is_not_reprobed_early() {
        let (s, mut peers, mut pending, ident) = setup(1, 1000);
        s.tick(&mut peers, &mut pending, &ident, 1000);
        // Half an interval later: probe still pending, nothing new sent,
        // but nothing timed out either.
        let out = s.tick(&mut peers, &mut pending, &ident, 1500);
        assert!(out.is_empty());
        assert_eq!(
            peers.get("127.0.0.1:6000").unwrap().consecutive_ping_failures,
            0
        );
    }

    #[test]
    fn timeout_pass_accounts_failure_and_reprobes() {
        let (s, mut peers, mut pending, ident) = setup(1, 1000);
        s.tick(&mut peers, &mut pending, &ident, 1000);

        // One interval later with no PONG: failure, then a fresh probe.
        let out = s.tick(&mut peers, &mut pending, &ident, 2000);
        assert_eq!(out.len(), 1);
        let rec = peers.get("127.0.0.1:6000").unwrap();
        assert_eq!(rec.consecutive_ping_failures, 1);
        assert_eq!(rec.pending_ping_seq, Some(1));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn three_failures_evict_on_the_next_tick() {
        let (s, mut peers, mut pending, ident) = setup(1, 1000);
        // Keep last_seen fresh so only the failure path can evict.
        let mut now = 1000;
        for _ in 0..3 {
            peers.touch("127.0.0.1:6000", now);
            s.tick(&mut peers, &mut pending, &ident, now);
            now += INTERVAL;
        }
        // Fourth tick: the third timeout fires in pass 1 (failures reach
        // 3) and pass 2 evicts in the same tick.
        peers.touch("127.0.0.1:6000", now - 100);
        s.tick(&mut peers, &mut pending, &ident, now);
        assert!(peers.is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn stale_peer_is_evicted_even_without_failures() {
        let (s, mut peers, mut pending, ident) = setup(1, 1000);
        let now = 1000 + TIMEOUT + 1;
        let out = s.tick(&mut peers, &mut pending, &ident, now);
        assert!(peers.is_empty());
        assert!(out.is_empty());
    }

    #[test]
    fn fresh_peer_survives_the_next_tick() {
        let (s, mut peers, mut pending, ident) = setup(1, 1000);
        // Grace: inserted at t=1000, first tick shortly after must probe,
        // not evict.
        let out = s.tick(&mut peers, &mut pending, &ident, 1001);
        assert_eq!(out.len(), 1);
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn evicted_peer_is_not_probed_in_the_same_tick() {
        let (s, mut peers, mut pending, ident) = setup(2, 1000);
        // 6000 goes stale; 6001 stays fresh.
        let now = 1000 + TIMEOUT + 1;
        peers.touch("127.0.0.1:6001", now);
        let out = s.tick(&mut peers, &mut pending, &ident, now);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "127.0.0.1:6001");
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn seq_is_monotonic_per_peer() {
        let (s, mut peers, mut pending, ident) = setup(1, 1000);
        let mut now = 1000;
        for expected_seq in 0..3u64 {
            peers.touch("127.0.0.1:6000", now);
            let out = s.tick(&mut peers, &mut pending, &ident, now);
            let probe: ProbePayload =
                crate::wire::parse_payload(&out[0].envelope.payload).unwrap();
            assert_eq!(probe.seq, expected_seq);
            now += INTERVAL;
            // Fail the pending probe so the next tick reprobes. Keep the
            // failure count below the eviction threshold.
            if expected_seq == 1 {
                peers.get_mut("127.0.0.1:6000").unwrap().consecutive_ping_failures = 0;
            }
        }
    }
}
