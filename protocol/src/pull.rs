//! # Hybrid Pull Engine
//!
//! Push gossip alone leaves holes: a node that joins late, or sits behind
//! a lossy link, misses rumors it will never be pushed again. The pull
//! side repairs those holes. Periodically each node advertises the ids it
//! knows (`IHAVE`); a receiver that is missing some asks for them
//! (`IWANT`); the advertiser answers with the full rumors at `ttl = 1`,
//! which delivers to the requester without re-igniting the flood.
//!
//! Advertisements are capped at `ids_max_ihave`, most recently first-seen
//! first — recent rumors are the ones still propagating, so they are the
//! ones worth repairing.

use std::sync::Arc;

use serde_json::json;

use crate::events::EventSink;
use crate::gossip::MessageStore;
use crate::peer::PeerTable;
use crate::rng::SeededRng;
use crate::wire::{
    parse_payload, Envelope, GossipPayload, IhavePayload, IwantPayload, MsgType, NodeIdentity,
    Outbound,
};

/// Periodic advertisement and repair of missed rumors.
pub struct PullEngine {
    fanout: usize,
    ids_max_ihave: usize,
    sink: Arc<EventSink>,
}

impl PullEngine {
    pub fn new(fanout: usize, ids_max_ihave: usize, sink: Arc<EventSink>) -> Self {
        Self {
            fanout,
            ids_max_ihave,
            sink,
        }
    }

    /// One advertisement round: `IHAVE` to up to `fanout` random peers.
    /// Nothing is sent while the store is empty — an empty advertisement
    /// can repair nothing.
    pub fn tick(
        &self,
        store: &dyn MessageStore,
        peers: &PeerTable,
        rng: &mut SeededRng,
        ident: &NodeIdentity,
        now_ms: u64,
    ) -> Vec<Outbound> {
        if store.len() == 0 || peers.is_empty() {
            return Vec::new();
        }

        let ids = store.recent_ids(self.ids_max_ihave);
        let payload = serde_json::to_value(IhavePayload {
            ids: ids.clone(),
            max_ids: self.ids_max_ihave as u64,
        })
        .unwrap_or_default();

        let targets = peers.sample(rng, &[], self.fanout);
        targets
            .into_iter()
            .map(|target| {
                self.sink.emit(
                    "ihave_sent",
                    json!({"target": target, "id_count": ids.len()}),
                );
                Outbound::new(
                    &target,
                    Envelope::new(
                        MsgType::Ihave,
                        &ident.node_id,
                        &ident.addr,
                        now_ms,
                        None,
                        payload.clone(),
                    ),
                )
            })
            .collect()
    }

    /// Answers an `IHAVE`: request whatever we have not seen.
    pub fn handle_ihave(
        &self,
        env: &Envelope,
        from_addr: &str,
        store: &dyn MessageStore,
        ident: &NodeIdentity,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let payload: IhavePayload = match parse_payload(&env.payload) {
            Ok(p) => p,
            Err(e) => {
                self.sink.emit(
                    "recv_invalid_schema",
                    json!({"reason": "payload_invalid", "msg_type": "IHAVE", "detail": e.to_string()}),
                );
                return Vec::new();
            }
        };

        let missing: Vec<String> = payload
            .ids
            .into_iter()
            .filter(|id| !store.contains(id))
            .collect();
        if missing.is_empty() {
            tracing::trace!(from = from_addr, "IHAVE carried nothing new");
            return Vec::new();
        }

        self.sink.emit(
            "iwant_sent",
            json!({"target": from_addr, "id_count": missing.len()}),
        );
        let payload = serde_json::to_value(IwantPayload { ids: missing }).unwrap_or_default();
        vec![Outbound::new(
            from_addr,
            Envelope::new(
                MsgType::Iwant,
                &ident.node_id,
                &ident.addr,
                now_ms,
                None,
                payload,
            ),
        )]
    }

    /// Fulfills an `IWANT`: one `GOSSIP` per known id, original payload,
    /// `ttl = 1` so the requester gets the rumor without re-flooding it.
    /// Ids we no longer know are skipped quietly.
    pub fn handle_iwant(
        &self,
        env: &Envelope,
        from_addr: &str,
        store: &dyn MessageStore,
        ident: &NodeIdentity,
        now_ms: u64,
    ) -> Vec<Outbound> {
        let payload: IwantPayload = match parse_payload(&env.payload) {
            Ok(p) => p,
            Err(e) => {
                self.sink.emit(
                    "recv_invalid_schema",
                    json!({"reason": "payload_invalid", "msg_type": "IWANT", "detail": e.to_string()}),
                );
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        let mut unknown = 0usize;
        for id in &payload.ids {
            let Some(stored) = store.get(id) else {
                tracing::debug!(msg_id = %id, from = from_addr, "IWANT for unknown id");
                unknown += 1;
                continue;
            };
            let gossip = serde_json::to_value(GossipPayload {
                topic: stored.topic.clone(),
                data: stored.data.clone(),
                origin_id: stored.origin_id.clone(),
                origin_timestamp_ms: stored.origin_timestamp_ms,
            })
            .unwrap_or_default();
            let mut envelope = Envelope::new(
                MsgType::Gossip,
                &ident.node_id,
                &ident.addr,
                now_ms,
                Some(1),
                gossip,
            );
            envelope.msg_id = stored.msg_id.clone();
            out.push(Outbound::new(from_addr, envelope));
        }

        self.sink.emit(
            "iwant_served",
            json!({"target": from_addr, "served": out.len(), "unknown": unknown}),
        );
        out
    }
}

impl std::fmt::Debug for PullEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullEngine")
            .field("fanout", &self.fanout)
            .field("ids_max_ihave", &self.ids_max_ihave)
            .finish()
    }
}
