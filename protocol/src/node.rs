//! # Node Runtime
//!
//! The top-level runtime entity for one murmur participant. Owns the UDP
//! endpoint, the mutable node state, and the periodic loops, and glues
//! them together:
//!
//! ```text
//! datagram → decode → dispatch → state mutation → outbound batch → send
//! ```
//!
//! ## Concurrency model
//!
//! Logically single-threaded and cooperative. All mutable state — peer
//! table, message store, pending probes, RNG — lives in one [`NodeState`]
//! behind a single mutex that is held for a whole handler invocation and
//! released before any socket I/O. The receive loop, the three periodic
//! loops (liveness, pull, discovery), and stdin origination interleave
//! only at their await points, so every handler sees a consistent
//! snapshot from entry to exit and no finer-grained locking exists
//! anywhere.
//!
//! ## Failure posture
//!
//! Nothing inside the running loops may terminate the process. Malformed
//! datagrams are logged and dropped at the decode boundary; send failures
//! are logged and abandoned; the only fatal errors are bind and sink
//! setup, both of which happen before the loops start.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{RuntimeConfig, CAPABILITY_JSON, CAPABILITY_UDP, DEFAULT_TOPIC, MAX_DATAGRAM_BYTES};
use crate::dispatch::dispatch;
use crate::events::{EventSink, EventSinkError};
use crate::gossip::{GossipEngine, InMemoryStore};
use crate::liveness::LivenessScheduler;
use crate::peer::{PeerRecord, PeerSource, PeerTable, PendingPings};
use crate::pow;
use crate::pull::PullEngine;
use crate::rng::SeededRng;
use crate::time::Clock;
use crate::wire::{self, Envelope, GetPeersPayload, HelloPayload, MsgType, NodeIdentity, Outbound};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Fatal startup failures. Everything after a successful [`NodeRuntime::bind`]
/// is recovered locally.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The UDP socket could not be bound.
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// The JSONL event sink could not be opened.
    #[error(transparent)]
    Sink(#[from] EventSinkError),
}

// ---------------------------------------------------------------------------
// Node State
// ---------------------------------------------------------------------------

/// All mutable state of one node, owned by the runtime's single mutex.
#[derive(Debug)]
pub struct NodeState {
    pub ident: NodeIdentity,
    pub cfg: RuntimeConfig,
    pub peers: PeerTable,
    pub pending: PendingPings,
    pub gossip: GossipEngine,
    pub pull: PullEngine,
    pub rng: SeededRng,
    pub sink: Arc<EventSink>,
}

impl NodeState {
    /// State with a disabled event sink. The runtime goes through
    /// [`NodeState::with_sink`]; this constructor is for tests that drive
    /// handlers directly.
    pub fn new(cfg: &RuntimeConfig) -> Self {
        let ident = NodeIdentity::generate(&cfg.self_addr());
        let sink = Arc::new(EventSink::disabled(&ident.node_id));
        Self::with_sink(cfg.clone(), ident, sink)
    }

    pub fn with_sink(cfg: RuntimeConfig, ident: NodeIdentity, sink: Arc<EventSink>) -> Self {
        let peers = PeerTable::new(
            cfg.peer_limit,
            cfg.peer_timeout_ms(),
            &ident.addr,
            Arc::clone(&sink),
        );
        let gossip = GossipEngine::new(
            cfg.fanout,
            cfg.ttl,
            Box::new(InMemoryStore::new()),
            Arc::clone(&sink),
        );
        let pull = PullEngine::new(cfg.fanout, cfg.ids_max_ihave, Arc::clone(&sink));
        let rng = SeededRng::from_seed(cfg.seed);
        Self {
            ident,
            cfg,
            peers,
            pending: PendingPings::new(),
            gossip,
            pull,
            rng,
            sink,
        }
    }
}

// ---------------------------------------------------------------------------
// Node Runtime
// ---------------------------------------------------------------------------

/// One running murmur node: socket, state, and loops.
#[derive(Debug)]
pub struct NodeRuntime {
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<NodeState>>,
    liveness: Arc<LivenessScheduler>,
    clock: Clock,
    sink: Arc<EventSink>,
    cfg: RuntimeConfig,
    ident: NodeIdentity,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Binds the socket and opens the event sink. The two fatal error
    /// paths of the whole program live here.
    pub async fn bind(cfg: RuntimeConfig) -> Result<Self, NodeError> {
        let self_addr = cfg.self_addr();
        let ident = NodeIdentity::generate(&self_addr);

        let sink = match &cfg.log_dir {
            Some(dir) => Arc::new(EventSink::create(dir, cfg.port, &ident.node_id)?),
            None => Arc::new(EventSink::disabled(&ident.node_id)),
        };

        let socket = UdpSocket::bind(&self_addr)
            .await
            .map_err(|e| NodeError::Bind {
                addr: self_addr.clone(),
                source: e,
            })?;
        tracing::info!(addr = %self_addr, node_id = %ident.node_id, "node listening");

        let liveness = Arc::new(LivenessScheduler::new(
            cfg.ping_interval_ms(),
            cfg.peer_timeout_ms(),
            Arc::clone(&sink),
        ));
        let state = Arc::new(Mutex::new(NodeState::with_sink(
            cfg.clone(),
            ident.clone(),
            Arc::clone(&sink),
        )));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            socket: Arc::new(socket),
            state,
            liveness,
            clock: Clock::new(),
            sink,
            cfg,
            ident,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// This node's identity.
    pub fn identity(&self) -> &NodeIdentity {
        &self.ident
    }

    /// Path of the JSONL event file, when one is open.
    pub fn event_log_path(&self) -> Option<std::path::PathBuf> {
        self.sink.path().map(|p| p.to_path_buf())
    }

    /// Effective configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    /// Spawns the receive loop and the three periodic loops, then runs
    /// the bootstrap handshake. Returns once everything is started.
    pub async fn start(&self) {
        let mut tasks = vec![
            self.spawn_recv_loop(),
            self.spawn_liveness_loop(),
            self.spawn_pull_loop(),
            self.spawn_discovery_loop(),
        ];
        self.bootstrap().await;
        self.tasks.lock().append(&mut tasks);
    }

    /// Signals every loop to exit and waits for them. Idempotent.
    /// In-flight pending probes are simply discarded — no failure
    /// accounting happens after shutdown.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(node_id = %self.ident.node_id, "node stopped");
    }

    // -- receive path -------------------------------------------------------

    fn spawn_recv_loop(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let clock = self.clock.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            // Envelopes target 1200 bytes; anything bigger is still read
            // whole so a jumbo datagram cannot wedge the socket.
            let mut buf = vec![0u8; MAX_DATAGRAM_BYTES * 4];
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    result = socket.recv_from(&mut buf) => {
                        let (len, src) = match result {
                            Ok(ok) => ok,
                            Err(e) => {
                                tracing::warn!(error = %e, "recv_from failed");
                                continue;
                            }
                        };
                        let from_addr = src.to_string();
                        let now_ms = clock.now_ms();

                        let env = match wire::decode(&buf[..len]) {
                            Ok(env) => env,
                            Err(e) => {
                                sink.emit(
                                    e.event(),
                                    json!({
                                        "from": from_addr,
                                        "reason": e.reason(),
                                        "detail": e.to_string(),
                                    }),
                                );
                                tracing::debug!(from = %from_addr, reason = e.reason(), "datagram dropped");
                                continue;
                            }
                        };
                        sink.emit(
                            "recv_ok",
                            json!({
                                "from": from_addr,
                                "msg_type": env.msg_type.as_str(),
                                "msg_id": env.msg_id,
                            }),
                        );

                        let outbound = {
                            let mut st = state.lock();
                            dispatch(&mut st, &env, &from_addr, now_ms)
                        };
                        send_batch(&socket, &sink, outbound).await;
                    }
                }
            }
        })
    }

    // -- periodic loops -----------------------------------------------------

    fn spawn_liveness_loop(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let liveness = Arc::clone(&self.liveness);
        let clock = self.clock.clone();
        let ident = self.ident.clone();
        let period = std::time::Duration::from_millis(self.cfg.ping_interval_ms().max(1));
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let now_ms = clock.now_ms();
                        let outbound = {
                            let mut st = state.lock();
                            let st = &mut *st;
                            liveness.tick(&mut st.peers, &mut st.pending, &ident, now_ms)
                        };
                        send_batch(&socket, &sink, outbound).await;
                    }
                }
            }
        })
    }

    fn spawn_pull_loop(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let clock = self.clock.clone();
        let ident = self.ident.clone();
        let period = std::time::Duration::from_millis(self.cfg.pull_interval_ms().max(1));
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let now_ms = clock.now_ms();
                        let outbound = {
                            let mut st = state.lock();
                            let st = &mut *st;
                            st.pull.tick(st.gossip.store(), &st.peers, &mut st.rng, &ident, now_ms)
                        };
                        send_batch(&socket, &sink, outbound).await;
                    }
                }
            }
        })
    }

    /// Discovery keeps asking random peers for addresses while the table
    /// is below its cap. At the cap it goes quiet.
    fn spawn_discovery_loop(&self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let clock = self.clock.clone();
        let ident = self.ident.clone();
        let peer_limit = self.cfg.peer_limit;
        let period = std::time::Duration::from_millis(self.cfg.discovery_interval_ms().max(1));
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let now_ms = clock.now_ms();
                        let outbound = {
                            let mut st = state.lock();
                            let st = &mut *st;
                            if st.peers.is_empty() || st.peers.len() >= peer_limit {
                                Vec::new()
                            } else {
                                let pool = st.peers.addrs();
                                match st.rng.pick(&pool) {
                                    Some(target) => {
                                        let want = (peer_limit - st.peers.len()) as u64;
                                        sink.emit(
                                            "discovery_get_peers_sent",
                                            json!({"target": target, "max_peers": want}),
                                        );
                                        let payload = serde_json::to_value(GetPeersPayload {
                                            max_peers: Some(want),
                                        })
                                        .unwrap_or_default();
                                        vec![Outbound::new(
                                            target,
                                            Envelope::new(
                                                MsgType::GetPeers,
                                                &ident.node_id,
                                                &ident.addr,
                                                now_ms,
                                                None,
                                                payload,
                                            ),
                                        )]
                                    }
                                    None => Vec::new(),
                                }
                            }
                        };
                        send_batch(&socket, &sink, outbound).await;
                    }
                }
            }
        })
    }

    // -- bootstrap ----------------------------------------------------------

    /// Sends `HELLO` (with a mined proof when PoW is on) and `GET_PEERS`
    /// to the configured entry node. A node that is its own bootstrap
    /// skips the handshake entirely. An unreachable bootstrap is a
    /// `send_error`, not a fatal condition — the node keeps running and
    /// waits to be found.
    async fn bootstrap(&self) {
        let bootstrap_addr = self.cfg.bootstrap_addr.clone();
        if bootstrap_addr == self.ident.addr {
            tracing::info!("acting as bootstrap seed, no handshake");
            return;
        }

        let now_ms = self.clock.now_ms();
        let outbound = {
            let mut st = self.state.lock();
            let st = &mut *st;
            if !st.peers.contains(&bootstrap_addr) {
                let rec = PeerRecord::new(&bootstrap_addr, PeerSource::Bootstrap, now_ms);
                st.peers.insert_new(rec, now_ms, &mut st.pending);
            }

            // Mining runs once, before the loops care about latency.
            let proof = (self.cfg.k_pow > 0)
                .then(|| pow::produce(&self.ident.node_id, self.cfg.k_pow));
            let hello = serde_json::to_value(HelloPayload {
                capabilities: vec![CAPABILITY_UDP.to_string(), CAPABILITY_JSON.to_string()],
                pow: proof,
            })
            .unwrap_or_default();
            let get_peers = serde_json::to_value(GetPeersPayload {
                max_peers: Some(self.cfg.peer_limit as u64),
            })
            .unwrap_or_default();

            self.sink
                .emit("bootstrap_hello_sent", json!({"target": bootstrap_addr}));
            self.sink.emit(
                "bootstrap_get_peers_sent",
                json!({"target": bootstrap_addr, "max_peers": self.cfg.peer_limit}),
            );

            vec![
                Outbound::new(
                    &bootstrap_addr,
                    Envelope::new(
                        MsgType::Hello,
                        &self.ident.node_id,
                        &self.ident.addr,
                        now_ms,
                        None,
                        hello,
                    ),
                ),
                Outbound::new(
                    &bootstrap_addr,
                    Envelope::new(
                        MsgType::GetPeers,
                        &self.ident.node_id,
                        &self.ident.addr,
                        now_ms,
                        None,
                        get_peers,
                    ),
                ),
            ]
        };
        send_batch(&self.socket, &self.sink, outbound).await;
    }

    // -- origination --------------------------------------------------------

    /// Originates one rumor from a line of local input. Empty lines
    /// (after trimming) are ignored.
    pub async fn originate(&self, line: &str) {
        let text = line.trim();
        if text.is_empty() {
            return;
        }
        let now_ms = self.clock.now_ms();
        let outbound = {
            let mut st = self.state.lock();
            let st = &mut *st;
            st.gossip
                .originate(DEFAULT_TOPIC, text, &st.ident, &st.peers, &mut st.rng, now_ms)
        };
        send_batch(&self.socket, &self.sink, outbound).await;
    }

    /// Current peer count, for the banner and tests.
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// True once `msg_id` has been processed by this node.
    pub fn has_seen(&self, msg_id: &str) -> bool {
        self.state.lock().gossip.store().contains(msg_id)
    }

    /// Number of rumors this node has stored.
    pub fn known_message_count(&self) -> usize {
        self.state.lock().gossip.store().len()
    }
}

/// Encodes and sends a batch, recording one `send_ok` / `send_error` per
/// envelope. Failures abandon the send; there are no retries.
async fn send_batch(socket: &UdpSocket, sink: &EventSink, batch: Vec<Outbound>) {
    for out in batch {
        let bytes = match out.envelope.encode() {
            Ok(b) => b,
            Err(e) => {
                sink.emit(
                    "send_error",
                    json!({"target": out.to, "error": e.to_string()}),
                );
                continue;
            }
        };
        match socket.send_to(&bytes, &out.to).await {
            Ok(_) => {
                sink.emit(
                    "send_ok",
                    json!({
                        "target": out.to,
                        "msg_type": out.envelope.msg_type.as_str(),
                        "msg_id": out.envelope.msg_id,
                        "bytes": bytes.len(),
                    }),
                );
            }
            Err(e) => {
                sink.emit(
                    "send_error",
                    json!({"target": out.to, "error": e.to_string()}),
                );
                tracing::debug!(target = %out.to, error = %e, "send failed");
            }
        }
    }
}
