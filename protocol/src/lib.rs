// Copyright (c) 2026 Murmur Contributors. MIT License.
// See LICENSE for details.

//! # Murmur Protocol — Core Library
//!
//! The node runtime for murmur: a decentralized rumor-dissemination
//! network where each participant is one process speaking a small JSON
//! message family over UDP. Push gossip with dedup and TTL does the heavy
//! lifting; periodic `IHAVE`/`IWANT` pulls repair the holes; liveness
//! probing keeps the bounded peer table honest; and an optional
//! proof-of-work puzzle makes joining cost something.
//!
//! ## Architecture
//!
//! The modules mirror the concerns of the runtime:
//!
//! - **config** — protocol constants and the per-process `RuntimeConfig`.
//! - **time** — one monotonic, epoch-anchored millisecond clock.
//! - **rng** — the seeded RNG behind every sampling decision.
//! - **wire** — the envelope codec: typed encode, reason-coded decode.
//! - **pow** — SHA-256 leading-zeros admission puzzle.
//! - **events** — the append-only JSONL sink the experiment harness reads.
//! - **peer** — bounded peer table with a deterministic replacement policy.
//! - **gossip** — seen-set, known-messages, and the forwarding algorithm.
//! - **pull** — hybrid pull: advertise, request, fulfill.
//! - **liveness** — probe scheduling, timeout accounting, eviction.
//! - **dispatch** — routing from decoded envelope to handler.
//! - **node** — the runtime: socket, loops, bootstrap, shutdown.
//!
//! ## Design stance
//!
//! 1. The receive path never fails. Every malformed datagram becomes a
//!    logged drop, not an error and certainly not a crash.
//! 2. Engines return outbound batches instead of doing I/O, so every
//!    protocol decision is testable on a virtual clock.
//! 3. One mutex, whole-handler critical sections, no finer locking.
//!    Determinism beats cleverness in an experiment platform.

pub mod config;
pub mod dispatch;
pub mod events;
pub mod gossip;
pub mod liveness;
pub mod node;
pub mod peer;
pub mod pow;
pub mod pull;
pub mod rng;
pub mod time;
pub mod wire;

pub use config::RuntimeConfig;
pub use events::EventSink;
pub use node::{NodeError, NodeRuntime, NodeState};
pub use wire::{Envelope, MsgType, NodeIdentity, Outbound};
