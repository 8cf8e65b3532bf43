//! # Wire Format — Envelope Codec
//!
//! Every datagram on the wire is one UTF-8 JSON envelope. This module owns
//! both directions: typed encode for outbound messages and a strict,
//! reason-coded decode for inbound bytes.
//!
//! ## Decode contract
//!
//! The receive path feeds raw bytes straight off the socket into
//! [`decode`]. Whatever arrives — binary garbage, truncated JSON, wrong
//! types, unknown message names — decode returns a [`DecodeError`] that
//! maps to exactly one drop reason. It never panics and the caller never
//! sees a raw serde error, which is why decoding goes through
//! `serde_json::Value` with explicit field checks instead of a derive:
//! a derive collapses every failure into one opaque error, and the event
//! sink needs to tell `invalid_json` from `invalid_schema` from
//! `unknown_type`.
//!
//! ## TTL scoping
//!
//! `ttl` is meaningful on `GOSSIP` only. On any other message type the
//! field is tolerated if present but dropped during decode, so handlers
//! never see it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::WIRE_VERSION;
use crate::pow::ProofOfWork;

// ---------------------------------------------------------------------------
// Message Types
// ---------------------------------------------------------------------------

/// The eight message types of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Hello,
    GetPeers,
    PeersList,
    Gossip,
    Ping,
    Pong,
    Ihave,
    Iwant,
}

impl MsgType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::GetPeers => "GET_PEERS",
            Self::PeersList => "PEERS_LIST",
            Self::Gossip => "GOSSIP",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::Ihave => "IHAVE",
            Self::Iwant => "IWANT",
        }
    }

    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "HELLO" => Some(Self::Hello),
            "GET_PEERS" => Some(Self::GetPeers),
            "PEERS_LIST" => Some(Self::PeersList),
            "GOSSIP" => Some(Self::Gossip),
            "PING" => Some(Self::Ping),
            "PONG" => Some(Self::Pong),
            "IHAVE" => Some(Self::Ihave),
            "IWANT" => Some(Self::Iwant),
            _ => None,
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The canonical message envelope.
///
/// `ttl` is `Some` only on `GOSSIP`; serialization omits it elsewhere.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub version: u64,
    pub msg_id: String,
    pub msg_type: MsgType,
    pub sender_id: String,
    pub sender_addr: String,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    pub payload: Value,
}

impl Envelope {
    /// Builds an envelope with a freshly minted `msg_id`.
    pub fn new(
        msg_type: MsgType,
        sender_id: &str,
        sender_addr: &str,
        timestamp_ms: u64,
        ttl: Option<i64>,
        payload: Value,
    ) -> Self {
        Self {
            version: WIRE_VERSION,
            msg_id: uuid::Uuid::new_v4().to_string(),
            msg_type,
            sender_id: sender_id.to_string(),
            sender_addr: sender_addr.to_string(),
            timestamp_ms,
            ttl,
            payload,
        }
    }

    /// Serializes the envelope to a datagram.
    ///
    /// Oversize is the sender's problem to avoid (gossip `data` is capped
    /// at origination); if an envelope still exceeds the budget we send it
    /// anyway and let the operator see the warning.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > crate::config::MAX_DATAGRAM_BYTES {
            tracing::warn!(
                msg_type = %self.msg_type,
                size = bytes.len(),
                budget = crate::config::MAX_DATAGRAM_BYTES,
                "datagram exceeds size budget"
            );
        }
        Ok(bytes)
    }
}

/// The local node's stable identity, stamped into every outbound envelope.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Opaque unique id (UUID-shaped), fixed for the process lifetime.
    pub node_id: String,
    /// Advertised `ip:port`.
    pub addr: String,
}

impl NodeIdentity {
    /// Mints a fresh identity for `addr`.
    pub fn generate(addr: &str) -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            addr: addr.to_string(),
        }
    }
}

/// An addressed envelope produced by a handler or engine.
///
/// Handlers never touch the socket; they return these and the runtime
/// performs the encode-and-send (and the `send_ok` / `send_error`
/// accounting) in one place.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Destination `ip:port`.
    pub to: String,
    /// The message to send.
    pub envelope: Envelope,
}

impl Outbound {
    pub fn new(to: &str, envelope: Envelope) -> Self {
        Self {
            to: to.to_string(),
            envelope,
        }
    }
}

// ---------------------------------------------------------------------------
// Decode Errors
// ---------------------------------------------------------------------------

/// Why inbound bytes failed to become an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The bytes are not parseable JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),

    /// A required field is missing, has the wrong type, or holds an
    /// unacceptable value.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// The `version` field is an integer but not ours.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(i64),

    /// `msg_type` is a string we do not recognize.
    #[error("unknown msg_type: {0}")]
    UnknownType(String),
}

impl DecodeError {
    /// Stable reason code for event records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "invalid_json",
            Self::InvalidSchema(_) => "invalid_schema",
            Self::UnsupportedVersion(_) => "unsupported_version",
            Self::UnknownType(_) => "unknown_type",
        }
    }

    /// Event name the receive path logs for this error. Version mismatch
    /// is a schema-level drop; it keeps its own reason code but shares the
    /// `recv_invalid_schema` record.
    pub fn event(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "recv_invalid_json",
            Self::InvalidSchema(_) | Self::UnsupportedVersion(_) => "recv_invalid_schema",
            Self::UnknownType(_) => "recv_unknown_type",
        }
    }
}

/// True when `s` looks like `host:port` with a parseable port.
pub fn is_valid_addr(s: &str) -> bool {
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn field<'a>(obj: &'a serde_json::Map<String, Value>, name: &str) -> Result<&'a Value, DecodeError> {
    obj.get(name)
        .ok_or_else(|| DecodeError::InvalidSchema(format!("missing field `{}`", name)))
}

fn string_field(obj: &serde_json::Map<String, Value>, name: &str) -> Result<String, DecodeError> {
    field(obj, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| DecodeError::InvalidSchema(format!("`{}` must be a string", name)))
}

/// Decodes and validates one datagram.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::InvalidSchema("envelope must be a JSON object".into()))?;

    let version = field(obj, "version")?
        .as_i64()
        .ok_or_else(|| DecodeError::InvalidSchema("`version` must be an integer".into()))?;
    if version != WIRE_VERSION as i64 {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let type_name = string_field(obj, "msg_type")?;
    let msg_type =
        MsgType::from_wire(&type_name).ok_or(DecodeError::UnknownType(type_name))?;

    let msg_id = string_field(obj, "msg_id")?;
    if msg_id.is_empty() {
        return Err(DecodeError::InvalidSchema("`msg_id` must be non-empty".into()));
    }

    let sender_id = string_field(obj, "sender_id")?;

    let sender_addr = string_field(obj, "sender_addr")?;
    if !is_valid_addr(&sender_addr) {
        return Err(DecodeError::InvalidSchema(
            "`sender_addr` must be `ip:port`".into(),
        ));
    }

    let timestamp_ms = field(obj, "timestamp_ms")?
        .as_u64()
        .ok_or_else(|| {
            DecodeError::InvalidSchema("`timestamp_ms` must be a non-negative integer".into())
        })?;

    // TTL: required non-negative integer on GOSSIP, ignored elsewhere.
    let ttl = if msg_type == MsgType::Gossip {
        let raw = field(obj, "ttl")?
            .as_i64()
            .ok_or_else(|| DecodeError::InvalidSchema("`ttl` must be an integer".into()))?;
        if raw < 0 {
            return Err(DecodeError::InvalidSchema("`ttl` must be >= 0".into()));
        }
        Some(raw)
    } else {
        None
    };

    let payload = field(obj, "payload")?;
    if !payload.is_object() {
        return Err(DecodeError::InvalidSchema("`payload` must be an object".into()));
    }

    Ok(Envelope {
        version: WIRE_VERSION,
        msg_id,
        msg_type,
        sender_id,
        sender_addr,
        timestamp_ms,
        ttl,
        payload: payload.clone(),
    })
}

// ---------------------------------------------------------------------------
// Payload Schemas
// ---------------------------------------------------------------------------

/// A payload failed its per-type validation after the envelope itself
/// decoded fine. Logged and dropped with reason `payload_invalid`.
#[derive(Debug, Error)]
#[error("invalid payload: {0}")]
pub struct PayloadError(pub String);

/// `HELLO` payload: advertised capabilities plus the optional admission
/// proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pow: Option<ProofOfWork>,
}

/// `GET_PEERS` payload: optional response size hint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetPeersPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_peers: Option<u64>,
}

/// One entry of a `PEERS_LIST` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    #[serde(default)]
    pub node_id: Option<String>,
    pub addr: String,
}

/// `PEERS_LIST` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersListPayload {
    pub peers: Vec<PeerEntry>,
}

/// `GOSSIP` payload: the rumor itself plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipPayload {
    pub topic: String,
    pub data: String,
    pub origin_id: String,
    pub origin_timestamp_ms: u64,
}

/// `PING` / `PONG` payload: correlation token plus per-peer sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbePayload {
    pub ping_id: String,
    pub seq: u64,
}

/// `IHAVE` payload: advertised message ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IhavePayload {
    pub ids: Vec<String>,
    pub max_ids: u64,
}

/// `IWANT` payload: requested message ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IwantPayload {
    pub ids: Vec<String>,
}

/// Parses a typed payload out of the envelope's raw JSON object.
///
/// Works for every payload struct above. Extra keys are tolerated (a newer
/// peer may send fields we don't know); missing or mistyped required keys
/// are a [`PayloadError`].
pub fn parse_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, PayloadError> {
    serde_json::from_value(payload.clone()).map_err(|e| PayloadError(e.to_string()))
}
