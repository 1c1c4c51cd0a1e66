//! # Wire Message Shapes
//!
//! Logical message shapes exchanged with clients and peers, independent of
//! any particular transport framing. Serialization uses bincode with size
//! limits to prevent memory exhaustion from untrusted input.
//!
//! | Direction | Request | Response |
//! |-----------|---------|----------|
//! | Client → engine | [`SubscribeRequest`] | [`SubscribeResponse`] |
//! | Peer → engine | [`PeerRequest`] | [`PeerResponse`] |
//! | Engine → peer | [`ForwardFrame`] / [`RelayFrame`] | ack or timeout |
//!
//! ## Security Limits
//!
//! - `MAX_BODY_SIZE`: maximum event payload (64 KiB)
//! - `MAX_DESERIALIZE_SIZE`: deserialization buffer bound
//! - All deserialization of untrusted bytes goes through `deserialize_bounded`

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::identifier::{EventId, Prefix, PrefixError, PrefixFormat};
use crate::routing::PeerContact;

/// Maximum event body size (64 KiB).
/// SECURITY: Prevents memory exhaustion from large publishes.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_BODY_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_BODY_SIZE as u64) + 4096;

/// Maximum proof size accepted at the boundary.
pub const MAX_PROOF_SIZE: usize = 1024;

/// Opaque reference identifying one forwarded subscription across hops.
pub type ForwardRef = [u8; 16];

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(value)
}

/// An immutable, append-only log entry. Never updated or deleted by the
/// engine; retention is the storage collaborator's policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    /// UTC instant as milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    /// Opaque binary payload. Encryption, if any, happens before the engine.
    pub body: Vec<u8>,
}

impl EventRecord {
    pub fn new(id: EventId, body: Vec<u8>) -> Self {
        Self {
            id,
            timestamp_ms: now_ms(),
            body,
        }
    }
}

/// Transport-facing event shape: hex id, base64 body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: String,
    pub timestamp_ms: u64,
    pub body: String,
}

impl WireEvent {
    pub fn from_record(record: &EventRecord) -> Self {
        use base64::Engine as _;
        Self {
            id: record.id.to_hex(),
            timestamp_ms: record.timestamp_ms,
            body: base64::engine::general_purpose::STANDARD.encode(&record.body),
        }
    }

    pub fn into_record(self) -> Result<EventRecord, WireError> {
        use base64::Engine as _;
        let id = EventId::from_hex(&self.id).map_err(|_| WireError::BadId)?;
        let body = base64::engine::general_purpose::STANDARD
            .decode(&self.body)
            .map_err(|_| WireError::BadBody)?;
        if body.len() > MAX_BODY_SIZE {
            return Err(WireError::BodyTooLarge { size: body.len() });
        }
        Ok(EventRecord {
            id,
            timestamp_ms: self.timestamp_ms,
            body,
        })
    }
}

/// Reasons a wire event fails decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    BadId,
    BadBody,
    BodyTooLarge { size: usize },
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::BadId => write!(f, "event id is not a 64-char hex string"),
            WireError::BadBody => write!(f, "event body is not valid base64"),
            WireError::BodyTooLarge { size } => {
                write!(f, "event body too large: {size} bytes (max {MAX_BODY_SIZE})")
            }
        }
    }
}

impl std::error::Error for WireError {}

/// How long a subscription stays live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeMode {
    /// Catch-up query: satisfied once from history, or registered until the
    /// first live match.
    OneShot,
    /// Live watch: delivers every match until expiry or cancellation.
    Stream,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Prefix in the encoding named by `format`.
    pub prefix: String,
    pub format: PrefixFormat,
    /// Opaque proof-of-knowledge bytes, checked by the engine's verifier.
    pub proof: Vec<u8>,
    pub mode: SubscribeMode,
    /// For catch-up: only return events strictly newer than this.
    pub since_ms: Option<u64>,
    /// For catch-up: cap on returned events (default applied by the engine).
    pub limit: Option<usize>,
}

/// Rejection reasons surfaced to the requester, never internal errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Prefix bit-length below the subscribable minimum.
    PrefixTooShort,
    /// Proof did not demonstrate knowledge of an identifier under the prefix.
    ProofInvalid,
    /// Prefix could not be decoded, or exceeds identifier width.
    MalformedPrefix,
}

impl From<PrefixError> for RejectReason {
    fn from(err: PrefixError) -> Self {
        match err {
            PrefixError::TooShort { .. } => RejectReason::PrefixTooShort,
            PrefixError::TooLong { .. } | PrefixError::Malformed => RejectReason::MalformedPrefix,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscribeStatus {
    /// At least one matching event existed locally.
    Matched,
    /// Registered; no local match yet (possibly forwarded to peers).
    Pending,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub status: SubscribeStatus,
    pub reason: Option<RejectReason>,
}

impl SubscribeResponse {
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            status: SubscribeStatus::Rejected,
            reason: Some(reason),
        }
    }

    pub fn ok(status: SubscribeStatus) -> Self {
        Self {
            status,
            reason: None,
        }
    }
}

/// A subscription forwarded toward peers closer to its prefix.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardFrame {
    pub forward_ref: ForwardRef,
    /// Significant prefix bytes (bit length rounded up to whole bytes).
    pub prefix_bytes: Vec<u8>,
    pub prefix_bits: u16,
    pub proof: Vec<u8>,
    /// Absolute expiry, milliseconds since Unix epoch.
    pub expires_ms: u64,
}

impl ForwardFrame {
    pub fn prefix(&self) -> Result<Prefix, PrefixError> {
        Prefix::new(&self.prefix_bytes, self.prefix_bits)
    }
}

/// A matching event relayed back along a forwarded subscription's path.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFrame {
    pub forward_ref: ForwardRef,
    pub event: WireEvent,
}

/// Requests arriving from peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    Forward {
        from: PeerContact,
        frame: ForwardFrame,
    },
    Relay {
        from: PeerContact,
        frame: RelayFrame,
    },
    /// Liveness check, used for bucket eviction decisions.
    Ping { from: PeerContact },
}

impl PeerRequest {
    pub fn sender(&self) -> &PeerContact {
        match self {
            PeerRequest::Forward { from, .. } => from,
            PeerRequest::Relay { from, .. } => from,
            PeerRequest::Ping { from } => from,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    Ack,
    Error { message: String },
}
