//! # Collaborator Traits
//!
//! The seams between the engine and its environment. The engine core is
//! generic over these so tests drive it with in-memory fakes and a
//! deployment plugs in real storage, identity, and transport.
//!
//! | Trait              | Concern                                   |
//! |--------------------|-------------------------------------------|
//! | [`EventStore`]     | Durable append-only event storage         |
//! | [`IdentityProvider`] | Caller authentication and defaults      |
//! | [`PeerRpc`]        | Point-to-point frames between mesh nodes  |

use async_trait::async_trait;

use crate::identifier::{EventId, Prefix};
use crate::messages::{EventRecord, ForwardFrame, RelayFrame};
use crate::routing::PeerContact;

/// Storage failures surfaced to publishers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An event with this identifier already exists. Identifiers carry 128
    /// random bits, so a collision means a duplicate publish, not chance.
    DuplicateId,
    /// The store refused the write (capacity, backend fault).
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateId => write!(f, "event id already exists"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Append-only event storage, ordered by identifier.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a record. Duplicate identifiers are rejected.
    async fn append(&self, record: EventRecord) -> Result<(), StoreError>;

    /// Fetch a single record by exact identifier.
    async fn get_by_id(&self, id: &EventId) -> Option<EventRecord>;

    /// All stored records whose identifier falls under the prefix, in
    /// ascending identifier order.
    async fn get_by_prefix_range(&self, prefix: &Prefix) -> Vec<EventRecord>;
}

/// An authenticated caller and the defaults attached to its credential.
#[derive(Debug, Clone)]
pub struct Caller {
    pub agent_id: String,
    /// Prefix applied when a publish names no explicit target.
    pub default_prefix: Option<Prefix>,
}

/// Maps presented credentials to caller identities.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve a credential to a caller, or `None` if unknown.
    async fn resolve_caller(&self, credential: &str) -> Option<Caller>;
}

/// Point-to-point requests between mesh nodes. Implementations own
/// serialization and transport; the engine only sees typed frames.
#[async_trait]
pub trait PeerRpc: Send + Sync + 'static {
    /// Hand a subscription to a peer for matching against its local state.
    async fn send_forward(&self, peer: &PeerContact, frame: ForwardFrame) -> anyhow::Result<()>;

    /// Relay a matched event back along the forwarding chain.
    async fn send_relay(&self, peer: &PeerContact, frame: RelayFrame) -> anyhow::Result<()>;

    /// Liveness check, used for bucket eviction decisions.
    async fn ping(&self, peer: &PeerContact) -> anyhow::Result<()>;
}
