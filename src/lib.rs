//! # Flowmesh - Decentralized Prefix-Addressed Pub/Sub
//!
//! Flowmesh is an append-only event log addressed by 256-bit identifiers,
//! where sharing a truncated identifier prefix grants exactly the scope that
//! prefix covers:
//!
//! - **Identifiers**: structured 256-bit ids (org, topic, nonce, randomness)
//!   whose leading bits form capability-like shareable prefixes
//! - **Subscriptions**: a binary trie matches published ids against every
//!   registered prefix in one root-to-leaf walk
//! - **Proofs**: subscribing requires demonstrating knowledge of a real
//!   identifier under the claimed prefix
//! - **Routing**: a Kademlia-style XOR-metric table picks the peers a
//!   subscription is forwarded toward
//! - **Forwarding**: subscriptions with no local match travel the mesh with
//!   bounded fanout and retries; matches relay back along the chain
//!
//! ## Architecture
//!
//! The engine uses the **Actor Pattern** for safe concurrent state:
//! - [`Engine`] is a cheap-to-clone handle; a private actor owns the
//!   subscription index, routing table, and forwarding bookkeeping
//! - Handles communicate with the actor via async channels
//! - Network sends run in spawned tasks that report back as commands
//!
//! ## Security Model
//!
//! - Prefixes below a minimum bit length are never subscribable
//! - Subscribe requests carry proof-of-knowledge, checked before indexing
//! - All deserialization of untrusted bytes is size-bounded
//! - Delivery queues, forwarding fanout, and per-peer outbound load are all
//!   bounded; slow consumers lose events rather than stall the engine
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `engine` | Actor-based core combining all components |
//! | `identifier` | Identifier composition, prefixes, codec |
//! | `proof` | Proof-of-knowledge verification for subscribe requests |
//! | `index` | Binary trie mapping prefixes to live subscriptions |
//! | `routing` | XOR-metric k-bucket routing table |
//! | `forward` | Forwarding lifecycle and retry rounds |
//! | `store` | In-memory append-only event storage |
//! | `protocols` | Collaborator trait definitions (EventStore, PeerRpc, etc.) |
//! | `messages` | Serialization types for client and peer exchanges |

pub mod engine;
pub mod forward;
pub mod identifier;
pub mod index;
pub mod messages;
pub mod proof;
pub mod protocols;
pub mod routing;
pub mod store;

pub use engine::{
    Engine, EngineConfig, EngineStats, PublishError, SubscribeError, SubscribeOutcome,
    SubscriptionHandle,
};
pub use forward::ForwardState;
pub use identifier::{EventId, IdentifierCodec, MIN_PREFIX_BITS, Prefix, PrefixFormat};
pub use index::{SubscriptionId, SUBSCRIPTION_TTL};
pub use messages::{
    EventRecord, PeerRequest, PeerResponse, RejectReason, SubscribeMode, SubscribeRequest,
    SubscribeResponse, SubscribeStatus,
};
pub use proof::{KnownIdVerifier, ProofVerifier, make_proof};
pub use protocols::{Caller, EventStore, IdentityProvider, PeerRpc, StoreError};
pub use routing::{PeerContact, PeerId};
pub use store::MemoryStore;
