//! # Subscription Forwarding
//!
//! When a subscription has no local match, the engine hands it to the peers
//! nearest the target prefix and tracks what happened. This module owns the
//! lifecycle bookkeeping ([`Forwarder`]) and the network round that pushes a
//! frame to one peer with retries ([`forward_with_retry`]). The network work
//! runs in spawned tasks; the bookkeeping lives on the engine actor.
//!
//! Lifecycle:
//!
//! ```text
//! LocalPending --forward acked--> Forwarded --relay seen--> Satisfied
//!      |                             |
//!      +--all peers failed-----------+--> Unreachable
//!      |
//!      +--TTL elapsed--> Expired
//! ```
//!
//! Relay frames are deduplicated per (forward reference, event id) so an
//! event reaching this node along two mesh paths is delivered once.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use crate::identifier::EventId;
use crate::index::SubscriptionId;
use crate::messages::{ForwardFrame, ForwardRef};
use crate::protocols::PeerRpc;
use crate::routing::{PeerContact, PeerId};

/// Peers a subscription is forwarded to per round.
///
/// SCALABILITY: redundancy against single-peer loss without flooding; the
/// mesh converges on the prefix neighborhood within a few hops.
pub const FORWARD_FANOUT: usize = 3;

/// Send attempts per peer before declaring it failed.
pub const MAX_FORWARD_ATTEMPTS: u32 = 3;

/// Base delay between attempts, doubled each retry.
pub const FORWARD_RETRY_BASE: Duration = Duration::from_millis(250);

/// Per-attempt network deadline.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// In-flight frames tolerated per peer before it is deprioritized as a
/// forwarding target.
pub const MAX_OUTBOUND_PER_PEER: usize = 100;

/// Remembered (forward ref, event) pairs for relay deduplication.
const RELAY_DEDUP_CAPACITY: usize = 4096;

/// Where a forwarded subscription stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardState {
    /// Matched locally or awaiting its first forward round.
    LocalPending,
    /// At least one peer acknowledged the frame.
    Forwarded { peers: Vec<PeerId> },
    /// A relayed event arrived for a one-shot subscription.
    Satisfied,
    /// TTL elapsed with no match.
    Expired,
    /// Every candidate peer failed; the subscription stays local-only.
    Unreachable,
}

/// A fresh 128-bit forwarding reference.
pub fn new_forward_ref() -> ForwardRef {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

struct ForwardEntry {
    state: ForwardState,
    forward_ref: ForwardRef,
}

/// Engine-actor-owned forwarding bookkeeping.
pub struct Forwarder {
    entries: HashMap<SubscriptionId, ForwardEntry>,
    by_ref: HashMap<ForwardRef, SubscriptionId>,
    /// In-flight frames per peer, for target deprioritization.
    outbound: HashMap<PeerId, usize>,
    relay_seen: LruCache<(ForwardRef, EventId), ()>,
    relays_deduplicated: u64,
}

impl Forwarder {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_ref: HashMap::new(),
            outbound: HashMap::new(),
            relay_seen: LruCache::new(
                NonZeroUsize::new(RELAY_DEDUP_CAPACITY).expect("capacity is nonzero"),
            ),
            relays_deduplicated: 0,
        }
    }

    /// Begin tracking a subscription, minting its forwarding reference.
    pub fn track(&mut self, sub: SubscriptionId) -> ForwardRef {
        let forward_ref = new_forward_ref();
        self.entries.insert(
            sub,
            ForwardEntry {
                state: ForwardState::LocalPending,
                forward_ref,
            },
        );
        self.by_ref.insert(forward_ref, sub);
        forward_ref
    }

    /// Track an inbound remote subscription under the reference the origin
    /// minted, so relays carry a reference the origin recognizes.
    pub fn track_remote(&mut self, sub: SubscriptionId, forward_ref: ForwardRef) {
        self.entries.insert(
            sub,
            ForwardEntry {
                state: ForwardState::LocalPending,
                forward_ref,
            },
        );
        self.by_ref.insert(forward_ref, sub);
    }

    pub fn state(&self, sub: SubscriptionId) -> Option<&ForwardState> {
        self.entries.get(&sub).map(|e| &e.state)
    }

    pub fn forward_ref(&self, sub: SubscriptionId) -> Option<ForwardRef> {
        self.entries.get(&sub).map(|e| e.forward_ref)
    }

    pub fn resolve_ref(&self, forward_ref: &ForwardRef) -> Option<SubscriptionId> {
        self.by_ref.get(forward_ref).copied()
    }

    /// Record the outcome of a forward round.
    pub fn apply_round(&mut self, sub: SubscriptionId, acked: Vec<PeerId>, exhausted: bool) {
        let Some(entry) = self.entries.get_mut(&sub) else {
            return;
        };
        // Terminal states never regress.
        if matches!(entry.state, ForwardState::Satisfied | ForwardState::Expired) {
            return;
        }
        if !acked.is_empty() {
            match &mut entry.state {
                ForwardState::Forwarded { peers } => {
                    for peer in acked {
                        if !peers.contains(&peer) {
                            peers.push(peer);
                        }
                    }
                }
                _ => entry.state = ForwardState::Forwarded { peers: acked },
            }
        } else if exhausted && matches!(entry.state, ForwardState::LocalPending) {
            debug!(%sub, "no peer reachable, subscription stays local");
            entry.state = ForwardState::Unreachable;
        }
    }

    pub fn mark_satisfied(&mut self, sub: SubscriptionId) {
        if let Some(entry) = self.entries.get_mut(&sub) {
            entry.state = ForwardState::Satisfied;
        }
    }

    pub fn mark_expired(&mut self, sub: SubscriptionId) {
        if let Some(entry) = self.entries.get_mut(&sub) {
            entry.state = ForwardState::Expired;
        }
    }

    /// Stop tracking a subscription, releasing its reference.
    pub fn forget(&mut self, sub: SubscriptionId) {
        if let Some(entry) = self.entries.remove(&sub) {
            self.by_ref.remove(&entry.forward_ref);
        }
    }

    /// Drop every entry that reached a terminal state. Run at the start of
    /// a cleanup sweep, so Satisfied and Expired stay queryable until the
    /// sweep after they were reached.
    pub fn purge_terminal(&mut self) {
        let done: Vec<SubscriptionId> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                matches!(e.state, ForwardState::Satisfied | ForwardState::Expired)
            })
            .map(|(sub, _)| *sub)
            .collect();
        for sub in done {
            self.forget(sub);
        }
    }

    /// True the first time this (reference, event) pair is seen; false on
    /// duplicates arriving along other mesh paths.
    pub fn first_relay(&mut self, forward_ref: ForwardRef, event: EventId) -> bool {
        if self.relay_seen.put((forward_ref, event), ()).is_some() {
            self.relays_deduplicated += 1;
            trace!(event = %event, "duplicate relay dropped");
            false
        } else {
            true
        }
    }

    pub fn relays_deduplicated(&self) -> u64 {
        self.relays_deduplicated
    }

    pub fn note_outbound_started(&mut self, peer: PeerId) {
        *self.outbound.entry(peer).or_insert(0) += 1;
    }

    pub fn note_outbound_done(&mut self, peer: PeerId) {
        if let Some(count) = self.outbound.get_mut(&peer) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outbound.remove(&peer);
            }
        }
    }

    /// Order forwarding candidates, pushing saturated peers to the back.
    /// Saturation deprioritizes rather than excludes: a saturated peer is
    /// still better than no peer at all.
    pub fn prioritize_targets(&self, mut candidates: Vec<PeerContact>) -> Vec<PeerContact> {
        candidates.sort_by_key(|c| {
            let load = self.outbound.get(&c.peer_id).copied().unwrap_or(0);
            load >= MAX_OUTBOUND_PER_PEER
        });
        candidates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Push a frame to one peer, retrying with exponential backoff.
///
/// Runs in a spawned task per peer; the outcome is reported back to the
/// engine actor as a command.
pub async fn forward_with_retry<N: PeerRpc>(
    network: &N,
    peer: &PeerContact,
    frame: ForwardFrame,
) -> bool {
    let mut delay = FORWARD_RETRY_BASE;
    for attempt in 1..=MAX_FORWARD_ATTEMPTS {
        match timeout(FORWARD_TIMEOUT, network.send_forward(peer, frame.clone())).await {
            Ok(Ok(())) => {
                trace!(peer = %peer.peer_id, attempt, "forward acknowledged");
                return true;
            }
            Ok(Err(err)) => {
                debug!(peer = %peer.peer_id, attempt, error = %err, "forward failed");
            }
            Err(_) => {
                debug!(peer = %peer.peer_id, attempt, "forward timed out");
            }
        }
        if attempt < MAX_FORWARD_ATTEMPTS {
            sleep(delay).await;
            delay *= 2;
        }
    }
    warn!(peer = %peer.peer_id, "peer unreachable after retries");
    false
}
