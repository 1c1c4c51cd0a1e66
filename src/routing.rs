//! # XOR-Metric Routing Table
//!
//! Kademlia-style routing table over the identifier space, used to pick
//! which peers a subscription should be forwarded toward.
//!
//! Key concepts:
//! - XOR distance: `distance(a, b) = a XOR b` (bitwise)
//! - Bucket index: number of leading zero bits in the XOR distance
//! - k-buckets: each bucket holds up to k peers at similar distances
//!
//! Bucket organization:
//!   Bucket 0: peers whose distance has 0 leading zeros (furthest, 50% of keyspace)
//!   Bucket 1: 1 leading zero (25% of keyspace)
//!   ...
//!   Bucket 255: 255 leading zeros (closest)
//!
//! Eviction prefers the least-recently-seen entry, subject to a liveness
//! check: a full bucket yields a [`PendingEviction`] and the engine pings the
//! oldest peer before deciding. The table itself never touches the network;
//! multi-hop traversal is the forwarding engine's concern.
//!
//! Lookup targets are prefixes compared as if zero-padded to full identifier
//! width. Ties in distance break toward the lower raw peer id, so results
//! are deterministic and reproducible across nodes.

use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::identifier::{Prefix, distance_cmp, xor32};

/// Maximum peers per bucket (the Kademlia k constant).
pub const BUCKET_CAPACITY: usize = 20;

/// Number of distance buckets (one per possible leading-zero count).
const BUCKET_COUNT: usize = 256;

/// A peer's coordinate in the identifier space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &[u8; 32]) -> [u8; 32] {
        xor32(&self.0, other)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// An entry in the routing table: a peer coordinate plus an opaque transport
/// locator. The table owns these exclusively; peers are always referenced by
/// id, never by direct object links, so the cyclic peer graph stays acyclic
/// in memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerContact {
    pub peer_id: PeerId,
    /// Opaque transport locator, interpreted only by the peer transport.
    pub addr: String,
    /// Milliseconds since Unix epoch of the last observed contact.
    pub last_seen_ms: u64,
}

impl PeerContact {
    pub fn new(peer_id: PeerId, addr: impl Into<String>) -> Self {
        Self {
            peer_id,
            addr: addr.into(),
            last_seen_ms: crate::messages::now_ms(),
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    /// Ordered oldest → newest by last activity.
    contacts: Vec<PeerContact>,
}

#[derive(Debug)]
enum TouchOutcome {
    Inserted,
    Refreshed,
    Full {
        new_contact: Box<PeerContact>,
        oldest: Box<PeerContact>,
    },
}

/// A full bucket waiting on a liveness check of its oldest entry.
///
/// The engine pings `oldest`; `RoutingTable::apply_ping_result` then either
/// keeps the old entry (alive) or replaces it with `new_contact` (dead).
#[derive(Clone, Debug)]
pub struct PendingEviction {
    bucket_index: usize,
    pub oldest: PeerContact,
    pub new_contact: PeerContact,
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
        }
    }

    fn touch(&mut self, contact: PeerContact, k: usize) -> TouchOutcome {
        if let Some(pos) = self
            .contacts
            .iter()
            .position(|c| c.peer_id == contact.peer_id)
        {
            let mut existing = self.contacts.remove(pos);
            // Keep the newer address, refresh recency either way.
            if contact.last_seen_ms >= existing.last_seen_ms {
                existing = contact;
            }
            self.contacts.push(existing);
            return TouchOutcome::Refreshed;
        }

        if self.contacts.len() < k {
            self.contacts.push(contact);
            TouchOutcome::Inserted
        } else {
            debug_assert!(!self.contacts.is_empty(), "bucket len >= k but contacts empty");
            let oldest = self
                .contacts
                .first()
                .cloned()
                .unwrap_or_else(|| contact.clone());
            TouchOutcome::Full {
                new_contact: Box::new(contact),
                oldest: Box::new(oldest),
            }
        }
    }

    fn refresh(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.peer_id == id) {
            let existing = self.contacts.remove(pos);
            self.contacts.push(existing);
            true
        } else {
            false
        }
    }

    fn remove(&mut self, id: &PeerId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| &c.peer_id == id) {
            self.contacts.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Bucket index = number of leading zero bits of the XOR distance.
fn bucket_index(self_id: &PeerId, other: &PeerId) -> usize {
    let dist = self_id.xor_distance(other.as_bytes());
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    BUCKET_COUNT - 1
}

#[derive(Debug)]
pub struct RoutingTable {
    self_id: PeerId,
    k: usize,
    buckets: Vec<Bucket>,
    len: usize,
}

impl RoutingTable {
    pub fn new(self_id: PeerId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(Bucket::new());
        }
        Self {
            self_id,
            k,
            buckets,
            len: 0,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Number of peers currently in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert or refresh a peer. A full bucket returns a [`PendingEviction`]
    /// instead of evicting blindly; the caller runs the liveness check.
    pub fn note_contact(&mut self, contact: PeerContact) -> Option<PendingEviction> {
        if contact.peer_id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, &contact.peer_id);
        match self.buckets[idx].touch(contact, self.k) {
            TouchOutcome::Inserted => {
                self.len += 1;
                None
            }
            TouchOutcome::Refreshed => None,
            TouchOutcome::Full { new_contact, oldest } => {
                trace!(
                    bucket = idx,
                    oldest = %oldest.peer_id,
                    candidate = %new_contact.peer_id,
                    "bucket full, liveness check pending"
                );
                Some(PendingEviction {
                    bucket_index: idx,
                    oldest: *oldest,
                    new_contact: *new_contact,
                })
            }
        }
    }

    /// Resolve a pending eviction after the liveness check of the oldest
    /// entry. Alive: the oldest is refreshed and the candidate dropped.
    /// Dead: the oldest is evicted and the candidate admitted.
    pub fn apply_ping_result(&mut self, pending: PendingEviction, oldest_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket_index];
        if oldest_alive {
            bucket.refresh(&pending.oldest.peer_id);
            return;
        }

        if bucket.remove(&pending.oldest.peer_id) {
            self.len -= 1;
        }
        let already_present = bucket
            .contacts
            .iter()
            .any(|c| c.peer_id == pending.new_contact.peer_id);
        if already_present {
            return;
        }
        if bucket.contacts.len() < self.k {
            bucket.contacts.push(pending.new_contact);
            self.len += 1;
        }
    }

    /// Demote a peer immediately, without waiting for bucket pressure.
    /// Used after forwarding failures.
    pub fn mark_unreachable(&mut self, id: &PeerId) -> bool {
        let idx = bucket_index(&self.self_id, id);
        let removed = self.buckets[idx].remove(id);
        if removed {
            self.len -= 1;
            trace!(peer = %id, "peer marked unreachable and evicted");
        }
        removed
    }

    /// Look up a peer by id.
    pub fn contact(&self, id: &PeerId) -> Option<PeerContact> {
        if *id == self.self_id {
            return None;
        }
        let idx = bucket_index(&self.self_id, id);
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| &c.peer_id == id)
            .cloned()
    }

    /// The `count` peers nearest the prefix by ascending XOR distance, the
    /// prefix zero-padded to full width. Equal distances break toward the
    /// lower raw peer id.
    pub fn find_closest(&self, target: &Prefix, count: usize) -> Vec<PeerContact> {
        if count == 0 {
            return Vec::new();
        }
        let target_bytes = *target.as_padded_bytes();

        #[derive(Eq, PartialEq)]
        struct Candidate {
            dist: [u8; 32],
            contact: PeerContact,
        }

        impl Ord for Candidate {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
                    .then_with(|| self.contact.peer_id.cmp(&other.contact.peer_id))
            }
        }

        impl PartialOrd for Candidate {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        // Max-heap of the best `count` so far; the root is the current worst.
        let mut heap: BinaryHeap<Candidate> = BinaryHeap::with_capacity(count + 1);
        for bucket in &self.buckets {
            for contact in &bucket.contacts {
                let dist = contact.peer_id.xor_distance(&target_bytes);
                let cand = Candidate {
                    dist,
                    contact: contact.clone(),
                };
                if heap.len() < count {
                    heap.push(cand);
                } else if let Some(worst) = heap.peek()
                    && cand.cmp(worst) == std::cmp::Ordering::Less
                {
                    heap.push(cand);
                    heap.pop();
                }
            }
        }

        let mut result: Vec<Candidate> = heap.into_vec();
        result.sort();
        result.into_iter().map(|c| c.contact).collect()
    }
}
