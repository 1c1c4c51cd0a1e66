//! # Subscription Index
//!
//! A binary trie over prefix bits mapping live subscriptions to the
//! identifiers they cover. Publication is the hot path: matching an
//! identifier walks at most one root-to-leaf path and collects every
//! subscription stored on it, so cost scales with identifier width and
//! matches found, never with total subscription count.
//!
//! | Operation          | Cost                          |
//! |--------------------|-------------------------------|
//! | `insert`           | O(prefix bits)                |
//! | `match_all`        | O(id bits + matches)          |
//! | `remove_where`     | O(nodes), with branch pruning |
//! | `remove_expired`   | O(nodes)                      |
//!
//! The index is plain data owned by the engine actor; all mutation and
//! matching happen on the actor task, so a `match_all` during publication
//! sees a consistent snapshot with no subscription half-registered.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::identifier::{EventId, Prefix};
use crate::messages::{EventRecord, ForwardRef, SubscribeMode};
use crate::routing::PeerId;

/// How long a subscription lives without a refreshing re-subscribe.
pub const SUBSCRIPTION_TTL: Duration = Duration::from_secs(300);

/// Locally-unique subscription handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Where matched events go: a local consumer channel, or a relay back to
/// the peer that forwarded the subscription here.
#[derive(Clone, Debug)]
pub enum DeliveryChannel {
    Local(mpsc::Sender<EventRecord>),
    Remote {
        peer: PeerId,
        forward_ref: ForwardRef,
    },
}

#[derive(Clone, Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub prefix: Prefix,
    /// Caller identity for local subscriptions, peer id hex for remote ones.
    pub subscriber: String,
    pub mode: SubscribeMode,
    pub channel: DeliveryChannel,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl Subscription {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// A local subscription whose consumer hung up can never deliver again.
    pub fn is_defunct(&self, now: Instant) -> bool {
        if self.is_expired(now) {
            return true;
        }
        match &self.channel {
            DeliveryChannel::Local(tx) => tx.is_closed(),
            DeliveryChannel::Remote { .. } => false,
        }
    }
}

/// Outcome of an insert: re-registering the same (subscriber, prefix) pair
/// refreshes the existing entry instead of duplicating it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(SubscriptionId),
    Refreshed(SubscriptionId),
}

impl InsertOutcome {
    pub fn id(&self) -> SubscriptionId {
        match self {
            InsertOutcome::Inserted(id) | InsertOutcome::Refreshed(id) => *id,
        }
    }
}

#[derive(Debug, Default)]
struct TrieNode {
    children: [Option<Box<TrieNode>>; 2],
    /// Subscriptions whose prefix ends exactly at this node.
    subs: Vec<Subscription>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.subs.is_empty() && self.children.iter().all(|c| c.is_none())
    }
}

#[derive(Debug)]
pub struct SubscriptionIndex {
    root: TrieNode,
    next_id: u64,
    len: usize,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self {
            root: TrieNode::default(),
            next_id: 1,
            len: 0,
        }
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a subscription at its prefix node. Idempotent on
    /// (subscriber, prefix): a repeat registration extends the expiry and
    /// replaces the delivery channel rather than adding a second entry.
    pub fn insert(
        &mut self,
        prefix: Prefix,
        subscriber: String,
        mode: SubscribeMode,
        channel: DeliveryChannel,
    ) -> InsertOutcome {
        let now = Instant::now();
        let node = Self::node_at_mut(&mut self.root, &prefix);

        if let Some(existing) = node
            .subs
            .iter_mut()
            .find(|s| s.subscriber == subscriber && s.prefix == prefix)
        {
            existing.expires_at = now + SUBSCRIPTION_TTL;
            existing.mode = mode;
            existing.channel = channel;
            return InsertOutcome::Refreshed(existing.id);
        }

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        node.subs.push(Subscription {
            id,
            prefix,
            subscriber,
            mode,
            channel,
            created_at: now,
            expires_at: now + SUBSCRIPTION_TTL,
        });
        self.len += 1;
        InsertOutcome::Inserted(id)
    }

    fn node_at_mut<'a>(root: &'a mut TrieNode, prefix: &Prefix) -> &'a mut TrieNode {
        let mut node = root;
        for i in 0..prefix.bit_len() {
            let branch = prefix.bit(i) as usize;
            node = node.children[branch].get_or_insert_with(Box::default);
        }
        node
    }

    /// Every subscription whose prefix is a prefix of `id`, in no particular
    /// order. Walks the single root-to-leaf path `id` spells out, collecting
    /// subscriptions at each node along the way.
    pub fn match_all(&self, id: &EventId) -> Vec<Subscription> {
        let mut matches = Vec::new();
        let mut node = &self.root;
        matches.extend(node.subs.iter().cloned());
        for i in 0..crate::identifier::ID_BITS {
            let branch = id.bit(i) as usize;
            match &node.children[branch] {
                Some(child) => {
                    node = child;
                    matches.extend(node.subs.iter().cloned());
                }
                None => break,
            }
        }
        matches
    }

    /// Find a live subscription by id.
    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        Self::find_node(&self.root, id)
    }

    fn find_node(node: &TrieNode, id: SubscriptionId) -> Option<&Subscription> {
        if let Some(sub) = node.subs.iter().find(|s| s.id == id) {
            return Some(sub);
        }
        node.children
            .iter()
            .flatten()
            .find_map(|child| Self::find_node(child, id))
    }

    /// Remove every subscription the predicate selects, pruning branches
    /// left empty. Returns the removed subscriptions.
    pub fn remove_where<F>(&mut self, mut pred: F) -> Vec<Subscription>
    where
        F: FnMut(&Subscription) -> bool,
    {
        let mut removed = Vec::new();
        Self::remove_node(&mut self.root, &mut pred, &mut removed);
        self.len -= removed.len();
        removed
    }

    fn remove_node<F>(node: &mut TrieNode, pred: &mut F, removed: &mut Vec<Subscription>)
    where
        F: FnMut(&Subscription) -> bool,
    {
        let mut i = 0;
        while i < node.subs.len() {
            if pred(&node.subs[i]) {
                removed.push(node.subs.swap_remove(i));
            } else {
                i += 1;
            }
        }
        for slot in node.children.iter_mut() {
            if let Some(child) = slot {
                Self::remove_node(child, pred, removed);
                if child.is_empty() {
                    *slot = None;
                }
            }
        }
    }

    /// Remove a single subscription by id. Returns it if it was present.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.remove_where(|s| s.id == id).pop()
    }

    /// Drop expired and defunct subscriptions. Returns what was dropped so
    /// the engine can abandon their forwarding state.
    pub fn remove_defunct(&mut self, now: Instant) -> Vec<Subscription> {
        self.remove_where(|s| s.is_defunct(now))
    }
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}
