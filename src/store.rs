//! # In-Memory Event Store
//!
//! [`MemoryStore`] keeps events in a `BTreeMap` keyed by raw identifier
//! bytes, which makes prefix queries a contiguous range scan: a prefix of
//! `b` significant bits covers exactly the identifiers between the prefix
//! zero-padded (floor) and the prefix with all trailing bits set (ceiling).
//!
//! Suitable for single-node deployments and tests. A persistent backend
//! implements the same [`EventStore`] trait.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::identifier::{EventId, ID_BITS, Prefix};
use crate::messages::EventRecord;
use crate::protocols::{EventStore, StoreError};

/// Maximum events held before writes are refused.
///
/// SCALABILITY: bounds memory on long-running nodes. 64 KiB bodies at this
/// cap keep worst-case store memory near 4 GiB.
pub const MAX_STORED_EVENTS: usize = 65_536;

pub struct MemoryStore {
    events: Mutex<BTreeMap<[u8; 32], EventRecord>>,
    capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(MAX_STORED_EVENTS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Inclusive bounds of the identifier range a prefix covers.
fn prefix_bounds(prefix: &Prefix) -> ([u8; 32], [u8; 32]) {
    let floor = *prefix.as_padded_bytes();
    let mut ceiling = floor;
    // Set every bit past the prefix.
    for i in prefix.bit_len()..ID_BITS {
        ceiling[(i / 8) as usize] |= 0x80 >> (i % 8);
    }
    (floor, ceiling)
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, record: EventRecord) -> Result<(), StoreError> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        if events.contains_key(record.id.as_bytes()) {
            return Err(StoreError::DuplicateId);
        }
        if events.len() >= self.capacity {
            return Err(StoreError::Unavailable("event capacity reached".into()));
        }
        debug!(id = %record.id, body_len = record.body.len(), "event stored");
        events.insert(*record.id.as_bytes(), record);
        Ok(())
    }

    async fn get_by_id(&self, id: &EventId) -> Option<EventRecord> {
        self.events.lock().ok()?.get(id.as_bytes()).cloned()
    }

    async fn get_by_prefix_range(&self, prefix: &Prefix) -> Vec<EventRecord> {
        let (floor, ceiling) = prefix_bounds(prefix);
        match self.events.lock() {
            Ok(events) => events
                .range(floor..=ceiling)
                .map(|(_, record)| record.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}
