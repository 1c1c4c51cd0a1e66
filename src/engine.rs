//! # Engine Core
//!
//! Orchestrates the whole publish/subscribe flow behind a cheap-to-clone
//! handle. All mutable state (subscription index, routing table, forwarding
//! bookkeeping) is owned by a single actor task; the handle talks to it over
//! a bounded command channel with oneshot replies. Publication matching
//! therefore always sees a consistent snapshot: no subscription is ever
//! half-registered when `match_all` runs.
//!
//! Division of labor:
//! - The handle resolves callers and performs store I/O in the caller's
//!   task, then sends the actor a command. The actor never awaits
//!   collaborators.
//! - Network sends (forward rounds, relays, liveness pings) run in spawned
//!   tasks that report back to the actor as commands.
//!
//! ## Backpressure
//!
//! Local delivery uses bounded channels with `try_send`: a consumer that
//! stops reading loses events (counted in stats) rather than stalling the
//! engine. Saturated peers are deprioritized as forwarding targets, never
//! queued against.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::forward::{FORWARD_FANOUT, Forwarder, forward_with_retry};
use crate::identifier::{EventId, MIN_PREFIX_BITS, Prefix, PrefixError};
use crate::index::{
    DeliveryChannel, InsertOutcome, SUBSCRIPTION_TTL, SubscriptionId, SubscriptionIndex,
};
use crate::messages::{
    EventRecord, ForwardFrame, ForwardRef, PeerRequest, PeerResponse, RejectReason, RelayFrame,
    SubscribeMode, SubscribeRequest, SubscribeResponse, SubscribeStatus, WireEvent, now_ms,
};
use crate::proof::ProofVerifier;
use crate::protocols::{EventStore, IdentityProvider, PeerRpc, StoreError};
use crate::routing::{BUCKET_CAPACITY, PeerContact, PeerId, PendingEviction, RoutingTable};

/// How often the actor sweeps expired and defunct subscriptions.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Per-subscriber delivery queue depth before events are dropped.
pub const DELIVERY_QUEUE_CAPACITY: usize = 64;

/// Catch-up events returned when the request names no limit.
pub const DEFAULT_CATCHUP_LIMIT: usize = 100;

/// Command queue depth between handles and the actor.
const COMMAND_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// This node's coordinate in the identifier space.
    pub self_id: PeerId,
    pub bucket_capacity: usize,
    pub forward_fanout: usize,
    pub catchup_limit: usize,
    pub cleanup_interval: Duration,
}

impl EngineConfig {
    pub fn new(self_id: PeerId) -> Self {
        Self {
            self_id,
            bucket_capacity: BUCKET_CAPACITY,
            forward_fanout: FORWARD_FANOUT,
            catchup_limit: DEFAULT_CATCHUP_LIMIT,
            cleanup_interval: CLEANUP_INTERVAL,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum PublishError {
    /// Credential did not resolve to a caller.
    Unauthorized,
    /// No explicit prefix and the caller has no default.
    NoPrefix,
    InvalidPrefix(PrefixError),
    BodyTooLarge { size: usize },
    Store(StoreError),
    ShuttingDown,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Unauthorized => write!(f, "unknown credential"),
            PublishError::NoPrefix => {
                write!(f, "no prefix given and the caller has no default prefix")
            }
            PublishError::InvalidPrefix(err) => write!(f, "invalid prefix: {err}"),
            PublishError::BodyTooLarge { size } => {
                write!(
                    f,
                    "body too large: {size} bytes (max {})",
                    crate::messages::MAX_BODY_SIZE
                )
            }
            PublishError::Store(err) => write!(f, "storage error: {err}"),
            PublishError::ShuttingDown => write!(f, "engine is shutting down"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<StoreError> for PublishError {
    fn from(err: StoreError) -> Self {
        PublishError::Store(err)
    }
}

#[derive(Debug)]
pub enum SubscribeError {
    Unauthorized,
    ShuttingDown,
}

impl std::fmt::Display for SubscribeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscribeError::Unauthorized => write!(f, "unknown credential"),
            SubscribeError::ShuttingDown => write!(f, "engine is shutting down"),
        }
    }
}

impl std::error::Error for SubscribeError {}

// ============================================================================
// Public result shapes
// ============================================================================

/// A registered subscription's consumer side.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Live matches. Dropping the receiver cancels the subscription within
    /// one cleanup sweep.
    pub events: mpsc::Receiver<EventRecord>,
}

/// What a subscribe call produced.
#[derive(Debug)]
pub struct SubscribeOutcome {
    pub response: SubscribeResponse,
    /// Historical matches honoring `since_ms` / `limit`.
    pub history: Vec<EventRecord>,
    /// Present unless the request was rejected or satisfied from history.
    pub subscription: Option<SubscriptionHandle>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub subscriptions: usize,
    pub tracked_forwards: usize,
    pub known_peers: usize,
    pub events_published: u64,
    pub events_delivered: u64,
    pub deliveries_dropped: u64,
    pub relays_deduplicated: u64,
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Publish {
        record: EventRecord,
        reply: oneshot::Sender<usize>,
    },
    Register {
        prefix: Prefix,
        subscriber: String,
        mode: SubscribeMode,
        tx: mpsc::Sender<EventRecord>,
        proof: Vec<u8>,
        forward: bool,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Cancel {
        sub: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    Peer {
        request: PeerRequest,
        reply: oneshot::Sender<PeerResponse>,
    },
    NotePeer {
        contact: PeerContact,
    },
    PingResult {
        pending: PendingEviction,
        alive: bool,
    },
    RoundOutcome {
        sub: SubscriptionId,
        acked: Vec<PeerId>,
        failed: Vec<PeerId>,
    },
    ForwardState {
        sub: SubscriptionId,
        reply: oneshot::Sender<Option<crate::forward::ForwardState>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap-to-clone engine handle.
pub struct Engine<N: PeerRpc> {
    cmd_tx: mpsc::Sender<Command>,
    store: Arc<dyn EventStore>,
    identity: Arc<dyn IdentityProvider>,
    verifier: Arc<dyn ProofVerifier>,
    network: Arc<N>,
    catchup_limit: usize,
}

impl<N: PeerRpc> Clone for Engine<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            store: self.store.clone(),
            identity: self.identity.clone(),
            verifier: self.verifier.clone(),
            network: self.network.clone(),
            catchup_limit: self.catchup_limit,
        }
    }
}

impl<N: PeerRpc> Engine<N> {
    /// Spawn the engine actor and return its handle.
    pub fn spawn(
        config: EngineConfig,
        store: Arc<dyn EventStore>,
        identity: Arc<dyn IdentityProvider>,
        verifier: Arc<dyn ProofVerifier>,
        network: Arc<N>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let catchup_limit = config.catchup_limit;
        let actor = EngineActor {
            index: SubscriptionIndex::new(),
            routing: RoutingTable::new(config.self_id, config.bucket_capacity),
            forwarder: Forwarder::new(),
            verifier: verifier.clone(),
            network: network.clone(),
            store: store.clone(),
            cmd_tx: cmd_tx.clone(),
            config,
            stats: Stats::default(),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self {
            cmd_tx,
            store,
            identity,
            verifier,
            network,
            catchup_limit,
        }
    }

    /// Append an event under the caller's prefix and fan it out to matching
    /// subscribers. Returns the generated identifier; delivery is
    /// asynchronous.
    pub async fn publish(
        &self,
        credential: &str,
        prefix: Option<Prefix>,
        body: Vec<u8>,
    ) -> Result<EventId, PublishError> {
        let caller = self
            .identity
            .resolve_caller(credential)
            .await
            .ok_or(PublishError::Unauthorized)?;
        if body.len() > crate::messages::MAX_BODY_SIZE {
            return Err(PublishError::BodyTooLarge { size: body.len() });
        }
        let prefix = prefix
            .or(caller.default_prefix)
            .ok_or(PublishError::NoPrefix)?;
        // Publishing needs room for the random suffix; a prefix past the
        // shareable width would pin bits that must stay unguessable.
        if prefix.bit_len() > crate::identifier::SHAREABLE_PREFIX_BITS {
            return Err(PublishError::InvalidPrefix(PrefixError::TooLong {
                bits: prefix.bit_len(),
            }));
        }

        let id = prefix.generate_id();
        let record = EventRecord::new(id, body);
        self.store.append(record.clone()).await?;

        debug!(agent = %caller.agent_id, id = %id, "event published");
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { record, reply })
            .await
            .map_err(|_| PublishError::ShuttingDown)?;
        // The reply is the local delivery count; the id is what callers need.
        let _ = rx.await;
        Ok(id)
    }

    /// Subscribe to a prefix. Catch-up runs against local history; a live
    /// registration is kept according to the mode.
    pub async fn subscribe(
        &self,
        credential: &str,
        request: SubscribeRequest,
    ) -> Result<SubscribeOutcome, SubscribeError> {
        let caller = self
            .identity
            .resolve_caller(credential)
            .await
            .ok_or(SubscribeError::Unauthorized)?;

        if request.proof.len() > crate::messages::MAX_PROOF_SIZE {
            return Ok(rejected(RejectReason::ProofInvalid));
        }
        let prefix = match Prefix::parse(&request.prefix, request.format) {
            Ok(prefix) => prefix,
            Err(err) => return Ok(rejected(err.into())),
        };
        if prefix.bit_len() < MIN_PREFIX_BITS {
            return Ok(rejected(RejectReason::PrefixTooShort));
        }
        if !self.verifier.verify(&prefix, &request.proof) {
            return Ok(rejected(RejectReason::ProofInvalid));
        }

        // Catch-up from local history, honoring the time floor and cap.
        // The store scans in id order, which is uncorrelated with time; the
        // cap must keep the newest matches, newest first.
        let limit = request.limit.unwrap_or(self.catchup_limit);
        let mut history = self.store.get_by_prefix_range(&prefix).await;
        if let Some(since) = request.since_ms {
            history.retain(|r| r.timestamp_ms > since);
        }
        history.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        history.truncate(limit);

        let status = if history.is_empty() {
            SubscribeStatus::Pending
        } else {
            SubscribeStatus::Matched
        };

        // One-shot satisfied from history never registers.
        if request.mode == SubscribeMode::OneShot && status == SubscribeStatus::Matched {
            return Ok(SubscribeOutcome {
                response: SubscribeResponse::ok(status),
                history,
                subscription: None,
            });
        }

        let (tx, events) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Register {
                prefix,
                subscriber: caller.agent_id,
                mode: request.mode,
                tx,
                proof: request.proof,
                forward: status == SubscribeStatus::Pending,
                reply,
            })
            .await
            .map_err(|_| SubscribeError::ShuttingDown)?;
        let id = rx.await.map_err(|_| SubscribeError::ShuttingDown)?;

        Ok(SubscribeOutcome {
            response: SubscribeResponse::ok(status),
            history,
            subscription: Some(SubscriptionHandle { id, events }),
        })
    }

    /// Fetch a single stored event by exact identifier.
    pub async fn event(&self, id: &EventId) -> Option<EventRecord> {
        self.store.get_by_id(id).await
    }

    /// Drop a subscription immediately. Returns whether it existed.
    pub async fn cancel(&self, sub: SubscriptionId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Cancel { sub, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Entry point for the peer transport: a request from another node.
    pub async fn handle_peer_request(&self, request: PeerRequest) -> PeerResponse {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Peer { request, reply })
            .await
            .is_err()
        {
            return PeerResponse::Error {
                message: "engine is shutting down".into(),
            };
        }
        rx.await.unwrap_or(PeerResponse::Error {
            message: "engine is shutting down".into(),
        })
    }

    /// Introduce a peer (bootstrap, discovery).
    pub async fn note_peer(&self, contact: PeerContact) {
        let _ = self.cmd_tx.send(Command::NotePeer { contact }).await;
    }

    /// Where a subscription's forwarding currently stands.
    pub async fn forward_state(&self, sub: SubscriptionId) -> Option<crate::forward::ForwardState> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::ForwardState { sub, reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn stats(&self) -> EngineStats {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stats { reply }).await.is_err() {
            return EngineStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Stop the actor after draining queued commands.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn rejected(reason: RejectReason) -> SubscribeOutcome {
    SubscribeOutcome {
        response: SubscribeResponse::rejected(reason),
        history: Vec::new(),
        subscription: None,
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Default)]
struct Stats {
    events_published: u64,
    events_delivered: u64,
    deliveries_dropped: u64,
}

struct EngineActor<N: PeerRpc> {
    index: SubscriptionIndex,
    routing: RoutingTable,
    forwarder: Forwarder,
    verifier: Arc<dyn ProofVerifier>,
    network: Arc<N>,
    store: Arc<dyn EventStore>,
    cmd_tx: mpsc::Sender<Command>,
    config: EngineConfig,
    stats: Stats,
}

impl<N: PeerRpc> EngineActor<N> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        info!(self_id = %self.routing.self_id(), "engine actor started");
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        // All handles dropped.
                        None => break,
                    }
                }
                _ = cleanup.tick() => {
                    self.sweep_defunct();
                }
            }
        }
        info!("engine actor stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Publish { record, reply } => {
                let delivered = self.deliver(&record);
                self.stats.events_published += 1;
                let _ = reply.send(delivered);
            }
            Command::Register {
                prefix,
                subscriber,
                mode,
                tx,
                proof,
                forward,
                reply,
            } => {
                let outcome = self.index.insert(
                    prefix,
                    subscriber,
                    mode,
                    DeliveryChannel::Local(tx),
                );
                let sub = outcome.id();
                if let InsertOutcome::Inserted(_) = outcome {
                    self.forwarder.track(sub);
                    if forward {
                        self.start_forward_round(sub, prefix, proof, None);
                    }
                }
                let _ = reply.send(sub);
            }
            Command::Cancel { sub, reply } => {
                let existed = self.index.remove(sub).is_some();
                self.forwarder.forget(sub);
                let _ = reply.send(existed);
            }
            Command::Peer { request, reply } => {
                let response = self.handle_peer(request);
                let _ = reply.send(response);
            }
            Command::NotePeer { contact } => self.note_contact(contact),
            Command::PingResult { pending, alive } => {
                self.routing.apply_ping_result(pending, alive);
            }
            Command::RoundOutcome { sub, acked, failed } => {
                for peer in acked.iter().chain(&failed) {
                    self.forwarder.note_outbound_done(*peer);
                }
                for peer in &failed {
                    self.routing.mark_unreachable(peer);
                }
                let exhausted = acked.is_empty();
                self.forwarder.apply_round(sub, acked, exhausted);
            }
            Command::ForwardState { sub, reply } => {
                let _ = reply.send(self.forwarder.state(sub).cloned());
            }
            Command::Stats { reply } => {
                let _ = reply.send(EngineStats {
                    subscriptions: self.index.len(),
                    tracked_forwards: self.forwarder.len(),
                    known_peers: self.routing.len(),
                    events_published: self.stats.events_published,
                    events_delivered: self.stats.events_delivered,
                    deliveries_dropped: self.stats.deliveries_dropped,
                    relays_deduplicated: self.forwarder.relays_deduplicated(),
                });
            }
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    // ------------------------------------------------------------------
    // Publication fan-out
    // ------------------------------------------------------------------

    /// Deliver a stored event to every matching subscription. Returns the
    /// local delivery count.
    fn deliver(&mut self, record: &EventRecord) -> usize {
        let matches = self.index.match_all(&record.id);
        let mut delivered = 0;
        let mut satisfied = Vec::new();

        for sub in &matches {
            match &sub.channel {
                DeliveryChannel::Local(tx) => {
                    // Slow consumers lose events rather than stall the actor.
                    match tx.try_send(record.clone()) {
                        Ok(()) => {
                            delivered += 1;
                            self.stats.events_delivered += 1;
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            self.stats.deliveries_dropped += 1;
                            warn!(sub = %sub.id, "delivery queue full, event dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            self.stats.deliveries_dropped += 1;
                        }
                    }
                }
                DeliveryChannel::Remote { peer, forward_ref } => {
                    if self.forwarder.first_relay(*forward_ref, record.id) {
                        self.spawn_relay(*peer, *forward_ref, record.clone());
                        delivered += 1;
                    }
                }
            }
            if sub.mode == SubscribeMode::OneShot {
                satisfied.push(sub.id);
            }
        }

        for sub in satisfied {
            self.index.remove(sub);
            self.forwarder.mark_satisfied(sub);
        }
        delivered
    }

    fn spawn_relay(&self, peer: PeerId, forward_ref: ForwardRef, record: EventRecord) {
        let Some(contact) = self.routing.contact(&peer) else {
            debug!(peer = %peer, "relay target unknown, dropping");
            return;
        };
        let network = self.network.clone();
        let frame = RelayFrame {
            forward_ref,
            event: WireEvent::from_record(&record),
        };
        tokio::spawn(async move {
            if let Err(err) = network.send_relay(&contact, frame).await {
                debug!(peer = %contact.peer_id, error = %err, "relay failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Peer requests
    // ------------------------------------------------------------------

    fn handle_peer(&mut self, request: PeerRequest) -> PeerResponse {
        self.note_contact(request.sender().clone());
        match request {
            PeerRequest::Forward { from, frame } => self.handle_forward(from, frame),
            PeerRequest::Relay { from: _, frame } => self.handle_relay(frame),
            PeerRequest::Ping { .. } => PeerResponse::Ack,
        }
    }

    /// An inbound forwarded subscription: validate, register remotely, serve
    /// local history, and push the frame further toward the prefix.
    fn handle_forward(&mut self, from: PeerContact, frame: ForwardFrame) -> PeerResponse {
        let prefix = match frame.prefix() {
            Ok(prefix) => prefix,
            Err(err) => {
                return PeerResponse::Error {
                    message: format!("bad prefix: {err}"),
                };
            }
        };
        if prefix.bit_len() < MIN_PREFIX_BITS {
            return PeerResponse::Error {
                message: "prefix too short".into(),
            };
        }
        if frame.expires_ms <= now_ms() {
            return PeerResponse::Error {
                message: "forward expired".into(),
            };
        }
        if frame.proof.len() > crate::messages::MAX_PROOF_SIZE
            || !self.verifier.verify(&prefix, &frame.proof)
        {
            return PeerResponse::Error {
                message: "proof rejected".into(),
            };
        }

        // A reference we already track means this frame looped back or was
        // retried; acknowledge without re-registering or re-forwarding.
        if self.forwarder.resolve_ref(&frame.forward_ref).is_some() {
            return PeerResponse::Ack;
        }

        let outcome = self.index.insert(
            prefix,
            from.peer_id.to_hex(),
            SubscribeMode::Stream,
            DeliveryChannel::Remote {
                peer: from.peer_id,
                forward_ref: frame.forward_ref,
            },
        );
        let sub = outcome.id();
        if let InsertOutcome::Inserted(_) = outcome {
            self.forwarder.track_remote(sub, frame.forward_ref);
            self.spawn_history_relay(from.clone(), frame.clone());
            // Keep pushing toward the prefix neighborhood, skipping the hop
            // we came from.
            self.start_forward_round(sub, prefix, frame.proof, Some(from.peer_id));
        }
        PeerResponse::Ack
    }

    /// Serve stored matches to the origin of a freshly registered forward.
    fn spawn_history_relay(&self, origin: PeerContact, frame: ForwardFrame) {
        let Ok(prefix) = frame.prefix() else { return };
        let store = self.store.clone();
        let network = self.network.clone();
        let limit = self.config.catchup_limit;
        tokio::spawn(async move {
            let mut records = store.get_by_prefix_range(&prefix).await;
            // Same newest-first cap as local catch-up.
            records.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
            records.truncate(limit);
            for record in records {
                let relay = RelayFrame {
                    forward_ref: frame.forward_ref,
                    event: WireEvent::from_record(&record),
                };
                if let Err(err) = network.send_relay(&origin, relay).await {
                    debug!(peer = %origin.peer_id, error = %err, "history relay failed");
                    break;
                }
            }
        });
    }

    /// A matched event relayed back along the forwarding chain.
    fn handle_relay(&mut self, frame: RelayFrame) -> PeerResponse {
        let Some(sub_id) = self.forwarder.resolve_ref(&frame.forward_ref) else {
            // Reference already satisfied or expired; harmless.
            return PeerResponse::Ack;
        };
        let record = match frame.event.into_record() {
            Ok(record) => record,
            Err(err) => {
                return PeerResponse::Error {
                    message: format!("bad event: {err}"),
                };
            }
        };
        if !self.forwarder.first_relay(frame.forward_ref, record.id) {
            return PeerResponse::Ack;
        }

        let Some(sub) = self.index.get(sub_id).cloned() else {
            return PeerResponse::Ack;
        };
        if !sub.prefix.matches(&record.id) {
            return PeerResponse::Error {
                message: "relayed event outside subscribed prefix".into(),
            };
        }

        match &sub.channel {
            DeliveryChannel::Local(tx) => match tx.try_send(record) {
                Ok(()) => self.stats.events_delivered += 1,
                Err(_) => self.stats.deliveries_dropped += 1,
            },
            // Mid-chain hop: pass the event on toward the origin.
            DeliveryChannel::Remote { peer, forward_ref } => {
                self.spawn_relay(*peer, *forward_ref, record);
            }
        }

        if sub.mode == SubscribeMode::OneShot {
            self.index.remove(sub_id);
            self.forwarder.mark_satisfied(sub_id);
        }
        PeerResponse::Ack
    }

    // ------------------------------------------------------------------
    // Routing and forwarding
    // ------------------------------------------------------------------

    fn note_contact(&mut self, contact: PeerContact) {
        if let Some(pending) = self.routing.note_contact(contact) {
            let network = self.network.clone();
            let cmd_tx = self.cmd_tx.clone();
            let oldest = pending.oldest.clone();
            tokio::spawn(async move {
                let alive = network.ping(&oldest).await.is_ok();
                let _ = cmd_tx.send(Command::PingResult { pending, alive }).await;
            });
        }
    }

    /// Push a subscription toward the peers nearest its prefix. Only peers
    /// strictly closer to the prefix than this node are candidates, which
    /// bounds traversal depth.
    fn start_forward_round(
        &mut self,
        sub: SubscriptionId,
        prefix: Prefix,
        proof: Vec<u8>,
        skip: Option<PeerId>,
    ) {
        let Some(forward_ref) = self.forwarder.forward_ref(sub) else {
            return;
        };
        let target = *prefix.as_padded_bytes();
        let self_dist = self.routing.self_id().xor_distance(&target);

        let candidates: Vec<PeerContact> = self
            .routing
            .find_closest(&prefix, self.config.forward_fanout * 2)
            .into_iter()
            .filter(|c| Some(c.peer_id) != skip)
            .filter(|c| {
                let dist = c.peer_id.xor_distance(&target);
                crate::identifier::distance_cmp(&dist, &self_dist) == std::cmp::Ordering::Less
            })
            .collect();
        let targets: Vec<PeerContact> = self
            .forwarder
            .prioritize_targets(candidates)
            .into_iter()
            .take(self.config.forward_fanout)
            .collect();

        if targets.is_empty() {
            trace!(%sub, "no closer peers, subscription stays local");
            self.forwarder.apply_round(sub, Vec::new(), true);
            return;
        }

        let frame = ForwardFrame {
            forward_ref,
            prefix_bytes: prefix.significant_bytes().to_vec(),
            prefix_bits: prefix.bit_len(),
            proof,
            expires_ms: now_ms() + SUBSCRIPTION_TTL.as_millis() as u64,
        };
        for target in &targets {
            self.forwarder.note_outbound_started(target.peer_id);
        }

        let network = self.network.clone();
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let mut set = JoinSet::new();
            for peer in targets {
                let network = network.clone();
                let frame = frame.clone();
                set.spawn(async move {
                    let acked = forward_with_retry(network.as_ref(), &peer, frame).await;
                    (peer.peer_id, acked)
                });
            }
            let mut acked = Vec::new();
            let mut failed = Vec::new();
            while let Some(result) = set.join_next().await {
                match result {
                    Ok((peer, true)) => acked.push(peer),
                    Ok((peer, false)) => failed.push(peer),
                    Err(_) => {}
                }
            }
            let _ = cmd_tx.send(Command::RoundOutcome { sub, acked, failed }).await;
        });
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    fn sweep_defunct(&mut self) {
        // Terminal states marked during the previous interval have been
        // queryable long enough; release their references first.
        self.forwarder.purge_terminal();
        let dropped = self.index.remove_defunct(Instant::now());
        if dropped.is_empty() {
            return;
        }
        debug!(count = dropped.len(), "swept defunct subscriptions");
        for sub in dropped {
            self.forwarder.mark_expired(sub.id);
        }
    }
}
