//! Integration tests for mesh forwarding and relay.
//!
//! These tests drive one engine with a scriptable in-memory peer transport
//! and validate the full forwarding lifecycle: candidate selection, retry
//! and eviction on failure, inbound forward registration, relay chaining,
//! and deduplication.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use flowmesh::forward::FORWARD_FANOUT;
use flowmesh::messages::{ForwardFrame, PeerRequest, PeerResponse, RelayFrame, WireEvent, now_ms};
use flowmesh::{
    Caller, Engine, EngineConfig, EventRecord, ForwardState, IdentifierCodec, IdentityProvider,
    KnownIdVerifier, MemoryStore, PeerContact, PeerId, PeerRpc, Prefix, PrefixFormat,
    SubscribeMode, SubscribeRequest, SubscribeStatus, make_proof,
};

const SETTLE_WAIT: Duration = Duration::from_secs(10);

// =============================================================================
// Scriptable transport
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Script {
    Ack,
    Fail,
}

#[derive(Default)]
struct MockNet {
    scripts: Mutex<HashMap<PeerId, Script>>,
    forwards: Mutex<Vec<(PeerId, ForwardFrame)>>,
    relays: Mutex<Vec<(PeerId, RelayFrame)>>,
}

impl MockNet {
    fn script(&self, peer: PeerId, script: Script) {
        self.scripts.lock().unwrap().insert(peer, script);
    }

    fn forwards(&self) -> Vec<(PeerId, ForwardFrame)> {
        self.forwards.lock().unwrap().clone()
    }

    fn relays(&self) -> Vec<(PeerId, RelayFrame)> {
        self.relays.lock().unwrap().clone()
    }

    fn behavior(&self, peer: &PeerId) -> Script {
        self.scripts
            .lock()
            .unwrap()
            .get(peer)
            .copied()
            .unwrap_or(Script::Ack)
    }
}

#[async_trait]
impl PeerRpc for MockNet {
    async fn send_forward(&self, peer: &PeerContact, frame: ForwardFrame) -> anyhow::Result<()> {
        self.forwards.lock().unwrap().push((peer.peer_id, frame));
        match self.behavior(&peer.peer_id) {
            Script::Ack => Ok(()),
            Script::Fail => anyhow::bail!("scripted failure"),
        }
    }

    async fn send_relay(&self, peer: &PeerContact, frame: RelayFrame) -> anyhow::Result<()> {
        self.relays.lock().unwrap().push((peer.peer_id, frame));
        match self.behavior(&peer.peer_id) {
            Script::Ack => Ok(()),
            Script::Fail => anyhow::bail!("scripted failure"),
        }
    }

    async fn ping(&self, peer: &PeerContact) -> anyhow::Result<()> {
        match self.behavior(&peer.peer_id) {
            Script::Ack => Ok(()),
            Script::Fail => anyhow::bail!("scripted failure"),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct TestIdentity(HashMap<String, Caller>);

#[async_trait]
impl IdentityProvider for TestIdentity {
    async fn resolve_caller(&self, credential: &str) -> Option<Caller> {
        self.0.get(credential).cloned()
    }
}

fn topic() -> Prefix {
    let mut codec = IdentifierCodec::new();
    codec.compose_topic_prefix(0xa7f3_d89c_2b1e_4068, "sensors/temp")
}

/// A peer id in the prefix's neighborhood, distinguished by `tail`.
fn near_peer(prefix: &Prefix, tail: u8) -> PeerId {
    let mut bytes = *prefix.as_padded_bytes();
    bytes[31] = tail;
    PeerId::from_bytes(bytes)
}

fn contact(peer: PeerId, tail: u8) -> PeerContact {
    PeerContact::new(peer, format!("10.1.0.{tail}:4100"))
}

/// Engine whose own id is far from the test prefix, so near peers are
/// always closer and eligible forwarding targets.
fn mesh_engine(
    net: Arc<MockNet>,
    default_prefix: Prefix,
) -> Engine<MockNet> {
    let identity = TestIdentity(HashMap::from([(
        "token-1".to_string(),
        Caller {
            agent_id: "agent-1".to_string(),
            default_prefix: Some(default_prefix),
        },
    )]));
    Engine::spawn(
        EngineConfig::new(PeerId::from_bytes([0xFF; 32])),
        Arc::new(MemoryStore::new()),
        Arc::new(identity),
        Arc::new(KnownIdVerifier),
        net,
    )
}

async fn settle_forward_state(
    engine: &Engine<MockNet>,
    sub: flowmesh::SubscriptionId,
    done: impl Fn(&ForwardState) -> bool,
) -> ForwardState {
    let poll = async {
        loop {
            if let Some(state) = engine.forward_state(sub).await
                && done(&state)
            {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    timeout(SETTLE_WAIT, poll).await.expect("forward round settles")
}

async fn pending_watch(engine: &Engine<MockNet>, prefix: &Prefix) -> flowmesh::SubscriptionHandle {
    let known = prefix.generate_id();
    let outcome = engine
        .subscribe(
            "token-1",
            SubscribeRequest {
                prefix: prefix.to_hex(),
                format: PrefixFormat::Hex,
                proof: make_proof(&known),
                mode: SubscribeMode::Stream,
                since_ms: None,
                limit: None,
            },
        )
        .await
        .expect("subscribe");
    assert_eq!(outcome.response.status, SubscribeStatus::Pending);
    outcome.subscription.expect("registered")
}

fn forward_request(origin: &PeerContact, prefix: &Prefix, proof: Vec<u8>, forward_ref: [u8; 16]) -> PeerRequest {
    PeerRequest::Forward {
        from: origin.clone(),
        frame: ForwardFrame {
            forward_ref,
            prefix_bytes: prefix.significant_bytes().to_vec(),
            prefix_bits: prefix.bit_len(),
            proof,
            expires_ms: now_ms() + 60_000,
        },
    }
}

// =============================================================================
// Outbound forwarding
// =============================================================================

#[tokio::test]
async fn pending_subscription_forwarded_with_bounded_fanout() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    for tail in 1..=5u8 {
        engine.note_peer(contact(near_peer(&prefix, tail), tail)).await;
    }

    let sub = pending_watch(&engine, &prefix).await;
    let state = settle_forward_state(&engine, sub.id, |s| {
        matches!(s, ForwardState::Forwarded { .. })
    })
    .await;

    let ForwardState::Forwarded { peers } = state else {
        panic!("expected Forwarded");
    };
    assert!(!peers.is_empty() && peers.len() <= FORWARD_FANOUT);

    let forwards = net.forwards();
    let distinct: std::collections::HashSet<PeerId> =
        forwards.iter().map(|(p, _)| *p).collect();
    assert!(distinct.len() <= FORWARD_FANOUT, "fanout bound respected");
    for (_, frame) in &forwards {
        assert_eq!(frame.prefix().unwrap(), prefix);
        assert!(!frame.proof.is_empty(), "frame carries the original proof");
    }
}

#[tokio::test]
async fn failed_peers_retried_then_evicted() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    let good = near_peer(&prefix, 1);
    let bad_a = near_peer(&prefix, 2);
    let bad_b = near_peer(&prefix, 3);
    net.script(bad_a, Script::Fail);
    net.script(bad_b, Script::Fail);
    for (peer, tail) in [(good, 1u8), (bad_a, 2), (bad_b, 3)] {
        engine.note_peer(contact(peer, tail)).await;
    }

    let sub = pending_watch(&engine, &prefix).await;
    let state = settle_forward_state(&engine, sub.id, |s| {
        matches!(s, ForwardState::Forwarded { .. })
    })
    .await;
    assert_eq!(state, ForwardState::Forwarded { peers: vec![good] });

    // Each failing peer got the full retry budget, then was evicted.
    let deadline = tokio::time::Instant::now() + SETTLE_WAIT;
    while engine.stats().await.known_peers != 1 {
        assert!(tokio::time::Instant::now() < deadline, "failed peers not evicted");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let attempts_bad_a = net
        .forwards()
        .iter()
        .filter(|(p, _)| *p == bad_a)
        .count();
    assert_eq!(attempts_bad_a, flowmesh::forward::MAX_FORWARD_ATTEMPTS as usize);
}

#[tokio::test]
async fn all_peers_failing_leaves_subscription_local() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    let bad = near_peer(&prefix, 1);
    net.script(bad, Script::Fail);
    engine.note_peer(contact(bad, 1)).await;

    let sub = pending_watch(&engine, &prefix).await;
    let state =
        settle_forward_state(&engine, sub.id, |s| *s != ForwardState::LocalPending).await;
    assert_eq!(state, ForwardState::Unreachable);

    // Local matching still works for an unreachable-forward subscription.
    assert_eq!(engine.stats().await.subscriptions, 1);
}

#[tokio::test]
async fn no_closer_peer_means_no_forwarding() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    // Self id right on the prefix: every peer is farther.
    let identity = TestIdentity(HashMap::from([(
        "token-1".to_string(),
        Caller {
            agent_id: "agent-1".to_string(),
            default_prefix: Some(prefix),
        },
    )]));
    let engine = Engine::spawn(
        EngineConfig::new(near_peer(&prefix, 0)),
        Arc::new(MemoryStore::new()),
        Arc::new(identity),
        Arc::new(KnownIdVerifier),
        net.clone(),
    );
    engine.note_peer(contact(PeerId::from_bytes([0x11; 32]), 1)).await;

    let sub = pending_watch(&engine, &prefix).await;
    let state =
        settle_forward_state(&engine, sub.id, |s| *s != ForwardState::LocalPending).await;
    assert_eq!(state, ForwardState::Unreachable);
    assert!(net.forwards().is_empty(), "no frame sent to a farther peer");
}

// =============================================================================
// Inbound forward and relay chain
// =============================================================================

#[tokio::test]
async fn inbound_forward_registers_and_relays_matches() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    // Seed one stored event so the origin gets history on arrival.
    engine.publish("token-1", None, b"stored".to_vec()).await.unwrap();

    let origin = contact(PeerId::from_bytes([0x11; 32]), 9);
    let known = prefix.generate_id();
    let forward_ref = [7u8; 16];
    let response = engine
        .handle_peer_request(forward_request(&origin, &prefix, make_proof(&known), forward_ref))
        .await;
    assert!(matches!(response, PeerResponse::Ack));
    assert_eq!(engine.stats().await.subscriptions, 1);

    // History relayed to the origin under the same reference.
    let deadline = tokio::time::Instant::now() + SETTLE_WAIT;
    while net.relays().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no history relay");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let (peer, frame) = net.relays().remove(0);
    assert_eq!(peer, origin.peer_id);
    assert_eq!(frame.forward_ref, forward_ref);

    // A fresh publish relays live.
    let id = engine.publish("token-1", None, b"live".to_vec()).await.unwrap();
    let deadline = tokio::time::Instant::now() + SETTLE_WAIT;
    loop {
        let live = net
            .relays()
            .iter()
            .any(|(p, f)| *p == origin.peer_id && f.event.id == id.to_hex());
        if live {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no live relay");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn repeated_forward_acked_without_duplicate_registration() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    let origin = contact(PeerId::from_bytes([0x11; 32]), 9);
    let known = prefix.generate_id();
    let request = forward_request(&origin, &prefix, make_proof(&known), [7u8; 16]);

    assert!(matches!(
        engine.handle_peer_request(request.clone()).await,
        PeerResponse::Ack
    ));
    assert!(matches!(
        engine.handle_peer_request(request).await,
        PeerResponse::Ack
    ));
    assert_eq!(engine.stats().await.subscriptions, 1);
}

#[tokio::test]
async fn invalid_inbound_forwards_rejected() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);
    let origin = contact(PeerId::from_bytes([0x11; 32]), 9);
    let known = prefix.generate_id();

    // Expired frame.
    let expired = PeerRequest::Forward {
        from: origin.clone(),
        frame: ForwardFrame {
            forward_ref: [1u8; 16],
            prefix_bytes: prefix.significant_bytes().to_vec(),
            prefix_bits: prefix.bit_len(),
            proof: make_proof(&known),
            expires_ms: now_ms().saturating_sub(1_000),
        },
    };
    assert!(matches!(
        engine.handle_peer_request(expired).await,
        PeerResponse::Error { .. }
    ));

    // Garbage proof.
    let bad_proof = forward_request(&origin, &prefix, vec![0u8; 64], [2u8; 16]);
    assert!(matches!(
        engine.handle_peer_request(bad_proof).await,
        PeerResponse::Error { .. }
    ));
    assert_eq!(engine.stats().await.subscriptions, 0);
}

#[tokio::test]
async fn relay_satisfies_local_one_shot() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    let downstream = near_peer(&prefix, 1);
    engine.note_peer(contact(downstream, 1)).await;

    // Register a one-shot that forwards to the downstream peer.
    let known = prefix.generate_id();
    let outcome = engine
        .subscribe(
            "token-1",
            SubscribeRequest {
                prefix: prefix.to_hex(),
                format: PrefixFormat::Hex,
                proof: make_proof(&known),
                mode: SubscribeMode::OneShot,
                since_ms: None,
                limit: None,
            },
        )
        .await
        .unwrap();
    let mut sub = outcome.subscription.expect("registered");
    settle_forward_state(&engine, sub.id, |s| {
        matches!(s, ForwardState::Forwarded { .. })
    })
    .await;

    // The frame the engine sent carries the reference a relay must quote.
    let (_, frame) = net.forwards().remove(0);
    let record = EventRecord::new(prefix.generate_id(), b"remote match".to_vec());
    let relay = PeerRequest::Relay {
        from: contact(downstream, 1),
        frame: RelayFrame {
            forward_ref: frame.forward_ref,
            event: WireEvent::from_record(&record),
        },
    };
    assert!(matches!(
        engine.handle_peer_request(relay.clone()).await,
        PeerResponse::Ack
    ));

    let delivered = timeout(SETTLE_WAIT, sub.events.recv())
        .await
        .expect("delivery in time")
        .expect("channel open");
    assert_eq!(delivered.body, b"remote match");

    // One-shot satisfied: stream ends, the terminal state is queryable,
    // duplicate relays are harmless.
    let end = timeout(SETTLE_WAIT, sub.events.recv()).await.expect("closed");
    assert!(end.is_none());
    assert_eq!(
        engine.forward_state(sub.id).await,
        Some(ForwardState::Satisfied)
    );
    assert!(matches!(
        engine.handle_peer_request(relay).await,
        PeerResponse::Ack
    ));
    assert_eq!(engine.stats().await.subscriptions, 0);
}

#[tokio::test]
async fn relay_outside_prefix_rejected_and_duplicates_suppressed() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    let downstream = near_peer(&prefix, 1);
    engine.note_peer(contact(downstream, 1)).await;
    let sub = pending_watch(&engine, &prefix).await;
    settle_forward_state(&engine, sub.id, |s| {
        matches!(s, ForwardState::Forwarded { .. })
    })
    .await;
    let (_, frame) = net.forwards().remove(0);

    // An event outside the subscribed prefix is refused even with a known
    // reference.
    let mut other_codec = IdentifierCodec::new();
    let foreign = other_codec.compose_topic_prefix(0xe2a6_b9d4_f1c8_7053, "alerts");
    let outside = EventRecord::new(foreign.generate_id(), b"x".to_vec());
    let response = engine
        .handle_peer_request(PeerRequest::Relay {
            from: contact(downstream, 1),
            frame: RelayFrame {
                forward_ref: frame.forward_ref,
                event: WireEvent::from_record(&outside),
            },
        })
        .await;
    assert!(matches!(response, PeerResponse::Error { .. }));

    // The same in-prefix event twice counts one delivery and one duplicate.
    let record = EventRecord::new(prefix.generate_id(), b"dup".to_vec());
    let relay = PeerRequest::Relay {
        from: contact(downstream, 1),
        frame: RelayFrame {
            forward_ref: frame.forward_ref,
            event: WireEvent::from_record(&record),
        },
    };
    engine.handle_peer_request(relay.clone()).await;
    engine.handle_peer_request(relay).await;
    let stats = engine.stats().await;
    assert_eq!(stats.events_delivered, 1);
    assert_eq!(stats.relays_deduplicated, 1);
}

#[tokio::test]
async fn mid_chain_relay_passes_toward_origin() {
    let prefix = topic();
    let net = Arc::new(MockNet::default());
    let engine = mesh_engine(net.clone(), prefix);

    // This node sits between origin A and downstream C.
    let origin = contact(PeerId::from_bytes([0x11; 32]), 8);
    let downstream = contact(near_peer(&prefix, 1), 1);
    engine.note_peer(downstream.clone()).await;

    let known = prefix.generate_id();
    let forward_ref = [5u8; 16];
    engine
        .handle_peer_request(forward_request(&origin, &prefix, make_proof(&known), forward_ref))
        .await;

    // C relays a match; it must continue to A under the same reference.
    let record = EventRecord::new(prefix.generate_id(), b"hop".to_vec());
    engine
        .handle_peer_request(PeerRequest::Relay {
            from: downstream.clone(),
            frame: RelayFrame {
                forward_ref,
                event: WireEvent::from_record(&record),
            },
        })
        .await;

    let deadline = tokio::time::Instant::now() + SETTLE_WAIT;
    loop {
        let chained = net.relays().iter().any(|(p, f)| {
            *p == origin.peer_id
                && f.forward_ref == forward_ref
                && f.event.id == record.id.to_hex()
        });
        if chained {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "relay not chained to origin");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
