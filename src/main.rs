use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use flowmesh::{
    Caller, Engine, EngineConfig, EventRecord, IdentifierCodec, IdentityProvider, KnownIdVerifier,
    MemoryStore, PeerContact, PeerId, PeerRpc, SubscribeMode, SubscribeRequest,
};
use flowmesh::messages::{ForwardFrame, RelayFrame};
use flowmesh::proof::make_proof;

#[derive(Parser, Debug)]
#[command(name = "flowmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Org identifier for the demo tenancy.
    #[arg(short, long, default_value = "42")]
    org: u64,

    /// Topic path events are published under.
    #[arg(short, long, default_value = "sensors/temp")]
    topic: String,

    /// Seconds between demo publishes.
    #[arg(short, long, default_value = "2")]
    publish_interval: u64,

    /// Seconds between stats snapshots.
    #[arg(short, long, default_value = "30")]
    stats_interval: u64,
}

/// Fixed credential table for a standalone node.
struct StaticIdentity {
    agents: HashMap<String, Caller>,
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn resolve_caller(&self, credential: &str) -> Option<Caller> {
        self.agents.get(credential).cloned()
    }
}

/// Transport stub for a node running without mesh peers.
struct NoPeers;

#[async_trait]
impl PeerRpc for NoPeers {
    async fn send_forward(&self, _peer: &PeerContact, _frame: ForwardFrame) -> Result<()> {
        anyhow::bail!("standalone node has no peer transport")
    }

    async fn send_relay(&self, _peer: &PeerContact, _frame: RelayFrame) -> Result<()> {
        anyhow::bail!("standalone node has no peer transport")
    }

    async fn ping(&self, _peer: &PeerContact) -> Result<()> {
        anyhow::bail!("standalone node has no peer transport")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut codec = IdentifierCodec::new();
    let topic_prefix = codec.compose_topic_prefix(args.org, &args.topic);
    info!(prefix = %topic_prefix, "demo topic prefix");

    let identity = StaticIdentity {
        agents: HashMap::from([(
            "demo-token".to_string(),
            Caller {
                agent_id: "demo-agent".to_string(),
                default_prefix: Some(topic_prefix.clone()),
            },
        )]),
    };

    let self_id = PeerId::from_bytes(*topic_prefix.generate_id().as_bytes());
    let engine = Engine::spawn(
        EngineConfig::new(self_id),
        Arc::new(MemoryStore::new()),
        Arc::new(identity),
        Arc::new(KnownIdVerifier),
        Arc::new(NoPeers),
    );

    // Seed one event so the watcher's proof has something to reference.
    let first_id = engine
        .publish("demo-token", None, b"boot".to_vec())
        .await?;

    let outcome = engine
        .subscribe(
            "demo-token",
            SubscribeRequest {
                prefix: topic_prefix.to_hex(),
                format: flowmesh::PrefixFormat::Hex,
                proof: make_proof(&first_id),
                mode: SubscribeMode::Stream,
                since_ms: None,
                limit: None,
            },
        )
        .await?;
    info!(status = ?outcome.response.status, catchup = outcome.history.len(), "watch registered");
    let mut subscription = outcome
        .subscription
        .ok_or_else(|| anyhow::anyhow!("watch was not registered"))?;

    tokio::spawn(async move {
        while let Some(EventRecord { id, body, .. }) = subscription.events.recv().await {
            info!(event = %id, body = %String::from_utf8_lossy(&body), "event delivered");
        }
    });

    let mut publish_tick = time::interval(Duration::from_secs(args.publish_interval));
    let mut stats_tick = time::interval(Duration::from_secs(args.stats_interval));
    let mut seq = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = publish_tick.tick() => {
                seq += 1;
                let body = format!("reading {seq}").into_bytes();
                if let Err(e) = engine.publish("demo-token", None, body).await {
                    warn!(error = %e, "publish failed");
                }
            }
            _ = stats_tick.tick() => {
                let stats = engine.stats().await;
                info!(
                    subscriptions = stats.subscriptions,
                    peers = stats.known_peers,
                    published = stats.events_published,
                    delivered = stats.events_delivered,
                    dropped = stats.deliveries_dropped,
                    "stats snapshot"
                );
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
