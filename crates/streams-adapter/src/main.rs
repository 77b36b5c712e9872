//! streams-fiddle: Runs a small cluster in one process.
//!
//! Several nodes share one in-memory substrate, attach two namespaces and
//! exercise broadcasts, rooms, multi-node queries and session recovery,
//! logging what each node observes.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cluster_core::{BroadcastOptions, MemoryNamespace, Packet, PersistedSession, Value};
use streams_adapter::{FiddleConfig, InMemoryBackend, NamespaceAdapter, StreamsAdapter};

#[derive(Parser, Debug)]
#[command(name = "streams-fiddle")]
#[command(about = "Log-backed cluster playground")]
struct Args {
    /// Path to a JSON config file (defaults are used when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of nodes to start
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

/// One simulated server process.
struct Node {
    adapter: StreamsAdapter,
    root: NamespaceAdapter,
    custom: NamespaceAdapter,
    root_sockets: Arc<MemoryNamespace>,
    socket_id: String,
}

/// Time for log entries and pub/sub messages to reach every node.
const PROPAGATION_DELAY: Duration = Duration::from_millis(200);

async fn settle() {
    tokio::time::sleep(PROPAGATION_DELAY).await;
}

async fn start_node(index: usize, backend: &Arc<InMemoryBackend>, config: &FiddleConfig) -> Result<Node> {
    let adapter = StreamsAdapter::new(
        backend.clone(),
        config.streams.clone(),
        config.cluster.clone(),
    )
    .await
    .context("Failed to create adapter")?;

    let root_sockets = MemoryNamespace::new("/");
    root_sockets.add_server_side_handler(move |args, reply| {
        info!("Node {} got server-side event {:?}", index, args);
        if let Some(reply) = reply {
            reply.reply(Value::from(format!("node-{}", index)));
        }
    });
    let root = adapter.attach(root_sockets.clone()).await?;
    let custom = adapter.attach(MemoryNamespace::new("/custom")).await?;

    let socket_id = root_sockets.connect();
    info!("Node {} is {} with socket {}", index, root.uid(), socket_id);

    Ok(Node {
        adapter,
        root,
        custom,
        root_sockets,
        socket_id,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,streams_adapter=debug,cluster_core=debug"
    } else {
        "info,streams_adapter=info,cluster_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = FiddleConfig::load_or_default(args.config.as_deref())?;
    if config.cluster.recovery.is_none() {
        info!("Enabling connection state recovery for the demo");
        config.cluster = config.cluster.with_recovery();
    }
    anyhow::ensure!(args.nodes >= 1, "at least one node is required");

    info!("Starting {} nodes", args.nodes);
    info!("Streams: {} x {}", config.streams.stream_count, config.streams.stream_name);

    let backend = InMemoryBackend::new();
    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        nodes.push(start_node(index, &backend, &config).await?);
    }
    settle().await;

    let first = &nodes[0];
    let last = &nodes[nodes.len() - 1];
    info!("Cluster size seen by node 0: {}", first.root.server_count().await);

    // Rooms
    first
        .root
        .add_sockets(BroadcastOptions::new().to(first.socket_id.clone()), vec!["room1".into()])
        .await?;

    // Broadcasts
    first
        .root
        .broadcast(Packet::event("hello", [Value::from("everyone")]), BroadcastOptions::new())
        .await?;
    last.root
        .broadcast(Packet::event("psst", [Value::from("room1 only")]), BroadcastOptions::new().to("room1"))
        .await?;
    last.custom
        .broadcast(Packet::event("custom", []), BroadcastOptions::new())
        .await?;
    settle().await;

    for (index, node) in nodes.iter().enumerate() {
        let events: Vec<String> = node
            .root_sockets
            .inbox(&node.socket_id)
            .iter()
            .filter_map(|p| p.event_name().map(str::to_string))
            .collect();
        info!("Node {} socket received {:?}", index, events);
    }

    // Multi-node queries
    match first.root.fetch_sockets(BroadcastOptions::new()).await {
        Ok(sockets) => info!("fetchSockets returned {} sockets", sockets.len()),
        Err(e) => warn!("fetchSockets failed: {}", e),
    }
    match first
        .root
        .server_side_emit_with_ack(vec![Value::from("ping")])
        .await
    {
        Ok(replies) => info!("serverSideEmit replies: {:?}", replies),
        Err(e) => warn!("serverSideEmit failed: {}", e),
    }

    // Session recovery
    let observer = last;
    let offset = observer
        .root_sockets
        .inbox(&observer.socket_id)
        .iter()
        .find(|p| p.event_name() == Some("hello"))
        .and_then(|p| p.data.last().and_then(Value::as_str).map(str::to_string))
        .context("No recovery offset in the received packet")?;

    let session = PersistedSession {
        sid: observer.socket_id.clone(),
        pid: uuid::Uuid::new_v4().to_string(),
        rooms: observer
            .root_sockets
            .rooms_of(&observer.socket_id)
            .into_iter()
            .collect(),
        data: Value::Null,
    };
    observer.root.persist_session(&session).await?;
    first
        .root
        .broadcast(Packet::event("while-away", []), BroadcastOptions::new())
        .await?;

    match observer.root.restore_session(&session.pid, &offset).await {
        Ok(restored) => info!(
            "Restored session {} with {} missed packets",
            restored.sid,
            restored.missed_packets.len()
        ),
        Err(e) => warn!("Failed to restore session: {}", e),
    }

    // Shutdown
    for node in &nodes {
        node.custom.close().await;
        node.root.close().await;
        node.adapter.close().await;
    }
    info!("All nodes stopped");

    Ok(())
}
