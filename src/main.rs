use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use xorkad::{DhtConfig, Key, LoopbackNode, LoopbackRegistry};

/// Build a loopback Kademlia network, store keys and look them up again.
#[derive(Parser, Debug)]
#[command(name = "xorkad")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the network.
    #[arg(short, long, default_value = "32")]
    nodes: usize,

    /// Number of keys stored from the first node.
    #[arg(long, default_value = "16")]
    keys: usize,

    /// Bucket capacity and replication factor.
    #[arg(short, long, default_value_t = xorkad::K)]
    k: usize,

    /// Concurrent requests per lookup round.
    #[arg(short, long, default_value_t = xorkad::ALPHA)]
    alpha: usize,

    /// Per-call timeout in milliseconds.
    #[arg(long, default_value = "500")]
    rpc_timeout_ms: u64,

    /// Fraction of nodes (other than the first) made unreachable before lookups.
    #[arg(short, long, default_value = "0.0")]
    unreachable: f64,
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

    if args.nodes < 2 {
        bail!("need at least 2 nodes, got {}", args.nodes);
    }
    if !(0.0..1.0).contains(&args.unreachable) {
        bail!("--unreachable must be in [0, 1), got {}", args.unreachable);
    }

    let config = DhtConfig {
        k: args.k,
        alpha: args.alpha,
        ..DhtConfig::default()
    };
    let registry = LoopbackRegistry::new(Duration::from_millis(args.rpc_timeout_ms));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting");
        }
        result = simulate(&registry, &args, config) => result?,
    }

    registry.shutdown_all().await;
    Ok(())
}

async fn simulate(registry: &std::sync::Arc<LoopbackRegistry>, args: &Args, config: DhtConfig) -> Result<()> {
    let mut nodes: Vec<LoopbackNode> = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let node = registry.spawn_node(config.clone()).await;
        if let Some(previous) = nodes.last()
            && let Err(e) = node.join(previous.contact()).await
        {
            warn!(node = %node.key(), error = %e, "join failed");
        }
        nodes.push(node);
    }
    let filled: usize = nodes.iter().map(|n| n.routing_table().len()).sum();
    info!(
        nodes = nodes.len(),
        avg_routing_entries = filled / nodes.len(),
        "network built"
    );

    let keys: Vec<Key> = (0..args.keys).map(|i| Key::digest(&format!("key-{i}"))).collect();
    for (i, key) in keys.iter().enumerate() {
        let acked = nodes[0]
            .iterative_store_value(*key, format!("value-{i}").into_bytes())
            .await?;
        info!(key = %key, acked, "stored");
    }

    let mut rng = rand::thread_rng();
    let down = ((nodes.len() - 1) as f64 * args.unreachable).round() as usize;
    let mut others: Vec<&LoopbackNode> = nodes[1..].iter().collect();
    others.shuffle(&mut rng);
    let (offline, online) = others.split_at(down);
    for node in offline {
        registry.set_unreachable(&node.contact().address, true).await;
    }
    if down > 0 {
        info!(unreachable = down, "marked nodes unreachable");
    }

    let mut hits = 0usize;
    let mut misses = 0usize;
    for (i, key) in keys.iter().enumerate() {
        let querier = if online.is_empty() {
            &nodes[0]
        } else {
            online[rng.gen_range(0..online.len())]
        };
        let found = querier.iterative_find_value(*key, false).await?;
        let expected = format!("value-{i}").into_bytes();
        if found.into_values().first() == Some(&expected) {
            hits += 1;
        } else {
            misses += 1;
            warn!(key = %key, from = %querier.key(), "lookup missed");
        }
    }

    let filled_buckets: usize = nodes
        .iter()
        .map(|n| n.routing_table().filled_buckets().len())
        .sum();
    info!(
        hits,
        misses,
        avg_filled_buckets = filled_buckets / nodes.len(),
        "simulation finished"
    );
    Ok(())
}
