use shard_kv::config::{CoordinatorConfig, ShardConfig};
use shard_kv::coordinator::handlers::router as coordinator_router;
use shard_kv::coordinator::registry::ShardRegistry;
use shard_kv::shard::handlers::router as shard_router;
use shard_kv::shard::node::ShardNode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let mut bind_override: Option<SocketAddr> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--bind" => {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--bind needs an address"))?;
                bind_override = Some(value.parse()?);
                i += 2;
            }
            other => {
                tracing::warn!("Ignoring unknown argument '{}'", other);
                i += 1;
            }
        }
    }

    match args[1].as_str() {
        "coordinator" => run_coordinator(bind_override).await,
        "shard" => run_shard(bind_override).await,
        _ => {
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("Usage: {} <coordinator|shard> [--bind <addr:port>]", program);
    eprintln!("Example: {} coordinator --bind 0.0.0.0:8000", program);
    eprintln!(
        "Example: ROLE=leader SHARD_ID=shard-1 COORDINATOR_URL=http://coordinator:8000 {} shard",
        program
    );
}

async fn run_coordinator(bind_override: Option<SocketAddr>) -> anyhow::Result<()> {
    let config = CoordinatorConfig::from_env(bind_override)?;
    tracing::info!(
        "Starting coordinator on {} (liveness window {:?})",
        config.bind_addr,
        config.liveness_window
    );

    // 1. Registry + health sweeper:
    let registry = Arc::new(ShardRegistry::new(config.liveness_window));
    registry.spawn_sweeper();

    // 2. Stats reporter:
    let stats_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);

        loop {
            interval.tick().await;
            let groups = stats_registry.groups();
            tracing::info!(
                "Cluster stats: {} shard groups, {} tables",
                groups.len(),
                stats_registry.tables().len()
            );
            for group in groups {
                tracing::info!(
                    "  - {} leader={} followers={}",
                    group.shard_id,
                    group
                        .leader
                        .as_ref()
                        .map(|l| format!("{} ({:?})", l.address, l.health))
                        .unwrap_or_else(|| "none".to_string()),
                    group.followers.len()
                );
            }
        }
    });

    // 3. HTTP server:
    let app = coordinator_router(registry);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Coordinator stopped");
    Ok(())
}

async fn run_shard(bind_override: Option<SocketAddr>) -> anyhow::Result<()> {
    let config = ShardConfig::from_env(bind_override)?;
    let span = tracing::info_span!("shard", id = %config.shard_id, role = %config.role);

    async move {
        let bind_addr = config.bind_addr;

        // 1. Recovery (WAL replay, snapshot):
        let node = ShardNode::open(config)?;

        // 2. Registration and, for followers, the replication link:
        node.start_background();

        // 3. Stats reporter:
        let stats_node = node.clone();
        tokio::spawn(
            async move {
                while stats_node.pause(STATS_INTERVAL).await {
                    tracing::info!(
                        "Shard stats: phase={:?} last_applied={} keys={} lag={:?}",
                        stats_node.phase(),
                        stats_node.last_applied_sequence(),
                        stats_node.engine().live_count(),
                        stats_node.replication_lag()
                    );
                }
            }
            .in_current_span(),
        );

        // 4. HTTP server:
        let app = shard_router(node.clone());
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!("HTTP server listening on {}", bind_addr);

        let draining = node.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                draining.drain();
            })
            .await?;

        node.stop();
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
