use std::sync::Arc;
use std::time::Duration;

use super::backoff::Backoff;
use super::node::ShardNode;
use crate::coordinator::protocol::{ENDPOINT_REGISTER_SHARD, RegisterShardRequest};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn descriptor(node: &ShardNode) -> RegisterShardRequest {
    let config = node.config();
    RegisterShardRequest {
        shard_id: config.shard_id.clone(),
        role: config.role,
        address: config.address.clone(),
        leader_address: config.leader_url.clone(),
    }
}

/// Registers with the coordinator until it succeeds, then keeps re-registering
/// every heartbeat as the liveness signal. Never gives up: the coordinator may
/// start after the shard.
pub async fn run_registration(node: Arc<ShardNode>) {
    let Some(coordinator_url) = node.config().coordinator_url.clone() else {
        tracing::warn!("No COORDINATOR_URL set, running unregistered");
        node.mark_registered();
        return;
    };
    let url = format!("{}{}", coordinator_url, ENDPOINT_REGISTER_SHARD);
    let request = descriptor(&node);
    let mut backoff = Backoff::new();

    loop {
        let delay = match register_once(node.http_client(), &url, &request).await {
            Ok(()) => {
                backoff.reset();
                if node.mark_registered() {
                    tracing::info!(
                        "Registered shard {} as {} at {}",
                        request.shard_id,
                        request.role,
                        coordinator_url
                    );
                }
                node.config().heartbeat_interval
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    "Registration with {} failed: {}. Retrying in {:?}",
                    coordinator_url,
                    e,
                    delay
                );
                delay
            }
        };

        if !node.pause(delay).await {
            break;
        }
    }
}

async fn register_once(
    client: &reqwest::Client,
    url: &str,
    request: &RegisterShardRequest,
) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .json(request)
        .timeout(REGISTER_TIMEOUT)
        .send()
        .await?;

    if !response.status().is_success() {
        anyhow::bail!("coordinator answered {}", response.status());
    }
    Ok(())
}
