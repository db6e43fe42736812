use rand::seq::SliceRandom;
use reqwest::{Method, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::protocol::QuorumReadResponse;
use super::registry::ShardRegistry;
use crate::error::{ErrorResponse, KvError};
use crate::shard::protocol::{
    DeleteResponse, ENDPOINT_STORAGE, ReadResponse, WriteRequest, WriteResponse,
};
use crate::shard::types::Role;

const SHARD_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Storage key on the shard: `partition_key` or `partition_key#sort_key`.
/// Routing only ever looks at the partition key.
pub fn storage_key(partition_key: &str, sort_key: Option<&str>) -> String {
    match sort_key {
        Some(sort_key) if !sort_key.is_empty() => format!("{}#{}", partition_key, sort_key),
        _ => partition_key.to_string(),
    }
}

/// Forwards record operations to the shard that owns them.
pub struct ShardProxy {
    registry: Arc<ShardRegistry>,
    http_client: reqwest::Client,
}

impl ShardProxy {
    pub fn new(registry: Arc<ShardRegistry>) -> Self {
        Self {
            registry,
            http_client: reqwest::Client::new(),
        }
    }

    pub async fn write(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
        value: serde_json::Value,
    ) -> Result<WriteResponse, KvError> {
        if !value.is_object() {
            return Err(KvError::MalformedRequest(
                "value must be a JSON object".to_string(),
            ));
        }
        let leader = self.registry.route_write(table, partition_key)?;
        let key = storage_key(partition_key, sort_key);

        let response = self
            .send(Method::POST, &leader, table, &key, Some(&WriteRequest { value }))
            .await?;
        parse_json(&leader, response).await
    }

    /// Leader read. `None` when the key is absent or deleted.
    pub async fn read(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<Option<ReadResponse>, KvError> {
        let leader = self.registry.route_read(table, partition_key)?;
        let key = storage_key(partition_key, sort_key);

        let response = self.send(Method::GET, &leader, table, &key, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_json(&leader, response).await.map(Some)
    }

    pub async fn exists(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<bool, KvError> {
        let leader = self.registry.route_read(table, partition_key)?;
        let key = storage_key(partition_key, sort_key);

        let response = self.send(Method::HEAD, &leader, table, &key, None).await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(&leader, status, None)),
        }
    }

    pub async fn delete(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
    ) -> Result<DeleteResponse, KvError> {
        let leader = self.registry.route_write(table, partition_key)?;
        let key = storage_key(partition_key, sort_key);

        let response = self.send(Method::DELETE, &leader, table, &key, None).await?;
        parse_json(&leader, response).await
    }

    /// Reads from `r` randomly chosen live replicas in parallel and keeps the
    /// answer with the highest version.
    pub async fn quorum_read(
        &self,
        table: &str,
        partition_key: &str,
        sort_key: Option<&str>,
        r: usize,
    ) -> Result<Option<QuorumReadResponse>, KvError> {
        let replicas = self.registry.route_replicas(table, partition_key)?;
        if r == 0 || r > replicas.len() {
            return Err(KvError::MalformedRequest(format!(
                "quorum of {} needs between 1 and {} live replicas",
                r,
                replicas.len()
            )));
        }

        let targets: Vec<String> = replicas
            .choose_multiple(&mut rand::thread_rng(), r)
            .cloned()
            .collect();
        let key = storage_key(partition_key, sort_key);

        let mut reads = JoinSet::new();
        for target in targets {
            let url = shard_url(&target, table, &key)?;
            let client = self.http_client.clone();
            reads.spawn(async move {
                let response = client.get(url).timeout(SHARD_TIMEOUT).send().await;
                (target, response)
            });
        }

        let mut responded = 0;
        let mut best: Option<ReadResponse> = None;
        while let Some(joined) = reads.join_next().await {
            let Ok((target, response)) = joined else {
                continue;
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Quorum read from {} failed: {}", target, e);
                    continue;
                }
            };

            match response.status() {
                StatusCode::OK => match response.json::<ReadResponse>().await {
                    Ok(read) => {
                        responded += 1;
                        if best.as_ref().is_none_or(|b| read.version > b.version) {
                            best = Some(read);
                        }
                    }
                    Err(e) => tracing::warn!("Bad quorum reply from {}: {}", target, e),
                },
                StatusCode::NOT_FOUND => responded += 1,
                status => tracing::warn!("Quorum read from {} answered {}", target, status),
            }
        }

        if responded == 0 {
            return Err(KvError::Unavailable(
                "no replica answered the quorum read".to_string(),
            ));
        }

        Ok(best.map(|read| QuorumReadResponse {
            value: read.value,
            version: read.version,
            quorum_met: responded >= r,
            responses: responded,
        }))
    }

    async fn send(
        &self,
        method: Method,
        address: &str,
        table: &str,
        key: &str,
        body: Option<&WriteRequest>,
    ) -> Result<reqwest::Response, KvError> {
        let url = shard_url(address, table, key)?;
        let request_id = Uuid::new_v4();
        tracing::debug!("[{}] {} {}", request_id, method, url);

        let mut request = self
            .http_client
            .request(method, url)
            .header(REQUEST_ID_HEADER, request_id.to_string())
            .timeout(SHARD_TIMEOUT);
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|e| {
            tracing::warn!("[{}] shard {} unreachable: {}", request_id, address, e);
            KvError::Unavailable(format!("shard {} unreachable", address))
        })
    }
}

/// `{address}/storage/{table}/{key}` with each segment percent-encoded, so
/// `#` in compound keys survives the trip.
fn shard_url(address: &str, table: &str, key: &str) -> Result<Url, KvError> {
    let mut url = Url::parse(address)
        .map_err(|e| KvError::Unavailable(format!("bad shard address {}: {}", address, e)))?;
    url.path_segments_mut()
        .map_err(|_| KvError::Unavailable(format!("bad shard address {}", address)))?
        .pop_if_empty()
        .extend([ENDPOINT_STORAGE.trim_start_matches('/'), table, key]);
    Ok(url)
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    address: &str,
    response: reqwest::Response,
) -> Result<T, KvError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.json::<ErrorResponse>().await.ok();
        return Err(status_error(address, status, body));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| KvError::Unavailable(format!("bad reply from shard {}: {}", address, e)))
}

/// Maps a shard's error status back onto the coordinator's taxonomy.
fn status_error(address: &str, status: StatusCode, body: Option<ErrorResponse>) -> KvError {
    let message = body
        .as_ref()
        .map(|b| b.error.clone())
        .unwrap_or_else(|| format!("shard {} answered {}", address, status));

    match status {
        StatusCode::MISDIRECTED_REQUEST => KvError::WrongRole {
            role: Role::Follower,
            leader_address: body.and_then(|b| b.leader_address),
        },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            KvError::MalformedRequest(message)
        }
        StatusCode::INTERNAL_SERVER_ERROR => KvError::DurabilityFailure(message),
        _ => KvError::Unavailable(message),
    }
}
