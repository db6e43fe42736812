use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;

use super::node::ShardNode;
use super::protocol::*;
use crate::error::{ErrorResponse, KvError};
use crate::wal::types::WalEntry;

/// HTTP surface of a shard node.
pub fn router(node: Arc<ShardNode>) -> Router {
    Router::new()
        .route(
            "/storage/:table/:key",
            get(handle_read)
                .head(handle_exists)
                .post(handle_write)
                .delete(handle_delete),
        )
        .route(ENDPOINT_REPLICATION_SUBSCRIBE, post(handle_subscribe))
        .route(ENDPOINT_REPLICATION_APPEND, post(handle_append))
        .route(ENDPOINT_REPLICATION_LOG, get(handle_read_log))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_DEBUG_DUMP, get(handle_dump))
        .layer(Extension(node))
}

pub async fn handle_write(
    Extension(node): Extension<Arc<ShardNode>>,
    Path((table, key)): Path<(String, String)>,
    Json(req): Json<WriteRequest>,
) -> Result<(StatusCode, Json<WriteResponse>), KvError> {
    let serde_json::Value::Object(value) = req.value else {
        return Err(KvError::MalformedRequest(
            "value must be a JSON object".to_string(),
        ));
    };

    let receipt = node.write(&table, &key, value).await?;
    Ok((
        StatusCode::OK,
        Json(WriteResponse {
            version: receipt.version,
            sequence: receipt.sequence,
            replicated: receipt.replicated,
        }),
    ))
}

pub async fn handle_read(
    Extension(node): Extension<Arc<ShardNode>>,
    Path((table, key)): Path<(String, String)>,
) -> Response {
    match node.read(&table, &key) {
        Some(record) => (
            StatusCode::OK,
            Json(ReadResponse {
                value: record.value,
                version: record.version,
            }),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorResponse::new("not found"))).into_response(),
    }
}

pub async fn handle_exists(
    Extension(node): Extension<Arc<ShardNode>>,
    Path((table, key)): Path<(String, String)>,
) -> StatusCode {
    if node.read(&table, &key).is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn handle_delete(
    Extension(node): Extension<Arc<ShardNode>>,
    Path((table, key)): Path<(String, String)>,
) -> Result<(StatusCode, Json<DeleteResponse>), KvError> {
    let receipt = node.delete(&table, &key).await?;
    Ok((
        StatusCode::OK,
        Json(DeleteResponse {
            deleted: receipt.deleted,
            sequence: receipt.sequence,
        }),
    ))
}

pub async fn handle_subscribe(
    Extension(node): Extension<Arc<ShardNode>>,
    Json(req): Json<SubscribeRequest>,
) -> Result<(StatusCode, Json<SubscribeResponse>), KvError> {
    let address = req.address.trim_end_matches('/');
    if address.is_empty() {
        return Err(KvError::MalformedRequest("address is required".to_string()));
    }

    let leader_last_sequence = node.accept_subscriber(address, req.last_applied_sequence)?;
    Ok((
        StatusCode::OK,
        Json(SubscribeResponse {
            leader_last_sequence,
        }),
    ))
}

pub async fn handle_append(
    Extension(node): Extension<Arc<ShardNode>>,
    Json(req): Json<AppendEntriesRequest>,
) -> Result<(StatusCode, Json<AppendEntriesResponse>), KvError> {
    tracing::debug!(
        "Received {} entries from {} (leader at {})",
        req.entries.len(),
        req.leader_address,
        req.leader_last_sequence
    );

    let last_applied_sequence = node
        .apply_replicated(req.leader_last_sequence, req.entries)
        .await?;
    Ok((
        StatusCode::OK,
        Json(AppendEntriesResponse {
            last_applied_sequence,
        }),
    ))
}

pub async fn handle_read_log(
    Extension(node): Extension<Arc<ShardNode>>,
    Query(query): Query<LogQuery>,
) -> Result<(StatusCode, Json<Vec<WalEntry>>), KvError> {
    let entries = node.read_log(
        query.start_sequence.unwrap_or(1),
        query.limit.unwrap_or(MAX_REPLICATION_BATCH),
    )?;
    Ok((StatusCode::OK, Json(entries)))
}

pub async fn handle_health(
    Extension(node): Extension<Arc<ShardNode>>,
) -> (StatusCode, Json<HealthResponse>) {
    let config = node.config();
    (
        StatusCode::OK,
        Json(HealthResponse {
            shard_id: config.shard_id.clone(),
            role: config.role,
            phase: node.phase(),
            last_applied_sequence: node.last_applied_sequence(),
            keys: node.engine().live_count(),
            replication_lag: node.replication_lag(),
            followers: node.hub().statuses(),
        }),
    )
}

pub async fn handle_dump(
    Extension(node): Extension<Arc<ShardNode>>,
) -> (StatusCode, Json<DumpResponse>) {
    let keys: Vec<String> = node
        .engine()
        .live_keys()
        .into_iter()
        .map(|(table, key)| format!("{}/{}", table, key))
        .collect();

    (
        StatusCode::OK,
        Json(DumpResponse {
            count: keys.len(),
            keys,
        }),
    )
}
