use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::sync::Arc;

use super::protocol::*;
use super::registry::ShardRegistry;
use super::router::ShardProxy;
use super::types::TableDef;
use crate::error::{ErrorResponse, KvError};
use crate::shard::protocol::{DeleteResponse, WriteResponse};

/// HTTP surface of the coordinator.
pub fn router(registry: Arc<ShardRegistry>) -> Router {
    let proxy = Arc::new(ShardProxy::new(registry.clone()));

    Router::new()
        .route(
            ENDPOINT_TABLES,
            post(handle_create_table).get(handle_list_tables),
        )
        .route(
            "/tables/:table/records",
            post(handle_write_record).get(handle_scan),
        )
        .route(
            "/tables/:table/records/:key",
            get(handle_read_record)
                .head(handle_record_exists)
                .delete(handle_delete_record),
        )
        .route("/tables/:table/records/:key/quorum", get(handle_quorum_read))
        .route(ENDPOINT_REGISTER_SHARD, post(handle_register_shard))
        .route(ENDPOINT_SHARDS, get(handle_topology))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .layer(Extension(proxy))
        .layer(Extension(registry))
}

// ============================================================
// TABLES
// ============================================================

pub async fn handle_create_table(
    Extension(registry): Extension<Arc<ShardRegistry>>,
    Json(req): Json<CreateTableRequest>,
) -> Result<(StatusCode, Json<CreateTableResponse>), KvError> {
    let created = registry.create_table(&req.name, req.shards)?;
    let table = registry
        .table(&req.name)
        .ok_or_else(|| KvError::TableNotFound(req.name.clone()))?;

    let status = if created { "created" } else { "exists" };
    Ok((
        StatusCode::OK,
        Json(CreateTableResponse {
            status: status.to_string(),
            table,
        }),
    ))
}

pub async fn handle_list_tables(
    Extension(registry): Extension<Arc<ShardRegistry>>,
) -> (StatusCode, Json<Vec<TableDef>>) {
    (StatusCode::OK, Json(registry.tables()))
}

/// Scans are not supported; answered explicitly rather than as an error.
pub async fn handle_scan(Path(table): Path<String>) -> (StatusCode, Json<ScanResponse>) {
    tracing::debug!("Scan requested on {}", table);
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(ScanResponse {
            status: "not_implemented".to_string(),
        }),
    )
}

// ============================================================
// RECORDS
// ============================================================

pub async fn handle_write_record(
    Extension(proxy): Extension<Arc<ShardProxy>>,
    Path(table): Path<String>,
    Json(req): Json<WriteRecordRequest>,
) -> Result<(StatusCode, Json<WriteResponse>), KvError> {
    if req.partition_key.is_empty() {
        return Err(KvError::MalformedRequest(
            "partition_key is required".to_string(),
        ));
    }

    let response = proxy
        .write(&table, &req.partition_key, req.sort_key.as_deref(), req.value)
        .await?;
    Ok((StatusCode::OK, Json(response)))
}

pub async fn handle_read_record(
    Extension(proxy): Extension<Arc<ShardProxy>>,
    Path((table, key)): Path<(String, String)>,
    Query(query): Query<RecordQuery>,
) -> Result<Response, KvError> {
    let record = proxy.read(&table, &key, query.sort_key.as_deref()).await?;
    Ok(match record {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorResponse::new("not found"))).into_response(),
    })
}

pub async fn handle_record_exists(
    Extension(proxy): Extension<Arc<ShardProxy>>,
    Path((table, key)): Path<(String, String)>,
    Query(query): Query<RecordQuery>,
) -> StatusCode {
    match proxy.exists(&table, &key, query.sort_key.as_deref()).await {
        Ok(true) => StatusCode::OK,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => e.status_code(),
    }
}

pub async fn handle_delete_record(
    Extension(proxy): Extension<Arc<ShardProxy>>,
    Path((table, key)): Path<(String, String)>,
    Query(query): Query<RecordQuery>,
) -> Result<(StatusCode, Json<DeleteResponse>), KvError> {
    let response = proxy.delete(&table, &key, query.sort_key.as_deref()).await?;
    Ok((StatusCode::OK, Json(response)))
}

pub async fn handle_quorum_read(
    Extension(proxy): Extension<Arc<ShardProxy>>,
    Path((table, key)): Path<(String, String)>,
    Query(query): Query<QuorumQuery>,
) -> Result<Response, KvError> {
    let r = query.r.unwrap_or(DEFAULT_QUORUM);
    let record = proxy
        .quorum_read(&table, &key, query.sort_key.as_deref(), r)
        .await?;

    Ok(match record {
        Some(record) => (StatusCode::OK, Json(record)).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ErrorResponse::new("not found"))).into_response(),
    })
}

// ============================================================
// SHARDS
// ============================================================

pub async fn handle_register_shard(
    Extension(registry): Extension<Arc<ShardRegistry>>,
    Json(req): Json<RegisterShardRequest>,
) -> Result<(StatusCode, Json<RegisterShardResponse>), KvError> {
    if req.shard_id.trim().is_empty() || req.address.trim().is_empty() {
        return Err(KvError::MalformedRequest(
            "shard_id and address are required".to_string(),
        ));
    }

    let descriptor = registry.register_shard(req);
    tracing::debug!(
        "Heartbeat from {} {} at {}",
        descriptor.shard_id,
        descriptor.role,
        descriptor.address
    );

    Ok((
        StatusCode::OK,
        Json(RegisterShardResponse {
            status: "registered".to_string(),
        }),
    ))
}

pub async fn handle_topology(
    Extension(registry): Extension<Arc<ShardRegistry>>,
) -> (StatusCode, Json<TopologyResponse>) {
    (
        StatusCode::OK,
        Json(TopologyResponse {
            groups: registry.groups(),
        }),
    )
}

pub async fn handle_health(
    Extension(registry): Extension<Arc<ShardRegistry>>,
) -> (StatusCode, Json<CoordinatorHealthResponse>) {
    (
        StatusCode::OK,
        Json(CoordinatorHealthResponse {
            status: "ok".to_string(),
            tables: registry.tables().len(),
            shard_groups: registry.groups().len(),
            healthy_leaders: registry.healthy_leaders(),
        }),
    )
}
