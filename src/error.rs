//! Request-level error taxonomy shared by the shard and coordinator surfaces.
//!
//! A missing key is not an error: reads return `Option` and the handlers turn
//! `None` into a 404. Everything a caller can act on lives in [`KvError`].

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shard::types::Role;

#[derive(Debug, Error)]
pub enum KvError {
    /// Write sent to a follower, or a replication call sent to the leader.
    #[error("operation not allowed on a {role} node")]
    WrongRole {
        role: Role,
        leader_address: Option<String>,
    },

    /// Target shard is unreachable, unhealthy, draining or not registered.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The WAL append could not be persisted. The write did not happen.
    #[error("durability failure: {0}")]
    DurabilityFailure(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A follower claims entries its leader never wrote.
    #[error("replica diverged: {0}")]
    Diverged(String),
}

impl KvError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            KvError::WrongRole { .. } => StatusCode::MISDIRECTED_REQUEST,
            KvError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            KvError::DurabilityFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            KvError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            KvError::TableNotFound(_) => StatusCode::NOT_FOUND,
            KvError::Diverged(_) => StatusCode::CONFLICT,
        }
    }
}

/// JSON body returned alongside every non-success status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
    /// Set on WrongRole so the caller can redirect to the leader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_address: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            leader_address: None,
        }
    }
}

impl IntoResponse for KvError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let leader_address = match &self {
            KvError::WrongRole { leader_address, .. } => leader_address.clone(),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.to_string(),
            leader_address,
        };

        (status, Json(body)).into_response()
    }
}
