use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tracing::error;

use crate::{
    domain::{QueryRequest, RecordsPage},
    gather::{GatherError, ScatterGather},
    tenant::TenantResolver,
};

const UNEXPECTED_SERVER_ERROR: &str = "Unexpected Server Error";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ScatterGather>,
    pub tenants: Arc<TenantResolver>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    /// Clients only ever see a generic message; the detail goes to the log.
    pub fn internal(detail: impl std::fmt::Display) -> Self {
        error!(%detail, "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, UNEXPECTED_SERVER_ERROR)
    }
}

impl From<GatherError> for ApiError {
    fn from(value: GatherError) -> Self {
        match value {
            GatherError::Identity(e) if e.is_not_found() => ApiError::not_found(e.to_string()),
            other => ApiError::internal(other),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub fn build_router(engine: Arc<ScatterGather>, tenants: Arc<TenantResolver>) -> Router {
    let state = AppState { engine, tenants };

    Router::new()
        .route("/:collection", get(get_records).fallback(not_found))
        .route("/:collection/", get(get_records).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

async fn get_records(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<RecordsPage>, ApiError> {
    let Some(tenant) = state.tenants.resolve(&headers) else {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        return Err(ApiError::not_found(format!(
            "database name not found for host \"{host}\""
        )));
    };

    let limit = params
        .iter()
        .find(|(key, _)| key == "limit")
        .map(|(_, value)| value.as_str());
    let request =
        QueryRequest::new(tenant, collection, raw_query, limit).with_forwarded_headers(&headers);
    let page = state.engine.gather(&request).await?;
    Ok(Json(page))
}

async fn not_found() -> ApiError {
    ApiError::not_found("not found")
}
