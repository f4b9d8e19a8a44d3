use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::user_extractor::Requester;
use crate::model::{BranchQueueEntry, NewBranchQueueEntry};
use crate::store::BranchQueueStore;

pub type AppState = Arc<dyn BranchQueueStore>;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueueResponse {
    pub id: u64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error(e: anyhow::Error) -> ApiError {
    error!("Branch queue request failed: {:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(&format!("{:#}", e))),
    )
}

pub async fn list_queue_entries(
    State(store): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<BranchQueueEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let items = store.list_entries(limit).await.map_err(internal_error)?;
    let total = items.len();
    Ok(Json(ListResponse { items, total }))
}

pub async fn get_queue_entry(
    State(store): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<BranchQueueEntry>, ApiError> {
    match store.get_entry(id).await {
        Ok(Some(entry)) => Ok(Json(entry)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!("Branch queue entry #{} not found", id))),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

pub async fn enqueue_entry(
    State(store): State<AppState>,
    requester: Requester,
    RequestJson(mut request): RequestJson<NewBranchQueueEntry>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    if request.added_by.trim().is_empty() {
        request.added_by = requester.name;
    }
    if request.user_id == 0 {
        request.user_id = requester.user_id;
    }

    if let Err(e) = request.validate() {
        return Err((StatusCode::BAD_REQUEST, Json(ErrorResponse::new(&e.to_string()))));
    }

    let action = request.action;
    let name = request.name.clone();
    let id = store.enqueue(request).await.map_err(internal_error)?;
    info!("Queued {} of '{}' as row #{}", action, name, id);
    Ok((StatusCode::CREATED, Json(EnqueueResponse { id })))
}
