//! JSON over HTTP for the dashboard.

use crate::assemble::{LineChart, MapMarker, SiteVariable};
use crate::dispatcher::{Dispatcher, OverviewRequest};
use crate::error::DetectError;
use crate::metrics;
use crate::model::{DetectionRequest, DetectionResult, Granularity, Site, SiteId};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Request failure mapped onto an HTTP status.
#[derive(Debug)]
pub enum ApiError {
    Detect(DetectError),
    SiteNotFound(SiteId),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Detect(e) => match e {
                DetectError::NotFound { .. } => StatusCode::NOT_FOUND,
                DetectError::InvalidRange { .. } | DetectError::InvalidParams { .. } => {
                    StatusCode::BAD_REQUEST
                }
                DetectError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                DetectError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                DetectError::LengthMismatch { .. } | DetectError::Store(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::SiteNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        ApiError::Detect(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::Detect(e) => ErrorBody {
                error: e.kind(),
                message: e.to_string(),
            },
            ApiError::SiteNotFound(id) => ErrorBody {
                error: "not_found",
                message: format!("unknown site {}", id),
            },
            ApiError::Internal(message) => {
                error!(message = %message, "Request failed.");
                ErrorBody {
                    error: "internal",
                    message,
                }
            }
        };
        (status, Json(body)).into_response()
    }
}

/// Detection is CPU-bound and synchronous; keep it off the async workers.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Dispatcher) -> Result<T, DetectError> + Send + 'static,
{
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::task::spawn_blocking(move || f(&dispatcher))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map_err(ApiError::from)
}

pub async fn detect(
    State(state): State<AppState>,
    Json(request): Json<DetectionRequest>,
) -> Result<Json<DetectionResult>, ApiError> {
    blocking(&state, move |d| d.detect(&request)).await.map(Json)
}

pub async fn overview(
    State(state): State<AppState>,
    Json(request): Json<OverviewRequest>,
) -> Result<Json<Vec<MapMarker>>, ApiError> {
    blocking(&state, move |d| d.overview(&request)).await.map(Json)
}

pub async fn chart(
    State(state): State<AppState>,
    Json(request): Json<DetectionRequest>,
) -> Result<Json<LineChart>, ApiError> {
    blocking(&state, move |d| d.chart(&request)).await.map(Json)
}

pub async fn site(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
) -> Result<Json<Site>, ApiError> {
    let site_id = SiteId::new(site_id);
    let lookup = site_id.clone();
    match blocking(&state, move |d| Ok(d.series_store().site(&lookup)?)).await? {
        Some(site) => Ok(Json(site)),
        None => Err(ApiError::SiteNotFound(site_id)),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VariablesQuery {
    #[serde(default)]
    pub granularity: Granularity,
}

pub async fn site_variables(
    State(state): State<AppState>,
    Path(site_id): Path<String>,
    Query(query): Query<VariablesQuery>,
) -> Result<Json<Vec<SiteVariable>>, ApiError> {
    let site_id = SiteId::new(site_id);
    let lookup = site_id.clone();
    match blocking(&state, move |d| d.site_variables(&lookup, query.granularity)).await? {
        Some(variables) => Ok(Json(variables)),
        None => Err(ApiError::SiteNotFound(site_id)),
    }
}

pub async fn metrics_handler() -> String {
    metrics::render()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/detect", post(detect))
        .route("/overview", post(overview))
        .route("/chart", post(chart))
        .route("/sites/{site_id}", get(site))
        .route("/sites/{site_id}/variables", get(site_variables))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}
