//! HTTP surface over the orchestrator.
//!
//! Identity arrives resolved: the `x-user-id` header names the caller and
//! `x-admin: true` grants the admin view. Authenticating those headers is
//! the job of whatever sits in front of this service.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use wahub_common::HubError;
use wahub_core::{
    CreateInstanceSpec, EventBroadcaster, MetricsCollector, Orchestrator, Requester,
    UpdateInstanceSpec,
};

use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub collector: Arc<MetricsCollector>,
    pub broadcaster: Arc<EventBroadcaster>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/instances", post(create_instance).get(list_instances))
        .route(
            "/api/v1/instances/:id",
            get(get_instance).patch(update_instance).delete(delete_instance),
        )
        .route("/api/v1/instances/:id/start", post(start_instance))
        .route("/api/v1/instances/:id/stop", post(stop_instance))
        .route("/api/v1/instances/:id/restart", post(restart_instance))
        .route("/api/v1/instances/:id/scale", post(scale_instance))
        .route("/api/v1/instances/:id/stats", get(instance_stats))
        .route("/api/v1/instances/:id/logs", get(instance_logs))
        .route("/api/v1/instances/:id/sessions", get(instance_sessions))
        .route("/api/v1/instances/:id/metrics", get(instance_metrics))
        .route("/api/v1/events", get(ws::events_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError(HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::NotFound(_) => StatusCode::NOT_FOUND,
            HubError::Forbidden(_) => StatusCode::FORBIDDEN,
            HubError::Adapter(_) | HubError::Poll(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn requester(headers: &HeaderMap) -> ApiResult<Requester> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| HubError::Validation("missing x-user-id header".to_string()))?;
    let user_id = Uuid::parse_str(user_id)
        .map_err(|_| HubError::Validation("x-user-id is not a uuid".to_string()))?;
    let is_admin = headers
        .get("x-admin")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    Ok(Requester { user_id, is_admin })
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "collector_running": state.collector.is_running().await,
        "event_subscribers": state.broadcaster.subscriber_count(),
    }))
}

#[derive(Deserialize)]
struct CreateInstanceBody {
    name: String,
    description: Option<String>,
    template_id: Option<Uuid>,
    #[serde(default)]
    config: HashMap<String, String>,
    custom_port: Option<u16>,
}

async fn create_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateInstanceBody>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    let instance = state
        .orchestrator
        .create(
            &req,
            CreateInstanceSpec {
                name: body.name,
                description: body.description,
                template_id: body.template_id,
                config: body.config,
                custom_port: body.custom_port,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn list_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(state.orchestrator.list(&req).await?))
}

async fn get_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(state.orchestrator.get(&req, id).await?))
}

#[derive(Deserialize)]
struct UpdateInstanceBody {
    description: Option<String>,
    config: Option<HashMap<String, String>>,
}

async fn update_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateInstanceBody>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    let instance = state
        .orchestrator
        .update(
            &req,
            id,
            UpdateInstanceSpec {
                description: body.description,
                config: body.config,
            },
        )
        .await?;
    Ok(Json(instance))
}

async fn delete_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    state.orchestrator.delete(&req, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(state.orchestrator.start(&req, id).await?))
}

async fn stop_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(state.orchestrator.stop(&req, id).await?))
}

async fn restart_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(state.orchestrator.restart(&req, id).await?))
}

#[derive(Deserialize)]
struct ScaleBody {
    replicas: i32,
}

async fn scale_instance(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ScaleBody>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(
        state.orchestrator.scale(&req, id, body.replicas).await?,
    ))
}

async fn instance_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(state.orchestrator.stats(&req, id).await?))
}

#[derive(Deserialize)]
struct LogsQuery {
    #[serde(default = "default_tail")]
    tail: i64,
}

fn default_tail() -> i64 {
    200
}

async fn instance_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    let logs = state.orchestrator.logs(&req, id, query.tail).await?;
    Ok(Json(json!({ "logs": logs })))
}

async fn instance_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    let status = state.orchestrator.session_status(&req, id).await?;
    Ok(Json(json!({ "session_status": status })))
}

#[derive(Deserialize)]
struct MetricsQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn instance_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<impl IntoResponse> {
    let req = requester(&headers)?;
    Ok(Json(
        state.orchestrator.metric_samples(&req, id, query.limit).await?,
    ))
}
