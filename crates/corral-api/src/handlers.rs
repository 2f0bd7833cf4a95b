//! REST API handlers.
//!
//! Each handler forwards to a `Server` endpoint and wraps the outcome in
//! the `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use corral_server::{JobScaleRequest, ServerError, ServerResult, VolumeListRequest};
use corral_state::{AllocClientUpdate, HostVolume, Job, Node, NodeStatus};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    /// Set on errors the caller may retry, possibly against another server.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            retryable: false,
        })
    }
}

fn error_status(err: &ServerError) -> StatusCode {
    match err {
        ServerError::NotLeader => StatusCode::SERVICE_UNAVAILABLE,
        ServerError::Validation(_) => StatusCode::BAD_REQUEST,
        ServerError::NotFound(_) => StatusCode::NOT_FOUND,
        ServerError::Conflict(_) | ServerError::StalePlan(_) => StatusCode::CONFLICT,
        ServerError::Provisioner(_) => StatusCode::BAD_GATEWAY,
        ServerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &ServerError) -> Response {
    let status = error_status(err);
    if status.is_server_error() {
        tracing::warn!(error = %err, "request failed");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
            retryable: err.is_retryable(),
        }),
    )
        .into_response()
}

fn respond<T: Serialize>(result: ServerResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.server.list_nodes())
}

/// POST /v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(node): Json<Node>,
) -> impl IntoResponse {
    respond(state.server.register_node(node).await)
}

/// GET /v1/nodes/{id}
pub async fn get_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.server.get_node(&id))
}

/// DELETE /v1/nodes/{id}
pub async fn deregister_node(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.server.deregister_node(&id).await)
}

/// POST /v1/nodes/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.server.heartbeat(&id).await)
}

#[derive(Debug, Deserialize)]
pub struct NodeStatusRequest {
    pub status: NodeStatus,
}

/// PUT /v1/nodes/{id}/status
pub async fn update_node_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<NodeStatusRequest>,
) -> impl IntoResponse {
    respond(state.server.update_node_status(&id, req.status).await)
}

#[derive(Debug, Deserialize)]
pub struct DrainRequest {
    pub enable: bool,
}

/// PUT /v1/nodes/{id}/drain
pub async fn update_drain(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<DrainRequest>,
) -> impl IntoResponse {
    respond(state.server.update_drain(&id, req.enable).await)
}

/// GET /v1/nodes/{id}/allocations
pub async fn node_allocations(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.server.node_allocations(&id))
}

/// POST /v1/allocations/updates
pub async fn update_allocs(
    State(state): State<ApiState>,
    Json(updates): Json<Vec<AllocClientUpdate>>,
) -> impl IntoResponse {
    respond(
        state
            .server
            .update_allocs(updates)
            .await
            .map(|index| serde_json::json!({ "index": index })),
    )
}

// ── Jobs ───────────────────────────────────────────────────────

/// GET /v1/jobs
pub async fn list_jobs(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.server.list_jobs())
}

/// POST /v1/jobs
pub async fn register_job(
    State(state): State<ApiState>,
    Json(job): Json<Job>,
) -> impl IntoResponse {
    respond(state.server.register_job(job).await)
}

/// GET /v1/jobs/{namespace}/{id}
pub async fn get_job(
    State(state): State<ApiState>,
    Path((namespace, id)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.server.get_job(&namespace, &id))
}

/// DELETE /v1/jobs/{namespace}/{id}
pub async fn deregister_job(
    State(state): State<ApiState>,
    Path((namespace, id)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.server.deregister_job(&namespace, &id).await)
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    #[serde(default)]
    pub group: Option<String>,
    pub count: u32,
    #[serde(default)]
    pub check_index: Option<u64>,
}

/// POST /v1/jobs/{namespace}/{id}/scale
pub async fn scale_job(
    State(state): State<ApiState>,
    Path((namespace, id)): Path<(String, String)>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    respond(
        state
            .server
            .scale_job(JobScaleRequest {
                namespace,
                job_id: id,
                group: req.group,
                count: req.count,
                check_index: req.check_index,
            })
            .await,
    )
}

/// GET /v1/jobs/{namespace}/{id}/allocations
pub async fn job_allocations(
    State(state): State<ApiState>,
    Path((namespace, id)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.server.job_allocations(&namespace, &id))
}

/// GET /v1/jobs/{namespace}/{id}/evaluations
pub async fn job_evaluations(
    State(state): State<ApiState>,
    Path((namespace, id)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.server.job_evaluations(&namespace, &id))
}

// ── Evaluations ────────────────────────────────────────────────

/// GET /v1/evaluations
pub async fn list_evals(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.server.list_evals())
}

/// GET /v1/evaluations/{id}
pub async fn eval_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.server.eval_status(&id))
}

/// GET /v1/evaluations/{id}/plan
pub async fn plan_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    respond(state.server.plan_result(&id))
}

/// GET /v1/broker/stats
pub async fn broker_stats(State(state): State<ApiState>) -> impl IntoResponse {
    respond(state.server.broker_stats())
}

// ── Host volumes ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VolumeWriteRequest {
    pub volumes: Vec<HostVolume>,
}

/// POST /v1/volumes
pub async fn create_volumes(
    State(state): State<ApiState>,
    Json(req): Json<VolumeWriteRequest>,
) -> impl IntoResponse {
    respond(state.server.create_volumes(req.volumes).await)
}

/// POST /v1/volumes/register
pub async fn register_volumes(
    State(state): State<ApiState>,
    Json(req): Json<VolumeWriteRequest>,
) -> impl IntoResponse {
    respond(state.server.register_volumes(req.volumes).await)
}

#[derive(Debug, Deserialize)]
pub struct VolumeDeleteRequest {
    #[serde(default)]
    pub namespace: String,
    pub ids: Vec<String>,
}

/// POST /v1/volumes/delete
pub async fn delete_volumes(
    State(state): State<ApiState>,
    Json(req): Json<VolumeDeleteRequest>,
) -> impl IntoResponse {
    respond(state.server.delete_volumes(&req.namespace, req.ids).await)
}

/// GET /v1/volumes?namespace=&node_id=&node_pool=&per_page=&next_token=
pub async fn list_volumes(
    State(state): State<ApiState>,
    Query(req): Query<VolumeListRequest>,
) -> impl IntoResponse {
    respond(state.server.list_volumes(&req))
}

/// GET /v1/volumes/{namespace}/{id}
pub async fn get_volume(
    State(state): State<ApiState>,
    Path((namespace, id)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.server.get_volume(&namespace, &id))
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct LeaderStatus {
    pub node_id: String,
    pub leader: bool,
    pub epoch: Option<u64>,
    pub index: u64,
}

/// GET /v1/status/leader
pub async fn leader_status(State(state): State<ApiState>) -> impl IntoResponse {
    let epoch = state.server.leader_epoch().await.map(|e| e.get());
    respond(
        state
            .server
            .state()
            .latest_index()
            .map_err(ServerError::from)
            .map(|index| LeaderStatus {
                node_id: state.server.config().node_id.clone(),
                leader: state.server.is_leader(),
                epoch,
                index,
            }),
    )
}
