//! Task workflow endpoints.
//!
//! Operator identity arrives with the request; authentication itself lives
//! in the gateway in front of this service.

use axum::extract::{Path, State};
use axum::Json;
use ratchet::TransitionRecord;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::{ok, AppError, Envelope};
use crate::domains::tasks::data::TaskData;
use crate::server::app::AppState;

fn default_operator() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub assignee_id: String,
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct OperatorRequest {
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReviewRequest {
    pub outcome_code: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

/// POST /api/v1/tasks/:id/assign
pub async fn assign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AssignRequest>,
) -> Result<Json<Envelope<TaskData>>, AppError> {
    let cancel = state.request_token();
    let task = state
        .tasks
        .assign(id, &req.assignee_id, &req.operator_id, &cancel)
        .await?;
    Ok(ok(task.into()))
}

/// POST /api/v1/tasks/:id/start
pub async fn start(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Envelope<TaskData>>, AppError> {
    let cancel = state.request_token();
    let task = state.tasks.start(id, &req.operator_id, &cancel).await?;
    Ok(ok(task.into()))
}

/// POST /api/v1/tasks/:id/complete
pub async fn complete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Envelope<TaskData>>, AppError> {
    let cancel = state.request_token();
    let task = state.tasks.complete(id, &req.operator_id, &cancel).await?;
    Ok(ok(task.into()))
}

/// POST /api/v1/tasks/:id/review
pub async fn review(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<Envelope<TaskData>>, AppError> {
    let cancel = state.request_token();
    let task = state
        .tasks
        .submit_review(id, &req.outcome_code, &req.comment, &req.operator_id, &cancel)
        .await?;
    Ok(ok(task.into()))
}

/// GET /api/v1/tasks/:id/history
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Vec<TransitionRecord>>>, AppError> {
    let records = state.tasks.history(id).await?;
    Ok(ok(records))
}
