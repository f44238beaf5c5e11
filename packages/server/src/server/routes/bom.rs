//! BOM change-control endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use ratchet::TransitionRecord;
use serde::Deserialize;
use uuid::Uuid;

use crate::common::{ok, AppError, Envelope};
use crate::domains::bom::data::{BomData, DraftResponse, EcnData};
use crate::domains::bom::models::{BomItemData, DraftData};
use crate::server::app::AppState;

fn default_operator() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Deserialize)]
pub struct OperatorRequest {
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SaveDraftRequest {
    #[serde(default)]
    pub items: Vec<BomItemData>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitEcnRequest {
    pub title: String,
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RejectEcnRequest {
    #[serde(default)]
    pub note: String,
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct EcnListQuery {
    pub status: Option<String>,
}

/// POST /api/v1/bom/:id/edit
pub async fn start_edit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Envelope<BomData>>, AppError> {
    let cancel = state.request_token();
    let bom = state.bom.start_edit(id, &req.operator_id, &cancel).await?;
    Ok(ok(bom.into()))
}

/// POST /api/v1/bom/:id/draft
pub async fn save_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SaveDraftRequest>,
) -> Result<Json<Envelope<DraftResponse>>, AppError> {
    let cancel = state.request_token();
    let draft = DraftData {
        items: req.items,
        name: req.name,
        description: req.description,
    };
    let row = state
        .bom
        .save_draft(id, draft, &req.operator_id, &cancel)
        .await?;
    Ok(ok(row.into()))
}

/// GET /api/v1/bom/:id/draft
pub async fn get_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<DraftResponse>>, AppError> {
    let draft = state
        .bom
        .get_draft(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no draft for BOM {id}")))?;
    Ok(ok(draft.into()))
}

/// POST /api/v1/bom/:id/discard
pub async fn discard_draft(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Envelope<BomData>>, AppError> {
    let cancel = state.request_token();
    let bom = state.bom.discard_draft(id, &req.operator_id, &cancel).await?;
    Ok(ok(bom.into()))
}

/// POST /api/v1/bom/:id/ecn
pub async fn submit_ecn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SubmitEcnRequest>,
) -> Result<Json<Envelope<EcnData>>, AppError> {
    let cancel = state.request_token();
    let ecn = state
        .bom
        .submit_ecn(id, &req.title, &req.operator_id, &cancel)
        .await?;
    Ok(ok(ecn.into()))
}

/// GET /api/v1/bom/:id/ecns
pub async fn list_ecns(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<EcnListQuery>,
) -> Result<Json<Envelope<Vec<EcnData>>>, AppError> {
    let ecns = state.bom.list_ecns(id, query.status.as_deref()).await?;
    Ok(ok(ecns.into_iter().map(Into::into).collect()))
}

/// GET /api/v1/bom/:id/history
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<Vec<TransitionRecord>>>, AppError> {
    let records = state.bom.history(id).await?;
    Ok(ok(records))
}

/// GET /api/v1/ecn/:id
pub async fn get_ecn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<EcnData>>, AppError> {
    let ecn = state.bom.get_ecn(id).await?;
    Ok(ok(ecn.into()))
}

/// POST /api/v1/ecn/:id/approve
pub async fn approve_ecn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<OperatorRequest>,
) -> Result<Json<Envelope<EcnData>>, AppError> {
    let cancel = state.request_token();
    let ecn = state.bom.approve_ecn(id, &req.operator_id, &cancel).await?;
    Ok(ok(ecn.into()))
}

/// POST /api/v1/ecn/:id/reject
pub async fn reject_ecn(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectEcnRequest>,
) -> Result<Json<Envelope<EcnData>>, AppError> {
    let cancel = state.request_token();
    let ecn = state
        .bom
        .reject_ecn(id, &req.operator_id, &req.note, &cancel)
        .await?;
    Ok(ok(ecn.into()))
}
