//! Routing rule administration and the evaluation test endpoint.

use axum::extract::{Path, Query, State};
use axum::Json;
use ratchet::RouteDecision;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::common::{ok, AppError, Envelope, ListResponse, Pagination};
use crate::domains::routing::models::{NewRule, RuleRecord, RuleUpdate};
use crate::server::app::AppState;

fn default_operator() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub entity_kind: Option<String>,
    pub event: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    #[serde(flatten)]
    pub rule: NewRule,
    #[serde(default = "default_operator")]
    pub operator_id: String,
}

#[derive(Debug, Deserialize)]
pub struct TestRouteRequest {
    pub entity_kind: String,
    pub event: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub context: Value,
}

/// GET /api/v1/routing-rules
pub async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Envelope<ListResponse<RuleRecord>>>, AppError> {
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, 200);
    let (items, total) = RuleRecord::list(
        query.entity_kind.as_deref(),
        query.event.as_deref(),
        page,
        page_size,
        &state.pool,
    )
    .await
    .map_err(AppError::internal)?;

    Ok(ok(ListResponse {
        items,
        pagination: Pagination::new(page, page_size, total),
    }))
}

/// POST /api/v1/routing-rules
pub async fn create_rule(
    State(state): State<AppState>,
    Json(req): Json<CreateRuleRequest>,
) -> Result<Json<Envelope<RuleRecord>>, AppError> {
    let rule = RuleRecord::create(req.rule, &req.operator_id, &state.pool).await?;
    Ok(ok(rule))
}

/// PUT /api/v1/routing-rules/:id
pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<RuleUpdate>,
) -> Result<Json<Envelope<RuleRecord>>, AppError> {
    let rule = RuleRecord::update(id, update, &state.pool).await?;
    Ok(ok(rule))
}

/// DELETE /api/v1/routing-rules/:id
pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Envelope<bool>>, AppError> {
    let deleted = RuleRecord::delete(id, &state.pool)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::NotFound(format!("routing rule {id} not found")));
    }
    Ok(ok(true))
}

/// POST /api/v1/routing-rules/test
///
/// Evaluate a context against the live rule table. The evaluation is logged
/// like any other, so test traffic is visible in the routing log.
pub async fn test_route(
    State(state): State<AppState>,
    Json(req): Json<TestRouteRequest>,
) -> Result<Json<Envelope<RouteDecision>>, AppError> {
    let decision = state
        .route_evaluator
        .evaluate(
            &req.entity_kind,
            &req.event,
            req.entity_id.as_deref(),
            &req.context,
        )
        .await?;
    Ok(ok(decision))
}
