//! Application wiring and router construction.

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use ratchet::{CancellationToken, Engine, EngineStore, PgEngineStore, Router as RouteEvaluator};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::domains::bom::BomChangeController;
use crate::domains::machines::{bom_machine, task_machine};
use crate::domains::tasks::TaskOrchestrator;
use crate::kernel::{self, LogExternalTasks, LogNotifier};
use crate::server::routes;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<Engine>,
    pub route_evaluator: Arc<RouteEvaluator>,
    pub tasks: Arc<TaskOrchestrator>,
    pub bom: Arc<BomChangeController>,
    /// Root token; each request operates on a child so shutdown interrupts
    /// in-flight work at its suspension points.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// A cancellation scope for one request.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

/// Wire storage, engine, machines, handlers, and domain services.
pub async fn build_state(pool: PgPool) -> anyhow::Result<AppState> {
    let store: Arc<dyn EngineStore> = Arc::new(PgEngineStore::new(pool.clone()));

    let engine = kernel::build_engine(
        Arc::clone(&store),
        pool.clone(),
        Arc::new(LogNotifier),
        Arc::new(LogExternalTasks),
    );

    // Definitions persisted by earlier runs come back first; the fixtures
    // then upsert themselves so code stays the source of truth for the two
    // built-in machines.
    engine.load_registered().await?;
    engine.register_machine(task_machine()).await?;
    engine.register_machine(bom_machine()).await?;

    let engine = Arc::new(engine);
    Ok(AppState {
        pool: pool.clone(),
        route_evaluator: Arc::new(RouteEvaluator::new(store)),
        tasks: Arc::new(TaskOrchestrator::new(pool.clone(), Arc::clone(&engine))),
        bom: Arc::new(BomChangeController::new(pool, Arc::clone(&engine))),
        engine,
        shutdown: CancellationToken::new(),
    })
}

/// Build the full application router.
pub fn build_app(state: AppState) -> Router {
    let api = Router::new()
        // Task workflow
        .route("/tasks/:id/assign", post(routes::tasks::assign))
        .route("/tasks/:id/start", post(routes::tasks::start))
        .route("/tasks/:id/complete", post(routes::tasks::complete))
        .route("/tasks/:id/review", post(routes::tasks::review))
        .route("/tasks/:id/history", get(routes::tasks::history))
        // BOM change control
        .route("/bom/:id/edit", post(routes::bom::start_edit))
        .route(
            "/bom/:id/draft",
            post(routes::bom::save_draft).get(routes::bom::get_draft),
        )
        .route("/bom/:id/discard", post(routes::bom::discard_draft))
        .route("/bom/:id/ecn", post(routes::bom::submit_ecn))
        .route("/bom/:id/ecns", get(routes::bom::list_ecns))
        .route("/bom/:id/history", get(routes::bom::history))
        .route("/ecn/:id", get(routes::bom::get_ecn))
        .route("/ecn/:id/approve", post(routes::bom::approve_ecn))
        .route("/ecn/:id/reject", post(routes::bom::reject_ecn))
        // Routing rules
        .route(
            "/routing-rules",
            get(routes::routing::list_rules).post(routes::routing::create_rule),
        )
        .route(
            "/routing-rules/:id",
            put(routes::routing::update_rule).delete(routes::routing::delete_rule),
        )
        .route("/routing-rules/test", post(routes::routing::test_route));

    Router::new()
        .route("/health", get(routes::health::health_handler))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
