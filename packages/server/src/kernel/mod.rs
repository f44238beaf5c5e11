pub mod actions;
pub mod traits;

pub use traits::{ExternalTasks, LogExternalTasks, LogNotifier, Notifier};

use std::sync::Arc;

use ratchet::{Engine, EngineStore};
use sqlx::PgPool;

use actions::{
    CompleteExternalTaskHandler, CreateExternalApprovalHandler, CreateExternalTaskHandler,
    NotifyAssigneeHandler, ACTION_COMPLETE_EXTERNAL_TASK, ACTION_CREATE_EXTERNAL_APPROVAL,
    ACTION_CREATE_EXTERNAL_TASK, ACTION_NOTIFY_ASSIGNEE,
};

/// Build the engine with every action handler registered.
///
/// The outbound adapters are ports: production wiring can swap in a chat
/// platform or task tracker client, the defaults log structurally and
/// answer deterministically.
pub fn build_engine(
    store: Arc<dyn EngineStore>,
    pool: PgPool,
    notifier: Arc<dyn Notifier>,
    external: Arc<dyn ExternalTasks>,
) -> Engine {
    Engine::builder(store)
        .with_handler(
            ACTION_CREATE_EXTERNAL_TASK,
            Arc::new(CreateExternalTaskHandler::new(pool.clone(), Arc::clone(&external))),
        )
        .with_handler(
            ACTION_COMPLETE_EXTERNAL_TASK,
            Arc::new(CompleteExternalTaskHandler::new(pool, Arc::clone(&external))),
        )
        .with_handler(
            ACTION_CREATE_EXTERNAL_APPROVAL,
            Arc::new(CreateExternalApprovalHandler::new(external)),
        )
        .with_handler(ACTION_NOTIFY_ASSIGNEE, Arc::new(NotifyAssigneeHandler::new(notifier)))
        .build()
}
