//! Side-effect dispatcher: fans out transition actions to handlers.
//!
//! Actions run strictly **after** the state transition commits. A failing
//! handler is recorded in the transition log and the dispatch continues —
//! state stays authoritative even when downstream systems are unreliable.
//! Handlers absorb retries through idempotency keys: they receive the
//! entity id and must use it as a deduplication key at the destination.
//!
//! Actions execute sequentially in the order defined on the transition.
//! They are typically few, and ordering may matter (update the external
//! task before notifying its assignee).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audit::{ActionOutcome, TransitionRecord};
use crate::error::EngineError;
use crate::machine::ActionSpec;

/// What a handler gets to see about the transition it runs for.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub entity_kind: String,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    pub event_data: Value,
}

impl ActionContext {
    pub fn from_record(record: &TransitionRecord) -> Self {
        Self {
            entity_kind: record.entity_kind.clone(),
            entity_id: record.entity_id.clone(),
            from_state: record.from_state.clone(),
            to_state: record.to_state.clone(),
            event: record.event.clone(),
            event_data: record.event_data.clone(),
        }
    }
}

/// A per-type action handler.
///
/// Handlers must be idempotent: the engine never retries on its own, but an
/// out-of-band replay may re-run a recorded action at any time.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()>;
}

/// Fallback handler: logs the action structurally and succeeds.
///
/// Keeps a transition with an unregistered action type from failing while
/// still leaving a trace of what was skipped over.
struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn execute(&self, action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()> {
        info!(
            action_type = %action.action_type,
            entity_kind = %ctx.entity_kind,
            entity_id = %ctx.entity_id,
            event = %ctx.event,
            "no handler registered; action logged only"
        );
        Ok(())
    }
}

/// Composite of per-action-type handlers plus the logging fallback.
///
/// Built once at boot, then shared immutably by the engine.
pub struct ActionDispatcher {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    fallback: Arc<dyn ActionHandler>,
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(LogHandler),
        }
    }

    /// Register a handler for an action type.
    ///
    /// Registering the same type twice is a wiring bug and returns an error
    /// rather than silently replacing the first handler.
    pub fn register(
        &mut self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<(), EngineError> {
        let action_type = action_type.into();
        if self.handlers.contains_key(&action_type) {
            return Err(EngineError::InvalidDefinition {
                name: action_type,
                reason: "action handler already registered".to_string(),
            });
        }
        self.handlers.insert(action_type, handler);
        Ok(())
    }

    /// Replace the fallback handler (defaults to structured logging).
    pub fn with_fallback(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.fallback = handler;
        self
    }

    /// Execute the actions of one transition, in order.
    ///
    /// Never fails: each action yields an outcome (`ok`, `error`, or —
    /// once the token fires — `skipped` for everything not yet run).
    pub async fn dispatch(
        &self,
        actions: &[ActionSpec],
        ctx: &ActionContext,
        cancel: &CancellationToken,
    ) -> Vec<ActionOutcome> {
        let mut outcomes = Vec::with_capacity(actions.len());
        let mut cancelled = false;

        for action in actions {
            if cancelled || cancel.is_cancelled() {
                cancelled = true;
                outcomes.push(ActionOutcome::skipped(&action.action_type));
                continue;
            }

            let handler = self
                .handlers
                .get(&action.action_type)
                .unwrap_or(&self.fallback);

            match handler.execute(action, ctx).await {
                Ok(()) => outcomes.push(ActionOutcome::ok(&action.action_type)),
                Err(err) => {
                    warn!(
                        action_type = %action.action_type,
                        entity_kind = %ctx.entity_kind,
                        entity_id = %ctx.entity_id,
                        error = %err,
                        "action handler failed; transition stands"
                    );
                    outcomes.push(ActionOutcome::error(&action.action_type, err.to_string()));
                }
            }
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ActionStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> ActionContext {
        ActionContext {
            entity_kind: "task".into(),
            entity_id: "t-1".into(),
            from_state: "pending".into(),
            to_state: "in_progress".into(),
            event: "start".into(),
            event_data: json!({}),
        }
    }

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ActionHandler for CountingHandler {
        async fn execute(&self, _action: &ActionSpec, _ctx: &ActionContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("downstream unavailable");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sequential_dispatch_with_failure_continues() {
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let fail_calls = Arc::new(AtomicUsize::new(0));

        let mut dispatcher = ActionDispatcher::new();
        dispatcher
            .register(
                "notify",
                Arc::new(CountingHandler { calls: ok_calls.clone(), fail: false }),
            )
            .unwrap();
        dispatcher
            .register(
                "create_task",
                Arc::new(CountingHandler { calls: fail_calls.clone(), fail: true }),
            )
            .unwrap();

        let actions = vec![
            ActionSpec::new("create_task"),
            ActionSpec::new("notify"),
        ];
        let outcomes = dispatcher
            .dispatch(&actions, &ctx(), &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, ActionStatus::Error);
        assert!(outcomes[0].error.as_deref().unwrap().contains("downstream"));
        assert_eq!(outcomes[1].status, ActionStatus::Ok);
        assert_eq!(ok_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fail_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_hits_fallback() {
        let dispatcher = ActionDispatcher::new();
        let outcomes = dispatcher
            .dispatch(
                &[ActionSpec::new("mystery")],
                &ctx(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, ActionStatus::Ok);
    }

    #[tokio::test]
    async fn test_cancelled_actions_are_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = ActionDispatcher::new();
        dispatcher
            .register("notify", Arc::new(CountingHandler { calls: calls.clone(), fail: false }))
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcomes = dispatcher
            .dispatch(
                &[ActionSpec::new("notify"), ActionSpec::new("notify")],
                &ctx(),
                &cancel,
            )
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == ActionStatus::Skipped));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_an_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = ActionDispatcher::new();
        dispatcher
            .register("notify", Arc::new(CountingHandler { calls: calls.clone(), fail: false }))
            .unwrap();
        let second = dispatcher.register(
            "notify",
            Arc::new(CountingHandler { calls, fail: false }),
        );
        assert!(second.is_err());
    }
}
