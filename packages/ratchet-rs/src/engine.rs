//! State-machine engine: resolves and applies transitions atomically.
//!
//! ```text
//! fire(kind, id, event, ctx)
//!     │
//!     ├─ look up machine by kind (read-mostly cache)
//!     │
//!     ▼ store.apply — one transaction, per-entity lock
//!     ├─ read current state (absent row ⇒ initial state)
//!     ├─ candidates(from, event) by priority DESC
//!     ├─ first guard that passes wins ── none ⇒ NoMatchingTransition,
//!     ├─ upsert entity_states              nothing written
//!     ├─ append transition_logs
//!     └─ commit
//!     │
//!     ▼ after commit
//!     └─ dispatch actions sequentially, record per-action outcomes
//!        back onto the log row
//! ```
//!
//! Commit-then-dispatch is deliberate: once the transaction commits, the
//! state change is authoritative regardless of what downstream systems do.
//! Action failures land in `actions_executed`, never in the caller's
//! result.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audit::{ActorKind, TransitionRecord};
use crate::dispatch::{ActionContext, ActionDispatcher, ActionHandler};
use crate::error::EngineError;
use crate::machine::MachineDef;
use crate::predicate;
use crate::store::{ApplyRequest, EngineStore, ResetRequest, ResolvedTransition};

/// Inputs to one firing.
pub struct FireRequest<'a> {
    pub entity_kind: &'a str,
    pub entity_id: &'a str,
    pub event: &'a str,
    /// Evaluation context for guards; captured verbatim as the log row's
    /// `event_data`.
    pub ctx: Value,
    pub actor_id: &'a str,
    pub actor_kind: ActorKind,
    /// State to assume when the entity has no state row yet. Defaults to
    /// the machine's initial state; domain layers pass their mirrored
    /// status here so entities that entered the system before (or outside)
    /// the workflow core join the machine mid-life instead of at the
    /// start.
    pub fallback_state: Option<&'a str>,
}

/// Pure transition resolution: first candidate (priority order) whose guard
/// passes under `ctx`.
pub fn resolve_transition(
    machine: &MachineDef,
    current: &str,
    event: &str,
    ctx: &Value,
) -> Result<ResolvedTransition, EngineError> {
    for candidate in machine.candidates(current, event) {
        let passes = match &candidate.guard {
            None => true,
            Some(guard) => predicate::eval(guard, ctx)?,
        };
        if passes {
            return Ok(ResolvedTransition {
                to_state: candidate.to_state.clone(),
                actions: candidate.actions.clone(),
            });
        }
    }
    Err(EngineError::NoMatchingTransition {
        kind: machine.name.clone(),
        id: String::new(),
        state: current.to_string(),
        event: event.to_string(),
    })
}

/// The engine. Holds the store, the action dispatcher, and a process-local
/// cache of machine definitions.
///
/// The cache is read-mostly: every firing reads it, only `register_machine`
/// writes, so a `std::sync::RwLock` (never held across `.await`) fits.
pub struct Engine {
    store: Arc<dyn EngineStore>,
    dispatcher: ActionDispatcher,
    machines: RwLock<HashMap<String, Arc<MachineDef>>>,
}

impl Engine {
    /// Build an engine with handlers registered up front.
    pub fn builder(store: Arc<dyn EngineStore>) -> EngineBuilder {
        EngineBuilder {
            store,
            dispatcher: ActionDispatcher::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn EngineStore> {
        Arc::clone(&self.store)
    }

    /// Warm the definition cache from storage. Returns the number of
    /// machines loaded.
    pub async fn load_registered(&self) -> Result<usize, EngineError> {
        let defs = self.store.load_machines().await?;
        let count = defs.len();
        let mut cache = self.machines.write().unwrap_or_else(|p| p.into_inner());
        for def in defs {
            cache.insert(def.name.clone(), Arc::new(def));
        }
        Ok(count)
    }

    /// Validate, persist, and cache a machine definition. Idempotent upsert:
    /// re-registering replaces the machine's transitions atomically.
    pub async fn register_machine(&self, def: MachineDef) -> Result<(), EngineError> {
        def.validate()?;
        self.store.upsert_machine(&def).await?;
        debug!(machine = %def.name, transitions = def.transitions.len(), "machine registered");
        let mut cache = self.machines.write().unwrap_or_else(|p| p.into_inner());
        cache.insert(def.name.clone(), Arc::new(def));
        Ok(())
    }

    /// The machine governing an entity kind (kind name = machine name).
    pub fn machine(&self, kind: &str) -> Result<Arc<MachineDef>, EngineError> {
        let cache = self.machines.read().unwrap_or_else(|p| p.into_inner());
        cache
            .get(kind)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMachine { kind: kind.to_string() })
    }

    /// Current state of an entity. An entity with no state row is in the
    /// machine's initial state.
    pub async fn current_state(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<String, EngineError> {
        let machine = self.machine(kind)?;
        Ok(self
            .store
            .current_state(kind, id)
            .await?
            .unwrap_or_else(|| machine.initial_state.clone()))
    }

    /// Fire an event against an entity.
    ///
    /// Returns the committed transition record with action outcomes filled
    /// in. Errors before the transaction leave nothing written; action
    /// failures after commit do not surface here.
    pub async fn fire(
        &self,
        req: FireRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<TransitionRecord, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let machine = self.machine(req.entity_kind)?;
        let FireRequest {
            entity_kind,
            entity_id,
            event,
            ctx,
            actor_id,
            actor_kind,
            fallback_state,
        } = req;
        let initial_state = fallback_state.unwrap_or(&machine.initial_state);

        let resolve = |current: &str| {
            resolve_transition(&machine, current, event, &ctx).map_err(|err| match err {
                EngineError::NoMatchingTransition { kind, state, event, .. } => {
                    EngineError::NoMatchingTransition {
                        kind,
                        id: entity_id.to_string(),
                        state,
                        event,
                    }
                }
                other => other,
            })
        };

        let applied = self
            .store
            .apply(ApplyRequest {
                entity_kind,
                entity_id,
                event,
                event_data: &ctx,
                actor_id,
                actor_kind,
                initial_state,
                resolve: &resolve,
            })
            .await?;

        let mut record = applied.record;
        debug!(
            entity_kind,
            entity_id,
            event,
            from = %record.from_state,
            to = %record.to_state,
            "transition committed"
        );

        if !applied.actions.is_empty() {
            let action_ctx = ActionContext::from_record(&record);
            let outcomes = self
                .dispatcher
                .dispatch(&applied.actions, &action_ctx, cancel)
                .await;

            // Post-commit bookkeeping: the transition already stands, so a
            // failure here is logged rather than returned.
            if let Err(err) = self.store.record_outcomes(record.id, &outcomes).await {
                warn!(log_id = %record.id, error = %err, "failed to record action outcomes");
            }
            record.actions_executed =
                serde_json::to_value(&outcomes).unwrap_or(Value::Null);
        }

        Ok(record)
    }

    /// Transition history for an entity, newest first.
    pub async fn history(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        self.store.history(kind, id).await
    }

    /// Impose a state outside the transition table (rollback primitive).
    ///
    /// The reset is audited like any transition, under the given event name
    /// with `actor_kind = system` expected from callers. No actions run.
    /// `fallback_state` plays the same role as on [`FireRequest`]: the
    /// `from_state` recorded when the entity has no state row yet.
    pub async fn reset(
        &self,
        kind: &str,
        id: &str,
        to_state: &str,
        event: &str,
        event_data: Value,
        actor_id: &str,
        fallback_state: Option<&str>,
    ) -> Result<TransitionRecord, EngineError> {
        let machine = self.machine(kind)?;
        if !machine.states.iter().any(|s| s == to_state) {
            return Err(EngineError::InvalidDefinition {
                name: machine.name.clone(),
                reason: format!("reset target '{to_state}' is not a declared state"),
            });
        }
        self.store
            .reset(ResetRequest {
                entity_kind: kind,
                entity_id: id,
                to_state,
                event,
                event_data: &event_data,
                actor_id,
                actor_kind: ActorKind::System,
                initial_state: fallback_state.unwrap_or(&machine.initial_state),
            })
            .await
    }
}

/// Builder wiring handlers into the engine before first use.
pub struct EngineBuilder {
    store: Arc<dyn EngineStore>,
    dispatcher: ActionDispatcher,
}

impl EngineBuilder {
    /// Register an action handler.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this action type. Use
    /// [`EngineBuilder::try_with_handler`] for a non-panicking version.
    pub fn with_handler(
        self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Self {
        self.try_with_handler(action_type, handler)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    /// Register an action handler, erroring on duplicates.
    pub fn try_with_handler(
        mut self,
        action_type: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<Self, EngineError> {
        self.dispatcher.register(action_type, handler)?;
        Ok(self)
    }

    /// Replace the fallback handler.
    pub fn with_fallback(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.dispatcher = self.dispatcher.with_fallback(handler);
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            store: self.store,
            dispatcher: self.dispatcher,
            machines: RwLock::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ActionStatus;
    use crate::machine::ActionSpec;
    use crate::store::testing::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn task_machine() -> MachineDef {
        MachineDef::new("task", "unassigned")
            .state("pending")
            .state("in_progress")
            .state("reviewing")
            .state("completed")
            .state("rejected")
            .transition("unassigned", "assign", "pending")
            .transition("pending", "assign", "pending")
            .transition("pending", "start", "in_progress")
            .transition_full(
                "in_progress",
                "complete",
                "completed",
                Some(json!({"field": "requires_approval", "op": "eq", "value": false})),
                vec![ActionSpec::new("complete_external_task")],
                10,
            )
            .transition_full(
                "in_progress",
                "complete",
                "reviewing",
                Some(json!({"field": "requires_approval", "op": "eq", "value": true})),
                Vec::new(),
                0,
            )
            .transition("reviewing", "approve", "completed")
            .transition("reviewing", "reject", "in_progress")
    }

    async fn engine_with(store: Arc<InMemoryStore>) -> Engine {
        let engine = Engine::builder(store).build();
        engine.register_machine(task_machine()).await.unwrap();
        engine
    }

    fn fire_req<'a>(id: &'a str, event: &'a str, ctx: Value) -> FireRequest<'a> {
        FireRequest {
            entity_kind: "task",
            entity_id: id,
            event,
            ctx,
            actor_id: "u-1",
            actor_kind: ActorKind::User,
            fallback_state: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_machine() {
        let engine = Engine::builder(Arc::new(InMemoryStore::new())).build();
        let err = engine
            .fire(fire_req("x", "assign", json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownMachine { .. }));
    }

    #[tokio::test]
    async fn test_initial_state_without_row() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;
        assert_eq!(engine.current_state("task", "t-1").await.unwrap(), "unassigned");
    }

    #[tokio::test]
    async fn test_fire_writes_state_and_log() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store.clone()).await;

        let record = engine
            .fire(
                fire_req("t-1", "assign", json!({"assignee_id": "u-9"})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(record.from_state, "unassigned");
        assert_eq!(record.to_state, "pending");
        assert_eq!(engine.current_state("task", "t-1").await.unwrap(), "pending");

        let history = engine.history("task", "t-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, "assign");
        assert_eq!(history[0].event_data["assignee_id"], "u-9");
    }

    #[tokio::test]
    async fn test_no_match_leaves_nothing_written() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store.clone()).await;

        // "complete" is not valid from the initial state.
        let err = engine
            .fire(fire_req("t-1", "complete", json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingTransition { .. }));

        assert_eq!(engine.current_state("task", "t-1").await.unwrap(), "unassigned");
        assert!(engine.history("task", "t-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_guard_priority_tie() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;

        for (id, requires_approval, expected) in [
            ("t-review", true, "reviewing"),
            ("t-direct", false, "completed"),
        ] {
            engine
                .fire(fire_req(id, "assign", json!({})), &CancellationToken::new())
                .await
                .unwrap();
            engine
                .fire(fire_req(id, "start", json!({})), &CancellationToken::new())
                .await
                .unwrap();
            let record = engine
                .fire(
                    fire_req(id, "complete", json!({"requires_approval": requires_approval})),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(record.to_state, expected, "requires_approval={requires_approval}");
        }
    }

    #[tokio::test]
    async fn test_history_replay_matches_current_state() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;

        for (event, ctx) in [
            ("assign", json!({})),
            ("start", json!({})),
            ("complete", json!({"requires_approval": true})),
            ("reject", json!({})),
            ("complete", json!({"requires_approval": true})),
            ("approve", json!({})),
        ] {
            engine
                .fire(fire_req("t-1", event, ctx), &CancellationToken::new())
                .await
                .unwrap();
        }

        let history = engine.history("task", "t-1").await.unwrap();
        // Newest first: replaying to_state from the newest row equals the
        // current state, and each row chains onto the previous one.
        assert_eq!(
            history.first().unwrap().to_state,
            engine.current_state("task", "t-1").await.unwrap()
        );
        for pair in history.windows(2) {
            assert_eq!(pair[1].to_state, pair[0].from_state);
        }
    }

    #[tokio::test]
    async fn test_concurrent_fires_serialize_per_entity() {
        let store = Arc::new(InMemoryStore::new());
        let engine = Arc::new(Engine::builder(store).build());
        engine
            .register_machine(
                MachineDef::new("switch", "off")
                    .state("on")
                    .transition("off", "toggle", "on")
                    .transition("on", "toggle", "off"),
            )
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine
                    .fire(
                        FireRequest {
                            entity_kind: "switch",
                            entity_id: "s-1",
                            event: "toggle",
                            ctx: json!({}),
                            actor_id: "u-1",
                            actor_kind: ActorKind::User,
                            fallback_state: None,
                        },
                        &CancellationToken::new(),
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Total order with no gaps: each row's from_state is the previous
        // row's to_state.
        let mut history = engine.history("switch", "s-1").await.unwrap();
        history.reverse(); // oldest first
        assert_eq!(history.len(), 16);
        assert_eq!(history[0].from_state, "off");
        for pair in history.windows(2) {
            assert_eq!(pair[0].to_state, pair[1].from_state);
        }
    }

    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::dispatch::ActionHandler for FlakyHandler {
        async fn execute(
            &self,
            _action: &ActionSpec,
            _ctx: &crate::dispatch::ActionContext,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("external system timed out")
        }
    }

    #[tokio::test]
    async fn test_action_failure_recorded_but_transition_stands() {
        let store = Arc::new(InMemoryStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = Engine::builder(store.clone())
            .with_handler("complete_external_task", Arc::new(FlakyHandler { calls: calls.clone() }))
            .build();
        engine.register_machine(task_machine()).await.unwrap();

        for (event, ctx) in [
            ("assign", json!({})),
            ("start", json!({})),
        ] {
            engine
                .fire(fire_req("t-1", event, ctx), &CancellationToken::new())
                .await
                .unwrap();
        }
        let record = engine
            .fire(
                fire_req("t-1", "complete", json!({"requires_approval": false})),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        // The fire succeeded despite the handler failure...
        assert_eq!(record.to_state, "completed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // ...and the outcome landed on the log row.
        let history = engine.history("task", "t-1").await.unwrap();
        let outcomes = history[0].actions_executed.as_array().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0]["type"], "complete_external_task");
        assert_eq!(outcomes[0]["status"], "error");
    }

    #[tokio::test]
    async fn test_cancelled_before_transaction_writes_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine
            .fire(fire_req("t-1", "assign", json!({})), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(engine.history("task", "t-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_transitions() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;

        // Re-register with assign removed: the old transition must be gone.
        let trimmed = MachineDef::new("task", "unassigned")
            .state("pending")
            .transition("pending", "assign", "pending");
        engine.register_machine(trimmed).await.unwrap();

        let err = engine
            .fire(fire_req("t-1", "assign", json!({})), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoMatchingTransition { .. }));
    }

    #[tokio::test]
    async fn test_reset_audits_with_system_actor() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;

        for (event, ctx) in [
            ("assign", json!({})),
            ("start", json!({})),
            ("complete", json!({"requires_approval": false})),
        ] {
            engine
                .fire(fire_req("t-1", event, ctx), &CancellationToken::new())
                .await
                .unwrap();
        }

        let record = engine
            .reset(
                "task",
                "t-1",
                "in_progress",
                "rollback",
                json!({"triggered_by_task": "t-9"}),
                "u-1",
                None,
            )
            .await
            .unwrap();
        assert_eq!(record.from_state, "completed");
        assert_eq!(record.to_state, "in_progress");
        assert_eq!(record.actor_kind, ActorKind::System);
        assert_eq!(engine.current_state("task", "t-1").await.unwrap(), "in_progress");

        // Resetting to an undeclared state is rejected.
        assert!(engine
            .reset("task", "t-1", "limbo", "rollback", json!({}), "u-1", None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fallback_state_joins_machine_mid_life() {
        let store = Arc::new(InMemoryStore::new());
        let engine = engine_with(store).await;

        // The entity was created outside the engine and sits in
        // "in_progress" according to its domain row; without the fallback
        // the machine would assume "unassigned" and refuse "complete".
        let record = engine
            .fire(
                FireRequest {
                    entity_kind: "task",
                    entity_id: "legacy-1",
                    event: "complete",
                    ctx: json!({"requires_approval": false}),
                    actor_id: "u-1",
                    actor_kind: ActorKind::User,
                    fallback_state: Some("in_progress"),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(record.from_state, "in_progress");
        assert_eq!(record.to_state, "completed");
    }

    // Guard against accidental blocking: resolve_transition is pure and
    // usable outside the engine (the orchestrator leans on this).
    #[test]
    fn test_resolve_transition_is_pure() {
        let machine = task_machine();
        let resolved = resolve_transition(
            &machine,
            "in_progress",
            "complete",
            &json!({"requires_approval": false}),
        )
        .unwrap();
        assert_eq!(resolved.to_state, "completed");
        assert_eq!(resolved.actions.len(), 1);
    }
}
