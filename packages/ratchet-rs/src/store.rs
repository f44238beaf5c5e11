//! Storage contract for the engine.
//!
//! The engine needs a relational store with two properties: atomic multi-row
//! transactions, and a per-key advisory lock so concurrent firings on the
//! same entity serialize. [`EngineStore`] captures exactly that surface.
//!
//! # The apply contract
//!
//! [`EngineStore::apply`] is the transactional firing primitive:
//!
//! 1. Acquire the per-entity lock (scoped to the transaction).
//! 2. Read the current state; an absent row means the machine's initial
//!    state.
//! 3. Call the synchronous `resolve` callback with that state. The callback
//!    is where the engine evaluates guards — pure computation, no IO.
//! 4. On `Ok`, upsert `entity_states` and append a `transition_logs` row in
//!    the same transaction, then commit.
//! 5. On `Err`, abort. Nothing is written.
//!
//! This split keeps transition resolution in the engine while the store owns
//! atomicity and ordering. Per-entity history is therefore a total order;
//! cross-entity calls run in parallel.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::audit::{ActionOutcome, ActorKind, RoutingLogRow, TransitionRecord};
use crate::error::EngineError;
use crate::machine::{ActionSpec, MachineDef};
use crate::routing::RoutingRule;

/// The transition chosen by the resolve callback.
#[derive(Debug, Clone)]
pub struct ResolvedTransition {
    pub to_state: String,
    pub actions: Vec<ActionSpec>,
}

/// Synchronous resolver from current state to the winning transition.
pub type Resolve<'a> =
    &'a (dyn Fn(&str) -> Result<ResolvedTransition, EngineError> + Send + Sync);

/// Inputs to one transactional firing.
pub struct ApplyRequest<'a> {
    pub entity_kind: &'a str,
    pub entity_id: &'a str,
    pub event: &'a str,
    pub event_data: &'a Value,
    pub actor_id: &'a str,
    pub actor_kind: ActorKind,
    /// Fallback state when no `entity_states` row exists yet.
    pub initial_state: &'a str,
    pub resolve: Resolve<'a>,
}

/// Inputs to a state reset (rollback). Same lock and transaction discipline
/// as `apply`, but the target state is imposed rather than resolved, and the
/// audit row records it under the given event name.
pub struct ResetRequest<'a> {
    pub entity_kind: &'a str,
    pub entity_id: &'a str,
    pub to_state: &'a str,
    pub event: &'a str,
    pub event_data: &'a Value,
    pub actor_id: &'a str,
    pub actor_kind: ActorKind,
    /// Fallback state recorded as `from_state` when no row exists.
    pub initial_state: &'a str,
}

/// A committed transition plus the actions awaiting post-commit dispatch.
#[derive(Debug, Clone)]
pub struct AppliedTransition {
    pub record: TransitionRecord,
    pub actions: Vec<ActionSpec>,
}

/// Persistence required by the engine and the router.
///
/// Implementations: `PgEngineStore` for Postgres, and
/// [`testing::InMemoryStore`] for tests.
#[async_trait]
pub trait EngineStore: Send + Sync {
    /// Idempotent upsert by machine name; the machine's transition rows are
    /// replaced atomically in the same transaction.
    async fn upsert_machine(&self, def: &MachineDef) -> Result<(), EngineError>;

    /// Load every registered machine definition (cache warm-up).
    async fn load_machines(&self) -> Result<Vec<MachineDef>, EngineError>;

    /// Current state of an entity, or `None` if it has never transitioned.
    async fn current_state(
        &self,
        entity_kind: &str,
        entity_id: &str,
    ) -> Result<Option<String>, EngineError>;

    /// Transactional firing. See the module docs for the contract.
    async fn apply(&self, req: ApplyRequest<'_>) -> Result<AppliedTransition, EngineError>;

    /// Transactional state reset (rollback primitive).
    async fn reset(&self, req: ResetRequest<'_>) -> Result<TransitionRecord, EngineError>;

    /// Write per-action outcomes back onto a transition log row.
    async fn record_outcomes(
        &self,
        log_id: Uuid,
        outcomes: &[ActionOutcome],
    ) -> Result<(), EngineError>;

    /// Transition history for an entity, newest first.
    async fn history(
        &self,
        entity_kind: &str,
        entity_id: &str,
    ) -> Result<Vec<TransitionRecord>, EngineError>;

    /// Enabled routing rules for `(entity_kind, event)`, ordered by
    /// `priority DESC` then `created_at DESC`.
    async fn enabled_rules(
        &self,
        entity_kind: &str,
        event: &str,
    ) -> Result<Vec<RoutingRule>, EngineError>;

    /// Append one routing decision row.
    async fn append_routing_log(&self, row: RoutingLogRow) -> Result<(), EngineError>;
}

// =============================================================================
// In-Memory Store (for testing)
// =============================================================================

/// In-memory store for tests.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    /// A mutex-guarded map standing in for the relational store.
    ///
    /// The single lock serializes every entity — a stronger guarantee than
    /// the per-entity advisory lock, which is fine for tests.
    #[derive(Default)]
    pub struct InMemoryStore {
        inner: Mutex<Inner>,
    }

    #[derive(Default)]
    struct Inner {
        machines: HashMap<String, MachineDef>,
        states: HashMap<(String, String), String>,
        transition_logs: Vec<TransitionRecord>,
        rules: Vec<RoutingRule>,
        routing_logs: Vec<RoutingLogRow>,
    }

    impl InMemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Seed a routing rule directly (tests only; rule CRUD lives with
        /// the application).
        pub fn push_rule(&self, rule: RoutingRule) {
            self.lock().rules.push(rule);
        }

        /// Snapshot of the routing log, oldest first.
        pub fn routing_logs(&self) -> Vec<RoutingLogRow> {
            self.lock().routing_logs.clone()
        }

        /// Snapshot of every transition record, oldest first.
        pub fn all_transitions(&self) -> Vec<TransitionRecord> {
            self.lock().transition_logs.clone()
        }
    }

    #[async_trait]
    impl EngineStore for InMemoryStore {
        async fn upsert_machine(&self, def: &MachineDef) -> Result<(), EngineError> {
            self.lock().machines.insert(def.name.clone(), def.clone());
            Ok(())
        }

        async fn load_machines(&self) -> Result<Vec<MachineDef>, EngineError> {
            Ok(self.lock().machines.values().cloned().collect())
        }

        async fn current_state(
            &self,
            entity_kind: &str,
            entity_id: &str,
        ) -> Result<Option<String>, EngineError> {
            Ok(self
                .lock()
                .states
                .get(&(entity_kind.to_string(), entity_id.to_string()))
                .cloned())
        }

        async fn apply(&self, req: ApplyRequest<'_>) -> Result<AppliedTransition, EngineError> {
            let mut inner = self.lock();
            let key = (req.entity_kind.to_string(), req.entity_id.to_string());
            let current = inner
                .states
                .get(&key)
                .cloned()
                .unwrap_or_else(|| req.initial_state.to_string());

            let resolved = (req.resolve)(&current)?;

            inner.states.insert(key, resolved.to_state.clone());
            let record = TransitionRecord {
                id: Uuid::new_v4(),
                entity_kind: req.entity_kind.to_string(),
                entity_id: req.entity_id.to_string(),
                from_state: current,
                to_state: resolved.to_state.clone(),
                event: req.event.to_string(),
                event_data: req.event_data.clone(),
                actor_id: req.actor_id.to_string(),
                actor_kind: req.actor_kind,
                actions_executed: json!([]),
                created_at: Utc::now(),
            };
            inner.transition_logs.push(record.clone());
            Ok(AppliedTransition {
                record,
                actions: resolved.actions,
            })
        }

        async fn reset(&self, req: ResetRequest<'_>) -> Result<TransitionRecord, EngineError> {
            let mut inner = self.lock();
            let key = (req.entity_kind.to_string(), req.entity_id.to_string());
            let current = inner
                .states
                .get(&key)
                .cloned()
                .unwrap_or_else(|| req.initial_state.to_string());

            inner.states.insert(key, req.to_state.to_string());
            let record = TransitionRecord {
                id: Uuid::new_v4(),
                entity_kind: req.entity_kind.to_string(),
                entity_id: req.entity_id.to_string(),
                from_state: current,
                to_state: req.to_state.to_string(),
                event: req.event.to_string(),
                event_data: req.event_data.clone(),
                actor_id: req.actor_id.to_string(),
                actor_kind: req.actor_kind,
                actions_executed: json!([]),
                created_at: Utc::now(),
            };
            inner.transition_logs.push(record.clone());
            Ok(record)
        }

        async fn record_outcomes(
            &self,
            log_id: Uuid,
            outcomes: &[ActionOutcome],
        ) -> Result<(), EngineError> {
            let mut inner = self.lock();
            if let Some(row) = inner.transition_logs.iter_mut().find(|r| r.id == log_id) {
                row.actions_executed =
                    serde_json::to_value(outcomes).map_err(|e| EngineError::Storage(e.into()))?;
            }
            Ok(())
        }

        async fn history(
            &self,
            entity_kind: &str,
            entity_id: &str,
        ) -> Result<Vec<TransitionRecord>, EngineError> {
            let inner = self.lock();
            let mut rows: Vec<TransitionRecord> = inner
                .transition_logs
                .iter()
                .filter(|r| r.entity_kind == entity_kind && r.entity_id == entity_id)
                .cloned()
                .collect();
            rows.reverse();
            Ok(rows)
        }

        async fn enabled_rules(
            &self,
            entity_kind: &str,
            event: &str,
        ) -> Result<Vec<RoutingRule>, EngineError> {
            let inner = self.lock();
            let mut rules: Vec<RoutingRule> = inner
                .rules
                .iter()
                .filter(|r| r.enabled && r.entity_kind == entity_kind && r.event == event)
                .cloned()
                .collect();
            rules.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.created_at.cmp(&a.created_at))
            });
            Ok(rules)
        }

        async fn append_routing_log(&self, row: RoutingLogRow) -> Result<(), EngineError> {
            self.lock().routing_logs.push(row);
            Ok(())
        }
    }
}
