//! Postgres-backed [`EngineStore`].
//!
//! Per-entity serialization uses `pg_advisory_xact_lock(hashtext(kind),
//! hashtext(id))` — the lock is scoped to the transaction, so commit or
//! rollback releases it and no unlock bookkeeping exists. Everything the
//! firing writes (`entity_states` upsert + `transition_logs` append) happens
//! inside that one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::audit::{ActionOutcome, ActorKind, RoutingLogRow, TransitionRecord};
use crate::error::EngineError;
use crate::machine::{ActionSpec, MachineDef, TransitionDef};
use crate::routing::{Channel, RoutingRule};
use crate::store::{AppliedTransition, ApplyRequest, EngineStore, ResetRequest};

pub struct PgEngineStore {
    pool: PgPool,
}

impl PgEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(sqlx::FromRow)]
struct MachineRow {
    id: Uuid,
    name: String,
    initial_state: String,
    states: Value,
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    from_state: String,
    to_state: String,
    event: String,
    guard: Option<Value>,
    actions: Value,
    priority: i32,
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    entity_kind: String,
    entity_id: String,
    from_state: String,
    to_state: String,
    event: String,
    event_data: Value,
    actor_id: String,
    actor_kind: String,
    actions_executed: Value,
    created_at: DateTime<Utc>,
}

impl From<LogRow> for TransitionRecord {
    fn from(row: LogRow) -> Self {
        TransitionRecord {
            id: row.id,
            entity_kind: row.entity_kind,
            entity_id: row.entity_id,
            from_state: row.from_state,
            to_state: row.to_state,
            event: row.event,
            event_data: row.event_data,
            actor_id: row.actor_id,
            actor_kind: ActorKind::parse(&row.actor_kind),
            actions_executed: row.actions_executed,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: Uuid,
    name: String,
    entity_kind: String,
    event: String,
    conditions: Value,
    channel: String,
    priority: i32,
    action_config: Option<Value>,
    enabled: bool,
    created_at: DateTime<Utc>,
}

impl From<RuleRow> for RoutingRule {
    fn from(row: RuleRow) -> Self {
        let channel = Channel::parse(&row.channel).unwrap_or_else(|| {
            warn!(rule_id = %row.id, channel = %row.channel, "unknown channel on rule; treating as human");
            Channel::Human
        });
        RoutingRule {
            id: row.id,
            name: row.name,
            entity_kind: row.entity_kind,
            event: row.event,
            conditions: row.conditions,
            channel,
            priority: row.priority,
            action_config: row.action_config.unwrap_or(Value::Null),
            enabled: row.enabled,
            created_at: row.created_at,
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Storage(e.into()))
}

// =============================================================================
// EngineStore implementation
// =============================================================================

#[async_trait]
impl EngineStore for PgEngineStore {
    async fn upsert_machine(&self, def: &MachineDef) -> Result<(), EngineError> {
        let mut tx = self.pool.begin().await?;

        let machine_id: Uuid = sqlx::query_scalar(
            "INSERT INTO machine_definitions (name, initial_state, states)
             VALUES ($1, $2, $3)
             ON CONFLICT (name) DO UPDATE
                 SET initial_state = EXCLUDED.initial_state,
                     states = EXCLUDED.states,
                     updated_at = NOW()
             RETURNING id",
        )
        .bind(&def.name)
        .bind(&def.initial_state)
        .bind(to_json(&def.states)?)
        .fetch_one(&mut *tx)
        .await?;

        // Transitions are owned by the machine: replace wholesale.
        sqlx::query("DELETE FROM transitions WHERE machine_id = $1")
            .bind(machine_id)
            .execute(&mut *tx)
            .await?;

        for t in &def.transitions {
            sqlx::query(
                "INSERT INTO transitions
                     (machine_id, from_state, to_state, event, guard, actions, priority)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(machine_id)
            .bind(&t.from_state)
            .bind(&t.to_state)
            .bind(&t.event)
            .bind(t.guard.as_ref())
            .bind(to_json(&t.actions)?)
            .bind(t.priority)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_machines(&self) -> Result<Vec<MachineDef>, EngineError> {
        let machines: Vec<MachineRow> = sqlx::query_as(
            "SELECT id, name, initial_state, states FROM machine_definitions ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut defs = Vec::with_capacity(machines.len());
        for row in machines {
            let transitions: Vec<TransitionRow> = sqlx::query_as(
                "SELECT from_state, to_state, event, guard, actions, priority
                 FROM transitions WHERE machine_id = $1
                 ORDER BY from_state, event, priority DESC",
            )
            .bind(row.id)
            .fetch_all(&self.pool)
            .await?;

            let states: Vec<String> =
                serde_json::from_value(row.states).map_err(|e| EngineError::Storage(e.into()))?;
            let transitions = transitions
                .into_iter()
                .map(|t| {
                    Ok(TransitionDef {
                        from_state: t.from_state,
                        to_state: t.to_state,
                        event: t.event,
                        guard: t.guard,
                        actions: serde_json::from_value::<Vec<ActionSpec>>(t.actions)
                            .map_err(|e| EngineError::Storage(e.into()))?,
                        priority: t.priority,
                    })
                })
                .collect::<Result<Vec<_>, EngineError>>()?;

            defs.push(MachineDef {
                name: row.name,
                initial_state: row.initial_state,
                states,
                transitions,
            });
        }
        Ok(defs)
    }

    async fn current_state(
        &self,
        entity_kind: &str,
        entity_id: &str,
    ) -> Result<Option<String>, EngineError> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT current_state FROM entity_states WHERE entity_kind = $1 AND entity_id = $2",
        )
        .bind(entity_kind)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(state)
    }

    async fn apply(&self, req: ApplyRequest<'_>) -> Result<AppliedTransition, EngineError> {
        let mut tx = self.pool.begin().await?;

        // Serialize firings per entity. Released at commit/rollback.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(req.entity_kind)
            .bind(req.entity_id)
            .execute(&mut *tx)
            .await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT current_state FROM entity_states WHERE entity_kind = $1 AND entity_id = $2",
        )
        .bind(req.entity_kind)
        .bind(req.entity_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.unwrap_or_else(|| req.initial_state.to_string());

        // Resolution failure drops the transaction: nothing written.
        let resolved = (req.resolve)(&current)?;

        sqlx::query(
            "INSERT INTO entity_states (entity_kind, entity_id, machine, current_state, updated_at)
             VALUES ($1, $2, $1, $3, NOW())
             ON CONFLICT (entity_kind, entity_id) DO UPDATE
                 SET current_state = EXCLUDED.current_state, updated_at = NOW()",
        )
        .bind(req.entity_kind)
        .bind(req.entity_id)
        .bind(&resolved.to_state)
        .execute(&mut *tx)
        .await?;

        let row: LogRow = sqlx::query_as(
            "INSERT INTO transition_logs
                 (entity_kind, entity_id, from_state, to_state, event,
                  event_data, actor_id, actor_kind, actions_executed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '[]'::jsonb)
             RETURNING *",
        )
        .bind(req.entity_kind)
        .bind(req.entity_id)
        .bind(&current)
        .bind(&resolved.to_state)
        .bind(req.event)
        .bind(req.event_data)
        .bind(req.actor_id)
        .bind(req.actor_kind.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AppliedTransition {
            record: row.into(),
            actions: resolved.actions,
        })
    }

    async fn reset(&self, req: ResetRequest<'_>) -> Result<TransitionRecord, EngineError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
            .bind(req.entity_kind)
            .bind(req.entity_id)
            .execute(&mut *tx)
            .await?;

        let current: Option<String> = sqlx::query_scalar(
            "SELECT current_state FROM entity_states WHERE entity_kind = $1 AND entity_id = $2",
        )
        .bind(req.entity_kind)
        .bind(req.entity_id)
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.unwrap_or_else(|| req.initial_state.to_string());

        sqlx::query(
            "INSERT INTO entity_states (entity_kind, entity_id, machine, current_state, updated_at)
             VALUES ($1, $2, $1, $3, NOW())
             ON CONFLICT (entity_kind, entity_id) DO UPDATE
                 SET current_state = EXCLUDED.current_state, updated_at = NOW()",
        )
        .bind(req.entity_kind)
        .bind(req.entity_id)
        .bind(req.to_state)
        .execute(&mut *tx)
        .await?;

        let row: LogRow = sqlx::query_as(
            "INSERT INTO transition_logs
                 (entity_kind, entity_id, from_state, to_state, event,
                  event_data, actor_id, actor_kind, actions_executed)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '[]'::jsonb)
             RETURNING *",
        )
        .bind(req.entity_kind)
        .bind(req.entity_id)
        .bind(&current)
        .bind(req.to_state)
        .bind(req.event)
        .bind(req.event_data)
        .bind(req.actor_id)
        .bind(req.actor_kind.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row.into())
    }

    async fn record_outcomes(
        &self,
        log_id: Uuid,
        outcomes: &[ActionOutcome],
    ) -> Result<(), EngineError> {
        sqlx::query("UPDATE transition_logs SET actions_executed = $2 WHERE id = $1")
            .bind(log_id)
            .bind(to_json(&outcomes)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn history(
        &self,
        entity_kind: &str,
        entity_id: &str,
    ) -> Result<Vec<TransitionRecord>, EngineError> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT * FROM transition_logs
             WHERE entity_kind = $1 AND entity_id = $2
             ORDER BY created_at DESC, id DESC",
        )
        .bind(entity_kind)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn enabled_rules(
        &self,
        entity_kind: &str,
        event: &str,
    ) -> Result<Vec<RoutingRule>, EngineError> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT id, name, entity_kind, event, conditions, channel,
                    priority, action_config, enabled, created_at
             FROM routing_rules
             WHERE enabled = TRUE AND entity_kind = $1 AND event = $2
             ORDER BY priority DESC, created_at DESC",
        )
        .bind(entity_kind)
        .bind(event)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn append_routing_log(&self, row: RoutingLogRow) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO routing_logs
                 (rule_id, rule_name, entity_kind, entity_id, event, channel, context, reason)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(row.rule_id)
        .bind(&row.rule_name)
        .bind(&row.entity_kind)
        .bind(&row.entity_id)
        .bind(&row.event)
        .bind(row.channel.as_str())
        .bind(&row.context)
        .bind(&row.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
