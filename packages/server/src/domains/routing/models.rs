//! Routing rule administration.
//!
//! The core router only ever reads enabled rules; this model owns the
//! writes — create, update, enable/disable, delete — plus the paginated
//! listing for the admin surface.

use anyhow::Result;
use chrono::{DateTime, Utc};
use ratchet::Channel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::AppError;

#[derive(sqlx::FromRow, Debug, Clone, Serialize)]
pub struct RuleRecord {
    pub id: Uuid,
    pub name: String,
    pub entity_kind: String,
    pub event: String,
    pub conditions: Value,
    pub channel: String,
    pub priority: i32,
    pub action_config: Option<Value>,
    pub enabled: bool,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub entity_kind: String,
    pub event: String,
    #[serde(default)]
    pub conditions: Value,
    pub channel: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub action_config: Option<Value>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub entity_kind: Option<String>,
    pub event: Option<String>,
    pub conditions: Option<Value>,
    pub channel: Option<String>,
    pub priority: Option<i32>,
    pub action_config: Option<Value>,
    pub enabled: Option<bool>,
    pub description: Option<String>,
}

fn validate_channel(channel: &str) -> Result<(), AppError> {
    if Channel::parse(channel).is_none() {
        return Err(AppError::InvalidInput(format!(
            "channel must be one of human, agent, auto (got '{channel}')"
        )));
    }
    Ok(())
}

impl RuleRecord {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM routing_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list(
        entity_kind: Option<&str>,
        event: Option<&str>,
        page: i64,
        page_size: i64,
        pool: &PgPool,
    ) -> Result<(Vec<Self>, i64)> {
        let offset = (page - 1).max(0) * page_size;

        let rows = sqlx::query_as::<_, Self>(
            "SELECT * FROM routing_rules
             WHERE ($1::text IS NULL OR entity_kind = $1)
               AND ($2::text IS NULL OR event = $2)
             ORDER BY priority DESC, created_at DESC
             LIMIT $3 OFFSET $4",
        )
        .bind(entity_kind)
        .bind(event)
        .bind(page_size)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM routing_rules
             WHERE ($1::text IS NULL OR entity_kind = $1)
               AND ($2::text IS NULL OR event = $2)",
        )
        .bind(entity_kind)
        .bind(event)
        .fetch_one(pool)
        .await?;

        Ok((rows, total))
    }

    pub async fn create(rule: NewRule, created_by: &str, pool: &PgPool) -> Result<Self, AppError> {
        if rule.name.trim().is_empty() {
            return Err(AppError::InvalidInput("rule name must not be empty".into()));
        }
        validate_channel(&rule.channel)?;

        let row = sqlx::query_as::<_, Self>(
            "INSERT INTO routing_rules
                 (name, entity_kind, event, conditions, channel, priority,
                  action_config, enabled, description, created_by)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING *",
        )
        .bind(&rule.name)
        .bind(&rule.entity_kind)
        .bind(&rule.event)
        .bind(&rule.conditions)
        .bind(&rule.channel)
        .bind(rule.priority)
        .bind(&rule.action_config)
        .bind(rule.enabled.unwrap_or(true))
        .bind(&rule.description)
        .bind(created_by)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    /// Partial update: absent fields keep their stored values.
    pub async fn update(id: Uuid, update: RuleUpdate, pool: &PgPool) -> Result<Self, AppError> {
        if let Some(channel) = update.channel.as_deref() {
            validate_channel(channel)?;
        }

        let row = sqlx::query_as::<_, Self>(
            "UPDATE routing_rules SET
                 name = COALESCE($2, name),
                 entity_kind = COALESCE($3, entity_kind),
                 event = COALESCE($4, event),
                 conditions = COALESCE($5, conditions),
                 channel = COALESCE($6, channel),
                 priority = COALESCE($7, priority),
                 action_config = COALESCE($8, action_config),
                 enabled = COALESCE($9, enabled),
                 description = COALESCE($10, description),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(&update.name)
        .bind(&update.entity_kind)
        .bind(&update.event)
        .bind(&update.conditions)
        .bind(&update.channel)
        .bind(update.priority)
        .bind(&update.action_config)
        .bind(update.enabled)
        .bind(&update.description)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)?;

        row.ok_or_else(|| AppError::NotFound(format!("routing rule {id} not found")))
    }

    pub async fn delete(id: Uuid, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query("DELETE FROM routing_rules WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_validation() {
        assert!(validate_channel("human").is_ok());
        assert!(validate_channel("agent").is_ok());
        assert!(validate_channel("auto").is_ok());
        assert!(validate_channel("carrier-pigeon").is_err());
    }

    #[test]
    fn test_new_rule_defaults() {
        let rule: NewRule = serde_json::from_value(serde_json::json!({
            "name": "r",
            "entity_kind": "po",
            "event": "approval_needed",
            "channel": "agent"
        }))
        .unwrap();
        assert_eq!(rule.priority, 0);
        assert!(rule.enabled.is_none());
        assert!(rule.conditions.is_null());
    }
}
