//! Routing engine: decides where an event goes before anyone raises it.
//!
//! A priority-ordered rule table maps `(entity_kind, event, context)` to a
//! dispatch channel — interactive human approval or an automated agent
//! channel. Evaluation is read-only against the rule table; the only write
//! is the decision row appended to the routing log.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::audit::RoutingLogRow;
use crate::error::EngineError;
use crate::predicate;
use crate::store::EngineStore;

/// Destination selected by the routing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Interactive human approval.
    Human,
    /// Automated agent processor.
    Agent,
    /// Policy-resolved. Currently collapses to `Agent`; the smarter
    /// resolution step is a future policy hook.
    Auto,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Human => "human",
            Channel::Agent => "agent",
            Channel::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Channel::Human),
            "agent" => Some(Channel::Agent),
            "auto" => Some(Channel::Auto),
            _ => None,
        }
    }

    /// Resolve `Auto` to a concrete channel.
    pub fn resolve(self) -> Self {
        match self {
            Channel::Auto => Channel::Agent,
            concrete => concrete,
        }
    }
}

/// One routing rule row. Higher priority evaluates first; disabled rules are
/// skipped entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: Uuid,
    pub name: String,
    pub entity_kind: String,
    pub event: String,
    /// Predicate tree over the evaluation context.
    pub conditions: Value,
    pub channel: Channel,
    pub priority: i32,
    pub action_config: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// The outcome of one routing evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub channel: Channel,
    /// `None` when no rule matched and the default applied.
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
    pub action_config: Value,
    pub reason: String,
}

/// Evaluates the rule table. Shares the predicate evaluator with the
/// state-machine engine.
pub struct Router {
    store: Arc<dyn EngineStore>,
}

impl Router {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Pick a channel for `(entity_kind, event)` under the given context.
    ///
    /// Rules are tried in priority order; the first whose conditions pass
    /// wins. A rule whose conditions cannot be evaluated is skipped so one
    /// bad row cannot take the whole table down. When nothing matches the
    /// decision defaults to `Human` with a null rule reference. Every
    /// evaluation, including the default, appends one routing log row.
    pub async fn evaluate(
        &self,
        entity_kind: &str,
        event: &str,
        entity_id: Option<&str>,
        ctx: &Value,
    ) -> Result<RouteDecision, EngineError> {
        let rules = self.store.enabled_rules(entity_kind, event).await?;

        let mut decision = None;
        for rule in &rules {
            match predicate::eval(&rule.conditions, ctx) {
                Ok(true) => {
                    decision = Some(RouteDecision {
                        channel: rule.channel.resolve(),
                        rule_id: Some(rule.id),
                        rule_name: Some(rule.name.clone()),
                        action_config: rule.action_config.clone(),
                        reason: format!(
                            "rule '{}' matched (priority {})",
                            rule.name, rule.priority
                        ),
                    });
                    break;
                }
                Ok(false) => continue,
                Err(err) => {
                    warn!(
                        rule_id = %rule.id,
                        rule_name = %rule.name,
                        error = %err,
                        "skipping routing rule with unevaluable conditions"
                    );
                }
            }
        }

        let decision = decision.unwrap_or_else(|| RouteDecision {
            channel: Channel::Human,
            rule_id: None,
            rule_name: None,
            action_config: Value::Null,
            reason: "no rule matched — default".to_string(),
        });

        self.store
            .append_routing_log(RoutingLogRow {
                rule_id: decision.rule_id,
                rule_name: decision.rule_name.clone(),
                entity_kind: entity_kind.to_string(),
                entity_id: entity_id.map(str::to_string),
                event: event.to_string(),
                channel: decision.channel,
                context: ctx.clone(),
                reason: decision.reason.clone(),
            })
            .await?;

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::InMemoryStore;
    use serde_json::json;

    fn rule(name: &str, priority: i32, conditions: Value, channel: Channel) -> RoutingRule {
        RoutingRule {
            id: Uuid::new_v4(),
            name: name.to_string(),
            entity_kind: "po".to_string(),
            event: "approval_needed".to_string(),
            conditions,
            channel,
            priority,
            action_config: Value::Null,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_priority_precedence() {
        let store = Arc::new(InMemoryStore::new());
        let high = rule(
            "large-orders-to-human",
            10,
            json!({"field": "amount", "op": "gt", "value": 1000}),
            Channel::Human,
        );
        let low = rule("everything-to-agent", 5, json!({}), Channel::Agent);
        let high_id = high.id;
        let low_id = low.id;
        store.push_rule(low);
        store.push_rule(high);

        let router = Router::new(store.clone());

        let small = router
            .evaluate("po", "approval_needed", Some("po-1"), &json!({"amount": 500}))
            .await
            .unwrap();
        assert_eq!(small.channel, Channel::Agent);
        assert_eq!(small.rule_id, Some(low_id));

        let large = router
            .evaluate("po", "approval_needed", Some("po-2"), &json!({"amount": 5000}))
            .await
            .unwrap();
        assert_eq!(large.channel, Channel::Human);
        assert_eq!(large.rule_id, Some(high_id));

        // Both evaluations were logged.
        let logs = store.routing_logs();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].channel, Channel::Agent);
        assert_eq!(logs[1].channel, Channel::Human);
    }

    #[tokio::test]
    async fn test_no_match_defaults_to_human_and_logs() {
        let store = Arc::new(InMemoryStore::new());
        let router = Router::new(store.clone());

        let decision = router
            .evaluate("po", "approval_needed", None, &json!({"amount": 1}))
            .await
            .unwrap();
        assert_eq!(decision.channel, Channel::Human);
        assert!(decision.rule_id.is_none());
        assert!(decision.reason.contains("default"));

        let logs = store.routing_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].rule_id.is_none());
    }

    #[tokio::test]
    async fn test_auto_resolves_to_agent() {
        let store = Arc::new(InMemoryStore::new());
        store.push_rule(rule("auto-policy", 1, json!({}), Channel::Auto));
        let router = Router::new(store.clone());

        let decision = router
            .evaluate("po", "approval_needed", None, &json!({}))
            .await
            .unwrap();
        assert_eq!(decision.channel, Channel::Agent);
    }

    #[tokio::test]
    async fn test_disabled_rules_are_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let mut disabled = rule("disabled", 100, json!({}), Channel::Agent);
        disabled.enabled = false;
        store.push_rule(disabled);
        let router = Router::new(store.clone());

        let decision = router
            .evaluate("po", "approval_needed", None, &json!({}))
            .await
            .unwrap();
        assert_eq!(decision.channel, Channel::Human);
        assert!(decision.rule_id.is_none());
    }

    #[tokio::test]
    async fn test_unevaluable_rule_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        store.push_rule(rule(
            "broken",
            100,
            json!({"value": 1}), // neither field nor op
            Channel::Agent,
        ));
        store.push_rule(rule("fallback", 1, json!({}), Channel::Agent));
        let router = Router::new(store.clone());

        let decision = router
            .evaluate("po", "approval_needed", None, &json!({}))
            .await
            .unwrap();
        assert_eq!(decision.channel, Channel::Agent);
        assert_eq!(decision.rule_name.as_deref(), Some("fallback"));
    }
}
