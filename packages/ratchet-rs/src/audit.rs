//! Audit records: the two append-only streams.
//!
//! Every successful transition appends one [`TransitionRecord`]; every
//! routing evaluation appends one [`RoutingLogRow`]. Transition records are
//! written in the same transaction as the state change, so a reader never
//! observes a state the log does not explain. Neither stream is compacted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::routing::Channel;

/// Who caused a transition.
///
/// `System` marks engine-internal propagation — auto-started successors and
/// cascade rollbacks — as opposed to explicit human or automation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorKind {
    User,
    Agent,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorKind::User => "user",
            ActorKind::Agent => "agent",
            ActorKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "agent" => ActorKind::Agent,
            "system" => ActorKind::System,
            _ => ActorKind::User,
        }
    }
}

/// Outcome of one dispatched action, recorded back onto the transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    #[serde(rename = "type")]
    pub action_type: String,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Ok,
    Error,
    /// The dispatch pass was cancelled before this action ran. Skipped
    /// actions are not retried automatically.
    Skipped,
}

impl ActionOutcome {
    pub fn ok(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            status: ActionStatus::Ok,
            error: None,
        }
    }

    pub fn error(action_type: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            status: ActionStatus::Error,
            error: Some(error.into()),
        }
    }

    pub fn skipped(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            status: ActionStatus::Skipped,
            error: None,
        }
    }
}

/// One row of the transition log. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: Uuid,
    pub entity_kind: String,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    /// The firing context, captured verbatim.
    pub event_data: Value,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    /// JSON array of [`ActionOutcome`]; empty until the post-commit dispatch
    /// pass reports back.
    pub actions_executed: Value,
    pub created_at: DateTime<Utc>,
}

/// One row of the routing log. Append-only.
///
/// `rule_id` is `None` when no rule matched and the default channel was
/// chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingLogRow {
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
    pub entity_kind: String,
    pub entity_id: Option<String>,
    pub event: String,
    pub channel: Channel,
    pub context: Value,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_kind_round_trip() {
        for kind in [ActorKind::User, ActorKind::Agent, ActorKind::System] {
            assert_eq!(ActorKind::parse(kind.as_str()), kind);
        }
        // Unrecognized input defaults to user.
        assert_eq!(ActorKind::parse("robot"), ActorKind::User);
    }

    #[test]
    fn test_action_outcome_serialization() {
        let ok = serde_json::to_value(ActionOutcome::ok("notify_assignee")).unwrap();
        assert_eq!(ok["type"], "notify_assignee");
        assert_eq!(ok["status"], "ok");
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ActionOutcome::error("create_external_task", "timeout")).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["error"], "timeout");

        let skipped = serde_json::to_value(ActionOutcome::skipped("notify_assignee")).unwrap();
        assert_eq!(skipped["status"], "skipped");
    }
}
