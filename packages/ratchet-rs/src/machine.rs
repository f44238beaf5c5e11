//! Machine definitions: the data that drives the engine.
//!
//! A machine is pure data — states, an initial state, and transition rows.
//! The engine has no hard-coded entity semantics; registering a new
//! definition adds a new entity lifecycle without touching engine code.
//! Definitions are validated at registration and cached process-locally.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// A single action attached to a transition, executed post-commit by the
/// dispatcher. `config` is handler-specific.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub config: Value,
}

impl ActionSpec {
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            config: Value::Null,
        }
    }

    pub fn with_config(action_type: impl Into<String>, config: Value) -> Self {
        Self {
            action_type: action_type.into(),
            config,
        }
    }
}

/// One transition row.
///
/// Uniqueness is deliberately NOT enforced on `(from_state, event)`: several
/// rows may share that key and are told apart by `priority` (higher first)
/// and `guard`. The first row whose guard passes wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from_state: String,
    pub to_state: String,
    pub event: String,
    /// Predicate tree evaluated against the firing context. `None` always
    /// passes.
    #[serde(default)]
    pub guard: Option<Value>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub priority: i32,
}

/// A complete machine definition.
///
/// Built either in code (fixtures registered at startup) or loaded from the
/// `machine_definitions` + `transitions` tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineDef {
    /// Unique machine name. By convention this equals the entity kind it
    /// governs (`task`, `bom`, ...).
    pub name: String,
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionDef>,
}

impl MachineDef {
    pub fn new(name: impl Into<String>, initial_state: impl Into<String>) -> Self {
        let initial_state = initial_state.into();
        Self {
            name: name.into(),
            states: vec![initial_state.clone()],
            initial_state,
            transitions: Vec::new(),
        }
    }

    /// Declare a state. Idempotent; the initial state is pre-declared.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        let state = state.into();
        if !self.states.contains(&state) {
            self.states.push(state);
        }
        self
    }

    /// Add an unguarded transition with default priority.
    pub fn transition(
        self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.transition_full(from, event, to, None, Vec::new(), 0)
    }

    /// Add a transition with guard, actions, and priority.
    pub fn transition_full(
        mut self,
        from: impl Into<String>,
        event: impl Into<String>,
        to: impl Into<String>,
        guard: Option<Value>,
        actions: Vec<ActionSpec>,
        priority: i32,
    ) -> Self {
        self.transitions.push(TransitionDef {
            from_state: from.into(),
            to_state: to.into(),
            event: event.into(),
            guard,
            actions,
            priority,
        });
        self
    }

    /// Validate referential integrity: the initial state and every
    /// transition endpoint must be declared states.
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("machine name is empty".into()));
        }
        if !self.states.iter().any(|s| *s == self.initial_state) {
            return Err(invalid(format!(
                "initial state '{}' is not a declared state",
                self.initial_state
            )));
        }
        for t in &self.transitions {
            for endpoint in [&t.from_state, &t.to_state] {
                if !self.states.iter().any(|s| s == endpoint) {
                    return Err(invalid(format!(
                        "transition '{}' references unknown state '{}'",
                        t.event, endpoint
                    )));
                }
            }
        }
        Ok(())
    }

    /// Candidate transitions for `(from, event)`, highest priority first.
    ///
    /// The relative order of equal-priority rows follows definition order.
    pub fn candidates(&self, from: &str, event: &str) -> Vec<&TransitionDef> {
        let mut matching: Vec<&TransitionDef> = self
            .transitions
            .iter()
            .filter(|t| t.from_state == from && t.event == event)
            .collect();
        matching.sort_by_key(|t| std::cmp::Reverse(t.priority));
        matching
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn toggle_machine() -> MachineDef {
        MachineDef::new("light", "off")
            .state("on")
            .transition("off", "toggle", "on")
            .transition("on", "toggle", "off")
    }

    #[test]
    fn test_validate_accepts_well_formed() {
        assert!(toggle_machine().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_initial() {
        let def = MachineDef {
            initial_state: "nowhere".into(),
            ..toggle_machine()
        };
        assert!(matches!(
            def.validate(),
            Err(EngineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_dangling_transition() {
        // "plasma" is never declared as a state.
        let def = toggle_machine().transition("on", "explode", "plasma");
        assert!(matches!(
            def.validate(),
            Err(EngineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_candidates_sorted_by_priority_desc() {
        let def = MachineDef::new("m", "a")
            .state("b")
            .state("c")
            .transition_full("a", "go", "b", None, Vec::new(), 0)
            .transition_full("a", "go", "c", Some(json!({"field": "x", "op": "eq", "value": 1})), Vec::new(), 10);
        let candidates = def.candidates("a", "go");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].to_state, "c");
        assert_eq!(candidates[1].to_state, "b");
        assert!(def.candidates("b", "go").is_empty());
    }

    #[test]
    fn test_action_spec_serde_shape() {
        let spec = ActionSpec::with_config("notify_assignee", json!({"template": "ready"}));
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], "notify_assignee");
        assert_eq!(value["config"]["template"], "ready");
    }
}
