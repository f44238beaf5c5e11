//! The two machine definitions registered at startup.
//!
//! Both machines are plain data fed to the engine; the fork points live in
//! guard/priority pairs rather than code. The orchestrator and the BOM
//! controller supply the guard inputs (`requires_approval`, `was_frozen`,
//! `draft_exists`) through the firing context.

use ratchet::{ActionSpec, MachineDef};
use serde_json::json;

use crate::kernel::actions::{
    ACTION_COMPLETE_EXTERNAL_TASK, ACTION_CREATE_EXTERNAL_APPROVAL, ACTION_CREATE_EXTERNAL_TASK,
    ACTION_NOTIFY_ASSIGNEE,
};

/// Task lifecycle.
///
/// `complete` forks on `requires_approval`: the higher-priority row goes
/// straight to `completed`, the lower-priority one detours through
/// `reviewing`.
pub fn task_machine() -> MachineDef {
    let assign_actions = vec![
        ActionSpec::new(ACTION_CREATE_EXTERNAL_TASK),
        ActionSpec::new(ACTION_NOTIFY_ASSIGNEE),
    ];

    MachineDef::new("task", "unassigned")
        .state("pending")
        .state("in_progress")
        .state("reviewing")
        .state("completed")
        .state("rejected")
        .transition_full("unassigned", "assign", "pending", None, assign_actions.clone(), 0)
        // Re-assignment while still pending.
        .transition_full("pending", "assign", "pending", None, assign_actions, 0)
        .transition("pending", "start", "in_progress")
        .transition_full(
            "in_progress",
            "complete",
            "completed",
            Some(json!({"field": "requires_approval", "op": "eq", "value": false})),
            vec![ActionSpec::new(ACTION_COMPLETE_EXTERNAL_TASK)],
            10,
        )
        .transition_full(
            "in_progress",
            "complete",
            "reviewing",
            Some(json!({"field": "requires_approval", "op": "eq", "value": true})),
            vec![ActionSpec::new(ACTION_CREATE_EXTERNAL_APPROVAL)],
            0,
        )
        .transition_full(
            "reviewing",
            "approve",
            "completed",
            None,
            vec![ActionSpec::new(ACTION_COMPLETE_EXTERNAL_TASK)],
            0,
        )
        .transition_full(
            "reviewing",
            "reject",
            "in_progress",
            None,
            vec![ActionSpec::new(ACTION_NOTIFY_ASSIGNEE)],
            0,
        )
        // Review outcomes of type fail_rollback land here; the rollback
        // cascade itself runs through the engine's reset primitive.
        .transition_full(
            "reviewing",
            "fail",
            "rejected",
            None,
            vec![ActionSpec::new(ACTION_NOTIFY_ASSIGNEE)],
            0,
        )
}

/// BOM change control.
///
/// A frozen BOM keeps returning to `frozen` instead of `released`; the fork
/// is a guard pair on `was_frozen` at every exit from the editing flow.
pub fn bom_machine() -> MachineDef {
    let frozen_guard = json!({"field": "was_frozen", "op": "eq", "value": true});

    MachineDef::new("bom", "draft")
        .state("submitted")
        .state("released")
        .state("editing")
        .state("ecn_pending")
        .state("frozen")
        .state("rejected")
        .transition("released", "start_edit", "editing")
        .transition("frozen", "start_edit", "editing")
        .transition("editing", "save_draft", "editing")
        .transition_full("editing", "discard_draft", "frozen", Some(frozen_guard.clone()), Vec::new(), 10)
        .transition_full("editing", "discard_draft", "released", None, Vec::new(), 0)
        .transition_full(
            "editing",
            "submit_ecn",
            "ecn_pending",
            Some(json!({"field": "draft_exists", "op": "eq", "value": true})),
            Vec::new(),
            0,
        )
        .transition_full("ecn_pending", "approve_ecn", "frozen", Some(frozen_guard.clone()), Vec::new(), 10)
        .transition_full("ecn_pending", "approve_ecn", "released", None, Vec::new(), 0)
        .transition_full("ecn_pending", "reject_ecn", "frozen", Some(frozen_guard), Vec::new(), 10)
        .transition_full("ecn_pending", "reject_ecn", "released", None, Vec::new(), 0)
}
