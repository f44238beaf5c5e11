//! Pure task-graph decisions: dependency gating, rollback cascade
//! eligibility, cycle detection.
//!
//! Everything here operates on loaded rows and does no IO, so the rules the
//! orchestrator enforces are testable without a database.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use super::models::status;

/// Classical precedence kinds between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    /// Finish-to-Start (default): predecessor must be completed.
    FinishToStart,
    /// Start-to-Start: predecessor must have started.
    StartToStart,
    /// Finish-to-Finish: no start-time constraint.
    FinishToFinish,
    /// Start-to-Finish: predecessor must have started.
    StartToFinish,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::FinishToStart => "FS",
            DependencyKind::StartToStart => "SS",
            DependencyKind::FinishToFinish => "FF",
            DependencyKind::StartToFinish => "SF",
        }
    }

    /// Unrecognized kinds fall back to FS, the strictest gate.
    pub fn parse(s: &str) -> Self {
        match s {
            "SS" => DependencyKind::StartToStart,
            "FF" => DependencyKind::FinishToFinish,
            "SF" => DependencyKind::StartToFinish,
            _ => DependencyKind::FinishToStart,
        }
    }
}

/// A predecessor as seen by the gate: its dependency kind and live status.
#[derive(Debug, Clone)]
pub struct Predecessor {
    pub kind: DependencyKind,
    pub status: String,
    pub title: String,
}

fn has_started(status: &str) -> bool {
    status != status::UNASSIGNED && status != status::PENDING
}

/// Reasons a task may not start yet. Empty means the gate is open.
///
/// FS predecessors must be completed; SS and SF predecessors must have
/// started; FF predecessors impose nothing at start time.
pub fn start_blockers(predecessors: &[Predecessor]) -> Vec<String> {
    let mut blockers = Vec::new();
    for pred in predecessors {
        match pred.kind {
            DependencyKind::FinishToStart => {
                if pred.status != status::COMPLETED {
                    blockers.push(format!(
                        "predecessor '{}' is not completed (currently {})",
                        pred.title, pred.status
                    ));
                }
            }
            DependencyKind::StartToStart | DependencyKind::StartToFinish => {
                if !has_started(&pred.status) {
                    blockers.push(format!(
                        "predecessor '{}' has not started (currently {})",
                        pred.title, pred.status
                    ));
                }
            }
            DependencyKind::FinishToFinish => {}
        }
    }
    blockers
}

/// Whether a cascade rollback may reset a task in this status back to
/// pending. Untouched tasks (unassigned, pending) have nothing to reset.
pub fn resettable(status: &str) -> bool {
    matches!(
        status,
        status::COMPLETED | status::IN_PROGRESS | status::REVIEWING | status::REJECTED
    )
}

/// Would adding the edge `task -> depends_on` close a cycle?
///
/// `edges` is the project's current edge set as `(task, depends_on)` pairs.
/// The new edge closes a cycle exactly when `task` is already reachable
/// from `depends_on` along dependency edges.
pub fn creates_cycle(edges: &[(Uuid, Uuid)], task: Uuid, depends_on: Uuid) -> bool {
    if task == depends_on {
        return true;
    }

    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        adjacency.entry(*from).or_default().push(*to);
    }

    let mut stack = vec![depends_on];
    let mut seen = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == task {
            return true;
        }
        if !seen.insert(current) {
            continue;
        }
        if let Some(nexts) = adjacency.get(&current) {
            stack.extend(nexts.iter().copied());
        }
    }
    false
}
