//! Task lifecycle orchestration on top of the state-machine engine.
//!
//! Every status change flows through `Engine::fire` (or the reset primitive
//! for rollbacks), which commits the entity state and audit row atomically;
//! the task row is then updated to mirror the committed state. Dependency
//! gating spans other entities and therefore runs before the fire rather
//! than inside a guard.
//!
//! Auto-start propagation and parent auto-completion run after the
//! user-visible operation commits, each under its own per-entity lock, so
//! the caller's lock set never grows with the fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use ratchet::{ActorKind, CancellationToken, Engine, FireRequest, TransitionRecord};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::gate;
use super::models::{status, Task, TaskDependency, TaskOutcome};
use crate::common::AppError;

/// Machine name and entity kind for tasks.
pub const TASK_KIND: &str = "task";

pub struct TaskOrchestrator {
    pool: PgPool,
    engine: Arc<Engine>,
}

impl TaskOrchestrator {
    pub fn new(pool: PgPool, engine: Arc<Engine>) -> Self {
        Self { pool, engine }
    }

    async fn load(&self, task_id: Uuid) -> Result<Task, AppError> {
        Task::find_by_id(task_id, &self.pool)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))
    }

    async fn fire(
        &self,
        task: &Task,
        event: &str,
        ctx: Value,
        actor_id: &str,
        actor_kind: ActorKind,
        cancel: &CancellationToken,
    ) -> Result<TransitionRecord, AppError> {
        let entity_id = task.id.to_string();
        let record = self
            .engine
            .fire(
                FireRequest {
                    entity_kind: TASK_KIND,
                    entity_id: &entity_id,
                    event,
                    ctx,
                    actor_id,
                    actor_kind,
                    // Tasks are authored by the project surface, so the row
                    // status seeds the machine on first contact.
                    fallback_state: Some(&task.status),
                },
                cancel,
            )
            .await?;
        Ok(record)
    }

    /// Assign (or re-assign) a task. Allowed from `unassigned` and
    /// `pending`; the machine rejects anything else.
    ///
    /// The transition's actions create the external task record and notify
    /// the assignee; both are best-effort.
    pub async fn assign(
        &self,
        task_id: Uuid,
        assignee: &str,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, AppError> {
        if assignee.trim().is_empty() {
            return Err(AppError::InvalidInput("assignee must not be empty".into()));
        }
        let task = self.load(task_id).await?;

        self.fire(
            &task,
            "assign",
            json!({
                "assignee_id": assignee,
                "title": task.title,
                "due_date": task.due_date,
            }),
            operator,
            ActorKind::User,
            cancel,
        )
        .await?;

        Task::mark_assigned(task_id, assignee, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    /// Start a task once its prerequisite gate is open.
    ///
    /// The gate spans other entities, so it is computed here rather than in
    /// a guard: FS predecessors must be completed, SS/SF predecessors must
    /// have started, FF predecessors do not constrain starting.
    pub async fn start(
        &self,
        task_id: Uuid,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, AppError> {
        let task = self.load(task_id).await?;
        self.ensure_prerequisites(&task).await?;

        self.fire(&task, "start", json!({}), operator, ActorKind::User, cancel)
            .await?;

        Task::mark_started(task_id, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    /// Complete a task. Tasks requiring approval detour through `reviewing`;
    /// the rest go straight to `completed` and wake their ready successors.
    pub async fn complete(
        &self,
        task_id: Uuid,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, AppError> {
        let task = self.load(task_id).await?;

        let record = self
            .fire(
                &task,
                "complete",
                json!({
                    "requires_approval": task.requires_approval,
                    "assignee_id": task.assignee_id,
                    "title": task.title,
                }),
                operator,
                ActorKind::User,
                cancel,
            )
            .await?;

        if record.to_state == status::COMPLETED {
            let task = Task::mark_completed(task_id, &self.pool)
                .await
                .map_err(AppError::internal)?;
            self.propagate_ready(task_id, cancel).await;
            Ok(task)
        } else {
            Task::set_status(task_id, &record.to_state, &self.pool)
                .await
                .map_err(AppError::internal)
        }
    }

    /// Resolve a review. The outcome row for `(task.code, outcome_code)`
    /// picks the event: `pass` (or no row with an approving code) approves,
    /// a plain reject sends the task back to work, and `fail_rollback`
    /// rejects the task and then rolls the flow back to the configured
    /// target.
    pub async fn submit_review(
        &self,
        task_id: Uuid,
        outcome_code: &str,
        comment: &str,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<Task, AppError> {
        let task = self.load(task_id).await?;
        let outcome = TaskOutcome::find(&task.code, outcome_code, &self.pool)
            .await
            .map_err(AppError::internal)?;

        let event_data = json!({
            "outcome_code": outcome_code,
            "comment": comment,
            "assignee_id": task.assignee_id,
            "title": task.title,
        });

        match outcome {
            Some(outcome) if outcome.outcome_type == TaskOutcome::TYPE_FAIL_ROLLBACK => {
                self.fire(&task, "fail", event_data, operator, ActorKind::User, cancel)
                    .await?;
                let task = Task::set_status(task_id, status::REJECTED, &self.pool)
                    .await
                    .map_err(AppError::internal)?;

                if let Some(target_code) = outcome.rollback_to_code.as_deref() {
                    // Review stands even if the rollback trips on a missing
                    // target; the failure is visible in the logs.
                    if let Err(err) = self
                        .rollback(&task, target_code, outcome.rollback_cascade, operator)
                        .await
                    {
                        error!(
                            task_id = %task_id,
                            target_code,
                            error = %err,
                            "rollback after failed review did not complete"
                        );
                    }
                }
                Ok(task)
            }
            _ if outcome_code == "reject" || outcome_code == "rejected" => {
                self.fire(&task, "reject", event_data, operator, ActorKind::User, cancel)
                    .await?;
                Task::set_status(task_id, status::IN_PROGRESS, &self.pool)
                    .await
                    .map_err(AppError::internal)
            }
            _ => {
                self.fire(&task, "approve", event_data, operator, ActorKind::User, cancel)
                    .await?;
                let task = Task::mark_completed(task_id, &self.pool)
                    .await
                    .map_err(AppError::internal)?;
                self.propagate_ready(task_id, cancel).await;
                Ok(task)
            }
        }
    }

    /// Roll a flow back to an earlier task.
    ///
    /// The target returns to `in_progress` with its completion cleared.
    /// With `cascade`, every same-phase task sequenced after the target
    /// that has left `pending` is reset to `pending`. Each reset is audited
    /// with `actor_kind = system` and a back-reference to the triggering
    /// task.
    pub async fn rollback(
        &self,
        source: &Task,
        target_code: &str,
        cascade: bool,
        operator: &str,
    ) -> Result<(), AppError> {
        let target = Task::find_by_code(source.project_id, target_code, &self.pool)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| {
                AppError::NotFound(format!("rollback target '{target_code}' not found"))
            })?;

        self.reset_task(&target, status::IN_PROGRESS, source.id, cascade, operator)
            .await?;

        if !cascade {
            return Ok(());
        }

        let successors = Task::phase_successors(
            source.project_id,
            &target.phase,
            target.sequence,
            target.id,
            &self.pool,
        )
        .await
        .map_err(AppError::internal)?;

        for task in successors.iter().filter(|t| gate::resettable(&t.status)) {
            self.reset_task(task, status::PENDING, source.id, true, operator)
                .await?;
        }
        Ok(())
    }

    async fn reset_task(
        &self,
        task: &Task,
        to_status: &str,
        triggered_by: Uuid,
        cascade: bool,
        operator: &str,
    ) -> Result<(), AppError> {
        self.engine
            .reset(
                TASK_KIND,
                &task.id.to_string(),
                to_status,
                "rollback",
                json!({"triggered_by_task": triggered_by, "cascade": cascade}),
                operator,
                Some(&task.status),
            )
            .await?;
        Task::reset_to(task.id, to_status, &self.pool)
            .await
            .map_err(AppError::internal)?;
        info!(task_id = %task.id, to_status, %triggered_by, "task rolled back");
        Ok(())
    }

    /// Transition history for a task, newest first.
    pub async fn history(&self, task_id: Uuid) -> Result<Vec<TransitionRecord>, AppError> {
        // Surface 404 for unknown ids rather than an empty log.
        self.load(task_id).await?;
        let records = self.engine.history(TASK_KIND, &task_id.to_string()).await?;
        Ok(records)
    }

    async fn ensure_prerequisites(&self, task: &Task) -> Result<(), AppError> {
        let predecessors = Task::predecessors(task.id, &self.pool)
            .await
            .map_err(AppError::internal)?;
        let blockers = gate::start_blockers(&predecessors);
        if blockers.is_empty() {
            Ok(())
        } else {
            Err(AppError::PreconditionFailed(format!(
                "prerequisites unmet: {}",
                blockers.join("; ")
            )))
        }
    }

    /// Wake work made ready by a completion.
    ///
    /// Worklist over the dependency DAG: auto-start every pending dependent
    /// whose gate is now open, and auto-complete a parent whose children
    /// are all complete (which re-enters the loop for the parent's own
    /// dependents). Best-effort by design — failures are logged, never
    /// propagated into the triggering operation.
    pub async fn propagate_ready(&self, completed_id: Uuid, cancel: &CancellationToken) {
        let mut queue = VecDeque::from([completed_id]);

        while let Some(done_id) = queue.pop_front() {
            match TaskDependency::dependents(done_id, &self.pool).await {
                Ok(edges) => {
                    for edge in edges {
                        match self.try_auto_start(edge.task_id, done_id, cancel).await {
                            Ok(true) => {
                                info!(task_id = %edge.task_id, completed_dep = %done_id, "task auto-started");
                            }
                            Ok(false) => {}
                            Err(err) => {
                                warn!(task_id = %edge.task_id, error = %err, "auto-start failed");
                            }
                        }
                    }
                }
                Err(err) => error!(task_id = %done_id, error = %err, "loading dependents failed"),
            }

            match self.try_auto_complete_parent(done_id, cancel).await {
                Ok(Some(parent_id)) => {
                    info!(parent_id = %parent_id, child_id = %done_id, "parent task auto-completed");
                    queue.push_back(parent_id);
                }
                Ok(None) => {}
                Err(err) => warn!(task_id = %done_id, error = %err, "parent auto-complete failed"),
            }
        }
    }

    async fn try_auto_start(
        &self,
        task_id: Uuid,
        completed_dep: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, AppError> {
        let task = match Task::find_by_id(task_id, &self.pool)
            .await
            .map_err(AppError::internal)?
        {
            Some(task) => task,
            None => return Ok(false),
        };
        if task.status != status::PENDING {
            return Ok(false);
        }

        let predecessors = Task::predecessors(task_id, &self.pool)
            .await
            .map_err(AppError::internal)?;
        if !gate::start_blockers(&predecessors).is_empty() {
            return Ok(false);
        }

        self.fire(
            &task,
            "start",
            json!({"auto_started": true, "completed_dep_task": completed_dep}),
            "system",
            ActorKind::System,
            cancel,
        )
        .await?;
        Task::mark_started(task_id, &self.pool)
            .await
            .map_err(AppError::internal)?;
        Ok(true)
    }

    /// If the completed task has a parent whose children are now all
    /// complete, complete the parent too. Returns the parent id when the
    /// parent actually reached `completed`.
    async fn try_auto_complete_parent(
        &self,
        child_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Uuid>, AppError> {
        let child = match Task::find_by_id(child_id, &self.pool)
            .await
            .map_err(AppError::internal)?
        {
            Some(child) => child,
            None => return Ok(None),
        };
        let parent_id = match child.parent_id {
            Some(parent_id) => parent_id,
            None => return Ok(None),
        };
        let parent = match Task::find_by_id(parent_id, &self.pool)
            .await
            .map_err(AppError::internal)?
        {
            Some(parent) => parent,
            None => return Ok(None),
        };
        if parent.status != status::IN_PROGRESS {
            return Ok(None);
        }

        let children = Task::children(parent_id, &self.pool)
            .await
            .map_err(AppError::internal)?;
        if children.is_empty() || children.iter().any(|t| t.status != status::COMPLETED) {
            return Ok(None);
        }

        let record = self
            .fire(
                &parent,
                "complete",
                json!({
                    "requires_approval": parent.requires_approval,
                    "auto_completed": true,
                    "completed_child": child_id,
                }),
                "system",
                ActorKind::System,
                cancel,
            )
            .await?;

        if record.to_state == status::COMPLETED {
            Task::mark_completed(parent_id, &self.pool)
                .await
                .map_err(AppError::internal)?;
            Ok(Some(parent_id))
        } else {
            // Parent needs review; a human finishes it from here.
            Task::set_status(parent_id, &record.to_state, &self.pool)
                .await
                .map_err(AppError::internal)?;
            Ok(None)
        }
    }
}
