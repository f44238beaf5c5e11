//! Task persistence layer.
//!
//! `tasks.status` mirrors the engine's entity state for this task and is
//! updated only by the orchestrator after a successful fire; the engine's
//! state row plus its log is the authoritative record.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::gate::{self, DependencyKind, Predecessor};
use crate::common::AppError;

/// Task status values, matching the task machine's states.
pub mod status {
    pub const UNASSIGNED: &str = "unassigned";
    pub const PENDING: &str = "pending";
    pub const IN_PROGRESS: &str = "in_progress";
    pub const REVIEWING: &str = "reviewing";
    pub const COMPLETED: &str = "completed";
    pub const REJECTED: &str = "rejected";
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub project_id: Uuid,
    pub code: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub assignee_id: Option<String>,
    pub requires_approval: bool,
    pub parent_id: Option<Uuid>,
    pub phase: String,
    pub sequence: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub progress: i32,
    pub external_task_id: Option<String>,
    pub actual_start: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_code(project_id: Uuid, code: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM tasks WHERE project_id = $1 AND code = $2")
            .bind(project_id)
            .bind(code)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Insert a new task row (seeding and tests; task authoring is owned by
    /// the project-template surface, not this crate).
    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO tasks (
                id, project_id, code, title, description, status, assignee_id,
                requires_approval, parent_id, phase, sequence, due_date, progress
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             RETURNING *",
        )
        .bind(self.id)
        .bind(self.project_id)
        .bind(&self.code)
        .bind(&self.title)
        .bind(&self.description)
        .bind(&self.status)
        .bind(&self.assignee_id)
        .bind(self.requires_approval)
        .bind(self.parent_id)
        .bind(&self.phase)
        .bind(self.sequence)
        .bind(self.due_date)
        .bind(self.progress)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_assigned(id: Uuid, assignee: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE tasks SET status = 'pending', assignee_id = $2, updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(assignee)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_started(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE tasks SET status = 'in_progress', actual_start = NOW(), updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_completed(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE tasks SET status = 'completed', completed_at = NOW(), progress = 100,
                 updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_status(id: Uuid, status: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE tasks SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Rollback reset: back to an earlier status with completion cleared.
    pub async fn reset_to(id: Uuid, status: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE tasks SET status = $2, completed_at = NULL, progress = 0, updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_external_task_id(id: Uuid, external_id: &str, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE tasks SET external_task_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(external_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Same-phase tasks sequenced after the given one (rollback cascade set,
    /// before status filtering).
    pub async fn phase_successors(
        project_id: Uuid,
        phase: &str,
        sequence: i32,
        exclude: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM tasks
             WHERE project_id = $1 AND phase = $2 AND sequence > $3 AND id != $4
             ORDER BY sequence",
        )
        .bind(project_id)
        .bind(phase)
        .bind(sequence)
        .bind(exclude)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn children(parent_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM tasks WHERE parent_id = $1 ORDER BY sequence")
            .bind(parent_id)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// The task's predecessors with dependency kind and live status, ready
    /// for the pure gate check.
    pub async fn predecessors(task_id: Uuid, pool: &PgPool) -> Result<Vec<Predecessor>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            kind: String,
            status: String,
            title: String,
        }

        let rows: Vec<Row> = sqlx::query_as(
            "SELECT d.kind, t.status, t.title
             FROM task_dependencies d
             JOIN tasks t ON t.id = d.depends_on_id
             WHERE d.task_id = $1",
        )
        .bind(task_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Predecessor {
                kind: DependencyKind::parse(&r.kind),
                status: r.status,
                title: r.title,
            })
            .collect())
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TaskDependency {
    pub id: Uuid,
    pub task_id: Uuid,
    pub depends_on_id: Uuid,
    pub kind: String,
    pub lag_days: i32,
}

impl TaskDependency {
    /// Edges pointing at tasks that depend on `depends_on_id` (forward
    /// propagation set).
    pub async fn dependents(depends_on_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM task_dependencies WHERE depends_on_id = $1")
            .bind(depends_on_id)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Insert an edge after rejecting cycles over the project's edge set.
    pub async fn insert(
        project_id: Uuid,
        task_id: Uuid,
        depends_on_id: Uuid,
        kind: DependencyKind,
        lag_days: i32,
        pool: &PgPool,
    ) -> Result<Self, AppError> {
        let edges = Self::project_edges(project_id, pool).await?;
        if gate::creates_cycle(&edges, task_id, depends_on_id) {
            return Err(AppError::InvalidInput(format!(
                "dependency {task_id} -> {depends_on_id} would close a cycle"
            )));
        }

        let row = sqlx::query_as::<_, Self>(
            "INSERT INTO task_dependencies (task_id, depends_on_id, kind, lag_days)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (task_id, depends_on_id) DO UPDATE
                 SET kind = EXCLUDED.kind, lag_days = EXCLUDED.lag_days
             RETURNING *",
        )
        .bind(task_id)
        .bind(depends_on_id)
        .bind(kind.as_str())
        .bind(lag_days)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    /// The project's full edge set as an adjacency list (task -> its
    /// prerequisites).
    async fn project_edges(
        project_id: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<(Uuid, Uuid)>, AppError> {
        #[derive(sqlx::FromRow)]
        struct Edge {
            task_id: Uuid,
            depends_on_id: Uuid,
        }

        let rows: Vec<Edge> = sqlx::query_as(
            "SELECT d.task_id, d.depends_on_id
             FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id
             WHERE t.project_id = $1",
        )
        .bind(project_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|e| (e.task_id, e.depends_on_id)).collect())
    }
}

/// Review outcome option for a task code. `fail_rollback` outcomes name a
/// rollback target and whether the cascade applies.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TaskOutcome {
    pub id: Uuid,
    pub task_code: String,
    pub outcome_code: String,
    pub outcome_name: String,
    pub outcome_type: String,
    pub rollback_to_code: Option<String>,
    pub rollback_cascade: bool,
    pub sort_order: i32,
}

impl TaskOutcome {
    pub const TYPE_PASS: &'static str = "pass";
    pub const TYPE_FAIL_ROLLBACK: &'static str = "fail_rollback";

    pub async fn find(task_code: &str, outcome_code: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM task_outcomes WHERE task_code = $1 AND outcome_code = $2",
        )
        .bind(task_code)
        .bind(outcome_code)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }
}
