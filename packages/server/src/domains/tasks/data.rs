use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::models::Task;

/// Task API representation
///
/// Public shape of a task for HTTP responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskData {
    pub id: Uuid,
    pub project_id: Uuid,
    pub code: String,
    pub title: String,
    pub status: String,
    pub assignee_id: Option<String>,
    pub requires_approval: bool,
    pub phase: String,
    pub sequence: i32,
    pub progress: i32,
    pub due_date: Option<DateTime<Utc>>,
    pub external_task_id: Option<String>,
    pub actual_start: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskData {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            project_id: task.project_id,
            code: task.code,
            title: task.title,
            status: task.status,
            assignee_id: task.assignee_id,
            requires_approval: task.requires_approval,
            phase: task.phase,
            sequence: task.sequence,
            progress: task.progress,
            due_date: task.due_date,
            external_task_id: task.external_task_id,
            actual_start: task.actual_start,
            completed_at: task.completed_at,
            updated_at: task.updated_at,
        }
    }
}
