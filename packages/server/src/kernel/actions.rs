//! Action handlers bridging transitions to the outbound ports.
//!
//! Registered on the engine's dispatcher at boot; they run post-commit and
//! their failures land in the transition log, never in the caller's result.
//! Every handler keys its destination write on `entity_kind:entity_id`.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ratchet::{ActionContext, ActionHandler, ActionSpec};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::traits::{ExternalApprovalRequest, ExternalTaskRequest, ExternalTasks, Notifier};
use crate::domains::tasks::models::Task;

pub const ACTION_CREATE_EXTERNAL_TASK: &str = "create_external_task";
pub const ACTION_COMPLETE_EXTERNAL_TASK: &str = "complete_external_task";
pub const ACTION_CREATE_EXTERNAL_APPROVAL: &str = "create_external_approval";
pub const ACTION_NOTIFY_ASSIGNEE: &str = "notify_assignee";

fn dedupe_key(ctx: &ActionContext) -> String {
    format!("{}:{}", ctx.entity_kind, ctx.entity_id)
}

fn task_id(ctx: &ActionContext) -> anyhow::Result<Uuid> {
    Uuid::parse_str(&ctx.entity_id).context("entity id is not a task uuid")
}

/// Creates the external task record on assignment.
///
/// The stored `external_task_id` is the dedupe record: a second run (retry
/// or re-assignment) that finds it set does nothing.
pub struct CreateExternalTaskHandler {
    pool: PgPool,
    external: Arc<dyn ExternalTasks>,
}

impl CreateExternalTaskHandler {
    pub fn new(pool: PgPool, external: Arc<dyn ExternalTasks>) -> Self {
        Self { pool, external }
    }
}

#[async_trait]
impl ActionHandler for CreateExternalTaskHandler {
    async fn execute(&self, _action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()> {
        let id = task_id(ctx)?;
        let task = Task::find_by_id(id, &self.pool)
            .await?
            .ok_or_else(|| anyhow!("task {id} not found"))?;

        if task.external_task_id.is_some() {
            return Ok(());
        }

        let assignee = ctx.event_data["assignee_id"]
            .as_str()
            .map(str::to_string)
            .or(task.assignee_id)
            .unwrap_or_default();

        let external_id = self
            .external
            .create_task(ExternalTaskRequest {
                summary: &task.title,
                assignee: &assignee,
                due: task.due_date,
                dedupe_key: &dedupe_key(ctx),
            })
            .await?;
        Task::set_external_task_id(id, &external_id, &self.pool).await?;
        Ok(())
    }
}

/// Completes the external task record when the task reaches `completed`.
pub struct CompleteExternalTaskHandler {
    pool: PgPool,
    external: Arc<dyn ExternalTasks>,
}

impl CompleteExternalTaskHandler {
    pub fn new(pool: PgPool, external: Arc<dyn ExternalTasks>) -> Self {
        Self { pool, external }
    }
}

#[async_trait]
impl ActionHandler for CompleteExternalTaskHandler {
    async fn execute(&self, _action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()> {
        let id = task_id(ctx)?;
        let task = Task::find_by_id(id, &self.pool)
            .await?
            .ok_or_else(|| anyhow!("task {id} not found"))?;

        // Nothing to complete when no external record was ever created.
        if let Some(external_id) = task.external_task_id.as_deref() {
            self.external.complete_task(external_id).await?;
        }
        Ok(())
    }
}

/// Opens the external approval flow when a task enters review.
pub struct CreateExternalApprovalHandler {
    external: Arc<dyn ExternalTasks>,
}

impl CreateExternalApprovalHandler {
    pub fn new(external: Arc<dyn ExternalTasks>) -> Self {
        Self { external }
    }
}

#[async_trait]
impl ActionHandler for CreateExternalApprovalHandler {
    async fn execute(&self, _action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()> {
        let title = ctx.event_data["title"].as_str().unwrap_or(&ctx.entity_id);
        self.external
            .create_approval(ExternalApprovalRequest {
                summary: title,
                dedupe_key: &dedupe_key(ctx),
            })
            .await?;
        Ok(())
    }
}

/// Sends the assignee a card about what just happened to their task.
pub struct NotifyAssigneeHandler {
    notifier: Arc<dyn Notifier>,
}

impl NotifyAssigneeHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl ActionHandler for NotifyAssigneeHandler {
    async fn execute(&self, _action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()> {
        let assignee = match ctx.event_data["assignee_id"].as_str() {
            Some(assignee) if !assignee.is_empty() => assignee,
            // No assignee, nobody to tell.
            _ => return Ok(()),
        };

        let card = json!({
            "title": ctx.event_data["title"],
            "event": ctx.event,
            "from_state": ctx.from_state,
            "to_state": ctx.to_state,
            "entity_id": ctx.entity_id,
        });
        self.notifier.notify_user(assignee, &card).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::traits::test_support::RecordingNotifier;
    use serde_json::json;

    fn ctx(event_data: serde_json::Value) -> ActionContext {
        ActionContext {
            entity_kind: "task".into(),
            entity_id: Uuid::new_v4().to_string(),
            from_state: "unassigned".into(),
            to_state: "pending".into(),
            event: "assign".into(),
            event_data,
        }
    }

    #[tokio::test]
    async fn test_notify_skips_without_assignee() {
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = NotifyAssigneeHandler::new(notifier.clone());

        handler
            .execute(&ActionSpec::new(ACTION_NOTIFY_ASSIGNEE), &ctx(json!({})))
            .await
            .unwrap();
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_sends_card_to_assignee() {
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = NotifyAssigneeHandler::new(notifier.clone());

        handler
            .execute(
                &ActionSpec::new(ACTION_NOTIFY_ASSIGNEE),
                &ctx(json!({"assignee_id": "u-7", "title": "review drawings"})),
            )
            .await
            .unwrap();

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "u-7");
        assert_eq!(sent[0].1["title"], "review drawings");
        assert_eq!(sent[0].1["to_state"], "pending");
    }

    #[test]
    fn test_dedupe_key_shape() {
        let ctx = ctx(json!({}));
        let key = dedupe_key(&ctx);
        assert!(key.starts_with("task:"));
        assert!(key.len() > "task:".len());
    }
}
