//! Outbound ports.
//!
//! The chat platform and the external task tracker are collaborators this
//! crate only knows by contract. Handlers talk to these traits; wiring
//! decides whether a real adapter or the log-backed default sits behind
//! them.
//!
//! Idempotency contract: `create_task` and `create_approval` must be
//! idempotent on their `dedupe_key` (the caller passes
//! `entity_kind:entity_id`), and `complete_task` must tolerate completing
//! an already-completed task.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

/// Best-effort user notification (card message).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_user(&self, user_id: &str, card: &Value) -> anyhow::Result<()>;
}

pub struct ExternalTaskRequest<'a> {
    pub summary: &'a str,
    pub assignee: &'a str,
    pub due: Option<DateTime<Utc>>,
    /// `entity_kind:entity_id` — the destination-side deduplication key.
    pub dedupe_key: &'a str,
}

pub struct ExternalApprovalRequest<'a> {
    pub summary: &'a str,
    pub dedupe_key: &'a str,
}

/// External task tracker.
#[async_trait]
pub trait ExternalTasks: Send + Sync {
    /// Create a task record; returns the external id. Idempotent on
    /// `dedupe_key`.
    async fn create_task(&self, req: ExternalTaskRequest<'_>) -> anyhow::Result<String>;

    /// Complete a task; OK if it is already completed.
    async fn complete_task(&self, external_id: &str) -> anyhow::Result<()>;

    /// Create an approval flow; returns the external id. Idempotent on
    /// `dedupe_key`.
    async fn create_approval(&self, req: ExternalApprovalRequest<'_>) -> anyhow::Result<String>;
}

/// Default notifier: structured log only.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_user(&self, user_id: &str, card: &Value) -> anyhow::Result<()> {
        info!(user_id, card = %card, "notification (log channel)");
        Ok(())
    }
}

/// Default tracker: ids derived from the dedupe key, so repeated creates
/// return the same id without remembering anything.
#[derive(Default)]
pub struct LogExternalTasks;

#[async_trait]
impl ExternalTasks for LogExternalTasks {
    async fn create_task(&self, req: ExternalTaskRequest<'_>) -> anyhow::Result<String> {
        let external_id = format!("ext-task-{}", req.dedupe_key);
        info!(summary = req.summary, assignee = req.assignee, external_id, "external task (log channel)");
        Ok(external_id)
    }

    async fn complete_task(&self, external_id: &str) -> anyhow::Result<()> {
        info!(external_id, "external task completed (log channel)");
        Ok(())
    }

    async fn create_approval(&self, req: ExternalApprovalRequest<'_>) -> anyhow::Result<String> {
        let external_id = format!("ext-approval-{}", req.dedupe_key);
        info!(summary = req.summary, external_id, "external approval (log channel)");
        Ok(external_id)
    }
}

/// Recording doubles for tests: dedupe like a well-behaved destination and
/// remember every call.
#[cfg(test)]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_user(&self, user_id: &str, card: &Value) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((user_id.to_string(), card.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct RecordingExternalTasks {
        pub created: Mutex<HashMap<String, String>>,
        pub completed: Mutex<Vec<String>>,
        pub create_calls: Mutex<u32>,
    }

    #[async_trait]
    impl ExternalTasks for RecordingExternalTasks {
        async fn create_task(&self, req: ExternalTaskRequest<'_>) -> anyhow::Result<String> {
            *self.create_calls.lock().unwrap() += 1;
            let mut created = self.created.lock().unwrap();
            // Destination-side dedupe: the second create with the same key
            // returns the first id.
            let next_id = format!("ext-{}", created.len() + 1);
            let id = created
                .entry(req.dedupe_key.to_string())
                .or_insert(next_id);
            Ok(id.clone())
        }

        async fn complete_task(&self, external_id: &str) -> anyhow::Result<()> {
            self.completed.lock().unwrap().push(external_id.to_string());
            Ok(())
        }

        async fn create_approval(&self, req: ExternalApprovalRequest<'_>) -> anyhow::Result<String> {
            let mut created = self.created.lock().unwrap();
            let next_id = format!("ext-approval-{}", created.len() + 1);
            let id = created
                .entry(req.dedupe_key.to_string())
                .or_insert(next_id);
            Ok(id.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingExternalTasks;
    use super::*;

    #[tokio::test]
    async fn test_log_tracker_is_deterministic_on_dedupe_key() {
        let tracker = LogExternalTasks;
        let req = || ExternalTaskRequest {
            summary: "review drawings",
            assignee: "u-1",
            due: None,
            dedupe_key: "task:t-1",
        };
        let first = tracker.create_task(req()).await.unwrap();
        let second = tracker.create_task(req()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_recording_tracker_dedupes_at_destination() {
        let tracker = RecordingExternalTasks::default();
        let req = || ExternalTaskRequest {
            summary: "review drawings",
            assignee: "u-1",
            due: None,
            dedupe_key: "task:t-1",
        };
        let first = tracker.create_task(req()).await.unwrap();
        let second = tracker.create_task(req()).await.unwrap();

        // Two calls arrived, one task exists.
        assert_eq!(first, second);
        assert_eq!(*tracker.create_calls.lock().unwrap(), 2);
        assert_eq!(tracker.created.lock().unwrap().len(), 1);
    }
}
