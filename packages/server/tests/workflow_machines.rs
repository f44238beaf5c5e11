//! End-to-end runs of the registered machine fixtures through the engine,
//! backed by the in-memory store. These cover the lifecycle semantics that
//! do not depend on Postgres: guard forks, review outcomes, the frozen BOM
//! path, action fan-out, and routing precedence.

use std::sync::{Arc, Mutex};

use plm_core::domains::machines::{bom_machine, task_machine};
use ratchet::{
    async_trait, ActionContext, ActionHandler, ActionSpec, ActorKind, CancellationToken, Channel,
    Engine, FireRequest, InMemoryStore, Router, RoutingRule,
};
use serde_json::{json, Value};
use uuid::Uuid;

struct Recording {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl ActionHandler for Recording {
    async fn execute(&self, action: &ActionSpec, ctx: &ActionContext) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((action.action_type.clone(), ctx.event.clone()));
        Ok(())
    }
}

async fn engine_with_recorder() -> (Engine, Arc<Mutex<Vec<(String, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::builder(store)
        .with_fallback(Arc::new(Recording { seen: Arc::clone(&seen) }))
        .build();
    engine.register_machine(task_machine()).await.unwrap();
    engine.register_machine(bom_machine()).await.unwrap();
    (engine, seen)
}

async fn fire(engine: &Engine, kind: &str, id: &str, event: &str, ctx: Value) -> String {
    engine
        .fire(
            FireRequest {
                entity_kind: kind,
                entity_id: id,
                event,
                ctx,
                actor_id: "u-1",
                actor_kind: ActorKind::User,
                fallback_state: None,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .to_state
}

#[tokio::test]
async fn task_without_approval_completes_directly() {
    let (engine, seen) = engine_with_recorder().await;

    assert_eq!(fire(&engine, "task", "t-1", "assign", json!({"assignee_id": "u-9"})).await, "pending");
    assert_eq!(fire(&engine, "task", "t-1", "start", json!({})).await, "in_progress");
    assert_eq!(
        fire(&engine, "task", "t-1", "complete", json!({"requires_approval": false})).await,
        "completed"
    );

    // Assign fans out task creation + notification, completion closes the
    // external record.
    let seen = seen.lock().unwrap();
    let types: Vec<&str> = seen.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(
        types,
        vec!["create_external_task", "notify_assignee", "complete_external_task"]
    );
}

#[tokio::test]
async fn task_with_approval_detours_through_review() {
    let (engine, _) = engine_with_recorder().await;

    fire(&engine, "task", "t-2", "assign", json!({})).await;
    fire(&engine, "task", "t-2", "start", json!({})).await;
    assert_eq!(
        fire(&engine, "task", "t-2", "complete", json!({"requires_approval": true})).await,
        "reviewing"
    );
    assert_eq!(fire(&engine, "task", "t-2", "approve", json!({})).await, "completed");
}

#[tokio::test]
async fn rejected_review_returns_to_work_then_fail_ends_rejected() {
    let (engine, _) = engine_with_recorder().await;

    fire(&engine, "task", "t-3", "assign", json!({})).await;
    fire(&engine, "task", "t-3", "start", json!({})).await;
    fire(&engine, "task", "t-3", "complete", json!({"requires_approval": true})).await;
    assert_eq!(fire(&engine, "task", "t-3", "reject", json!({})).await, "in_progress");

    fire(&engine, "task", "t-3", "complete", json!({"requires_approval": true})).await;
    assert_eq!(fire(&engine, "task", "t-3", "fail", json!({})).await, "rejected");

    // History replays to the current state with a gapless chain.
    let mut history = engine.history("task", "t-3").await.unwrap();
    assert_eq!(history.first().unwrap().to_state, "rejected");
    history.reverse();
    for pair in history.windows(2) {
        assert_eq!(pair[0].to_state, pair[1].from_state);
    }
}

#[tokio::test]
async fn released_bom_edit_cycle_returns_to_released() {
    let (engine, _) = engine_with_recorder().await;
    let id = Uuid::new_v4().to_string();
    let released = json!({"was_frozen": false});

    // The BOM was released by the catalog surface; it joins the machine
    // mid-life via the fallback state.
    let to = engine
        .fire(
            FireRequest {
                entity_kind: "bom",
                entity_id: &id,
                event: "start_edit",
                ctx: released.clone(),
                actor_id: "u-1",
                actor_kind: ActorKind::User,
                fallback_state: Some("released"),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .to_state;
    assert_eq!(to, "editing");

    assert_eq!(fire(&engine, "bom", &id, "save_draft", released.clone()).await, "editing");
    assert_eq!(
        fire(&engine, "bom", &id, "submit_ecn", json!({"was_frozen": false, "draft_exists": true})).await,
        "ecn_pending"
    );
    assert_eq!(fire(&engine, "bom", &id, "approve_ecn", released).await, "released");
}

#[tokio::test]
async fn frozen_bom_round_trips_back_to_frozen() {
    let (engine, _) = engine_with_recorder().await;
    let id = Uuid::new_v4().to_string();
    let frozen = json!({"was_frozen": true});

    let to = engine
        .fire(
            FireRequest {
                entity_kind: "bom",
                entity_id: &id,
                event: "start_edit",
                ctx: frozen.clone(),
                actor_id: "u-1",
                actor_kind: ActorKind::User,
                fallback_state: Some("frozen"),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap()
        .to_state;
    assert_eq!(to, "editing");
    assert_eq!(fire(&engine, "bom", &id, "discard_draft", frozen).await, "frozen");
}

#[tokio::test]
async fn routing_precedence_matches_amount_thresholds() {
    let store = Arc::new(InMemoryStore::new());
    let mk_rule = |name: &str, priority: i32, conditions: Value, channel: Channel| RoutingRule {
        id: Uuid::new_v4(),
        name: name.to_string(),
        entity_kind: "po".to_string(),
        event: "approval_needed".to_string(),
        conditions,
        channel,
        priority,
        action_config: Value::Null,
        enabled: true,
        created_at: chrono::Utc::now(),
    };
    store.push_rule(mk_rule(
        "large-to-human",
        10,
        json!({"field": "amount", "op": "gt", "value": 1000}),
        Channel::Human,
    ));
    store.push_rule(mk_rule("rest-to-agent", 5, json!({}), Channel::Agent));

    let router = Router::new(store.clone());

    let low = router
        .evaluate("po", "approval_needed", Some("po-1"), &json!({"amount": 500}))
        .await
        .unwrap();
    assert_eq!(low.channel, Channel::Agent);

    let high = router
        .evaluate("po", "approval_needed", Some("po-2"), &json!({"amount": 5000}))
        .await
        .unwrap();
    assert_eq!(high.channel, Channel::Human);

    assert_eq!(store.routing_logs().len(), 2);
}
