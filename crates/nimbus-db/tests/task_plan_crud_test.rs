//! Integration tests for task, plan, checkpoint, and event persistence.
//!
//! Each test gets its own temporary database via `nimbus_test_utils`,
//! spun up in a shared PostgreSQL testcontainer (or `NIMBUS_TEST_PG_URL`
//! when set by a nextest setup script) and dropped on completion.

use nimbus_db::models::{EventKind, FailurePolicy, Priority, StepState, TaskStatus, TaskType};
use nimbus_db::queries::plans::NewStep;
use nimbus_db::queries::{checkpoints, events, plans, tasks};
use nimbus_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

fn sample_step(id: Uuid, kind: &str, position: i32, depends_on_positions: Vec<i32>) -> NewStep {
    NewStep {
        id,
        kind: kind.to_string(),
        inputs: serde_json::json!({}),
        expected_effects: serde_json::Value::Null,
        max_retries: 2,
        timeout_ms: 30_000,
        idempotency_key: format!("k-{position}"),
        failure_policy: FailurePolicy::Abort,
        position,
        depends_on_positions,
    }
}

#[tokio::test]
async fn insert_and_get_task_round_trips() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "user-1",
        Some("team-1"),
        Priority::High,
        serde_json::json!({"provider": "aws", "environment": "dev"}),
        serde_json::json!({}),
    )
    .await
    .expect("insert_task should succeed");

    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.plan_id.is_none());
    assert!(task.started_at.is_none());

    let fetched = tasks::get_task(&pool, task.id)
        .await
        .expect("get_task should succeed")
        .expect("task should exist");
    assert_eq!(fetched.id, task.id);
    assert_eq!(fetched.user_id, "user-1");
    assert_eq!(fetched.team_id.as_deref(), Some("team-1"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_task_returns_none_for_missing_id() {
    let (pool, db_name) = create_test_db().await;

    let result = tasks::get_task(&pool, Uuid::new_v4()).await.unwrap();
    assert!(result.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_tasks_filters_by_status_and_team() {
    let (pool, db_name) = create_test_db().await;

    let a = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "u1",
        Some("team-a"),
        Priority::Low,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();
    tasks::insert_task(
        &pool,
        TaskType::Verify,
        "u2",
        Some("team-b"),
        Priority::Low,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();

    tasks::transition_task_status(&pool, a.id, TaskStatus::Pending, TaskStatus::Planning, None, None)
        .await
        .unwrap();

    let team_a = tasks::list_tasks(
        &pool,
        &tasks::TaskFilters { team_id: Some("team-a".to_string()), ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(team_a.len(), 1);
    assert_eq!(team_a[0].id, a.id);

    let planning = tasks::list_tasks(
        &pool,
        &tasks::TaskFilters { status: Some(TaskStatus::Planning), ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(planning.len(), 1);
    assert_eq!(planning[0].id, a.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn transition_task_status_uses_optimistic_lock() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "u",
        None,
        Priority::Medium,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();

    // Wrong "from" status: no rows affected, task unchanged.
    let rows = tasks::transition_task_status(&pool, task.id, TaskStatus::Running, TaskStatus::Succeeded, None, None)
        .await
        .unwrap();
    assert_eq!(rows, 0);
    let unchanged = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, TaskStatus::Pending);

    // Correct "from" status: row updates.
    let rows = tasks::transition_task_status(&pool, task.id, TaskStatus::Pending, TaskStatus::Planning, None, None)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    let updated = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Planning);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn insert_plan_with_steps_persists_dag_and_attaches_to_task() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "u",
        None,
        Priority::Medium,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();

    let step_a = Uuid::new_v4();
    let step_b = Uuid::new_v4();
    let steps = vec![
        sample_step(step_a, "terraform.plan", 0, vec![]),
        sample_step(step_b, "terraform.apply", 1, vec![0]),
    ];

    let (plan, inserted) = plans::insert_plan_with_steps(&pool, task.id, 150_000, 0.4, &steps)
        .await
        .expect("insert_plan_with_steps should succeed");

    assert_eq!(inserted.len(), 2);
    assert_eq!(plan.risk_score, 0.4);

    let fetched_steps = plans::get_steps_for_plan(&pool, plan.id).await.unwrap();
    assert_eq!(fetched_steps.len(), 2);
    assert_eq!(fetched_steps[0].id, step_a);
    assert_eq!(fetched_steps[1].id, step_b);
    assert_eq!(fetched_steps[0].state, StepState::Pending);

    let edges = plans::get_edges_for_plan(&pool, plan.id).await.unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].from_step_id, step_a);
    assert_eq!(edges[0].to_step_id, step_b);

    let task_after = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(task_after.plan_id, Some(plan.id));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_ready_steps_excludes_steps_blocked_on_predecessors() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "u",
        None,
        Priority::Medium,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();

    let root = Uuid::new_v4();
    let dependent = Uuid::new_v4();
    let steps = vec![
        sample_step(root, "terraform.plan", 0, vec![]),
        sample_step(dependent, "terraform.apply", 1, vec![0]),
    ];
    let (plan, _) = plans::insert_plan_with_steps(&pool, task.id, 1000, 0.1, &steps).await.unwrap();

    let ready = plans::get_ready_steps(&pool, plan.id).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, root);

    plans::transition_step_state(&pool, root, StepState::Pending, StepState::Succeeded)
        .await
        .unwrap();

    let ready = plans::get_ready_steps(&pool, plan.id).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, dependent);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn checkpoint_save_rejects_non_increasing_step() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "u",
        None,
        Priority::Medium,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();

    checkpoints::save(&pool, task.id, 1, serde_json::json!({"cursor": 1})).await.unwrap();
    let second = checkpoints::save(&pool, task.id, 2, serde_json::json!({"cursor": 2})).await.unwrap();

    let rejected = checkpoints::save(&pool, task.id, 2, serde_json::json!({"cursor": 2})).await;
    assert!(rejected.is_err(), "equal step should be rejected");
    let rejected = checkpoints::save(&pool, task.id, 1, serde_json::json!({"cursor": 1})).await;
    assert!(rejected.is_err(), "lower step should be rejected");

    let latest = checkpoints::get_latest(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);
    assert_eq!(latest.step, 2);

    let all = checkpoints::list(&pool, task.id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].step < all[1].step);

    let deleted = checkpoints::delete_all(&pool, task.id).await.unwrap();
    assert_eq!(deleted, 2);
    assert!(checkpoints::get_latest(&pool, task.id).await.unwrap().is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn events_are_appended_in_sequence_order() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(
        &pool,
        TaskType::Deploy,
        "u",
        None,
        Priority::Medium,
        serde_json::json!({}),
        serde_json::json!({}),
    )
    .await
    .unwrap();

    events::insert_event(&pool, Some(task.id), None, EventKind::TaskCreated, serde_json::Value::Null)
        .await
        .unwrap();
    events::insert_event(&pool, Some(task.id), None, EventKind::PlanGenerated, serde_json::Value::Null)
        .await
        .unwrap();
    events::insert_event(&pool, Some(task.id), None, EventKind::StepStarted, serde_json::Value::Null)
        .await
        .unwrap();

    let all = events::list_events_for_task(&pool, task.id, None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(all[0].kind, EventKind::TaskCreated);
    assert_eq!(all[2].kind, EventKind::StepStarted);

    let limited = events::list_events_for_task(&pool, task.id, Some(2)).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].kind, EventKind::PlanGenerated);
    assert_eq!(limited[1].kind, EventKind::StepStarted);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn statistics_aggregate_across_statuses() {
    let (pool, db_name) = create_test_db().await;

    let a = tasks::insert_task(&pool, TaskType::Deploy, "u", None, Priority::Low, serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();
    tasks::insert_task(&pool, TaskType::Verify, "u", None, Priority::Low, serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();

    tasks::transition_task_status(&pool, a.id, TaskStatus::Pending, TaskStatus::Running, None, None)
        .await
        .unwrap();

    let stats = tasks::get_statistics(&pool).await.unwrap();
    assert_eq!(stats.total, 2);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.running, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}
