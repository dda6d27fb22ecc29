//! Executor retry/backoff and fan-out tests (spec §8 scenario 3, §5 fan-out).

mod support;

use std::sync::Arc;
use std::time::Duration;

use nimbus_db::models::{FailurePolicy, Priority, StepState, TaskType};
use nimbus_db::queries::plans::{self, NewStep};
use nimbus_db::queries::tasks;
use nimbus_test_utils::{create_test_db, drop_test_db};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_core::executor::{self, ExecutorConfig, ExecutorOutcome};
use nimbus_core::safety::SafetyRegistry;
use support::{full_registry_with_scripted, Scripted};

fn fast_config() -> ExecutorConfig {
    ExecutorConfig { max_fanout: 4, base_backoff: Duration::from_millis(20), max_backoff: Duration::from_millis(200), ..ExecutorConfig::default() }
}

#[tokio::test]
async fn transient_failures_are_retried_until_max_attempts_then_succeed() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, TaskType::Deploy, "u", None, Priority::Medium, serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();

    let step_id = Uuid::new_v4();
    let steps = vec![NewStep {
        id: step_id,
        kind: "terraform.apply".to_string(),
        inputs: serde_json::json!({}),
        expected_effects: serde_json::Value::Null,
        max_retries: 2,
        timeout_ms: 5_000,
        idempotency_key: "k".to_string(),
        failure_policy: FailurePolicy::FailTask,
        position: 0,
        depends_on_positions: vec![],
    }];
    let (plan, _) = plans::insert_plan_with_steps(&pool, task.id, 5_000, 0.8, &steps).await.unwrap();

    let (registry, terraform) = full_registry_with_scripted("terraform");
    terraform.script(
        "terraform.apply",
        vec![
            Scripted::Err(nimbus_core::capability::CapabilityErrorKind::Transient),
            Scripted::Err(nimbus_core::capability::CapabilityErrorKind::Transient),
            Scripted::Ok(serde_json::json!({"applied": true})),
        ],
    );
    let registry = Arc::new(registry);
    let safety = Arc::new(SafetyRegistry::empty());

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    let outcome = executor::run(&pool, &registry, &safety, &task, &plan, CancellationToken::new(), &fast_config())
        .await
        .expect("run should succeed");

    assert_eq!(outcome, ExecutorOutcome::Completed);
    assert_eq!(terraform.call_count("terraform.apply"), 3, "two transient failures plus the succeeding third attempt");

    let updated_step = plans::get_steps_for_plan(&pool, plan.id).await.unwrap().into_iter().next().unwrap();
    assert_eq!(updated_step.state, StepState::Succeeded);
    assert_eq!(updated_step.attempts, 3);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, TaskType::Deploy, "u", None, Priority::Medium, serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();

    let step_id = Uuid::new_v4();
    let steps = vec![NewStep {
        id: step_id,
        kind: "terraform.apply".to_string(),
        inputs: serde_json::json!({}),
        expected_effects: serde_json::Value::Null,
        max_retries: 3,
        timeout_ms: 5_000,
        idempotency_key: "k".to_string(),
        failure_policy: FailurePolicy::FailTask,
        position: 0,
        depends_on_positions: vec![],
    }];
    let (plan, _) = plans::insert_plan_with_steps(&pool, task.id, 5_000, 0.8, &steps).await.unwrap();

    let (registry, terraform) = full_registry_with_scripted("terraform");
    terraform.script("terraform.apply", vec![Scripted::Err(nimbus_core::capability::CapabilityErrorKind::Permanent)]);
    let registry = Arc::new(registry);
    let safety = Arc::new(SafetyRegistry::empty());

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    let outcome = executor::run(&pool, &registry, &safety, &task, &plan, CancellationToken::new(), &fast_config())
        .await
        .expect("run should not error even though the step failed");

    assert_eq!(outcome, ExecutorOutcome::Failed { failed_step_ids: vec![step_id] });
    assert_eq!(terraform.call_count("terraform.apply"), 1, "a permanent failure should not be retried");

    let updated_step = plans::get_steps_for_plan(&pool, plan.id).await.unwrap().into_iter().next().unwrap();
    assert_eq!(updated_step.state, StepState::Failed);
    assert_eq!(updated_step.attempts, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn continue_policy_skips_only_descendants_of_the_failed_step() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks::insert_task(&pool, TaskType::Generate, "u", None, Priority::Medium, serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();

    // a (succeeds) -> b (fails, continue) -> c (descendant, should be
    // skipped); d is independent and should still succeed.
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let c = Uuid::new_v4();
    let d = Uuid::new_v4();
    let steps = vec![
        NewStep {
            id: a,
            kind: "fs.write_files".to_string(),
            inputs: serde_json::json!({}),
            expected_effects: serde_json::Value::Null,
            max_retries: 0,
            timeout_ms: 5_000,
            idempotency_key: "a".to_string(),
            failure_policy: FailurePolicy::Abort,
            position: 0,
            depends_on_positions: vec![],
        },
        NewStep {
            id: b,
            kind: "fs.format".to_string(),
            inputs: serde_json::json!({}),
            expected_effects: serde_json::Value::Null,
            max_retries: 0,
            timeout_ms: 5_000,
            idempotency_key: "b".to_string(),
            failure_policy: FailurePolicy::Continue,
            position: 1,
            depends_on_positions: vec![0],
        },
        NewStep {
            id: c,
            kind: "fs.validate".to_string(),
            inputs: serde_json::json!({}),
            expected_effects: serde_json::Value::Null,
            max_retries: 0,
            timeout_ms: 5_000,
            idempotency_key: "c".to_string(),
            failure_policy: FailurePolicy::Abort,
            position: 2,
            depends_on_positions: vec![1],
        },
        NewStep {
            id: d,
            kind: "llm.render_template".to_string(),
            inputs: serde_json::json!({}),
            expected_effects: serde_json::Value::Null,
            max_retries: 0,
            timeout_ms: 5_000,
            idempotency_key: "d".to_string(),
            failure_policy: FailurePolicy::Abort,
            position: 3,
            depends_on_positions: vec![],
        },
    ];
    let (plan, _) = plans::insert_plan_with_steps(&pool, task.id, 20_000, 0.1, &steps).await.unwrap();

    let (registry, fs) = full_registry_with_scripted("fs");
    fs.script("fs.format", vec![Scripted::Err(nimbus_core::capability::CapabilityErrorKind::Permanent)]);
    let registry = Arc::new(registry);
    let safety = Arc::new(SafetyRegistry::empty());

    let task = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    let outcome = executor::run(&pool, &registry, &safety, &task, &plan, CancellationToken::new(), &fast_config())
        .await
        .unwrap();

    assert_eq!(outcome, ExecutorOutcome::Failed { failed_step_ids: vec![b] });

    let final_steps = plans::get_steps_for_plan(&pool, plan.id).await.unwrap();
    let by_id: std::collections::HashMap<_, _> = final_steps.iter().map(|s| (s.id, s.state)).collect();
    assert_eq!(by_id[&a], StepState::Succeeded);
    assert_eq!(by_id[&b], StepState::Failed);
    assert_eq!(by_id[&c], StepState::Skipped);
    assert_eq!(by_id[&d], StepState::Succeeded, "an independent branch should still complete");

    pool.close().await;
    drop_test_db(&db_name).await;
}
