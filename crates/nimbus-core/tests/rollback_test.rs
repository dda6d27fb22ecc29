//! Rollback Manager integration tests (spec §8 scenario 6: a step with no
//! registered inverse).

mod support;

use std::sync::Arc;

use nimbus_db::models::{FailurePolicy, Priority, StepState, TaskType};
use nimbus_db::queries::plans::{self, NewStep};
use nimbus_db::queries::tasks;
use nimbus_test_utils::{create_test_db, drop_test_db};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_core::executor::{ExecutorConfig, ExecutorOutcome};
use nimbus_core::rollback::{self, RollbackAction, RollbackOptions, RollbackResult};
use nimbus_core::safety::SafetyRegistry;

fn fast_config() -> ExecutorConfig {
    ExecutorConfig { max_fanout: 4, base_backoff: std::time::Duration::from_millis(1), max_backoff: std::time::Duration::from_millis(10), ..ExecutorConfig::default() }
}

/// Plan with two succeeded steps: `terraform.apply` (has an inverse) and
/// `git.push` (no registered inverse).
async fn task_with_unrollbackable_step(pool: &sqlx::PgPool) -> (nimbus_db::models::Task, nimbus_db::models::Plan) {
    let task = tasks::insert_task(pool, TaskType::Deploy, "u", None, Priority::Medium, serde_json::json!({}), serde_json::json!({}))
        .await
        .unwrap();

    let apply_id = Uuid::new_v4();
    let push_id = Uuid::new_v4();
    let steps = vec![
        NewStep {
            id: apply_id,
            kind: "terraform.apply".to_string(),
            inputs: serde_json::json!({}),
            expected_effects: serde_json::Value::Null,
            max_retries: 1,
            timeout_ms: 5_000,
            idempotency_key: "apply".to_string(),
            failure_policy: FailurePolicy::FailTask,
            position: 0,
            depends_on_positions: vec![],
        },
        NewStep {
            id: push_id,
            kind: "git.push".to_string(),
            inputs: serde_json::json!({}),
            expected_effects: serde_json::Value::Null,
            max_retries: 1,
            timeout_ms: 5_000,
            idempotency_key: "push".to_string(),
            failure_policy: FailurePolicy::FailTask,
            position: 1,
            depends_on_positions: vec![0],
        },
    ];
    let (plan, steps) = plans::insert_plan_with_steps(pool, task.id, 10_000, 0.5, &steps).await.unwrap();
    for step in &steps {
        plans::set_step_outputs(pool, step.id, serde_json::json!({"ok": true})).await.unwrap();
    }
    (task, plan)
}

#[tokio::test]
async fn can_rollback_reports_succeeded_step_count() {
    let (pool, db_name) = create_test_db().await;
    let (_task, plan) = task_with_unrollbackable_step(&pool).await;

    let availability = rollback::can_rollback(&pool, plan.id).await.unwrap();
    assert!(availability.available);
    assert_eq!(availability.succeeded_step_count, 2);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn plan_rollback_without_force_refuses_when_a_step_has_no_inverse() {
    let (pool, db_name) = create_test_db().await;
    let (task, plan) = task_with_unrollbackable_step(&pool).await;

    let err = rollback::plan_rollback(&pool, task.id, plan.id, &RollbackOptions::default())
        .await
        .expect_err("a step with no registered inverse should refuse the whole rollback without force");

    assert!(
        err.downcast_ref::<rollback::NoInverseError>().is_some(),
        "error should be a NoInverseError, got: {err:?}"
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn force_rollback_skips_the_unsafe_step_and_runs_the_rest() {
    let (pool, db_name) = create_test_db().await;
    let (task, plan) = task_with_unrollbackable_step(&pool).await;

    let options = RollbackOptions { force: true, dry_run: false, targets: vec![] };
    let registry = Arc::new(support::full_registry());
    let safety = Arc::new(SafetyRegistry::empty());

    let result = rollback::run_rollback(&pool, &registry, &safety, &task, plan.id, &options, CancellationToken::new(), &fast_config())
        .await
        .expect("forced rollback should succeed");

    match result {
        RollbackResult::Executed { plan: rollback_plan, outcome } => {
            let skipped: Vec<_> = rollback_plan
                .actions
                .iter()
                .filter_map(|a| match a {
                    RollbackAction::SkippedUnsafe { original_kind, .. } => Some(original_kind.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(skipped, vec!["git.push"], "git.push has no registered inverse and should be reported as skipped");

            let inverses: Vec<_> = rollback_plan
                .actions
                .iter()
                .filter_map(|a| match a {
                    RollbackAction::Inverse(step) => Some(step.kind.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(inverses, vec!["terraform.destroy"], "terraform.apply's inverse should be the only one actually run");

            assert_eq!(outcome, ExecutorOutcome::Completed);
        }
        RollbackResult::Planned(_) => panic!("a forced rollback with a runnable inverse should execute, not just plan"),
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn dry_run_rollback_never_touches_step_state() {
    let (pool, db_name) = create_test_db().await;
    let (task, plan) = task_with_unrollbackable_step(&pool).await;

    let options = RollbackOptions { force: true, dry_run: true, targets: vec![] };
    let registry = Arc::new(support::full_registry());
    let safety = Arc::new(SafetyRegistry::empty());

    let result = rollback::run_rollback(&pool, &registry, &safety, &task, plan.id, &options, CancellationToken::new(), &fast_config())
        .await
        .unwrap();

    assert!(matches!(result, RollbackResult::Planned(_)));

    let original_steps = plans::get_steps_for_plan(&pool, plan.id).await.unwrap();
    assert!(original_steps.iter().all(|s| s.state == StepState::Succeeded), "dry run must not mutate the original plan's steps");

    pool.close().await;
    drop_test_db(&db_name).await;
}
