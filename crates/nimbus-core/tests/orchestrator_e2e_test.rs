//! End-to-end tests for the Orchestrator driving a task through planning,
//! safety evaluation, and execution against a scripted Capability Port
//! (spec §8 scenarios 1, 2, and 4).

mod support;

use std::sync::Arc;

use nimbus_db::models::{EventKind, Priority, TaskStatus, TaskType};
use nimbus_test_utils::{create_test_db, drop_test_db};

use nimbus_core::executor::ExecutorConfig;
use nimbus_core::orchestrator::{Orchestrator, OrchestratorConfig, TaskSpec};
use nimbus_core::safety::SafetyRegistry;

fn dev_deploy_spec() -> TaskSpec {
    TaskSpec {
        task_type: TaskType::Deploy,
        user_id: "user-1".to_string(),
        team_id: None,
        priority: Priority::Medium,
        context: serde_json::json!({"provider": "aws", "environment": "dev", "components": ["vpc"]}),
        metadata: serde_json::json!({}),
    }
}

fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig { max_fanout: 4, base_backoff: std::time::Duration::from_millis(1), max_backoff: std::time::Duration::from_millis(10), ..ExecutorConfig::default() }
}

#[tokio::test]
async fn happy_deploy_reaches_succeeded_with_one_checkpoint_per_step() {
    let (pool, db_name) = create_test_db().await;

    let registry = Arc::new(support::full_registry());
    let safety = Arc::new(SafetyRegistry::with_builtins());
    let orchestrator = Orchestrator::new(
        pool.clone(),
        registry,
        safety,
        OrchestratorConfig { executor: fast_executor_config(), ..OrchestratorConfig::default() },
    );

    let task = orchestrator.create_task(dev_deploy_spec()).await.expect("create_task should succeed");
    let finished = orchestrator.execute_task(task.id).await.expect("execute_task should succeed");

    assert_eq!(finished.status, TaskStatus::Succeeded);
    assert!(finished.plan_id.is_some());

    let plan_id = finished.plan_id.unwrap();
    let steps = nimbus_db::queries::plans::get_steps_for_plan(&pool, plan_id).await.unwrap();
    assert!(!steps.is_empty(), "deploy should decompose into at least one step");
    assert!(steps.iter().all(|s| s.state == nimbus_db::models::StepState::Succeeded));

    let checkpoints = nimbus_core::checkpoint::list(&pool, task.id).await.unwrap();
    assert_eq!(checkpoints.len(), steps.len(), "one checkpoint should be written per succeeded step");

    let events = orchestrator.get_task_events(task.id, None).await.unwrap();
    let step_succeeded_count = events.iter().filter(|e| e.kind == EventKind::StepSucceeded).count();
    assert_eq!(step_succeeded_count, steps.len(), "exactly one step_succeeded event per step");
    assert!(events.iter().any(|e| e.kind == EventKind::TaskCreated));
    assert!(events.iter().any(|e| e.kind == EventKind::PlanGenerated));
    assert!(events.iter().any(|e| e.kind == EventKind::TaskFinished));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn prod_deploy_suspends_for_approval_and_cancel_stops_it_cleanly() {
    let (pool, db_name) = create_test_db().await;

    let registry = Arc::new(support::full_registry());
    let safety = Arc::new(SafetyRegistry::with_builtins());
    // Long approval timeout: the test drives cancellation itself rather
    // than waiting out the timeout.
    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        registry,
        safety,
        OrchestratorConfig { executor: fast_executor_config(), ..OrchestratorConfig::default() },
    ));

    let mut prod_spec = dev_deploy_spec();
    prod_spec.context = serde_json::json!({"provider": "aws", "environment": "prod", "components": ["vpc"]});
    let task = orchestrator.create_task(prod_spec).await.unwrap();

    let orchestrator_for_execute = orchestrator.clone();
    let task_id = task.id;
    let execute_handle = tokio::spawn(async move { orchestrator_for_execute.execute_task(task_id).await });

    // Poll until the task is suspended awaiting approval, then cancel it.
    let mut observed_awaiting = false;
    for _ in 0..200 {
        let current = orchestrator.get_task(task_id).await.unwrap();
        if current.status == TaskStatus::AwaitingApproval {
            observed_awaiting = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(observed_awaiting, "task should reach awaiting_approval before any step executes");

    let cancelled = orchestrator.cancel_task(task_id).await.unwrap();
    assert!(cancelled);

    let result = execute_handle.await.unwrap();
    assert!(result.is_err());

    let final_task = orchestrator.get_task(task_id).await.unwrap();
    assert_eq!(final_task.status, TaskStatus::Cancelled);

    let plan_id = final_task.plan_id.expect("plan is generated before pre-safety suspends the task");
    let steps = nimbus_db::queries::plans::get_steps_for_plan(&pool, plan_id).await.unwrap();
    assert!(
        steps.iter().all(|s| s.state == nimbus_db::models::StepState::Pending),
        "no step should have executed while the task was suspended for approval"
    );

    let checkpoints = nimbus_core::checkpoint::list(&pool, task_id).await.unwrap();
    assert!(checkpoints.is_empty(), "no checkpoints should be written before any step runs");

    let events = orchestrator.get_task_events(task_id, None).await.unwrap();
    assert_eq!(events.last().unwrap().kind, EventKind::TaskCancelled, "the last event should be task_cancelled");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn resume_after_crash_only_re_executes_the_next_pending_step() {
    let (pool, db_name) = create_test_db().await;

    let registry = Arc::new(support::full_registry());
    let safety = Arc::new(SafetyRegistry::with_builtins());
    let config = OrchestratorConfig { executor: fast_executor_config(), ..OrchestratorConfig::default() };
    let orchestrator = Orchestrator::new(pool.clone(), registry.clone(), safety.clone(), config.clone());

    let task = orchestrator.create_task(dev_deploy_spec()).await.unwrap();
    let finished = orchestrator.execute_task(task.id).await.expect("first run should succeed end to end");
    assert_eq!(finished.status, TaskStatus::Succeeded);

    // Simulate "the engine restarts mid-deploy" by hand-rolling a second
    // task whose plan is only partially marked succeeded, then resuming
    // it through a fresh Orchestrator instance (spec §8 scenario 4).
    let task2 = orchestrator.create_task(dev_deploy_spec()).await.unwrap();
    nimbus_core::state::dispatch::start_planning(&pool, task2.id).await.unwrap();

    let generated = nimbus_core::planner::generate_plan(&orchestrator.get_task(task2.id).await.unwrap());
    let (plan, steps) = nimbus_db::queries::plans::insert_plan_with_steps(
        &pool,
        task2.id,
        generated.estimated_duration_ms,
        generated.risk_score,
        &generated.steps,
    )
    .await
    .unwrap();
    nimbus_core::state::dispatch::begin_running_from_planning(&pool, task2.id).await.unwrap();

    // Mark every step but the last as succeeded and write a matching
    // checkpoint, as the executor would have done before a crash.
    let last = steps.last().unwrap().clone();
    let mut state = nimbus_core::checkpoint::CheckpointState::default();
    for (i, step) in steps.iter().enumerate() {
        if step.id == last.id {
            continue;
        }
        nimbus_db::queries::plans::set_step_outputs(&pool, step.id, serde_json::json!({"ok": true})).await.unwrap();
        state.step_outputs_so_far.insert(step.id, serde_json::json!({"ok": true}));
        state.cursor = i + 1;
    }
    nimbus_core::checkpoint::save(&pool, task2.id, (steps.len() - 1) as i64, &state).await.unwrap();

    let restarted_orchestrator = Orchestrator::new(pool.clone(), registry, safety, config);
    let resumed = restarted_orchestrator.resume_task(task2.id).await.expect("resume should succeed");
    assert_eq!(resumed.status, TaskStatus::Succeeded);

    let final_steps = nimbus_db::queries::plans::get_steps_for_plan(&pool, plan.id).await.unwrap();
    assert!(final_steps.iter().all(|s| s.state == nimbus_db::models::StepState::Succeeded));

    let events_after_resume = restarted_orchestrator.get_task_events(task2.id, None).await.unwrap();
    let step_started_for_last = events_after_resume
        .iter()
        .filter(|e| e.kind == EventKind::StepStarted)
        .count();
    assert_eq!(step_started_for_last, 1, "resume should only (re)start the single pending step, not replay earlier ones");

    pool.close().await;
    drop_test_db(&db_name).await;
}
