//! Integration tests for safety result and drift report persistence.

use nimbus_db::models::{Priority, SafetyPhase, Severity, TaskType};
use nimbus_db::queries::{drift_reports, safety_results, tasks};
use nimbus_test_utils::{create_test_db, drop_test_db};
use uuid::Uuid;

#[tokio::test]
async fn safety_result_insert_and_list_for_operation() {
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

    safety_results::insert(
        &pool,
        Some(task.id),
        SafetyPhase::Pre,
        "prod_requires_approval",
        "environment",
        Severity::Critical,
        false,
        "task targets a production environment",
        true,
    )
    .await
    .expect("insert should succeed");

    safety_results::insert(
        &pool,
        Some(task.id),
        SafetyPhase::Pre,
        "rate_limit_headroom",
        "rate",
        Severity::Warning,
        true,
        "within headroom",
        false,
    )
    .await
    .unwrap();

    let results = safety_results::list_for_operation(&pool, task.id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].check_name, "prod_requires_approval");
    assert!(results[0].requires_approval);
    assert!(results[0].approved_at.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn record_approval_only_affects_pending_approval_rows() {
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

    let pending = safety_results::insert(
        &pool,
        Some(task.id),
        SafetyPhase::Pre,
        "prod_requires_approval",
        "environment",
        Severity::Critical,
        false,
        "needs approval",
        true,
    )
    .await
    .unwrap();

    let not_required = safety_results::insert(
        &pool,
        Some(task.id),
        SafetyPhase::Pre,
        "rate_limit_headroom",
        "rate",
        Severity::Warning,
        true,
        "fine",
        false,
    )
    .await
    .unwrap();

    let affected = safety_results::record_approval(&pool, pending.id, "approver-1").await.unwrap();
    assert_eq!(affected, 1);

    // A check that never required approval cannot be "approved".
    let affected = safety_results::record_approval(&pool, not_required.id, "approver-1").await.unwrap();
    assert_eq!(affected, 0);

    // Approving the same result twice is a no-op the second time.
    let affected = safety_results::record_approval(&pool, pending.id, "approver-2").await.unwrap();
    assert_eq!(affected, 0);

    let results = safety_results::list_for_operation(&pool, task.id).await.unwrap();
    let approved = results.iter().find(|r| r.id == pending.id).unwrap();
    assert_eq!(approved.approved_by.as_deref(), Some("approver-1"));
    assert!(approved.approved_at.is_some());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn drift_report_insert_get_and_list_by_provider_scope() {
    let (pool, db_name) = create_test_db().await;

    let items = serde_json::json!([
        {"resource_address": "aws_vpc.main", "status": "in_sync", "desired": null, "actual": null, "severity": "info"}
    ]);
    let report = drift_reports::insert(&pool, "aws", "infra/network", items.clone()).await.expect("insert should succeed");

    let fetched = drift_reports::get(&pool, report.id).await.unwrap().unwrap();
    assert_eq!(fetched.provider, "aws");
    assert_eq!(fetched.scope, "infra/network");
    assert_eq!(fetched.items, items);

    // A second report for the same provider/scope; list should return
    // newest first and get_latest should pick it up.
    let items2 = serde_json::json!([
        {"resource_address": "aws_vpc.main", "status": "missing", "desired": {}, "actual": null, "severity": "critical"}
    ]);
    let report2 = drift_reports::insert(&pool, "aws", "infra/network", items2).await.unwrap();

    let listed = drift_reports::list_for_provider_scope(&pool, "aws", "infra/network").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, report2.id);

    let latest = drift_reports::get_latest_for_provider_scope(&pool, "aws", "infra/network").await.unwrap().unwrap();
    assert_eq!(latest.id, report2.id);

    let other_scope = drift_reports::list_for_provider_scope(&pool, "aws", "infra/other").await.unwrap();
    assert!(other_scope.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn drift_report_get_returns_none_for_missing_id() {
    let (pool, db_name) = create_test_db().await;

    let result = drift_reports::get(&pool, Uuid::new_v4()).await.unwrap();
    assert!(result.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}
