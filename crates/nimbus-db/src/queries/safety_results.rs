//! Database query functions for the `safety_results` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{SafetyPhase, SafetyResult, Severity};

/// Record the outcome of one safety check evaluation.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    pool: &PgPool,
    operation_id: Option<Uuid>,
    phase: SafetyPhase,
    check_name: &str,
    category: &str,
    severity: Severity,
    passed: bool,
    message: &str,
    requires_approval: bool,
) -> Result<SafetyResult> {
    let result = sqlx::query_as::<_, SafetyResult>(
        "INSERT INTO safety_results \
            (operation_id, phase, check_name, category, severity, passed, message, requires_approval) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(operation_id)
    .bind(phase)
    .bind(check_name)
    .bind(category)
    .bind(severity)
    .bind(passed)
    .bind(message)
    .bind(requires_approval)
    .fetch_one(pool)
    .await
    .context("failed to insert safety result")?;

    Ok(result)
}

/// List all safety results recorded for an operation, oldest first.
pub async fn list_for_operation(pool: &PgPool, operation_id: Uuid) -> Result<Vec<SafetyResult>> {
    let results = sqlx::query_as::<_, SafetyResult>(
        "SELECT * FROM safety_results WHERE operation_id = $1 ORDER BY created_at ASC",
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await
    .context("failed to list safety results")?;

    Ok(results)
}

/// Record a human approval against a safety result that required one.
/// Returns 0 rows affected if the result does not exist or did not require
/// approval.
pub async fn record_approval(
    pool: &PgPool,
    safety_result_id: Uuid,
    approved_by: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE safety_results \
         SET approved_by = $1, approved_at = $2 \
         WHERE id = $3 AND requires_approval = true AND approved_at IS NULL",
    )
    .bind(approved_by)
    .bind(Utc::now())
    .bind(safety_result_id)
    .execute(pool)
    .await
    .context("failed to record safety approval")?;

    Ok(result.rows_affected())
}
