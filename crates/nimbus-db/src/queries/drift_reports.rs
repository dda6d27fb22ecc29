//! Database query functions for the `drift_reports` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::DriftReport;

/// Insert a drift detection report. `items` is the full JSON array of
/// per-resource comparison results.
pub async fn insert(
    pool: &PgPool,
    provider: &str,
    scope: &str,
    items: serde_json::Value,
) -> Result<DriftReport> {
    let report = sqlx::query_as::<_, DriftReport>(
        "INSERT INTO drift_reports (provider, scope, items) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(provider)
    .bind(scope)
    .bind(items)
    .fetch_one(pool)
    .await
    .context("failed to insert drift report")?;

    Ok(report)
}

/// Fetch a drift report by ID.
pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<DriftReport>> {
    let report = sqlx::query_as::<_, DriftReport>("SELECT * FROM drift_reports WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch drift report")?;

    Ok(report)
}

/// List drift reports for a given provider/scope pair, newest first.
pub async fn list_for_provider_scope(
    pool: &PgPool,
    provider: &str,
    scope: &str,
) -> Result<Vec<DriftReport>> {
    let reports = sqlx::query_as::<_, DriftReport>(
        "SELECT * FROM drift_reports \
         WHERE provider = $1 AND scope = $2 \
         ORDER BY created_at DESC",
    )
    .bind(provider)
    .bind(scope)
    .fetch_all(pool)
    .await
    .context("failed to list drift reports")?;

    Ok(reports)
}

/// Fetch the most recent drift report for a provider/scope pair, if any.
pub async fn get_latest_for_provider_scope(
    pool: &PgPool,
    provider: &str,
    scope: &str,
) -> Result<Option<DriftReport>> {
    let report = sqlx::query_as::<_, DriftReport>(
        "SELECT * FROM drift_reports \
         WHERE provider = $1 AND scope = $2 \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(provider)
    .bind(scope)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest drift report")?;

    Ok(report)
}
