//! Database query functions for the `checkpoints` table.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Checkpoint;

/// Save a checkpoint for an operation.
///
/// Steps must increase strictly within an operation: this is enforced both
/// by the `UNIQUE (operation_id, step)` constraint and, here, by rejecting
/// any `step` that is not greater than the latest one on record.
pub async fn save(
    pool: &PgPool,
    operation_id: Uuid,
    step: i64,
    state: serde_json::Value,
) -> Result<Checkpoint> {
    let latest = get_latest(pool, operation_id).await?;
    if let Some(latest) = &latest {
        if step <= latest.step {
            bail!(
                "checkpoint step {} is not greater than latest recorded step {} for operation {}",
                step,
                latest.step,
                operation_id
            );
        }
    }

    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (operation_id, step, state) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(operation_id)
    .bind(step)
    .bind(state)
    .fetch_one(pool)
    .await
    .context("failed to save checkpoint")?;

    Ok(checkpoint)
}

/// Fetch the most recent checkpoint for an operation, if any.
pub async fn get_latest(pool: &PgPool, operation_id: Uuid) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE operation_id = $1 ORDER BY step DESC LIMIT 1",
    )
    .bind(operation_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest checkpoint")?;

    Ok(checkpoint)
}

/// List all checkpoints for an operation, oldest first.
pub async fn list(pool: &PgPool, operation_id: Uuid) -> Result<Vec<Checkpoint>> {
    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE operation_id = $1 ORDER BY step ASC",
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints")?;

    Ok(checkpoints)
}

/// Fetch a specific checkpoint by operation and step.
pub async fn get(pool: &PgPool, operation_id: Uuid, step: i64) -> Result<Option<Checkpoint>> {
    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints WHERE operation_id = $1 AND step = $2",
    )
    .bind(operation_id)
    .bind(step)
    .fetch_optional(pool)
    .await
    .context("failed to fetch checkpoint")?;

    Ok(checkpoint)
}

/// Delete all checkpoints for an operation. Callers are expected to only do
/// this once the owning task has reached a terminal status.
pub async fn delete_all(pool: &PgPool, operation_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM checkpoints WHERE operation_id = $1")
        .bind(operation_id)
        .execute(pool)
        .await
        .context("failed to delete checkpoints")?;

    Ok(result.rows_affected())
}
