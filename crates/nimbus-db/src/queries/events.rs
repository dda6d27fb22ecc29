//! Database query functions for the append-only `events` log.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Event, EventKind};

/// Append an event. Events are never updated or deleted; ordering within a
/// task is determined entirely by the database-assigned `seq` column.
pub async fn insert_event(
    pool: &PgPool,
    task_id: Option<Uuid>,
    plan_id: Option<Uuid>,
    kind: EventKind,
    payload: serde_json::Value,
) -> Result<Event> {
    let event = sqlx::query_as::<_, Event>(
        "INSERT INTO events (task_id, plan_id, kind, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(plan_id)
    .bind(kind)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("failed to insert event")?;

    Ok(event)
}

/// List events for a task in sequence order, optionally capped at `limit`
/// most recent entries (still returned oldest-first).
pub async fn list_events_for_task(
    pool: &PgPool,
    task_id: Uuid,
    limit: Option<i64>,
) -> Result<Vec<Event>> {
    let events = match limit {
        Some(limit) => {
            sqlx::query_as::<_, Event>(
                "SELECT * FROM ( \
                     SELECT * FROM events WHERE task_id = $1 ORDER BY seq DESC LIMIT $2 \
                 ) recent \
                 ORDER BY seq ASC",
            )
            .bind(task_id)
            .bind(limit)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Event>("SELECT * FROM events WHERE task_id = $1 ORDER BY seq ASC")
                .bind(task_id)
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list events for task")?;

    Ok(events)
}
