//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Priority, Task, TaskStatus, TaskType};

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, status=pending, created_at).
pub async fn insert_task(
    pool: &PgPool,
    task_type: TaskType,
    user_id: &str,
    team_id: Option<&str>,
    priority: Priority,
    context: serde_json::Value,
    metadata: serde_json::Value,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (task_type, user_id, team_id, priority, context, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(task_type)
    .bind(user_id)
    .bind(team_id)
    .bind(priority)
    .bind(context)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Filters accepted by [`list_tasks`]. All fields are optional; `None` means
/// "no filter on this dimension".
#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub task_type: Option<TaskType>,
}

/// List tasks matching the given filters, newest first.
pub async fn list_tasks(pool: &PgPool, filters: &TaskFilters) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR user_id = $2) \
           AND ($3::text IS NULL OR team_id = $3) \
           AND ($4::text IS NULL OR task_type = $4) \
         ORDER BY created_at DESC",
    )
    .bind(filters.status)
    .bind(&filters.user_id)
    .bind(&filters.team_id)
    .bind(filters.task_type)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// Atomically transition a task from one status to another.
///
/// Uses optimistic locking: the UPDATE's WHERE clause includes
/// `status = $from`, so the row is only updated if the current status
/// matches the expected `from` value. Returns the number of rows affected
/// (0 means the status did not match, or the task does not exist).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             finished_at = COALESCE($3, finished_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(finished_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Fail every task left stuck mid-flight by an unclean shutdown.
///
/// Run once at process start, before anything is served: any task still
/// `running`, `planning`, or `awaiting_approval` cannot have survived the
/// restart (its executor is gone), so it is force-failed rather than left
/// to hang forever. Returns the number of tasks recovered this way.
pub async fn recover_interrupted_tasks(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', finished_at = now() \
         WHERE status IN ('running', 'planning', 'awaiting_approval')",
    )
    .execute(pool)
    .await
    .context("failed to recover interrupted tasks")?;

    Ok(result.rows_affected())
}

/// Aggregate counters for the orchestrator's `get_statistics` operation:
/// total tasks grouped by status.
#[derive(Debug, Clone, Default)]
pub struct TaskStatistics {
    pub pending: i64,
    pub planning: i64,
    pub awaiting_approval: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

/// Get a summary of task counts by status across the whole engine.
pub async fn get_statistics(pool: &PgPool) -> Result<TaskStatistics> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status::text, COUNT(*) AS cnt FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to get task statistics")?;

    let mut stats = TaskStatistics::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => stats.pending = *count,
            "planning" => stats.planning = *count,
            "awaiting_approval" => stats.awaiting_approval = *count,
            "running" => stats.running = *count,
            "succeeded" => stats.succeeded = *count,
            "failed" => stats.failed = *count,
            "cancelled" => stats.cancelled = *count,
            _ => {}
        }
        stats.total += count;
    }
    Ok(stats)
}
