//! Semantic dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with names matching the Orchestrator's public operations.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use nimbus_db::models::TaskStatus;

use super::TaskStateMachine;

/// Begin planning: transition `pending -> planning`.
pub async fn start_planning(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Pending, TaskStatus::Planning).await
}

/// Suspend a task pending human approval: transition `planning -> awaiting_approval`.
pub async fn request_approval(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Planning, TaskStatus::AwaitingApproval).await
}

/// Begin execution directly after planning (no approval required):
/// transition `planning -> running`.
pub async fn begin_running_from_planning(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Planning, TaskStatus::Running).await
}

/// Begin execution after an approval was granted: transition
/// `awaiting_approval -> running`.
pub async fn begin_running_from_approval(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::AwaitingApproval, TaskStatus::Running).await
}

/// Mark a task as succeeded: transition `running -> succeeded`.
pub async fn succeed_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskStatus::Running, TaskStatus::Succeeded).await
}

/// Mark a task as failed from whichever status it is currently in.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, from: TaskStatus) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Failed).await
}

/// Cancel a task, observed at the next suspension point by the executor.
/// Idempotent: returns `false` if the task was already terminal, or is
/// still `pending` (cancellation can only interrupt `planning`,
/// `awaiting_approval`, or `running`).
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    TaskStateMachine::cancel(pool, task_id).await
}
