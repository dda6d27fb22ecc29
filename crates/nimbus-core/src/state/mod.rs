//! Task and Step state machines.
//!
//! Validates and executes state transitions, enforcing the allowed
//! transition graph, optimistic locking, and timestamp bookkeeping.

pub mod dispatch;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use nimbus_db::models::{StepState, TaskStatus};
use nimbus_db::queries::plans as plan_db;
use nimbus_db::queries::tasks as task_db;

/// The task state machine.
///
/// Enforces the transition graph from spec §3: status transitions are
/// monotonic except that cancellation may interrupt `planning`,
/// `awaiting_approval`, or `running`.
///
/// ```text
/// pending -> planning -> awaiting_approval -> running -> succeeded
///                  \            \                  \
///                   \            \                  -> failed
///                    \            -> failed / cancelled
///                     -> failed
/// running -> cancelled
/// planning -> cancelled
/// awaiting_approval -> cancelled
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Planning)
                | (Planning, AwaitingApproval)
                | (Planning, Running)
                | (Planning, Failed)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Planning, Cancelled)
                | (AwaitingApproval, Cancelled)
                | (Running, Cancelled)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Sets `started_at` on the first transition into `running`, and
    /// `finished_at` when entering any terminal status. Returns an error
    /// if the transition is not a valid edge, or if the current status in
    /// the database does not match `from` (optimistic lock failure).
    pub async fn transition(pool: &PgPool, task_id: Uuid, from: TaskStatus, to: TaskStatus) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {} -> {} for task {}", from, to, task_id);
        }

        let started_at = if to == TaskStatus::Running { Some(Utc::now()) } else { None };
        let finished_at = if to.is_terminal() { Some(Utc::now()) } else { None };

        let rows = task_db::transition_task_status(pool, task_id, from, to, started_at, finished_at)
            .await
            .with_context(|| format!("failed to transition task {} from {} to {}", task_id, from, to))?;

        if rows == 0 {
            let task = task_db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {} not found", task_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {}, expected {}",
                    task_id,
                    t.status,
                    from
                ),
            }
        }

        Ok(())
    }

    /// Force a task into `cancelled` from whichever of the interruptible
    /// statuses (`planning`, `awaiting_approval`, `running`) it currently
    /// holds. Idempotent: a task already in a terminal status, or still
    /// `pending` (not yet interruptible), is left untouched and no error is
    /// raised.
    pub async fn cancel(pool: &PgPool, task_id: Uuid) -> Result<bool> {
        let task = task_db::get_task(pool, task_id)
            .await?
            .with_context(|| format!("task {} not found", task_id))?;

        if task.status.is_terminal() || task.status == TaskStatus::Pending {
            return Ok(false);
        }

        Self::transition(pool, task_id, task.status, TaskStatus::Cancelled).await?;
        Ok(true)
    }
}

/// The step state machine.
///
/// ```text
/// pending -> ready -> running -> succeeded
///                         \-> failed -> skipped
/// ```
pub struct StepStateMachine;

impl StepStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge.
    pub fn is_valid_transition(from: StepState, to: StepState) -> bool {
        use StepState::*;
        matches!(
            (from, to),
            (Pending, Ready)
                | (Ready, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Ready) // retry: re-queued after backoff
                | (Failed, Skipped)
                | (Pending, Skipped)
                | (Ready, Skipped)
        )
    }

    /// Execute a step state transition with optimistic locking.
    pub async fn transition(pool: &PgPool, step_id: Uuid, from: StepState, to: StepState) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid step transition: {} -> {} for step {}", from, to, step_id);
        }

        let rows = plan_db::transition_step_state(pool, step_id, from, to)
            .await
            .with_context(|| format!("failed to transition step {} from {} to {}", step_id, from, to))?;

        if rows == 0 {
            bail!(
                "optimistic lock failed: step {} expected status {}",
                step_id,
                from
            );
        }

        Ok(())
    }
}
