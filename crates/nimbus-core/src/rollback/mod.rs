//! Rollback Manager (C6): replays a task's succeeded steps in reverse,
//! invoking each one's registered inverse capability (spec §4.6).

pub mod inverses;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_db::models::{FailurePolicy, Step, StepState, Task};
use nimbus_db::queries::plans;
use sqlx::PgPool;

use crate::capability::CapabilityRegistry;
use crate::executor::{self, ExecutorConfig, ExecutorOutcome};
use crate::planner::GeneratedPlan;
use crate::safety::SafetyRegistry;

/// Whether a task can be rolled back, and if so, what would be rolled
/// back.
#[derive(Debug, Clone)]
pub struct RollbackAvailability {
    pub available: bool,
    pub reason: Option<String>,
    pub succeeded_step_count: usize,
}

/// Check whether `task_id`'s plan has any succeeded steps to roll back.
pub async fn can_rollback(pool: &PgPool, plan_id: Uuid) -> Result<RollbackAvailability> {
    let steps = plans::get_steps_for_plan(pool, plan_id).await?;
    let succeeded: Vec<&Step> = steps.iter().filter(|s| s.state == StepState::Succeeded).collect();

    if succeeded.is_empty() {
        return Ok(RollbackAvailability {
            available: false,
            reason: Some("no succeeded steps to roll back".to_string()),
            succeeded_step_count: 0,
        });
    }

    Ok(RollbackAvailability { available: true, reason: None, succeeded_step_count: succeeded.len() })
}

/// Parameters controlling a rollback run (spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// Proceed even if one or more succeeded steps have no registered
    /// inverse; those steps are skipped and recorded as unsafe.
    pub force: bool,
    /// Produce the derived plan and a summary without executing it.
    pub dry_run: bool,
    /// Narrow the inverse set to steps whose `expected_effects` match one
    /// of these targets. Empty means "all succeeded steps".
    pub targets: Vec<String>,
}

/// One step of the derived rollback plan, or a record of a step skipped
/// because it had no registered inverse.
#[derive(Debug, Clone)]
pub enum RollbackAction {
    Inverse(nimbus_db::queries::plans::NewStep),
    SkippedUnsafe { original_step_id: Uuid, original_kind: String },
}

/// The result of planning (and, unless `dry_run`, executing) a rollback.
#[derive(Debug, Clone)]
pub struct RollbackPlan {
    pub actions: Vec<RollbackAction>,
    pub summary: String,
}

/// Error returned when a rollback is refused outright because some
/// succeeded step has no registered inverse and `force` was not set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no inverse registered for step kind {0:?}; pass force=true to skip it and roll back the rest")]
pub struct NoInverseError(pub String);

/// Build the derived rollback plan by walking the original plan's
/// topological order in reverse and emitting an inverse step for every
/// `succeeded` step (narrowed by `options.targets` if non-empty).
///
/// Refuses (returns `Err`) if any in-scope step lacks a registered inverse
/// and `options.force` is `false`.
pub async fn plan_rollback(pool: &PgPool, task_id: Uuid, plan_id: Uuid, options: &RollbackOptions) -> Result<RollbackPlan> {
    let mut steps = plans::get_steps_for_plan(pool, plan_id).await?;
    // Reverse topological order: since positions strictly increase along
    // every dependency edge (enforced by `planner::validate_plan`),
    // descending position order is a valid reverse walk.
    steps.sort_by(|a, b| b.position.cmp(&a.position));

    let in_scope: Vec<&Step> = steps
        .iter()
        .filter(|s| s.state == StepState::Succeeded)
        .filter(|s| options.targets.is_empty() || target_matches(s, &options.targets))
        .collect();

    let mut missing_inverse = HashSet::new();
    for step in &in_scope {
        if inverses::inverse_kind(&step.kind).is_none() {
            missing_inverse.insert(step.kind.clone());
        }
    }
    if !missing_inverse.is_empty() && !options.force {
        let kind = missing_inverse.into_iter().next().unwrap();
        return Err(NoInverseError(kind).into());
    }

    let mut actions = Vec::with_capacity(in_scope.len());
    let mut position = 0i32;
    let mut executed_count = 0usize;
    let mut skipped_count = 0usize;

    for step in in_scope {
        match inverses::inverse_kind(&step.kind) {
            Some(inverse_kind) => {
                let new_step = nimbus_db::queries::plans::NewStep {
                    id: rollback_step_id(task_id, position, inverse_kind, step.id),
                    kind: inverse_kind.to_string(),
                    inputs: step.inputs.clone(),
                    expected_effects: step.expected_effects.clone(),
                    max_retries: 1,
                    timeout_ms: step.timeout_ms,
                    idempotency_key: format!("{task_id}:rollback:{}", step.id),
                    failure_policy: FailurePolicy::Continue,
                    position,
                    depends_on_positions: if position == 0 { Vec::new() } else { vec![position - 1] },
                };
                actions.push(RollbackAction::Inverse(new_step));
                executed_count += 1;
                position += 1;
            }
            None => {
                actions.push(RollbackAction::SkippedUnsafe { original_step_id: step.id, original_kind: step.kind.clone() });
                skipped_count += 1;
            }
        }
    }

    let summary = format!(
        "{executed_count} inverse step(s) to run, {skipped_count} step(s) skipped as unsafe (no registered inverse)"
    );

    Ok(RollbackPlan { actions, summary })
}

fn target_matches(step: &Step, targets: &[String]) -> bool {
    targets.iter().any(|t| {
        step.expected_effects
            .get("target")
            .and_then(serde_json::Value::as_str)
            .map(|v| v == t)
            .unwrap_or(false)
    })
}

fn rollback_step_id(task_id: Uuid, position: i32, kind: &str, original_step_id: Uuid) -> Uuid {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(position.to_le_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(original_step_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0F) | 0x50;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Turn a planned rollback into an insertable [`GeneratedPlan`], dropping
/// any `SkippedUnsafe` actions (they never run, they're only reported).
pub fn into_generated_plan(plan: &RollbackPlan) -> GeneratedPlan {
    let steps: Vec<_> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            RollbackAction::Inverse(step) => Some(step.clone()),
            RollbackAction::SkippedUnsafe { .. } => None,
        })
        .collect();
    let estimated_duration_ms = steps.iter().map(|s| s.timeout_ms).sum();
    GeneratedPlan { estimated_duration_ms, risk_score: 0.5, steps }
}

/// The result of driving a rollback: either it was only planned (dry run,
/// or everything was skipped as unsafe), or it was persisted and run.
#[derive(Debug)]
pub enum RollbackResult {
    Planned(RollbackPlan),
    Executed { plan: RollbackPlan, outcome: ExecutorOutcome },
}

/// Plan a task's rollback and, unless `options.dry_run` or the plan turned
/// out empty, persist it and run it through the Executor.
///
/// Like [`crate::drift::remediate`], this never transitions `task.status`:
/// a rollback is a new unit of work layered on top of a task that has
/// already reached a terminal state, not a resumption of its own lifecycle.
pub async fn run_rollback(
    pool: &PgPool,
    registry: &Arc<CapabilityRegistry>,
    safety: &Arc<SafetyRegistry>,
    task: &Task,
    plan_id: Uuid,
    options: &RollbackOptions,
    cancel: CancellationToken,
    executor_config: &ExecutorConfig,
) -> Result<RollbackResult> {
    let plan = plan_rollback(pool, task.id, plan_id, options).await?;
    let generated = into_generated_plan(&plan);

    if options.dry_run || generated.steps.is_empty() {
        return Ok(RollbackResult::Planned(plan));
    }

    let (db_plan, _steps) = plans::insert_plan_with_steps(
        pool,
        task.id,
        generated.estimated_duration_ms,
        generated.risk_score,
        &generated.steps,
    )
    .await
    .context("failed to persist rollback plan")?;

    let outcome = executor::run(pool, registry, safety, task, &db_plan, cancel, executor_config).await?;
    Ok(RollbackResult::Executed { plan, outcome })
}

/// List rollback state: every task that currently has rollback-eligible
/// (succeeded) steps, intended for `GET /api/rollback/states`.
pub async fn list_rollback_states(pool: &PgPool) -> Result<Vec<Uuid>> {
    let plan_ids: Vec<(Uuid,)> = sqlx::query_as("SELECT DISTINCT plan_id FROM steps WHERE state = 'succeeded'")
        .fetch_all(pool)
        .await
        .context("failed to list rollback-eligible plans")?;
    Ok(plan_ids.into_iter().map(|(id,)| id).collect())
}

/// Delete checkpoints for operations whose task finished more than
/// `max_age` ago, freeing storage for rollback state no longer needed.
pub async fn cleanup_old_states(pool: &PgPool, max_age: chrono::Duration) -> Result<u64> {
    let cutoff = chrono::Utc::now() - max_age;
    let tasks: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM tasks WHERE finished_at IS NOT NULL AND finished_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list tasks eligible for rollback state cleanup")?;

    let mut deleted = 0u64;
    for (task_id,) in tasks {
        deleted += nimbus_db::queries::checkpoints::delete_all(pool, task_id).await?;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_step_id_is_deterministic() {
        let task_id = Uuid::new_v4();
        let original = Uuid::new_v4();
        let a = rollback_step_id(task_id, 0, "terraform.destroy", original);
        let b = rollback_step_id(task_id, 0, "terraform.destroy", original);
        assert_eq!(a, b);
    }

    #[test]
    fn into_generated_plan_drops_skipped_actions() {
        let plan = RollbackPlan {
            actions: vec![RollbackAction::SkippedUnsafe { original_step_id: Uuid::new_v4(), original_kind: "git.push".to_string() }],
            summary: "0 inverse step(s) to run, 1 step(s) skipped as unsafe (no registered inverse)".to_string(),
        };
        let generated = into_generated_plan(&plan);
        assert!(generated.steps.is_empty());
    }
}
