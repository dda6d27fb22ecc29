//! Helpers shared by the `plan` subcommands and the `/api/plans/*` routes:
//! turning a persisted plan back into the in-memory shape
//! [`nimbus_core::planner`] operates on, for re-validation and
//! re-optimization previews that never touch the database.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use nimbus_core::planner::GeneratedPlan;
use nimbus_db::queries::plans::{self, NewStep};

/// Rebuild a [`GeneratedPlan`] from a persisted plan's steps and edges, so
/// it can be re-run through [`nimbus_core::planner::validate_plan`] or
/// [`nimbus_core::planner::optimize_plan`] without re-deriving it from the
/// owning task.
pub async fn reconstruct_generated_plan(pool: &PgPool, plan_id: Uuid) -> Result<GeneratedPlan> {
    let plan = plans::get_plan(pool, plan_id).await?.with_context(|| format!("plan {plan_id} not found"))?;
    let steps = plans::get_steps_for_plan(pool, plan_id).await?;
    let edges = plans::get_edges_for_plan(pool, plan_id).await?;

    let position_of: HashMap<Uuid, i32> = steps.iter().map(|s| (s.id, s.position)).collect();
    let mut depends_on: HashMap<Uuid, Vec<i32>> = HashMap::new();
    for edge in edges {
        let Some(&from_position) = position_of.get(&edge.from_step_id) else { continue };
        depends_on.entry(edge.to_step_id).or_default().push(from_position);
    }

    let new_steps = steps
        .into_iter()
        .map(|s| NewStep {
            id: s.id,
            kind: s.kind,
            inputs: s.inputs,
            expected_effects: s.expected_effects,
            max_retries: s.max_retries,
            timeout_ms: s.timeout_ms,
            idempotency_key: s.idempotency_key,
            failure_policy: s.failure_policy,
            position: s.position,
            depends_on_positions: depends_on.remove(&s.id).unwrap_or_default(),
        })
        .collect();

    Ok(GeneratedPlan { estimated_duration_ms: plan.estimated_duration_ms, risk_score: plan.risk_score, steps: new_steps })
}
