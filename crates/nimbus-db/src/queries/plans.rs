//! Database query functions for the `plans`, `steps`, and `step_edges` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Plan, Step, StepEdge, StepState};

/// One step to be inserted as part of a freshly generated plan, before it has
/// an id. `edges_from` lists the positions (within the same plan) of steps
/// this step depends on.
#[derive(Debug, Clone)]
pub struct NewStep {
    /// Content-addressed id computed by the planner (spec §4.2: "the same
    /// spec must yield the same step ids"), inserted explicitly rather than
    /// left to the table's `gen_random_uuid()` default.
    pub id: Uuid,
    pub kind: String,
    pub inputs: serde_json::Value,
    pub expected_effects: serde_json::Value,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub idempotency_key: String,
    pub failure_policy: crate::models::FailurePolicy,
    pub position: i32,
    pub depends_on_positions: Vec<i32>,
}

/// Insert a plan together with all of its steps and dependency edges in a
/// single transaction, then point the owning task at the new plan.
///
/// Steps are inserted in position order so `depends_on_positions` (which
/// refers to other steps by position) can be resolved to step ids as we go.
pub async fn insert_plan_with_steps(
    pool: &PgPool,
    task_id: Uuid,
    estimated_duration_ms: i64,
    risk_score: f64,
    steps: &[NewStep],
) -> Result<(Plan, Vec<Step>)> {
    let mut tx = pool.begin().await.context("failed to start transaction")?;

    let plan = sqlx::query_as::<_, Plan>(
        "INSERT INTO plans (task_id, estimated_duration_ms, risk_score) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(estimated_duration_ms)
    .bind(risk_score)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert plan")?;

    let mut inserted = Vec::with_capacity(steps.len());
    let mut id_by_position = std::collections::HashMap::with_capacity(steps.len());

    for new_step in steps {
        let step = sqlx::query_as::<_, Step>(
            "INSERT INTO steps \
                (id, plan_id, kind, inputs, expected_effects, max_retries, timeout_ms, \
                 idempotency_key, failure_policy, position) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING *",
        )
        .bind(new_step.id)
        .bind(plan.id)
        .bind(&new_step.kind)
        .bind(&new_step.inputs)
        .bind(&new_step.expected_effects)
        .bind(new_step.max_retries)
        .bind(new_step.timeout_ms)
        .bind(&new_step.idempotency_key)
        .bind(new_step.failure_policy)
        .bind(new_step.position)
        .fetch_one(&mut *tx)
        .await
        .with_context(|| format!("failed to insert step at position {}", new_step.position))?;

        id_by_position.insert(new_step.position, step.id);
        inserted.push(step);
    }

    for new_step in steps {
        for dep_position in &new_step.depends_on_positions {
            let from_id = id_by_position.get(dep_position).with_context(|| {
                format!(
                    "step at position {} depends on unknown position {}",
                    new_step.position, dep_position
                )
            })?;
            let to_id = id_by_position[&new_step.position];

            sqlx::query(
                "INSERT INTO step_edges (plan_id, from_step_id, to_step_id) VALUES ($1, $2, $3)",
            )
            .bind(plan.id)
            .bind(from_id)
            .bind(to_id)
            .execute(&mut *tx)
            .await
            .context("failed to insert step edge")?;
        }
    }

    sqlx::query("UPDATE tasks SET plan_id = $1 WHERE id = $2")
        .bind(plan.id)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("failed to attach plan to task")?;

    tx.commit().await.context("failed to commit plan insert")?;

    Ok((plan, inserted))
}

/// Fetch a plan by ID.
pub async fn get_plan(pool: &PgPool, id: Uuid) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

/// Fetch all steps belonging to a plan, ordered by position.
pub async fn get_steps_for_plan(pool: &PgPool, plan_id: Uuid) -> Result<Vec<Step>> {
    let steps = sqlx::query_as::<_, Step>(
        "SELECT * FROM steps WHERE plan_id = $1 ORDER BY position ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch steps for plan")?;

    Ok(steps)
}

/// Fetch all dependency edges belonging to a plan.
pub async fn get_edges_for_plan(pool: &PgPool, plan_id: Uuid) -> Result<Vec<StepEdge>> {
    let edges = sqlx::query_as::<_, StepEdge>("SELECT * FROM step_edges WHERE plan_id = $1")
        .bind(plan_id)
        .fetch_all(pool)
        .await
        .context("failed to fetch step edges for plan")?;

    Ok(edges)
}

/// Steps with no incomplete predecessor, currently in `pending` or `ready`
/// state. The executor promotes these to `running` as it dispatches them.
pub async fn get_ready_steps(pool: &PgPool, plan_id: Uuid) -> Result<Vec<Step>> {
    let steps = sqlx::query_as::<_, Step>(
        "SELECT s.* FROM steps s \
         WHERE s.plan_id = $1 \
           AND s.state IN ('pending', 'ready') \
           AND NOT EXISTS ( \
               SELECT 1 FROM step_edges e \
               JOIN steps dep ON dep.id = e.from_step_id \
               WHERE e.to_step_id = s.id \
                 AND dep.state NOT IN ('succeeded', 'skipped') \
           ) \
         ORDER BY s.position ASC",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch ready steps")?;

    Ok(steps)
}

/// Atomically transition a step from one state to another (optimistic lock).
pub async fn transition_step_state(
    pool: &PgPool,
    step_id: Uuid,
    from: StepState,
    to: StepState,
) -> Result<u64> {
    let result = sqlx::query("UPDATE steps SET state = $1 WHERE id = $2 AND state = $3")
        .bind(to)
        .bind(step_id)
        .bind(from)
        .execute(pool)
        .await
        .context("failed to transition step state")?;

    Ok(result.rows_affected())
}

/// Record the start of a new attempt: increments `attempts` and clears
/// `last_error`.
pub async fn record_step_attempt(pool: &PgPool, step_id: Uuid) -> Result<()> {
    sqlx::query("UPDATE steps SET attempts = attempts + 1, last_error = NULL WHERE id = $1")
        .bind(step_id)
        .execute(pool)
        .await
        .context("failed to record step attempt")?;

    Ok(())
}

/// Store a step's outputs and mark it succeeded.
pub async fn set_step_outputs(
    pool: &PgPool,
    step_id: Uuid,
    outputs: serde_json::Value,
) -> Result<()> {
    sqlx::query("UPDATE steps SET outputs = $1, state = 'succeeded' WHERE id = $2")
        .bind(outputs)
        .bind(step_id)
        .execute(pool)
        .await
        .context("failed to set step outputs")?;

    Ok(())
}

/// Record a step failure message and move it to `failed`.
pub async fn set_step_error(pool: &PgPool, step_id: Uuid, error: &str) -> Result<()> {
    sqlx::query("UPDATE steps SET last_error = $1, state = 'failed' WHERE id = $2")
        .bind(error)
        .bind(step_id)
        .execute(pool)
        .await
        .context("failed to set step error")?;

    Ok(())
}

/// Progress counters for a single plan's steps, used to decide whether a
/// task's execution has finished.
#[derive(Debug, Clone, Default)]
pub struct PlanProgress {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub skipped: i64,
    pub running: i64,
    pub remaining: i64,
}

/// Summarize step states for a plan.
pub async fn get_plan_progress(pool: &PgPool, plan_id: Uuid) -> Result<PlanProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT state::text, COUNT(*) AS cnt FROM steps WHERE plan_id = $1 GROUP BY state",
    )
    .bind(plan_id)
    .fetch_all(pool)
    .await
    .context("failed to fetch plan progress")?;

    let mut progress = PlanProgress::default();
    for (state, count) in &rows {
        match state.as_str() {
            "succeeded" => progress.succeeded = *count,
            "failed" => progress.failed = *count,
            "skipped" => progress.skipped = *count,
            "running" => progress.running = *count,
            "pending" | "ready" => progress.remaining += *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
