//! Executor (C3): walks a plan's step DAG to completion, dispatching
//! ready steps through the Capability Port with bounded fan-out,
//! per-step retry/backoff, `during`-phase safety checks, and
//! checkpointing after every success (spec §4.3).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_db::models::{EventKind, FailurePolicy, Plan, SafetyPhase, Step, StepState, Task};
use nimbus_db::queries::{events, plans as plan_db};

use crate::capability::{CapabilityErrorKind, CapabilityRegistry};
use crate::checkpoint::{self, CheckpointState};
use crate::safety::{SafetyOutcome, SafetyRegistry};
use crate::state::StepStateMachine;

/// Tunables for a single executor run (spec §5, §6 env vars).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-plan cap on concurrently in-flight steps (`MAX_STEP_FANOUT`,
    /// default 4).
    pub max_fanout: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Process-wide cap on concurrently in-flight steps across every
    /// task's plan (`MAX_TASK_CONCURRENCY`, default 16; spec §5 "global
    /// step concurrency is capped by a process-wide semaphore"). Shared
    /// across every [`run`] invocation made from the same
    /// [`ExecutorConfig`] instance — construct one at startup and reuse
    /// it, never build a fresh one per task.
    pub global_fanout: Arc<Semaphore>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_fanout: 4,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            global_fanout: Arc::new(Semaphore::new(16)),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Self {
        let max_fanout = std::env::var("MAX_STEP_FANOUT").ok().and_then(|v| v.parse().ok()).unwrap_or(4);
        let max_task_concurrency: usize = std::env::var("MAX_TASK_CONCURRENCY").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
        Self { max_fanout, global_fanout: Arc::new(Semaphore::new(max_task_concurrency)), ..Default::default() }
    }
}

/// Outcome of running a plan to quiescence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorOutcome {
    /// Every step succeeded or was skipped under a `continue` policy.
    Completed,
    /// At least one step failed in a way that propagates to the task.
    Failed { failed_step_ids: Vec<Uuid> },
    /// A `during`-phase critical safety check failed, or the caller's
    /// cancellation token fired; in-flight steps were drained, no further
    /// steps were dispatched.
    Cancelled,
}

/// Message sent from a spawned step task back to the driving loop.
struct StepDone {
    step_id: Uuid,
    position: i32,
    kind: String,
    idempotency_key: String,
    failure_policy: FailurePolicy,
    attempts: i32,
    outcome: Result<Value, String>,
}

/// Run `plan` to completion (or until cancelled / blocked), dispatching
/// steps through `registry` and evaluating `safety` at each step
/// boundary.
///
/// Resumable: steps already `succeeded` in the database are not
/// re-dispatched (they're filtered out by
/// [`plan_db::get_ready_steps`]); their outputs are reloaded from the
/// `steps.outputs` column into the in-memory output map so dependent
/// steps can reference them.
pub async fn run(
    pool: &PgPool,
    registry: &Arc<CapabilityRegistry>,
    safety: &Arc<SafetyRegistry>,
    task: &Task,
    plan: &Plan,
    cancel: CancellationToken,
    config: &ExecutorConfig,
) -> Result<ExecutorOutcome> {
    let mut outputs: HashMap<Uuid, Value> = HashMap::new();
    let mut idempotency_used: HashMap<Uuid, String> = HashMap::new();
    let mut cursor = 0i64;

    if let Some((checkpoint, state)) = checkpoint::load_latest(pool, task.id).await? {
        cursor = checkpoint.step;
        outputs.extend(state.step_outputs_so_far);
        idempotency_used.extend(state.idempotency_keys_used);
    }

    // Resume: reload outputs for steps already marked succeeded in the DB
    // (authoritative) in case they completed after the last checkpoint.
    for step in plan_db::get_steps_for_plan(pool, plan.id).await? {
        if step.state == StepState::Succeeded {
            if let Some(value) = step.outputs.clone() {
                outputs.entry(step.id).or_insert(value);
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(config.max_fanout.max(1)));
    let (tx, mut rx) = mpsc::channel::<StepDone>(config.max_fanout.max(1) * 2);
    let mut in_flight: usize = 0;
    let mut failed_step_ids: Vec<Uuid> = Vec::new();
    let mut stop_dispatch = false;

    loop {
        if cancel.is_cancelled() {
            drain_discarding(&mut rx, &mut in_flight, Duration::from_secs(10)).await;
            events::insert_event(pool, Some(task.id), Some(plan.id), EventKind::TaskCancelled, Value::Null).await?;
            return Ok(ExecutorOutcome::Cancelled);
        }

        while let Ok(done) = rx.try_recv() {
            in_flight -= 1;
            let failed_policy = apply_step_result(
                pool,
                task,
                plan,
                &done,
                &mut outputs,
                &mut idempotency_used,
                &mut cursor,
            )
            .await?;

            if let Some(policy) = failed_policy {
                failed_step_ids.push(done.step_id);
                match policy {
                    FailurePolicy::Continue => {
                        skip_descendants(pool, plan.id, done.step_id).await?;
                    }
                    FailurePolicy::Abort => {
                        stop_dispatch = true;
                    }
                    FailurePolicy::FailTask => {
                        stop_dispatch = true;
                        cancel.cancel();
                    }
                }
            }
        }

        let progress = plan_db::get_plan_progress(pool, plan.id).await?;
        if progress.running == 0 && progress.remaining == 0 && in_flight == 0 {
            if !failed_step_ids.is_empty() {
                return Ok(ExecutorOutcome::Failed { failed_step_ids });
            }
            return Ok(ExecutorOutcome::Completed);
        }

        if stop_dispatch {
            if in_flight == 0 {
                return Ok(ExecutorOutcome::Failed { failed_step_ids });
            }
            tokio::select! {
                Some(done) = rx.recv() => {
                    in_flight -= 1;
                    let failed_policy = apply_step_result(pool, task, plan, &done, &mut outputs, &mut idempotency_used, &mut cursor).await?;
                    if failed_policy.is_some() {
                        failed_step_ids.push(done.step_id);
                    }
                }
                _ = cancel.cancelled() => {}
            }
            continue;
        }

        let ready = plan_db::get_ready_steps(pool, plan.id).await?;
        let mut ready = ready;
        // Scheduling tiebreak: shorter estimated duration first, then step
        // id for full determinism (spec §4.3).
        ready.sort_by(|a, b| a.timeout_ms.cmp(&b.timeout_ms).then(a.id.cmp(&b.id)));

        let mut spawned_any = false;
        for step in ready {
            if semaphore.available_permits() == 0 || config.global_fanout.available_permits() == 0 {
                break;
            }

            let (during_results, outcome) = crate::safety::evaluate(
                safety,
                SafetyPhase::During,
                task,
                plan,
                Some(&CheckpointState { step_outputs_so_far: outputs.clone(), cursor: cursor as usize, idempotency_keys_used: idempotency_used.clone() }),
            );
            record_safety_results(pool, task.id, &during_results).await?;
            if let SafetyOutcome::Blocked { check_id, message } = outcome {
                tracing::warn!(task_id = %task.id, check_id = %check_id, message = %message, "during-phase critical safety check failed, cancelling task");
                cancel.cancel();
                break;
            }

            let permit = semaphore.clone().acquire_owned().await.context("semaphore closed")?;
            let global_permit = config.global_fanout.clone().acquire_owned().await.context("global fanout semaphore closed")?;
            if step.state == StepState::Pending {
                StepStateMachine::transition(pool, step.id, StepState::Pending, StepState::Ready).await?;
            }
            StepStateMachine::transition(pool, step.id, StepState::Ready, StepState::Running).await?;
            plan_db::record_step_attempt(pool, step.id).await?;
            events::insert_event(
                pool,
                Some(task.id),
                Some(plan.id),
                EventKind::StepStarted,
                serde_json::json!({"step_id": step.id, "kind": step.kind}),
            )
            .await?;

            in_flight += 1;
            spawned_any = true;

            let registry = Arc::clone(registry);
            let cancel = cancel.clone();
            let tx = tx.clone();
            let config = config.clone();
            let already_used = idempotency_used.get(&step.id).cloned();

            tokio::spawn(async move {
                let _permit = permit;
                let _global_permit = global_permit;
                let result = execute_with_retry(&registry, &step, cancel, &config, already_used).await;
                let _ = tx
                    .send(StepDone {
                        step_id: step.id,
                        position: step.position,
                        kind: step.kind.clone(),
                        idempotency_key: step.idempotency_key.clone(),
                        failure_policy: step.failure_policy,
                        attempts: step.attempts + 1,
                        outcome: result,
                    })
                    .await;
            });
        }

        if !spawned_any && in_flight > 0 {
            tokio::select! {
                Some(done) = rx.recv() => {
                    in_flight -= 1;
                    let failed_policy = apply_step_result(pool, task, plan, &done, &mut outputs, &mut idempotency_used, &mut cursor).await?;
                    if let Some(policy) = failed_policy {
                        failed_step_ids.push(done.step_id);
                        match policy {
                            FailurePolicy::Continue => { skip_descendants(pool, plan.id, done.step_id).await?; }
                            FailurePolicy::Abort => { stop_dispatch = true; }
                            FailurePolicy::FailTask => { stop_dispatch = true; cancel.cancel(); }
                        }
                    }
                }
                _ = cancel.cancelled() => {}
            }
        } else if !spawned_any {
            // Nothing ready and nothing in flight but the plan is not yet
            // complete: a dependency cycle slipped past validation, or
            // every remaining step was skipped without its state being
            // reflected in `progress` yet. Avoid a busy loop.
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                _ = cancel.cancelled() => {}
            }
        }
    }
}

/// Invoke a step's capability, retrying retryable failures with
/// exponential backoff and full jitter up to `step.max_retries` times
/// beyond the first attempt.
async fn execute_with_retry(
    registry: &CapabilityRegistry,
    step: &Step,
    cancel: CancellationToken,
    config: &ExecutorConfig,
    already_used_idempotency_key: Option<String>,
) -> Result<Value, String> {
    if already_used_idempotency_key.as_deref() == Some(step.idempotency_key.as_str()) {
        // Already accepted by the tool service in a prior (possibly
        // crashed) run with this exact idempotency key; trust it rather
        // than invoking again.
        return Ok(step.outputs.clone().unwrap_or(Value::Null));
    }

    let deadline = Duration::from_millis(step.timeout_ms.max(1) as u64);
    let max_attempts = step.max_retries.max(0) as u32 + 1;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = registry.invoke(&step.kind, &step.inputs, deadline, cancel.clone()).await;

        match result {
            Ok(outcome) => return Ok(outcome.outputs),
            Err(err) => {
                let retryable = err.kind.is_retryable();
                if !retryable || attempt >= max_attempts {
                    return Err(format!("{}: {}", err.kind, err.message));
                }

                let backoff = backoff_with_jitter(attempt, config.base_backoff, config.max_backoff);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return Err(format!("{}: cancelled during retry backoff", CapabilityErrorKind::Timeout)),
                }
            }
        }
    }
}

/// Exponential backoff with full jitter: `uniform(0, min(max, base * 2^(attempt-1)))`.
fn backoff_with_jitter(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.as_millis().saturating_mul(1u128 << attempt.saturating_sub(1).min(20));
    let capped = exp.min(max.as_millis());
    let capped = capped.max(1) as u64;
    let jittered = rand::thread_rng().gen_range(0..=capped);
    Duration::from_millis(jittered)
}

/// Persist the result of a completed step: outputs/error, checkpoint, and
/// the corresponding event. Returns `Some(failure_policy)` if the step
/// ended in failure.
async fn apply_step_result(
    pool: &PgPool,
    task: &Task,
    plan: &Plan,
    done: &StepDone,
    outputs: &mut HashMap<Uuid, Value>,
    idempotency_used: &mut HashMap<Uuid, String>,
    cursor: &mut i64,
) -> Result<Option<FailurePolicy>> {
    match &done.outcome {
        Ok(value) => {
            plan_db::set_step_outputs(pool, done.step_id, value.clone()).await?;
            outputs.insert(done.step_id, value.clone());
            idempotency_used.insert(done.step_id, done.idempotency_key.clone());
            *cursor += 1;

            let state = CheckpointState {
                step_outputs_so_far: outputs.clone(),
                cursor: done.position as usize,
                idempotency_keys_used: idempotency_used.clone(),
            };
            checkpoint::save(pool, task.id, *cursor, &state).await?;
            events::insert_event(
                pool,
                Some(task.id),
                Some(plan.id),
                EventKind::CheckpointSaved,
                serde_json::json!({"step": *cursor}),
            )
            .await?;
            events::insert_event(
                pool,
                Some(task.id),
                Some(plan.id),
                EventKind::StepSucceeded,
                serde_json::json!({"step_id": done.step_id, "kind": done.kind, "attempts": done.attempts}),
            )
            .await?;
            Ok(None)
        }
        Err(message) => {
            plan_db::set_step_error(pool, done.step_id, message).await?;
            events::insert_event(
                pool,
                Some(task.id),
                Some(plan.id),
                EventKind::StepFailed,
                serde_json::json!({"step_id": done.step_id, "kind": done.kind, "attempts": done.attempts, "error": message}),
            )
            .await?;
            Ok(Some(done.failure_policy))
        }
    }
}

/// Record a batch of `during`-phase safety check results against the
/// task, if any were evaluated.
async fn record_safety_results(pool: &PgPool, task_id: Uuid, results: &[crate::safety::EvaluatedCheck]) -> Result<()> {
    for result in results {
        nimbus_db::queries::safety_results::insert(
            pool,
            Some(task_id),
            SafetyPhase::During,
            result.check_id,
            result.category,
            result.severity,
            result.passed,
            &result.message,
            result.requires_approval,
        )
        .await?;
    }
    Ok(())
}

/// Mark every not-yet-started descendant of `failed_step_id` as `skipped`
/// (spec §8: "all steps of T's plan are succeeded or skipped under a
/// continue policy").
async fn skip_descendants(pool: &PgPool, plan_id: Uuid, failed_step_id: Uuid) -> Result<()> {
    let edges = plan_db::get_edges_for_plan(pool, plan_id).await?;
    let steps = plan_db::get_steps_for_plan(pool, plan_id).await?;
    let by_id: HashMap<Uuid, &Step> = steps.iter().map(|s| (s.id, s)).collect();

    let mut adjacency: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for edge in &edges {
        adjacency.entry(edge.from_step_id).or_default().push(edge.to_step_id);
    }

    let mut queue = vec![failed_step_id];
    let mut visited = HashSet::new();
    while let Some(current) = queue.pop() {
        let Some(children) = adjacency.get(&current) else { continue };
        for &child in children {
            if !visited.insert(child) {
                continue;
            }
            if let Some(step) = by_id.get(&child) {
                if matches!(step.state, StepState::Pending | StepState::Ready) {
                    let _ = StepStateMachine::transition(pool, child, step.state, StepState::Skipped).await;
                }
            }
            queue.push(child);
        }
    }
    Ok(())
}

/// Drain `rx` for up to `deadline`, discarding results: used when
/// cancellation fires so that no `step_succeeded` is recorded for work
/// that was in flight at the moment of cancellation (spec §8 boundary
/// behavior).
async fn drain_discarding(rx: &mut mpsc::Receiver<StepDone>, in_flight: &mut usize, deadline: Duration) {
    let deadline = tokio::time::Instant::now() + deadline;
    while *in_flight > 0 {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(_)) => *in_flight -= 1,
            _ => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_max() {
        for attempt in 1..10 {
            let d = backoff_with_jitter(attempt, Duration::from_millis(500), Duration::from_secs(30));
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn backoff_grows_with_attempt_ceiling() {
        let small = backoff_with_jitter(1, Duration::from_millis(500), Duration::from_secs(30));
        let large_ceiling = backoff_with_jitter(10, Duration::from_millis(500), Duration::from_secs(30));
        assert!(small <= Duration::from_millis(500));
        assert!(large_ceiling <= Duration::from_secs(30));
    }

    #[test]
    fn executor_config_defaults_match_spec() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_fanout, 4);
        assert_eq!(config.base_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }
}
