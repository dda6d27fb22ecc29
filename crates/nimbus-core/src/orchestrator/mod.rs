//! Orchestrator (C1): the core engine's only public surface (spec §4.1).
//!
//! Owns task lifecycle, the event log, and cancellation. Delegates
//! decomposition to the [`crate::planner`], pre/during/post evaluation to
//! the [`crate::safety`] engine, and execution to the [`crate::executor`].
//! Composition follows spec §2: "C1 owns C2, C3, C6, C7 and the event
//! log; it is the only public surface."

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_db::models::{
    Checkpoint, Event, EventKind, Plan, Priority, SafetyPhase, Task, TaskStatus, TaskType,
};
use nimbus_db::queries::tasks::{TaskFilters, TaskStatistics};
use nimbus_db::queries::{checkpoints, events, plans as plan_db, safety_results, tasks as task_db};

use crate::capability::CapabilityRegistry;
use crate::checkpoint;
use crate::executor::{self, ExecutorConfig, ExecutorOutcome};
use crate::planner::{self, ValidationIssue};
use crate::safety::{SafetyOutcome, SafetyRegistry};
use crate::state::dispatch;

/// The shape callers submit to [`Orchestrator::create_task`] (spec §3 Task).
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_type: TaskType,
    pub user_id: String,
    pub team_id: Option<String>,
    pub priority: Priority,
    pub context: serde_json::Value,
    pub metadata: serde_json::Value,
}

/// Errors surfaced by the Orchestrator's public operations (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} cannot {1}: {2}")]
    Conflict(Uuid, &'static str, String),
    #[error("generated plan failed validation: {0:?}")]
    PlanInvalid(Vec<ValidationIssue>),
    #[error("safety check {check_id:?} blocked the task: {message}")]
    SafetyBlocked { check_id: String, message: String },
    #[error("task was cancelled before completion")]
    Cancelled,
    #[error("one or more steps failed: {failed_step_ids:?}")]
    CapabilityFailed { failed_step_ids: Vec<Uuid> },
    #[error("approval wait timed out")]
    Timeout,
    #[error("no checkpoint recorded for task {0}")]
    NoCheckpoint(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Tunables for the orchestrator (spec §6 env vars).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub executor: ExecutorConfig,
    /// Default 24h (spec §4.4, `APPROVAL_TIMEOUT_MS`).
    pub approval_timeout: Duration,
    /// How often `execute_task` polls for an out-of-band approval or
    /// cancellation while a task sits in `awaiting_approval`.
    pub approval_poll_interval: Duration,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let approval_timeout_ms: u64 = std::env::var("APPROVAL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24 * 60 * 60 * 1000);
        Self {
            executor: ExecutorConfig::from_env(),
            approval_timeout: Duration::from_millis(approval_timeout_ms),
            approval_poll_interval: Duration::from_millis(200),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            approval_timeout: Duration::from_secs(24 * 60 * 60),
            approval_poll_interval: Duration::from_millis(200),
        }
    }
}

/// The Orchestrator: constructed once at startup with injected
/// dependencies (spec §9: "single-process singletons... constructed once
/// at startup with injected dependencies; no hidden global mutation").
pub struct Orchestrator {
    pool: PgPool,
    capabilities: Arc<CapabilityRegistry>,
    safety: Arc<SafetyRegistry>,
    config: OrchestratorConfig,
    /// Cancellation tokens for tasks currently executing, keyed by task id.
    /// Populated for the duration of `execute_task`/`resume_task`, so
    /// `cancel_task` can reach an in-flight run from a concurrent caller.
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(pool: PgPool, capabilities: Arc<CapabilityRegistry>, safety: Arc<SafetyRegistry>, config: OrchestratorConfig) -> Self {
        Self { pool, capabilities, safety, config, cancel_tokens: Mutex::new(HashMap::new()) }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create a task (spec §4.1): validates nothing beyond type system
    /// constraints (the caller's HTTP layer validates the wire payload),
    /// assigns an id, stores `status=pending`, emits `task_created`.
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task, OrchestratorError> {
        let task = task_db::insert_task(
            self.pool(),
            spec.task_type,
            &spec.user_id,
            spec.team_id.as_deref(),
            spec.priority,
            spec.context,
            spec.metadata,
        )
        .await?;

        self.emit(Some(task.id), None, EventKind::TaskCreated, serde_json::json!({"task_type": task.r#type})).await?;
        Ok(task)
    }

    /// Drive `task_id` through planning, safety evaluation, and execution,
    /// blocking until the task reaches a terminal status (spec §4.1).
    pub async fn execute_task(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if task.status != TaskStatus::Pending {
            return Err(OrchestratorError::Conflict(task_id, "execute", format!("status is {}, expected pending", task.status)));
        }

        dispatch::start_planning(self.pool(), task_id).await?;

        let generated = planner::generate_plan(&task);
        let domains = self.capabilities.list();
        let report = planner::validate_plan(&generated, Some(&domains));
        if !report.is_valid() {
            dispatch::fail_task(self.pool(), task_id, TaskStatus::Planning).await.ok();
            self.finish_with_failure(task_id, "plan_invalid").await?;
            return Err(OrchestratorError::PlanInvalid(report.issues));
        }
        let generated = planner::optimize_plan(&task, generated);

        let (plan, _steps) = plan_db::insert_plan_with_steps(
            self.pool(),
            task_id,
            generated.estimated_duration_ms,
            generated.risk_score,
            &generated.steps,
        )
        .await
        .context("failed to persist generated plan")?;
        self.emit(Some(task_id), Some(plan.id), EventKind::PlanGenerated, serde_json::json!({"plan_id": plan.id, "step_count": generated.steps.len()})).await?;

        let task = self.require_task(task_id).await?;

        match self.run_pre_safety(&task, &plan).await? {
            SafetyOutcome::Passed => {
                dispatch::begin_running_from_planning(self.pool(), task_id).await?;
            }
            SafetyOutcome::Blocked { check_id, message } => {
                dispatch::fail_task(self.pool(), task_id, TaskStatus::Planning).await.ok();
                self.finish_with_failure(task_id, "safety_blocked").await?;
                return Err(OrchestratorError::SafetyBlocked { check_id, message });
            }
            SafetyOutcome::ApprovalRequired { check_id, message } => {
                dispatch::request_approval(self.pool(), task_id).await?;
                self.emit(Some(task_id), Some(plan.id), EventKind::ApprovalRequested, serde_json::json!({"check_id": check_id, "message": message})).await?;

                if !self.wait_for_approval(task_id).await? {
                    dispatch::fail_task(self.pool(), task_id, TaskStatus::AwaitingApproval).await.ok();
                    self.finish_with_failure(task_id, "timeout").await?;
                    return Err(OrchestratorError::Timeout);
                }
            }
        }

        let task = self.require_task(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            return Err(OrchestratorError::Cancelled);
        }

        self.run_plan_to_completion(task, plan).await
    }

    /// Poll until the task leaves `awaiting_approval` (granted via
    /// [`Self::grant_approval`] or cancelled via [`Self::cancel_task`]), or
    /// until the approval timeout elapses. Returns `true` if approval was
    /// granted, `false` on timeout.
    async fn wait_for_approval(&self, task_id: Uuid) -> Result<bool, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + self.config.approval_timeout;
        loop {
            let task = self.require_task(task_id).await?;
            match task.status {
                TaskStatus::Running => return Ok(true),
                TaskStatus::Cancelled | TaskStatus::Failed => return Ok(false),
                TaskStatus::AwaitingApproval => {}
                _ => return Ok(false),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.config.approval_poll_interval).await;
        }
    }

    /// Run pre-phase safety checks and persist their results.
    async fn run_pre_safety(&self, task: &Task, plan: &Plan) -> Result<SafetyOutcome, OrchestratorError> {
        let (results, outcome) = crate::safety::evaluate(&self.safety, SafetyPhase::Pre, task, plan, None);
        for result in &results {
            safety_results::insert(
                self.pool(),
                Some(task.id),
                SafetyPhase::Pre,
                result.check_id,
                result.category,
                result.severity,
                result.passed,
                &result.message,
                result.requires_approval,
            )
            .await?;
        }
        Ok(outcome)
    }

    /// Execute `plan` to quiescence via the [`crate::executor`], finalize
    /// the task's terminal status, and run post-phase safety checks.
    async fn run_plan_to_completion(&self, task: Task, plan: Plan) -> Result<Task, OrchestratorError> {
        let cancel = self.register_cancel_token(task.id);
        let outcome = executor::run(self.pool(), &self.capabilities, &self.safety, &task, &plan, cancel, &self.config.executor).await;
        self.cancel_tokens.lock().expect("cancel_tokens mutex poisoned").remove(&task.id);
        let outcome = outcome?;

        match outcome {
            ExecutorOutcome::Completed => {
                dispatch::succeed_task(self.pool(), task.id).await?;
                self.run_post_safety(task.id, &plan).await?;
                self.emit(Some(task.id), Some(plan.id), EventKind::TaskFinished, serde_json::json!({"result": "succeeded"})).await?;
                self.require_task(task.id).await
            }
            ExecutorOutcome::Failed { failed_step_ids } => {
                dispatch::fail_task(self.pool(), task.id, TaskStatus::Running).await.ok();
                self.finish_with_failure(task.id, "capability_failed").await?;
                Err(OrchestratorError::CapabilityFailed { failed_step_ids })
            }
            ExecutorOutcome::Cancelled => {
                // The executor only returns `Cancelled` once a cancel
                // signal fired; `cancel_task` already transitioned the row
                // and emitted `task_cancelled`, so there is nothing left to
                // persist here.
                Err(OrchestratorError::Cancelled)
            }
        }
    }

    /// Post-phase safety checks never revert a succeeded task; failures are
    /// recorded for visibility only (spec §4.4).
    async fn run_post_safety(&self, task_id: Uuid, plan: &Plan) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        let (results, _outcome) = crate::safety::evaluate(&self.safety, SafetyPhase::Post, &task, plan, None);
        for result in &results {
            safety_results::insert(
                self.pool(),
                Some(task_id),
                SafetyPhase::Post,
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

    async fn finish_with_failure(&self, task_id: Uuid, reason: &str) -> Result<(), OrchestratorError> {
        self.emit(Some(task_id), None, EventKind::TaskFinished, serde_json::json!({"result": "failed", "reason": reason})).await
    }

    fn register_cancel_token(&self, task_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancel_tokens.lock().expect("cancel_tokens mutex poisoned").insert(task_id, token.clone());
        token
    }

    /// Resume a task from its latest checkpoint (spec §4.1, §4.3).
    ///
    /// Unlike `execute_task`, this does not re-run planning or pre-phase
    /// safety: the task already has a validated plan and has passed pre
    /// checks. Steps the executor finds already `succeeded` in the
    /// database (or whose outputs were reloaded from the checkpoint) are
    /// not re-dispatched.
    pub async fn resume_task(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(OrchestratorError::Conflict(task_id, "resume", format!("status {} is terminal", task.status)));
        }
        let plan_id = task.plan_id.ok_or_else(|| OrchestratorError::Conflict(task_id, "resume", "no plan has been generated for this task".to_string()))?;
        let plan = plan_db::get_plan(self.pool(), plan_id).await?.ok_or_else(|| OrchestratorError::NotFound(plan_id))?;

        if checkpoint::load_latest(self.pool(), task_id).await?.is_none() {
            return Err(OrchestratorError::NoCheckpoint(task_id));
        }

        if task.status != TaskStatus::Running {
            // A crash can leave a task in `awaiting_approval` or
            // `planning`; resuming only makes sense once execution was
            // underway, so re-drive it through `begin_running_from_*`
            // when the prior phase already concluded favorably.
            match task.status {
                TaskStatus::AwaitingApproval => dispatch::begin_running_from_approval(self.pool(), task_id).await?,
                TaskStatus::Planning => dispatch::begin_running_from_planning(self.pool(), task_id).await?,
                _ => return Err(OrchestratorError::Conflict(task_id, "resume", format!("status {} cannot resume", task.status))),
            }
        }

        let task = self.require_task(task_id).await?;
        self.run_plan_to_completion(task, plan).await
    }

    /// Cancel a task: sets the cancellation token observed by the executor
    /// at every suspension point, transitions the row, and emits
    /// `task_cancelled`. Idempotent (spec §4.1).
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, OrchestratorError> {
        if let Some(token) = self.cancel_tokens.lock().expect("cancel_tokens mutex poisoned").get(&task_id) {
            token.cancel();
        }

        let cancelled = dispatch::cancel_task(self.pool(), task_id).await?;
        if cancelled {
            self.emit(Some(task_id), None, EventKind::TaskCancelled, serde_json::Value::Null).await?;
        }
        Ok(cancelled)
    }

    /// Record an out-of-band approval grant and transition the task from
    /// `awaiting_approval` to `running` (spec §4.4).
    pub async fn grant_approval(&self, task_id: Uuid, approver_id: &str) -> Result<(), OrchestratorError> {
        let task = self.require_task(task_id).await?;
        if task.status != TaskStatus::AwaitingApproval {
            return Err(OrchestratorError::Conflict(task_id, "grant_approval", format!("status is {}, expected awaiting_approval", task.status)));
        }

        let results = safety_results::list_for_operation(self.pool(), task_id).await?;
        if let Some(pending) = results.iter().find(|r| r.requires_approval && r.approved_at.is_none()) {
            safety_results::record_approval(self.pool(), pending.id, approver_id).await?;
        }

        dispatch::begin_running_from_approval(self.pool(), task_id).await?;
        self.emit(Some(task_id), task.plan_id, EventKind::ApprovalGranted, serde_json::json!({"approved_by": approver_id})).await?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        self.require_task(task_id).await
    }

    pub async fn list_tasks(&self, filters: &TaskFilters) -> Result<Vec<Task>, OrchestratorError> {
        Ok(task_db::list_tasks(self.pool(), filters).await?)
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> Result<Plan, OrchestratorError> {
        plan_db::get_plan(self.pool(), plan_id).await?.ok_or(OrchestratorError::NotFound(plan_id))
    }

    pub async fn get_task_events(&self, task_id: Uuid, limit: Option<i64>) -> Result<Vec<Event>, OrchestratorError> {
        Ok(events::list_events_for_task(self.pool(), task_id, limit).await?)
    }

    pub async fn get_latest_checkpoint(&self, task_id: Uuid) -> Result<Option<Checkpoint>, OrchestratorError> {
        Ok(checkpoints::get_latest(self.pool(), task_id).await?)
    }

    pub async fn get_statistics(&self) -> Result<TaskStatistics, OrchestratorError> {
        Ok(task_db::get_statistics(self.pool()).await?)
    }

    async fn require_task(&self, task_id: Uuid) -> Result<Task, OrchestratorError> {
        task_db::get_task(self.pool(), task_id).await?.ok_or(OrchestratorError::NotFound(task_id))
    }

    async fn emit(&self, task_id: Option<Uuid>, plan_id: Option<Uuid>, kind: EventKind, payload: serde_json::Value) -> Result<(), OrchestratorError> {
        events::insert_event(self.pool(), task_id, plan_id, kind, payload).await?;
        Ok(())
    }
}
