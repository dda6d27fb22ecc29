//! The HTTP API surface (spec §6): task lifecycle, plan inspection, safety
//! checks, drift, and rollback, each wrapped in a `{success, data?, error?}`
//! envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use nimbus_core::capability::CapabilityRegistry;
use nimbus_core::drift;
use nimbus_core::executor::ExecutorConfig;
use nimbus_core::orchestrator::{Orchestrator, TaskSpec};
use nimbus_core::planner;
use nimbus_core::rollback::{self, RollbackOptions};
use nimbus_core::safety::SafetyRegistry;
use nimbus_db::queries::{drift_reports, plans, tasks};

use crate::plan_support;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<CapabilityRegistry>,
    safety: Arc<SafetyRegistry>,
    executor_config: ExecutorConfig,
    pool: PgPool,
}

/// Error type for every handler, rendered as `{success: false, error}` with
/// the appropriate status code.
enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<nimbus_core::orchestrator::OrchestratorError> for AppError {
    fn from(err: nimbus_core::orchestrator::OrchestratorError) -> Self {
        use nimbus_core::orchestrator::OrchestratorError as E;
        match err {
            E::NotFound(id) => Self::NotFound(format!("task {id} not found")),
            E::Conflict(..) => Self::Conflict(err.to_string()),
            E::PlanInvalid(_) => Self::BadRequest(err.to_string()),
            E::SafetyBlocked { .. } => Self::Conflict(err.to_string()),
            E::Cancelled => Self::Conflict(err.to_string()),
            E::NoCheckpoint(_) => Self::NotFound(err.to_string()),
            E::CapabilityFailed { .. } | E::Timeout | E::Internal(_) => {
                Self::Internal(anyhow::anyhow!(err.to_string()))
            }
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg),
            Self::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        };
        (status, Json(Envelope::<()>::error(message))).into_response()
    }
}

/// `{success, data?, error?}`, per spec §6.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None }
    }

    fn error(message: String) -> Self {
        Self { success: false, data: None, error: Some(message) }
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, AppError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope::ok(data)))
}

pub async fn run_serve(engine: &crate::setup::Engine, pool: PgPool, bind: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState {
        orchestrator: engine.orchestrator.clone(),
        registry: engine.registry.clone(),
        safety: engine.safety.clone(),
        executor_config: engine.executor_config.clone(),
        pool,
    };
    let router = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "nimbus serve listening");
    axum::serve(listener, router).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(submit_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/execute", post(execute_task))
        .route("/api/tasks/{id}/resume", post(resume_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/approve", post(approve_task))
        .route("/api/tasks/{id}/events", get(task_events))
        .route("/api/tasks/{id}/rollback", post(rollback_run))
        .route("/api/tasks/{id}/rollback/check", get(rollback_check))
        .route("/api/plans/generate", post(plan_generate))
        .route("/api/plans/{id}", get(plan_get))
        .route("/api/plans/{id}/validate", post(plan_validate))
        .route("/api/plans/{id}/optimize", post(plan_optimize))
        .route("/api/safety/checks", get(safety_checks))
        .route("/api/drift/detect", post(drift_detect))
        .route("/api/drift/{id}/plan", post(drift_plan))
        .route("/api/drift/{id}/fix", post(drift_fix))
        .route("/api/drift/{id}/compliance", get(drift_compliance))
        .route("/api/rollback/states", get(rollback_states))
        .route("/api/rollback/cleanup", post(rollback_cleanup))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SubmitTaskRequest {
    #[serde(rename = "type")]
    task_type: nimbus_db::models::TaskType,
    user_id: String,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    priority: Option<nimbus_db::models::Priority>,
    #[serde(default)]
    context: serde_json::Value,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn submit_task(State(state): State<AppState>, Json(req): Json<SubmitTaskRequest>) -> ApiResult<nimbus_db::models::Task> {
    let task = state
        .orchestrator
        .create_task(TaskSpec {
            task_type: req.task_type,
            user_id: req.user_id,
            team_id: req.team_id,
            priority: req.priority.unwrap_or(nimbus_db::models::Priority::Medium),
            context: req.context,
            metadata: req.metadata,
        })
        .await?;
    ok(task)
}

#[derive(Deserialize)]
struct TaskListQuery {
    status: Option<String>,
    user_id: Option<String>,
    team_id: Option<String>,
    #[serde(rename = "type")]
    task_type: Option<String>,
}

async fn list_tasks(State(state): State<AppState>, Query(q): Query<TaskListQuery>) -> ApiResult<Vec<nimbus_db::models::Task>> {
    let filters = tasks::TaskFilters {
        status: q.status.as_deref().map(str::parse).transpose().map_err(|e: nimbus_db::models::TaskStatusParseError| AppError::BadRequest(e.to_string()))?,
        user_id: q.user_id,
        team_id: q.team_id,
        task_type: q.task_type.as_deref().map(str::parse).transpose().map_err(|e: nimbus_db::models::TaskTypeParseError| AppError::BadRequest(e.to_string()))?,
    };
    let tasks = state.orchestrator.list_tasks(&filters).await?;
    ok(tasks)
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<nimbus_db::models::Task> {
    let task = state.orchestrator.get_task(id).await?;
    ok(task)
}

async fn execute_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<nimbus_db::models::Task> {
    let task = state.orchestrator.execute_task(id).await?;
    ok(task)
}

async fn resume_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<nimbus_db::models::Task> {
    let task = state.orchestrator.resume_task(id).await?;
    ok(task)
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<serde_json::Value> {
    let cancelled = state.orchestrator.cancel_task(id).await?;
    ok(serde_json::json!({ "cancelled": cancelled }))
}

#[derive(Deserialize)]
struct ApproveRequest {
    approver_id: String,
}

async fn approve_task(State(state): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<ApproveRequest>) -> ApiResult<serde_json::Value> {
    state.orchestrator.grant_approval(id, &req.approver_id).await?;
    ok(serde_json::json!({ "approved": true }))
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<i64>,
}

async fn task_events(State(state): State<AppState>, Path(id): Path<Uuid>, Query(q): Query<EventsQuery>) -> ApiResult<Vec<nimbus_db::models::Event>> {
    let events = state.orchestrator.get_task_events(id, q.limit).await?;
    ok(events)
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PlanGenerateRequest {
    task_id: Uuid,
}

#[derive(Serialize)]
struct PlanPreviewResponse {
    estimated_duration_ms: i64,
    risk_score: f64,
    step_count: usize,
    valid: bool,
    issues: Vec<String>,
}

async fn plan_generate(State(state): State<AppState>, Json(req): Json<PlanGenerateRequest>) -> ApiResult<PlanPreviewResponse> {
    let task = tasks::get_task(&state.pool, req.task_id).await?.ok_or_else(|| AppError::NotFound(format!("task {} not found", req.task_id)))?;
    let generated = planner::generate_plan(&task);
    let generated = planner::optimize_plan(&task, generated);
    let report = planner::validate_plan(&generated, Some(&state.registry.list()));
    ok(PlanPreviewResponse {
        estimated_duration_ms: generated.estimated_duration_ms,
        risk_score: generated.risk_score,
        step_count: generated.steps.len(),
        valid: report.is_valid(),
        issues: report.issues.into_iter().map(|i| i.message).collect(),
    })
}

#[derive(Serialize)]
struct PlanDetailResponse {
    plan: nimbus_db::models::Plan,
    steps: Vec<nimbus_db::models::Step>,
    edges: Vec<nimbus_db::models::StepEdge>,
}

async fn plan_get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<PlanDetailResponse> {
    let plan = plans::get_plan(&state.pool, id).await?.ok_or_else(|| AppError::NotFound(format!("plan {id} not found")))?;
    let steps = plans::get_steps_for_plan(&state.pool, id).await?;
    let edges = plans::get_edges_for_plan(&state.pool, id).await?;
    ok(PlanDetailResponse { plan, steps, edges })
}

async fn plan_validate(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<serde_json::Value> {
    let generated = plan_support::reconstruct_generated_plan(&state.pool, id).await?;
    let report = planner::validate_plan(&generated, Some(&state.registry.list()));
    ok(serde_json::json!({
        "valid": report.is_valid(),
        "issues": report.issues.iter().map(|i| serde_json::json!({"step_position": i.step_position, "message": i.message})).collect::<Vec<_>>(),
    }))
}

async fn plan_optimize(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<PlanPreviewResponse> {
    let plan = plans::get_plan(&state.pool, id).await?.ok_or_else(|| AppError::NotFound(format!("plan {id} not found")))?;
    let task = tasks::get_task(&state.pool, plan.task_id).await?.ok_or_else(|| AppError::NotFound(format!("task {} not found", plan.task_id)))?;
    let generated = plan_support::reconstruct_generated_plan(&state.pool, id).await?;
    let optimized = planner::optimize_plan(&task, generated);
    let report = planner::validate_plan(&optimized, Some(&state.registry.list()));
    ok(PlanPreviewResponse {
        estimated_duration_ms: optimized.estimated_duration_ms,
        risk_score: optimized.risk_score,
        step_count: optimized.steps.len(),
        valid: report.is_valid(),
        issues: report.issues.into_iter().map(|i| i.message).collect(),
    })
}

// ---------------------------------------------------------------------------
// Safety
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct SafetyCheckSummary {
    id: &'static str,
    phase: nimbus_db::models::SafetyPhase,
    category: &'static str,
    severity: nimbus_db::models::Severity,
    requires_approval: bool,
}

async fn safety_checks(State(state): State<AppState>) -> ApiResult<Vec<SafetyCheckSummary>> {
    let checks: Vec<_> = state
        .safety
        .all()
        .map(|c| SafetyCheckSummary { id: c.id, phase: c.phase, category: c.category, severity: c.severity, requires_approval: c.requires_approval })
        .collect();
    ok(checks)
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct DriftDetectRequest {
    provider: String,
    scope: String,
    #[serde(default)]
    desired: serde_json::Map<String, serde_json::Value>,
}

async fn drift_detect(State(state): State<AppState>, Json(req): Json<DriftDetectRequest>) -> ApiResult<nimbus_db::models::DriftReport> {
    let desired: nimbus_core::drift::DesiredState = req.desired.into_iter().collect();
    let report = drift::detect(&state.pool, &state.registry, &req.provider, &req.scope, &desired, CancellationToken::new()).await?;
    ok(report)
}

async fn drift_plan(State(state): State<AppState>, Path(report_id): Path<Uuid>) -> ApiResult<serde_json::Value> {
    let report = drift_reports::get(&state.pool, report_id).await?.ok_or_else(|| AppError::NotFound(format!("drift report {report_id} not found")))?;
    let generated = drift::create_remediation_plan(Uuid::new_v4(), &report.provider, &report)?;
    ok(serde_json::json!({
        "estimated_duration_ms": generated.estimated_duration_ms,
        "risk_score": generated.risk_score,
        "steps": generated.steps.iter().map(|s| serde_json::json!({"kind": s.kind, "inputs": s.inputs})).collect::<Vec<_>>(),
    }))
}

#[derive(Deserialize)]
struct DriftFixRequest {
    task_id: Uuid,
}

async fn drift_fix(State(state): State<AppState>, Path(report_id): Path<Uuid>, Json(req): Json<DriftFixRequest>) -> ApiResult<serde_json::Value> {
    let report = drift_reports::get(&state.pool, report_id).await?.ok_or_else(|| AppError::NotFound(format!("drift report {report_id} not found")))?;
    let task = state.orchestrator.get_task(req.task_id).await?;
    let outcome = drift::remediate(&state.pool, &state.registry, &state.safety, &task, &report.provider, &report, CancellationToken::new(), &state.executor_config).await?;
    ok(serde_json::json!({ "outcome": format!("{outcome:?}") }))
}

async fn drift_compliance(State(state): State<AppState>, Path(report_id): Path<Uuid>) -> ApiResult<serde_json::Value> {
    let report = drift_reports::get(&state.pool, report_id).await?.ok_or_else(|| AppError::NotFound(format!("drift report {report_id} not found")))?;
    let compliance = drift::generate_compliance_report(&report)?;
    ok(serde_json::json!({
        "total_items": compliance.total_items,
        "in_sync": compliance.in_sync,
        "changed": compliance.changed,
        "missing": compliance.missing,
        "extra": compliance.extra,
        "critical_count": compliance.critical_count,
        "warning_count": compliance.warning_count,
        "info_count": compliance.info_count,
        "percent_in_sync": compliance.percent_in_sync,
    }))
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[derive(Deserialize, Default)]
struct RollbackRunRequest {
    #[serde(default)]
    force: bool,
    #[serde(default)]
    dry_run: bool,
    #[serde(default)]
    targets: Vec<String>,
}

async fn rollback_run(State(state): State<AppState>, Path(id): Path<Uuid>, Json(req): Json<RollbackRunRequest>) -> ApiResult<serde_json::Value> {
    let task = state.orchestrator.get_task(id).await?;
    let plan_id = task.plan_id.ok_or_else(|| AppError::BadRequest("task has no plan to roll back".to_string()))?;
    let options = RollbackOptions { force: req.force, dry_run: req.dry_run, targets: req.targets };
    let result = rollback::run_rollback(&state.pool, &state.registry, &state.safety, &task, plan_id, &options, CancellationToken::new(), &state.executor_config).await?;
    match result {
        rollback::RollbackResult::Planned(plan) => ok(serde_json::json!({ "executed": false, "summary": plan.summary })),
        rollback::RollbackResult::Executed { plan, outcome } => ok(serde_json::json!({ "executed": true, "summary": plan.summary, "outcome": format!("{outcome:?}") })),
    }
}

async fn rollback_check(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<serde_json::Value> {
    let task = state.orchestrator.get_task(id).await?;
    let plan_id = task.plan_id.ok_or_else(|| AppError::BadRequest("task has no plan".to_string()))?;
    let availability = rollback::can_rollback(&state.pool, plan_id).await?;
    ok(serde_json::json!({
        "available": availability.available,
        "reason": availability.reason,
        "succeeded_step_count": availability.succeeded_step_count,
    }))
}

async fn rollback_states(State(state): State<AppState>) -> ApiResult<Vec<Uuid>> {
    let plan_ids = rollback::list_rollback_states(&state.pool).await?;
    ok(plan_ids)
}

#[derive(Deserialize, Default)]
struct RollbackCleanupRequest {
    #[serde(default)]
    max_age_hours: Option<i64>,
}

async fn rollback_cleanup(State(state): State<AppState>, Json(req): Json<RollbackCleanupRequest>) -> ApiResult<serde_json::Value> {
    let max_age = chrono::Duration::hours(req.max_age_hours.unwrap_or(24 * 30));
    let deleted = rollback::cleanup_old_states(&state.pool, max_age).await?;
    ok(serde_json::json!({ "deleted": deleted }))
}
