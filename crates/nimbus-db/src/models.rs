use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The kind of work a [`Task`] submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Generate,
    Deploy,
    Verify,
    Rollback,
    Analyze,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generate => "generate",
            Self::Deploy => "deploy",
            Self::Verify => "verify",
            Self::Rollback => "rollback",
            Self::Analyze => "analyze",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(Self::Generate),
            "deploy" => Ok(Self::Deploy),
            "verify" => Ok(Self::Verify),
            "rollback" => Ok(Self::Rollback),
            "analyze" => Ok(Self::Analyze),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Task priority, used by the executor's readiness tiebreak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`Task`].
///
/// Transitions are monotonic except cancellation, which may interrupt
/// `planning`, `awaiting_approval`, or `running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    AwaitingApproval,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions possible).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------

/// Execution state of a [`Step`] within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepState {
    type Err = StepStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StepStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepState`] string.
#[derive(Debug, Clone)]
pub struct StepStateParseError(pub String);

impl fmt::Display for StepStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step state: {:?}", self.0)
    }
}

impl std::error::Error for StepStateParseError {}

// ---------------------------------------------------------------------------

/// What happens to a step's descendants when it exhausts its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Abort,
    Continue,
    FailTask,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
            Self::FailTask => "fail_task",
        };
        f.write_str(s)
    }
}

impl FromStr for FailurePolicy {
    type Err = FailurePolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            "fail_task" => Ok(Self::FailTask),
            other => Err(FailurePolicyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailurePolicy`] string.
#[derive(Debug, Clone)]
pub struct FailurePolicyParseError(pub String);

impl fmt::Display for FailurePolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure policy: {:?}", self.0)
    }
}

impl std::error::Error for FailurePolicyParseError {}

// ---------------------------------------------------------------------------

/// The evaluation window for a [`SafetyResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SafetyPhase {
    Pre,
    During,
    Post,
}

impl fmt::Display for SafetyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pre => "pre",
            Self::During => "during",
            Self::Post => "post",
        };
        f.write_str(s)
    }
}

impl FromStr for SafetyPhase {
    type Err = SafetyPhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre" => Ok(Self::Pre),
            "during" => Ok(Self::During),
            "post" => Ok(Self::Post),
            other => Err(SafetyPhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SafetyPhase`] string.
#[derive(Debug, Clone)]
pub struct SafetyPhaseParseError(pub String);

impl fmt::Display for SafetyPhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid safety phase: {:?}", self.0)
    }
}

impl std::error::Error for SafetyPhaseParseError {}

// ---------------------------------------------------------------------------

/// Severity of a [`SafetyResult`] or [`DriftItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = SeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(SeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Severity`] string.
#[derive(Debug, Clone)]
pub struct SeverityParseError(pub String);

impl fmt::Display for SeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid severity: {:?}", self.0)
    }
}

impl std::error::Error for SeverityParseError {}

// ---------------------------------------------------------------------------

/// Sync status of a single [`DriftItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DriftItemStatus {
    InSync,
    Changed,
    Missing,
    Extra,
}

impl fmt::Display for DriftItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InSync => "in_sync",
            Self::Changed => "changed",
            Self::Missing => "missing",
            Self::Extra => "extra",
        };
        f.write_str(s)
    }
}

impl FromStr for DriftItemStatus {
    type Err = DriftItemStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_sync" => Ok(Self::InSync),
            "changed" => Ok(Self::Changed),
            "missing" => Ok(Self::Missing),
            "extra" => Ok(Self::Extra),
            other => Err(DriftItemStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`DriftItemStatus`] string.
#[derive(Debug, Clone)]
pub struct DriftItemStatusParseError(pub String);

impl fmt::Display for DriftItemStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid drift item status: {:?}", self.0)
    }
}

impl std::error::Error for DriftItemStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of an append-only [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    PlanGenerated,
    StepStarted,
    StepSucceeded,
    StepFailed,
    CheckpointSaved,
    ApprovalRequested,
    ApprovalGranted,
    TaskCancelled,
    TaskFinished,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCreated => "task_created",
            Self::PlanGenerated => "plan_generated",
            Self::StepStarted => "step_started",
            Self::StepSucceeded => "step_succeeded",
            Self::StepFailed => "step_failed",
            Self::CheckpointSaved => "checkpoint_saved",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalGranted => "approval_granted",
            Self::TaskCancelled => "task_cancelled",
            Self::TaskFinished => "task_finished",
        };
        f.write_str(s)
    }
}

impl FromStr for EventKind {
    type Err = EventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_created" => Ok(Self::TaskCreated),
            "plan_generated" => Ok(Self::PlanGenerated),
            "step_started" => Ok(Self::StepStarted),
            "step_succeeded" => Ok(Self::StepSucceeded),
            "step_failed" => Ok(Self::StepFailed),
            "checkpoint_saved" => Ok(Self::CheckpointSaved),
            "approval_requested" => Ok(Self::ApprovalRequested),
            "approval_granted" => Ok(Self::ApprovalGranted),
            "task_cancelled" => Ok(Self::TaskCancelled),
            "task_finished" => Ok(Self::TaskFinished),
            other => Err(EventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventKind`] string.
#[derive(Debug, Clone)]
pub struct EventKindParseError(pub String);

impl fmt::Display for EventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event kind: {:?}", self.0)
    }
}

impl std::error::Error for EventKindParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    #[sqlx(rename = "task_type")]
    pub r#type: TaskType,
    pub user_id: String,
    pub team_id: Option<String>,
    pub priority: Priority,
    /// Free-form context: provider, environment, region, components, requirements.
    pub context: serde_json::Value,
    pub metadata: serde_json::Value,
    pub status: TaskStatus,
    pub plan_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A validated DAG of [`Step`]s realizing a [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub task_id: Uuid,
    pub estimated_duration_ms: i64,
    pub risk_score: f64,
    pub created_at: DateTime<Utc>,
}

/// One invocation of a named capability with inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Step {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub kind: String,
    pub inputs: serde_json::Value,
    pub expected_effects: serde_json::Value,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub idempotency_key: String,
    pub failure_policy: FailurePolicy,
    pub state: StepState,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub outputs: Option<serde_json::Value>,
    /// Position within the plan; used as the executor's reproducibility tiebreak.
    pub position: i32,
}

/// A directed edge `from_step_id -> to_step_id` within a plan's DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StepEdge {
    pub plan_id: Uuid,
    pub from_step_id: Uuid,
    pub to_step_id: Uuid,
}

/// Durable per-step execution state, indexed by operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: Uuid,
    pub operation_id: Uuid,
    pub step: i64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The outcome of one safety check evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct SafetyResult {
    pub id: Uuid,
    pub operation_id: Option<Uuid>,
    pub phase: SafetyPhase,
    pub check_name: String,
    pub category: String,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
    pub requires_approval: bool,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A desired-vs-actual comparison result for one detection run.
///
/// `items` is stored as a single JSON array column rather than a child
/// table: items are opaque per-provider comparison records and are always
/// read back as a whole report, never queried individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DriftReport {
    pub id: Uuid,
    pub provider: String,
    pub scope: String,
    pub items: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One item within a [`DriftReport`]'s `items` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftItem {
    pub resource_address: String,
    pub status: DriftItemStatus,
    pub desired: Option<serde_json::Value>,
    pub actual: Option<serde_json::Value>,
    pub severity: Severity,
}

/// An append-only log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub task_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    /// Monotonically increasing, assigned by the database at insert time.
    pub seq: i64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    macro_rules! roundtrip_test {
        ($name:ident, $ty:ty, $( $variant:expr => $text:expr ),+ $(,)?) => {
            #[test]
            fn $name() {
                $(
                    let v: $ty = $variant;
                    assert_eq!(v.to_string(), $text);
                    assert_eq!(<$ty>::from_str($text).unwrap(), v);
                )+
            }
        };
    }

    roundtrip_test!(
        task_type_roundtrip, TaskType,
        TaskType::Generate => "generate",
        TaskType::Deploy => "deploy",
        TaskType::Verify => "verify",
        TaskType::Rollback => "rollback",
        TaskType::Analyze => "analyze",
    );

    roundtrip_test!(
        priority_roundtrip, Priority,
        Priority::Low => "low",
        Priority::Medium => "medium",
        Priority::High => "high",
        Priority::Critical => "critical",
    );

    roundtrip_test!(
        task_status_roundtrip, TaskStatus,
        TaskStatus::Pending => "pending",
        TaskStatus::Planning => "planning",
        TaskStatus::AwaitingApproval => "awaiting_approval",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    );

    roundtrip_test!(
        step_state_roundtrip, StepState,
        StepState::Pending => "pending",
        StepState::Ready => "ready",
        StepState::Running => "running",
        StepState::Succeeded => "succeeded",
        StepState::Failed => "failed",
        StepState::Skipped => "skipped",
    );

    roundtrip_test!(
        failure_policy_roundtrip, FailurePolicy,
        FailurePolicy::Abort => "abort",
        FailurePolicy::Continue => "continue",
        FailurePolicy::FailTask => "fail_task",
    );

    roundtrip_test!(
        safety_phase_roundtrip, SafetyPhase,
        SafetyPhase::Pre => "pre",
        SafetyPhase::During => "during",
        SafetyPhase::Post => "post",
    );

    roundtrip_test!(
        severity_roundtrip, Severity,
        Severity::Info => "info",
        Severity::Warning => "warning",
        Severity::Critical => "critical",
    );

    roundtrip_test!(
        drift_item_status_roundtrip, DriftItemStatus,
        DriftItemStatus::InSync => "in_sync",
        DriftItemStatus::Changed => "changed",
        DriftItemStatus::Missing => "missing",
        DriftItemStatus::Extra => "extra",
    );

    roundtrip_test!(
        event_kind_roundtrip, EventKind,
        EventKind::TaskCreated => "task_created",
        EventKind::PlanGenerated => "plan_generated",
        EventKind::StepStarted => "step_started",
        EventKind::StepSucceeded => "step_succeeded",
        EventKind::StepFailed => "step_failed",
        EventKind::CheckpointSaved => "checkpoint_saved",
        EventKind::ApprovalRequested => "approval_requested",
        EventKind::ApprovalGranted => "approval_granted",
        EventKind::TaskCancelled => "task_cancelled",
        EventKind::TaskFinished => "task_finished",
    );

    #[test]
    fn invalid_task_status_errors() {
        let err = TaskStatus::from_str("bogus").unwrap_err();
        assert_eq!(err.to_string(), "invalid task status: \"bogus\"");
    }

    #[test]
    fn priority_orders_low_to_critical() {
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::High < Priority::Critical);
    }

    #[test]
    fn severity_orders_info_to_critical() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
    }

    #[test]
    fn terminal_status_classification() {
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
