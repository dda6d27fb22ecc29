//! The Safety Engine (C4): declarative, statically-registered checks
//! evaluated at the `pre`, `during`, and `post` phases of a task's
//! execution (spec §4.4).
//!
//! Checks are pure predicate functions of `(task, plan, latest_state)` --
//! no I/O, no mutation -- mirroring the teacher's invariant/gate split
//! between "pure check logic" and "the runner that records results".

pub mod builtin;

use std::collections::HashMap;

use nimbus_db::models::{Plan, SafetyPhase, Severity, Task};

use crate::checkpoint::CheckpointState;

/// A predicate function: given the task, its plan, and the latest
/// checkpoint state (if any), decide whether the check passes.
pub type Predicate = fn(&Task, &Plan, Option<&CheckpointState>) -> CheckVerdict;

/// What a single predicate evaluation concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckVerdict {
    pub passed: bool,
    pub message: String,
}

impl CheckVerdict {
    pub fn pass() -> Self {
        Self { passed: true, message: String::new() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { passed: false, message: message.into() }
    }
}

/// A declarative, statically-registered safety check.
#[derive(Clone, Copy)]
pub struct SafetyCheck {
    pub id: &'static str,
    pub phase: SafetyPhase,
    pub category: &'static str,
    pub severity: Severity,
    /// Whether a failure of this check, at `warning` severity, suspends
    /// the task for human approval rather than merely logging (spec
    /// §4.4: "warning with requires_approval").
    pub requires_approval: bool,
    pub predicate: Predicate,
}

/// Error returned when two checks are registered under the same id.
#[derive(Debug, Clone, thiserror::Error)]
#[error("a safety check with id {0:?} is already registered")]
pub struct DuplicateCheckError(pub String);

/// The set of safety checks active for this engine instance, built once at
/// startup from [`builtin::all`] plus any caller-supplied extensions.
pub struct SafetyRegistry {
    checks: HashMap<&'static str, SafetyCheck>,
}

impl SafetyRegistry {
    /// Build a registry containing only the built-in checks.
    pub fn with_builtins() -> Self {
        let mut registry = Self { checks: HashMap::new() };
        for check in builtin::all() {
            registry.register(check).expect("built-in safety checks must have unique ids");
        }
        registry
    }

    pub fn empty() -> Self {
        Self { checks: HashMap::new() }
    }

    /// Register a check. Fails if a check with the same id already exists.
    pub fn register(&mut self, check: SafetyCheck) -> Result<(), DuplicateCheckError> {
        if self.checks.contains_key(check.id) {
            return Err(DuplicateCheckError(check.id.to_string()));
        }
        self.checks.insert(check.id, check);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn for_phase(&self, phase: SafetyPhase) -> impl Iterator<Item = &SafetyCheck> {
        self.checks.values().filter(move |c| c.phase == phase)
    }

    /// Every registered check, in no particular order. Used by the
    /// `GET /api/safety/checks` surface to advertise what is active.
    pub fn all(&self) -> impl Iterator<Item = &SafetyCheck> {
        self.checks.values()
    }
}

/// One check's outcome, ready to be persisted via
/// `nimbus_db::queries::safety_results::insert`.
#[derive(Debug, Clone)]
pub struct EvaluatedCheck {
    pub check_id: &'static str,
    pub category: &'static str,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
    pub requires_approval: bool,
}

/// The aggregate decision after evaluating every check registered for a
/// phase (spec §4.4 flow).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyOutcome {
    /// Every check passed, or only non-blocking warnings failed.
    Passed,
    /// A `critical` check failed: the task must not proceed.
    Blocked { check_id: String, message: String },
    /// A `warning` check with `requires_approval` failed: the task must
    /// suspend pending `grant_approval`.
    ApprovalRequired { check_id: String, message: String },
}

/// Evaluate every check registered for `phase` against `(task, plan,
/// state)`, returning both the per-check results (for persistence) and the
/// aggregate verdict that governs the state machine.
///
/// Per spec §4.4: a failing check flagged `requires_approval` always
/// suspends the task for human approval rather than hard-blocking, even at
/// `critical` severity (the worked example `prod_requires_approval` is
/// registered exactly this way); any other `critical` failure blocks
/// outright. Everything else is recorded but does not change flow.
pub fn evaluate(
    registry: &SafetyRegistry,
    phase: SafetyPhase,
    task: &Task,
    plan: &Plan,
    state: Option<&CheckpointState>,
) -> (Vec<EvaluatedCheck>, SafetyOutcome) {
    let mut results = Vec::new();
    let mut blocked: Option<(String, String)> = None;
    let mut approval: Option<(String, String)> = None;

    for check in registry.for_phase(phase) {
        let verdict = (check.predicate)(task, plan, state);
        if !verdict.passed {
            if check.requires_approval && approval.is_none() {
                approval = Some((check.id.to_string(), verdict.message.clone()));
            } else if check.severity == Severity::Critical && blocked.is_none() {
                blocked = Some((check.id.to_string(), verdict.message.clone()));
            }
        }
        results.push(EvaluatedCheck {
            check_id: check.id,
            category: check.category,
            severity: check.severity,
            passed: verdict.passed,
            message: verdict.message,
            requires_approval: check.requires_approval,
        });
    }

    let outcome = if let Some((check_id, message)) = approval {
        SafetyOutcome::ApprovalRequired { check_id, message }
    } else if let Some((check_id, message)) = blocked {
        SafetyOutcome::Blocked { check_id, message }
    } else {
        SafetyOutcome::Passed
    };

    (results, outcome)
}
