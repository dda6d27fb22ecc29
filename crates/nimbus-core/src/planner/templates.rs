//! Declarative per-`TaskType` decomposition rules (spec §4.2).
//!
//! Each [`StepTemplate`] names the capability kind to invoke and the
//! defaults for retry/timeout/failure behavior. `generate_plan` walks a
//! task's template table and turns it into concrete steps -- this module
//! contains no control flow, only data.

use nimbus_db::models::{FailurePolicy, TaskType};

/// One step in a task type's fixed decomposition.
#[derive(Debug, Clone, Copy)]
pub struct StepTemplate {
    /// The capability kind to invoke, e.g. `"terraform.plan"`.
    pub kind: &'static str,
    pub max_retries: i32,
    pub timeout_ms: i64,
    pub failure_policy: FailurePolicy,
    /// Whether this step is destructive and therefore requires a
    /// `safety.pre` gate step as a dependency (spec §4.2 edge rules).
    pub destructive: bool,
}

const fn step(kind: &'static str, max_retries: i32, timeout_ms: i64, failure_policy: FailurePolicy, destructive: bool) -> StepTemplate {
    StepTemplate { kind, max_retries, timeout_ms, failure_policy, destructive }
}

/// Capability kind used for the safety pre-check gate step inserted ahead
/// of any destructive step.
pub const SAFETY_PRE_KIND: &str = "safety.pre";

/// Return the ordered list of step templates for a task type.
///
/// Decomposition rules (spec §4.2):
/// - generate: render templates -> write files -> format -> validate.
/// - deploy: preflight (validate + plan) -> checkpoint desired state ->
///   apply -> post-verify.
/// - verify: drift detect -> compare against policy.
/// - rollback: load last successful checkpoint -> compute inverse steps ->
///   apply.
/// - analyze: drift detect -> compliance report.
pub fn templates_for(task_type: TaskType) -> &'static [StepTemplate] {
    const GENERATE: &[StepTemplate] = &[
        step("llm.render_template", 2, 60_000, FailurePolicy::Abort, false),
        step("fs.write_files", 1, 10_000, FailurePolicy::Abort, false),
        step("fs.format", 2, 15_000, FailurePolicy::Continue, false),
        step("fs.validate", 1, 15_000, FailurePolicy::FailTask, false),
    ];
    const DEPLOY: &[StepTemplate] = &[
        step("terraform.validate", 2, 30_000, FailurePolicy::Abort, false),
        step("terraform.plan", 2, 120_000, FailurePolicy::Abort, false),
        step("state.checkpoint_desired", 1, 10_000, FailurePolicy::Abort, false),
        step("terraform.apply", 1, 900_000, FailurePolicy::FailTask, true),
        step("terraform.verify", 3, 60_000, FailurePolicy::Continue, false),
    ];
    const VERIFY: &[StepTemplate] = &[
        step("drift.detect", 2, 60_000, FailurePolicy::Abort, false),
        step("policy.compare", 1, 30_000, FailurePolicy::FailTask, false),
    ];
    const ROLLBACK: &[StepTemplate] = &[
        step("checkpoint.load_last_successful", 1, 10_000, FailurePolicy::Abort, false),
        step("rollback.compute_inverse", 1, 15_000, FailurePolicy::Abort, false),
        step("rollback.apply", 1, 900_000, FailurePolicy::FailTask, true),
    ];
    const ANALYZE: &[StepTemplate] = &[
        step("drift.detect", 2, 60_000, FailurePolicy::Abort, false),
        step("drift.compliance_report", 1, 15_000, FailurePolicy::Continue, false),
    ];

    match task_type {
        TaskType::Generate => GENERATE,
        TaskType::Deploy => DEPLOY,
        TaskType::Verify => VERIFY,
        TaskType::Rollback => ROLLBACK,
        TaskType::Analyze => ANALYZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_task_type_has_a_nonempty_template() {
        for tt in [TaskType::Generate, TaskType::Deploy, TaskType::Verify, TaskType::Rollback, TaskType::Analyze] {
            assert!(!templates_for(tt).is_empty(), "{tt} has no template");
        }
    }

    #[test]
    fn deploy_apply_step_is_marked_destructive() {
        let apply = templates_for(TaskType::Deploy)
            .iter()
            .find(|s| s.kind == "terraform.apply")
            .unwrap();
        assert!(apply.destructive);
    }
}
