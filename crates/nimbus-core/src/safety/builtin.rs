//! Worked-example built-in checks, one per category named in spec §4.4
//! (environment, destructive-action confirmation, rate).
//!
//! Each predicate is pure: it reads only `(task, plan, state)` and never
//! touches the database or network.

use nimbus_db::models::{Plan, SafetyPhase, Severity, Task};

use super::{CheckVerdict, SafetyCheck};
use crate::checkpoint::CheckpointState;

fn is_production(task: &Task) -> bool {
    task.context
        .get("environment")
        .and_then(serde_json::Value::as_str)
        .map(|env| env.eq_ignore_ascii_case("prod") || env.eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}

/// Category: environment (prod protection). Registered at `critical`
/// severity but flagged `requires_approval`, so a failure suspends the
/// task for human sign-off rather than hard-blocking it (spec §8 scenario
/// 2). Only fires when the plan actually carries a destructive step --
/// a prod deploy made entirely of read-only steps does not need sign-off.
fn prod_requires_approval(task: &Task, plan: &Plan, _state: Option<&CheckpointState>) -> CheckVerdict {
    if is_production(task) && plan.risk_score > 0.0 {
        CheckVerdict::fail("task targets a production environment and its plan includes a destructive step, requiring explicit approval")
    } else {
        CheckVerdict::pass()
    }
}

/// Category: destructive-action confirmation. Warns whenever the plan
/// contains at least one step template marked destructive, without
/// suspending execution.
fn destructive_action_confirmation(_task: &Task, plan: &Plan, _state: Option<&CheckpointState>) -> CheckVerdict {
    if plan.risk_score > 0.0 {
        CheckVerdict::fail(format!("plan includes destructive steps (risk_score={:.2})", plan.risk_score))
    } else {
        CheckVerdict::pass()
    }
}

/// Category: rate. A conservative warning that the plan's estimated
/// duration may exceed a single rate-limit window; the actual limiting is
/// enforced by [`crate::capability::http::HttpCapabilityClient`], this
/// check only surfaces the risk for visibility.
fn rate_limit_headroom(_task: &Task, plan: &Plan, _state: Option<&CheckpointState>) -> CheckVerdict {
    const ONE_MINUTE_MS: i64 = 60_000;
    if plan.estimated_duration_ms > ONE_MINUTE_MS * 10 {
        CheckVerdict::fail("plan's estimated duration may exhaust rate-limit headroom for a single-window burst")
    } else {
        CheckVerdict::pass()
    }
}

/// All built-in checks, registered at engine startup by
/// [`super::SafetyRegistry::with_builtins`].
pub fn all() -> Vec<SafetyCheck> {
    vec![
        SafetyCheck {
            id: "prod_requires_approval",
            phase: SafetyPhase::Pre,
            category: "environment",
            severity: Severity::Critical,
            requires_approval: true,
            predicate: prod_requires_approval,
        },
        SafetyCheck {
            id: "destructive_action_confirmation",
            phase: SafetyPhase::Pre,
            category: "destructive-action",
            severity: Severity::Warning,
            requires_approval: false,
            predicate: destructive_action_confirmation,
        },
        SafetyCheck {
            id: "rate_limit_headroom",
            phase: SafetyPhase::Pre,
            category: "rate",
            severity: Severity::Warning,
            requires_approval: false,
            predicate: rate_limit_headroom,
        },
    ]
}
