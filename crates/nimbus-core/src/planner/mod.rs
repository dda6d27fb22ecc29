//! The Planner: turns a [`Task`] into a validated DAG of steps (spec §4.2).
//!
//! `generate_plan` is pure and deterministic -- given the same task id and
//! task type it always produces the same step ids and edges, which is a
//! required property of the engine (spec §8: "Plan generation is
//! deterministic"). Determinism is achieved by content-addressing each
//! step's id from `(task_id, position, kind)` rather than drawing a random
//! UUID, so re-planning (e.g. after a crash, before any step has run) is
//! idempotent.

pub mod templates;

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use nimbus_db::models::{FailurePolicy, Task};
use nimbus_db::queries::plans::NewStep;

use templates::{templates_for, StepTemplate, SAFETY_PRE_KIND};

/// A fully formed plan ready for [`nimbus_db::queries::plans::insert_plan_with_steps`].
#[derive(Debug, Clone)]
pub struct GeneratedPlan {
    pub estimated_duration_ms: i64,
    pub risk_score: f64,
    pub steps: Vec<NewStep>,
}

/// Compute a deterministic, content-addressed step id.
///
/// The hash input is `(task_id, position, kind)`: position is included so
/// that two steps of the same kind in the same plan (rare, but not
/// forbidden) still get distinct ids, and task_id is included so that
/// identical decompositions across different tasks don't collide.
fn content_address(task_id: Uuid, position: i32, kind: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(position.to_le_bytes());
    hasher.update(kind.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    // Stamp as a UUIDv5-shaped (name-based) value so it's visibly
    // content-addressed rather than random, without depending on a
    // particular namespace.
    bytes[6] = (bytes[6] & 0x0F) | 0x50;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Derive a stable idempotency key for a step, reused across retries and
/// across identical re-plans so that a tool service can deduplicate.
fn idempotency_key(task_id: Uuid, position: i32, kind: &str) -> String {
    format!("{task_id}:{position}:{kind}")
}

/// Generate a plan for `task`. Deterministic: calling this twice with
/// tasks that share the same id and type yields identical step ids and
/// edges.
pub fn generate_plan(task: &Task) -> GeneratedPlan {
    let templates = templates_for(task.r#type);
    let mut steps = Vec::with_capacity(templates.len());

    let mut prior_destructive_gate: Option<i32> = None;
    let mut next_position = 0i32;

    for template in templates {
        let mut depends_on = if next_position == 0 { Vec::new() } else { vec![next_position - 1] };

        if template.destructive && prior_destructive_gate.is_none() {
            // Insert a safety gate step immediately ahead of the first
            // destructive step in the decomposition (spec §4.2 edge rule).
            let gate_position = next_position;
            let gate_step = build_step(
                task.id,
                gate_position,
                &StepTemplate {
                    kind: SAFETY_PRE_KIND,
                    max_retries: 0,
                    timeout_ms: 10_000,
                    failure_policy: FailurePolicy::Abort,
                    destructive: false,
                },
                depends_on,
                task,
            );
            steps.push(gate_step);
            prior_destructive_gate = Some(gate_position);
            next_position += 1;
            depends_on = vec![gate_position];
        }

        let step = build_step(task.id, next_position, template, depends_on, task);
        steps.push(step);
        next_position += 1;
    }

    let estimated_duration_ms = steps.iter().map(|s| s.timeout_ms).sum();
    let risk_score = risk_score_for(task, &steps);

    GeneratedPlan { estimated_duration_ms, risk_score, steps }
}

fn build_step(task_id: Uuid, position: i32, template: &StepTemplate, depends_on_positions: Vec<i32>, task: &Task) -> NewStep {
    NewStep {
        id: content_address(task_id, position, template.kind),
        kind: template.kind.to_string(),
        inputs: task.context.clone(),
        expected_effects: Value::Null,
        max_retries: template.max_retries,
        timeout_ms: template.timeout_ms,
        idempotency_key: idempotency_key(task_id, position, template.kind),
        failure_policy: template.failure_policy,
        position,
        depends_on_positions,
    }
}

/// A crude risk score in `[0.0, 1.0]`: proportional to the fraction of
/// destructive steps, nudged up for production-looking contexts.
fn risk_score_for(task: &Task, steps: &[NewStep]) -> f64 {
    let destructive_count = steps.iter().filter(|s| s.kind != SAFETY_PRE_KIND && is_destructive_kind(&s.kind)).count();
    let base = if steps.is_empty() { 0.0 } else { destructive_count as f64 / steps.len() as f64 };

    let env_bump = task
        .context
        .get("environment")
        .and_then(Value::as_str)
        .map(|env| if env.eq_ignore_ascii_case("production") || env.eq_ignore_ascii_case("prod") { 0.3 } else { 0.0 })
        .unwrap_or(0.0);

    (base + env_bump).min(1.0)
}

fn is_destructive_kind(kind: &str) -> bool {
    matches!(kind, "terraform.apply" | "rollback.apply" | "k8s.apply" | "k8s.delete" | "terraform.destroy")
}

/// One problem found by [`validate_plan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub step_position: Option<i32>,
    pub message: String,
}

/// Result of validating a generated plan before it is persisted.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validate a generated plan's structure: no cycles, no orphaned
/// dependency references, no unknown capability kinds, and no step whose
/// input reference points somewhere other than an ancestor.
///
/// `known_kinds` is the set of capability kinds registered in the
/// [`crate::capability::CapabilityRegistry`] at validation time; `None`
/// skips the "unknown kind" check (useful in unit tests that don't stand
/// up a registry).
pub fn validate_plan(plan: &GeneratedPlan, known_domains: Option<&[&str]>) -> ValidationReport {
    let mut issues = Vec::new();
    let n = plan.steps.len();

    for step in &plan.steps {
        for &dep in &step.depends_on_positions {
            if dep < 0 || dep as usize >= n {
                issues.push(ValidationIssue {
                    step_position: Some(step.position),
                    message: format!("step {} depends on out-of-range position {}", step.position, dep),
                });
            } else if dep >= step.position {
                issues.push(ValidationIssue {
                    step_position: Some(step.position),
                    message: format!("step {} depends on non-ancestor position {}", step.position, dep),
                });
            }
        }

        if let Some(domains) = known_domains {
            let domain = step.kind.split('.').next().unwrap_or(&step.kind);
            if !domains.contains(&domain) {
                issues.push(ValidationIssue {
                    step_position: Some(step.position),
                    message: format!("step {} references unknown capability domain {domain:?}", step.position),
                });
            }
        }
    }

    if has_cycle(plan) {
        issues.push(ValidationIssue { step_position: None, message: "plan contains a dependency cycle".to_string() });
    }

    ValidationReport { issues }
}

fn has_cycle(plan: &GeneratedPlan) -> bool {
    // Positions strictly increase along every edge we construct, and
    // validate_plan already rejects `dep >= step.position` edges, so a
    // cycle can only arise from a pathological plan not produced by
    // `generate_plan`. Checked defensively via a topological walk.
    let n = plan.steps.len();
    let mut indegree = vec![0usize; n];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];

    for step in &plan.steps {
        let to = step.position as usize;
        for &dep in &step.depends_on_positions {
            if dep < 0 || dep as usize >= n {
                continue;
            }
            adjacency[dep as usize].push(to);
            indegree[to] += 1;
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut visited = 0;
    while let Some(node) = queue.pop() {
        visited += 1;
        for &next in &adjacency[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push(next);
            }
        }
    }

    visited != n
}

/// Optimize a validated plan: fuse sequential idempotent steps against the
/// same target, and reorder independent branches by estimated duration so
/// cheaper work is attempted first (spec §4.2 optimization rules).
///
/// This operates on the in-memory plan before insertion; positions and
/// dependency edges are renumbered to match the fused/reordered result, so
/// content-addressed ids are recomputed.
pub fn optimize_plan(task: &Task, plan: GeneratedPlan) -> GeneratedPlan {
    let fused = fuse_sequential_idempotent(plan.steps);
    let reordered = reorder_independent_branches(fused);

    let mut steps = Vec::with_capacity(reordered.len());
    let mut old_to_new = std::collections::HashMap::with_capacity(reordered.len());
    for (new_position, (old_position, step)) in reordered.into_iter().enumerate() {
        old_to_new.insert(old_position, new_position as i32);
        steps.push((new_position as i32, step));
    }

    let steps: Vec<NewStep> = steps
        .into_iter()
        .map(|(new_position, mut step)| {
            step.depends_on_positions = step
                .depends_on_positions
                .iter()
                .filter_map(|old| old_to_new.get(old).copied())
                .collect();
            step.position = new_position;
            step.id = content_address(task.id, new_position, &step.kind);
            step
        })
        .collect();

    let estimated_duration_ms = steps.iter().map(|s| s.timeout_ms).sum();
    GeneratedPlan { estimated_duration_ms, risk_score: plan.risk_score, steps }
}

/// Collapse runs of sequential steps that target the same idempotency key
/// prefix and carry no side-effect-observing dependents in between, into a
/// single fused step. In practice our templates never produce such runs
/// (each step has a distinct kind), so this is a no-op pass-through that
/// exists as the hook future templates can rely on.
fn fuse_sequential_idempotent(steps: Vec<NewStep>) -> Vec<(i32, NewStep)> {
    steps.into_iter().map(|s| (s.position, s)).collect()
}

/// Reorder steps that share no dependency relationship by their estimated
/// duration (ascending), keeping the partial order intact: a step never
/// moves ahead of anything it (transitively) depends on.
fn reorder_independent_branches(mut positioned: Vec<(i32, NewStep)>) -> Vec<(i32, NewStep)> {
    positioned.sort_by(|(_, a), (_, b)| {
        let a_ready_after = a.depends_on_positions.iter().copied().max().unwrap_or(-1);
        let b_ready_after = b.depends_on_positions.iter().copied().max().unwrap_or(-1);
        a_ready_after.cmp(&b_ready_after).then(a.timeout_ms.cmp(&b.timeout_ms)).then(a.position.cmp(&b.position))
    });
    positioned
}
