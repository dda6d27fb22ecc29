//! Drift Subsystem (C7): detects divergence between desired and actual
//! infrastructure state, and turns a [`nimbus_db::models::DriftReport`]
//! into a remediation [`crate::planner::GeneratedPlan`] (spec §4.7).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use nimbus_db::models::{DriftItem, DriftItemStatus, DriftReport, FailurePolicy, Severity};
use nimbus_db::queries::drift_reports;
use sqlx::PgPool;

use std::sync::Arc;

use nimbus_db::models::Task;

use crate::capability::{CapabilityOutcome, CapabilityRegistry};
use crate::executor::{self, ExecutorConfig, ExecutorOutcome};
use crate::planner::GeneratedPlan;
use crate::safety::SafetyRegistry;

/// Fields injected by the tool service rather than declared by the user;
/// stripped from both sides before equality comparison so that, e.g., a
/// freshly re-read `updated_at` timestamp is never reported as drift.
const SERVER_INJECTED_FIELDS: &[&str] = &["id", "created_at", "updated_at", "resource_version", "generation", "uid"];

/// Recursively remove server-injected fields from a JSON value so two
/// otherwise-identical resources compare equal regardless of provider
/// bookkeeping.
fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut normalized = serde_json::Map::new();
            for (k, v) in map {
                if SERVER_INJECTED_FIELDS.contains(&k.as_str()) {
                    continue;
                }
                normalized.insert(k.clone(), normalize(v));
            }
            Value::Object(normalized)
        }
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Desired state for detection: a map from resource address to its
/// declared configuration (as read from IaC files or manifests upstream
/// of this module).
pub type DesiredState = BTreeMap<String, Value>;

/// Query the tool service for `provider`'s actual state over `scope`, via
/// the `<provider>.describe` capability, then diff it against `desired`.
///
/// Every address present in `desired` but absent from the response is
/// `missing`; every address present in the response but absent from
/// `desired` is `extra`; addresses in both are `in_sync` or `changed`
/// depending on normalized equality.
pub async fn detect(
    pool: &PgPool,
    registry: &CapabilityRegistry,
    provider: &str,
    scope: &str,
    desired: &DesiredState,
    cancel: CancellationToken,
) -> Result<DriftReport> {
    let kind = format!("{provider}.describe");
    let outcome: CapabilityOutcome = registry
        .invoke(&kind, &Value::Null, Duration::from_secs(120), cancel)
        .await
        .with_context(|| format!("failed to describe actual state for provider {provider:?}"))?;

    let actual: BTreeMap<String, Value> = serde_json::from_value(outcome.outputs)
        .context("describe response did not contain a resource-address-keyed object")?;

    let mut addresses: Vec<&String> = desired.keys().chain(actual.keys()).collect();
    addresses.sort();
    addresses.dedup();

    let mut items = Vec::with_capacity(addresses.len());
    for address in addresses {
        let desired_value = desired.get(address);
        let actual_value = actual.get(address);

        let (status, severity) = match (desired_value, actual_value) {
            (Some(_), None) => (DriftItemStatus::Missing, Severity::Critical),
            (None, Some(_)) => (DriftItemStatus::Extra, Severity::Warning),
            (Some(d), Some(a)) if normalize(d) == normalize(a) => (DriftItemStatus::InSync, Severity::Info),
            (Some(_), Some(_)) => (DriftItemStatus::Changed, Severity::Warning),
            (None, None) => unreachable!("address came from the union of both key sets"),
        };

        items.push(DriftItem {
            resource_address: address.clone(),
            status,
            desired: desired_value.cloned(),
            actual: actual_value.cloned(),
            severity,
        });
    }

    let items_json = serde_json::to_value(&items).context("failed to serialize drift items")?;
    drift_reports::insert(pool, provider, scope, items_json).await
}

/// Decode a persisted [`DriftReport`]'s `items` column back into
/// structured [`DriftItem`]s.
pub fn items_of(report: &DriftReport) -> Result<Vec<DriftItem>> {
    serde_json::from_value(report.items.clone()).context("failed to decode drift report items")
}

/// Build a remediation plan from a drift report: one step per
/// non-`in_sync` item, mapped to `update`/`create`/`delete` against the
/// item's provider.
///
/// `update` and `create` both resolve to `<provider>.apply` (the tool
/// service distinguishes them by whether the resource already exists);
/// `delete` (an `extra` item) resolves to `<provider>.destroy`.
pub fn create_remediation_plan(task_id: Uuid, provider: &str, report: &DriftReport) -> Result<GeneratedPlan> {
    let items = items_of(report)?;
    let mut steps = Vec::new();
    let mut position = 0i32;

    for item in items.iter().filter(|i| i.status != DriftItemStatus::InSync) {
        let kind = match item.status {
            DriftItemStatus::Missing | DriftItemStatus::Changed => format!("{provider}.apply"),
            DriftItemStatus::Extra => format!("{provider}.destroy"),
            DriftItemStatus::InSync => continue,
        };

        let inputs = serde_json::json!({
            "target": item.resource_address,
            "desired": item.desired,
        });

        steps.push(nimbus_db::queries::plans::NewStep {
            id: remediation_step_id(task_id, position, &kind, &item.resource_address),
            kind,
            inputs,
            expected_effects: Value::Null,
            max_retries: 2,
            timeout_ms: 300_000,
            idempotency_key: format!("{task_id}:remediate:{}", item.resource_address),
            failure_policy: FailurePolicy::Continue,
            position,
            depends_on_positions: Vec::new(),
        });
        position += 1;
    }

    let estimated_duration_ms = steps.iter().map(|s| s.timeout_ms).sum();
    Ok(GeneratedPlan { estimated_duration_ms, risk_score: if steps.is_empty() { 0.0 } else { 0.5 }, steps })
}

fn remediation_step_id(task_id: Uuid, position: i32, kind: &str, address: &str) -> Uuid {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update(position.to_le_bytes());
    hasher.update(kind.as_bytes());
    hasher.update(address.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    bytes[6] = (bytes[6] & 0x0F) | 0x50;
    bytes[8] = (bytes[8] & 0x3F) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Remediate a drift report: build the inverse plan, persist it, and run it
/// to completion through the Executor (spec §4.7: "`remediate(options)` is
/// `create_remediation_plan` followed by `Executor.run`").
///
/// `task` provides the execution context (the `during`-phase safety checks
/// evaluate against it); it is not mutated, and its `status` is left
/// untouched regardless of outcome, since a remediation run is its own unit
/// of work rather than a resumption of the task's own lifecycle.
pub async fn remediate(
    pool: &PgPool,
    registry: &Arc<CapabilityRegistry>,
    safety: &Arc<SafetyRegistry>,
    task: &Task,
    provider: &str,
    report: &DriftReport,
    cancel: CancellationToken,
    executor_config: &ExecutorConfig,
) -> Result<ExecutorOutcome> {
    let generated = create_remediation_plan(task.id, provider, report)?;
    if generated.steps.is_empty() {
        return Ok(ExecutorOutcome::Completed);
    }

    let validation = crate::planner::validate_plan(&generated, Some(&registry.list()));
    if !validation.is_valid() {
        anyhow::bail!("remediation plan failed validation: {:?}", validation.issues);
    }

    let (plan, _steps) = nimbus_db::queries::plans::insert_plan_with_steps(
        pool,
        task.id,
        generated.estimated_duration_ms,
        generated.risk_score,
        &generated.steps,
    )
    .await
    .context("failed to persist remediation plan")?;

    executor::run(pool, registry, safety, task, &plan, cancel, executor_config).await
}

/// Aggregated compliance summary over a drift report: counts by severity
/// and the percentage of items already in sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplianceReport {
    pub total_items: usize,
    pub in_sync: usize,
    pub changed: usize,
    pub missing: usize,
    pub extra: usize,
    pub critical_count: usize,
    pub warning_count: usize,
    pub info_count: usize,
    pub percent_in_sync: f64,
}

pub fn generate_compliance_report(report: &DriftReport) -> Result<ComplianceReport> {
    let items = items_of(report)?;
    let total_items = items.len();

    let mut result = ComplianceReport {
        total_items,
        in_sync: 0,
        changed: 0,
        missing: 0,
        extra: 0,
        critical_count: 0,
        warning_count: 0,
        info_count: 0,
        percent_in_sync: 100.0,
    };

    for item in &items {
        match item.status {
            DriftItemStatus::InSync => result.in_sync += 1,
            DriftItemStatus::Changed => result.changed += 1,
            DriftItemStatus::Missing => result.missing += 1,
            DriftItemStatus::Extra => result.extra += 1,
        }
        match item.severity {
            Severity::Critical => result.critical_count += 1,
            Severity::Warning => result.warning_count += 1,
            Severity::Info => result.info_count += 1,
        }
    }

    if total_items > 0 {
        result.percent_in_sync = (result.in_sync as f64 / total_items as f64) * 100.0;
    }

    Ok(result)
}
