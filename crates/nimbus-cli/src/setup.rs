//! Wires a [`NimbusConfig`] into the engine's injected dependencies: the
//! Capability Port registry, the Safety Engine, and the Orchestrator
//! itself. Every binary entry point (CLI subcommands, `serve`) goes
//! through here so they all see the same tool-service wiring and share a
//! single process-wide step-concurrency semaphore (spec §5: "global step
//! concurrency is capped by a process-wide semaphore" -- constructed once,
//! never per-call).

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::warn;

use nimbus_core::capability::http::HttpCapabilityClient;
use nimbus_core::capability::CapabilityRegistry;
use nimbus_core::executor::ExecutorConfig;
use nimbus_core::orchestrator::{Orchestrator, OrchestratorConfig};
use nimbus_core::safety::SafetyRegistry;
use nimbus_db::queries::tasks;

use crate::config::NimbusConfig;

/// The engine's injected dependencies, constructed once per process and
/// shared by every subcommand/request handler that needs direct access to
/// a piece of it (the Orchestrator itself only exposes task-shaped
/// operations; `drift`/`rollback` commands operate below that layer).
#[derive(Clone)]
pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<CapabilityRegistry>,
    pub safety: Arc<SafetyRegistry>,
    pub executor_config: ExecutorConfig,
}

/// Build the [`CapabilityRegistry`] from the tool services named in
/// `config.toml`'s `[[capabilities]]` table, each reachable over HTTP via
/// [`HttpCapabilityClient`].
fn build_registry(config: &NimbusConfig) -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    for capability in &config.capabilities {
        registry.register(HttpCapabilityClient::new(
            capability.name.clone(),
            capability.base_url.clone(),
            config.token_config.clone(),
            config.rate_limit.clone(),
        ));
    }
    Arc::new(registry)
}

/// Construct the full engine, per spec §9: "single-process singletons...
/// constructed once at startup with injected dependencies; no hidden
/// global mutation."
///
/// Before anything else, recovers tasks left `running`, `planning`, or
/// `awaiting_approval` by a previous process that exited without a clean
/// shutdown -- their executors no longer exist, so they are force-failed
/// rather than left stuck forever.
pub async fn build_engine(pool: PgPool, config: &NimbusConfig) -> Result<Engine> {
    let recovered = tasks::recover_interrupted_tasks(&pool).await.context("failed to recover interrupted tasks at startup")?;
    if recovered > 0 {
        warn!(recovered, "failed tasks left running by a previous process");
    }

    let registry = build_registry(config);
    let safety = Arc::new(SafetyRegistry::with_builtins());
    let orchestrator_config = OrchestratorConfig::from_env();
    let executor_config = orchestrator_config.executor.clone();
    let orchestrator = Arc::new(Orchestrator::new(pool, registry.clone(), safety.clone(), orchestrator_config));
    Ok(Engine { orchestrator, registry, safety, executor_config })
}
