//! Shared test harness for `nimbus-core` integration tests: a scriptable
//! mock [`CapabilityPort`] standing in for the real HTTP-backed tool
//! services, plus a temp-database bootstrap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use nimbus_core::capability::{CapabilityError, CapabilityErrorKind, CapabilityOutcome, CapabilityPort, CapabilityRegistry};

/// One scripted response for a single invocation of a capability kind.
#[derive(Clone)]
pub enum Scripted {
    Ok(Value),
    Err(CapabilityErrorKind),
}

/// A [`CapabilityPort`] whose responses are scripted per capability kind:
/// each call to `invoke("kind", ...)` pops the next [`Scripted`] entry
/// queued for that kind. Kinds with no queued entries (or an exhausted
/// queue) succeed with an empty output, so tests only need to script the
/// behavior they care about.
pub struct MockProvider {
    name: String,
    scripts: Mutex<HashMap<String, Vec<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), scripts: Mutex::new(HashMap::new()), calls: Mutex::new(Vec::new()) }
    }

    /// Queue a sequence of responses for `kind`, consumed in order.
    /// Takes `&self` (interior mutability) so it can be called through an
    /// `Arc` the registry also holds a clone of.
    pub fn script(&self, kind: &str, responses: Vec<Scripted>) -> &Self {
        self.scripts.lock().unwrap().insert(kind.to_string(), responses);
        self
    }

    pub fn call_count(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| k.as_str() == kind).count()
    }
}

impl MockProvider {
    async fn do_invoke(&self, kind: &str) -> Result<CapabilityOutcome, CapabilityError> {
        self.calls.lock().unwrap().push(kind.to_string());

        let mut scripts = self.scripts.lock().unwrap();
        let next = scripts.get_mut(kind).and_then(|queue| if queue.is_empty() { None } else { Some(queue.remove(0)) });

        match next {
            Some(Scripted::Ok(outputs)) => Ok(CapabilityOutcome { outputs }),
            Some(Scripted::Err(err_kind)) => Err(CapabilityError::new(err_kind, format!("scripted failure ({err_kind:?})"))),
            None => Ok(CapabilityOutcome::default()),
        }
    }
}

#[async_trait]
impl CapabilityPort for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        kind: &str,
        _inputs: &Value,
        _deadline: Duration,
        _cancel: CancellationToken,
    ) -> Result<CapabilityOutcome, CapabilityError> {
        self.do_invoke(kind).await
    }
}

/// Delegating impl so a test can hold its own `Arc<MockProvider>` for
/// scripting/assertions while the registry owns a clone of the same `Arc`.
#[async_trait]
impl CapabilityPort for Arc<MockProvider> {
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    async fn invoke(
        &self,
        kind: &str,
        inputs: &Value,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<CapabilityOutcome, CapabilityError> {
        self.as_ref().invoke(kind, inputs, deadline, cancel).await
    }
}

pub const ALL_DEPLOY_DOMAINS: &[&str] =
    &["terraform", "state", "safety", "drift", "policy", "checkpoint", "rollback", "k8s", "git", "helm", "fs", "llm"];

/// Stand up a registry covering every domain referenced by any task-type
/// template, each backed by a plain (unscripted, always-succeeds)
/// [`MockProvider`].
pub fn full_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for domain in ALL_DEPLOY_DOMAINS {
        registry.register(MockProvider::new(domain));
    }
    registry
}

/// Build a registry covering every deploy-relevant domain, but with a
/// caller-supplied, independently scriptable provider swapped in for
/// `domain`. Returns the registry plus the `Arc` the test can script.
pub fn full_registry_with_scripted(domain: &str) -> (CapabilityRegistry, Arc<MockProvider>) {
    let mut registry = CapabilityRegistry::new();
    let mut scripted = None;
    for d in ALL_DEPLOY_DOMAINS {
        if *d == domain {
            let provider = Arc::new(MockProvider::new(d));
            registry.register(provider.clone());
            scripted = Some(provider);
        } else {
            registry.register(MockProvider::new(d));
        }
    }
    (registry, scripted.expect("domain must be one of ALL_DEPLOY_DOMAINS"))
}
