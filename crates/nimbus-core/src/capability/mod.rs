//! The Capability Port -- the interface the Executor uses to invoke a
//! named remote operation (e.g. `terraform.plan`) on a tool service.
//!
//! Each concrete tool service adapter implements [`CapabilityPort`]. The
//! trait is object-safe so it can be stored as `Box<dyn CapabilityPort>` in
//! a [`CapabilityRegistry`].

pub mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Error kinds a capability invocation can report (spec §4.3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityErrorKind {
    #[error("capability not available")]
    NotAvailable,
    #[error("bad input")]
    BadInput,
    #[error("transient failure")]
    Transient,
    #[error("permanent failure")]
    Permanent,
    #[error("conflict")]
    Conflict,
    #[error("timeout")]
    Timeout,
}

impl CapabilityErrorKind {
    /// Whether this error kind should be retried by the Executor (spec §4.3
    /// step 4: timeout, transient network, rate-limit are retryable).
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

/// An error returned by a capability invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("capability error ({kind}): {message}")]
pub struct CapabilityError {
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// The result of a successful capability invocation.
#[derive(Debug, Clone, Default)]
pub struct CapabilityOutcome {
    pub outputs: Value,
}

/// Adapter interface for invoking a remote capability.
///
/// Implementors wrap a specific tool service (terraform, k8s, helm, aws,
/// git) and translate its HTTP+JSON surface into this common interface.
///
/// # Object Safety
///
/// Every method returns a concrete, boxed-future type via `#[async_trait]`,
/// so `Box<dyn CapabilityPort>` can be stored in [`CapabilityRegistry`].
#[async_trait]
pub trait CapabilityPort: Send + Sync {
    /// Human-readable name for this capability provider (e.g. "terraform").
    fn name(&self) -> &str;

    /// Invoke `kind` (e.g. `"terraform.apply"`) with `inputs`, aborting if
    /// `deadline` elapses or `cancel` fires first.
    async fn invoke(
        &self,
        kind: &str,
        inputs: &Value,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<CapabilityOutcome, CapabilityError>;
}

// Compile-time assertion: CapabilityPort must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn CapabilityPort) {}
};

/// A named collection of registered [`CapabilityPort`] implementations,
/// keyed by the domain prefix of the capability kind (the text before the
/// first `.`, e.g. `"terraform"` for `"terraform.apply"`).
#[derive(Default)]
pub struct CapabilityRegistry {
    providers: std::collections::HashMap<String, Box<dyn CapabilityPort>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability provider under its own name.
    pub fn register(&mut self, provider: impl CapabilityPort + 'static) -> Option<Box<dyn CapabilityPort>> {
        let name = provider.name().to_string();
        self.providers.insert(name, Box::new(provider))
    }

    /// Look up the provider for a capability `kind` by its domain prefix.
    pub fn get_for_kind(&self, kind: &str) -> Option<&dyn CapabilityPort> {
        let domain = kind.split('.').next().unwrap_or(kind);
        self.providers.get(domain).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Invoke the capability `kind` via its registered provider.
    pub async fn invoke(
        &self,
        kind: &str,
        inputs: &Value,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<CapabilityOutcome, CapabilityError> {
        let provider = self.get_for_kind(kind).ok_or_else(|| {
            CapabilityError::new(
                CapabilityErrorKind::NotAvailable,
                format!("no capability provider registered for kind {kind:?}"),
            )
        })?;
        provider.invoke(kind, inputs, deadline, cancel).await
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
