//! Reference [`super::CapabilityPort`] implementation: HTTP+JSON against a
//! sibling tool service, bearing an internal bearer token and gated by a
//! per-service token bucket rate limiter (spec §5, §6).

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::token::{self, TokenConfig};

use super::{CapabilityError, CapabilityErrorKind, CapabilityOutcome, CapabilityPort};

type TokenBucket = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limit configuration for a single tool service (spec §5: default 60
/// req/min, burst 60; excess is queued up to a bounded capacity and
/// rejected beyond it).
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
    /// Maximum number of callers allowed to queue for a permit before
    /// invocations are rejected outright as `not_available`.
    pub max_queue_depth: usize,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let requests_per_minute = std::env::var("RATE_LIMIT_REQ_PER_MIN")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);
        Self { requests_per_minute, burst: requests_per_minute, max_queue_depth: 128 }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { requests_per_minute: 60, burst: 60, max_queue_depth: 128 }
    }
}

/// Envelope every tool service returns, per spec §6: `{success, data?,
/// error?, details?}`.
#[derive(Debug, Deserialize)]
struct CapabilityEnvelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client implementation of [`CapabilityPort`], one instance per tool
/// service base URL.
pub struct HttpCapabilityClient {
    name: String,
    base_url: String,
    client: reqwest::Client,
    token_config: TokenConfig,
    limiter: Arc<TokenBucket>,
    queued: Arc<tokio::sync::Semaphore>,
}

impl HttpCapabilityClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, token_config: TokenConfig, rate_limit: RateLimitConfig) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(rate_limit.requests_per_minute.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(rate_limit.burst.max(1)).unwrap());
        Self {
            name: name.into(),
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            token_config,
            limiter: Arc::new(RateLimiter::direct(quota)),
            queued: Arc::new(tokio::sync::Semaphore::new(rate_limit.max_queue_depth)),
        }
    }
}

#[async_trait]
impl CapabilityPort for HttpCapabilityClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        kind: &str,
        inputs: &Value,
        deadline: Duration,
        cancel: CancellationToken,
    ) -> Result<CapabilityOutcome, CapabilityError> {
        // Bound how many callers may queue for a rate-limit permit; beyond
        // that, reject immediately rather than pile up unboundedly.
        let Ok(_permit) = self.queued.clone().try_acquire_owned() else {
            return Err(CapabilityError::new(
                CapabilityErrorKind::NotAvailable,
                format!("{} rate limiter queue is full", self.name),
            ));
        };

        tokio::select! {
            _ = self.limiter.until_ready() => {}
            _ = cancel.cancelled() => {
                return Err(CapabilityError::new(CapabilityErrorKind::Timeout, "cancelled while queued for rate limit"));
            }
        }

        let path = kind.replacen('.', "/", 1);
        let url = format!("{}/api/{}", self.base_url.trim_end_matches('/'), path);

        let issued_at = chrono::Utc::now().timestamp();
        let service_token = token::generate_token(&self.token_config, &self.name, issued_at);

        let request = self
            .client
            .post(&url)
            .header(token::HEADER_NAME, service_token)
            .json(inputs)
            .timeout(deadline);

        let response = tokio::select! {
            result = request.send() => result,
            _ = cancel.cancelled() => {
                return Err(CapabilityError::new(CapabilityErrorKind::Timeout, "cancelled while waiting for capability RPC"));
            }
        };

        let response = response.map_err(|e| classify_transport_error(&e))?;
        let status = response.status();

        let body: CapabilityEnvelope = response
            .json()
            .await
            .map_err(|e| CapabilityError::new(CapabilityErrorKind::Permanent, format!("invalid response body: {e}")))?;

        if !status.is_success() || !body.success {
            let message = body.error.unwrap_or_else(|| format!("capability call failed with status {status}"));
            let kind = classify_status(status);
            return Err(CapabilityError::new(kind, message));
        }

        Ok(CapabilityOutcome { outputs: body.data.unwrap_or(Value::Null) })
    }
}

fn classify_transport_error(err: &reqwest::Error) -> CapabilityError {
    let kind = if err.is_timeout() {
        CapabilityErrorKind::Timeout
    } else if err.is_connect() {
        CapabilityErrorKind::Transient
    } else {
        CapabilityErrorKind::Permanent
    };
    CapabilityError::new(kind, err.to_string())
}

fn classify_status(status: reqwest::StatusCode) -> CapabilityErrorKind {
    match status.as_u16() {
        409 => CapabilityErrorKind::Conflict,
        408 => CapabilityErrorKind::Timeout,
        429 => CapabilityErrorKind::Transient,
        400..=499 => CapabilityErrorKind::BadInput,
        500..=599 => CapabilityErrorKind::Transient,
        _ => CapabilityErrorKind::Permanent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(reqwest::StatusCode::CONFLICT), CapabilityErrorKind::Conflict);
        assert_eq!(classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS), CapabilityErrorKind::Transient);
        assert_eq!(classify_status(reqwest::StatusCode::BAD_REQUEST), CapabilityErrorKind::BadInput);
        assert_eq!(classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR), CapabilityErrorKind::Transient);
        assert_eq!(classify_status(reqwest::StatusCode::NOT_IMPLEMENTED), CapabilityErrorKind::Transient);
        assert_eq!(classify_status(reqwest::StatusCode::NOT_FOUND), CapabilityErrorKind::BadInput);
    }

    #[test]
    fn rate_limit_config_defaults() {
        let cfg = RateLimitConfig::default();
        assert_eq!(cfg.requests_per_minute, 60);
        assert_eq!(cfg.burst, 60);
    }
}
