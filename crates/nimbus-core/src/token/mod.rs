//! Scoped bearer tokens for the `x-internal-service-token` header used on
//! every Capability RPC (see spec §6).
//!
//! Tokens are HMAC-SHA256 based, scoped to a (service, issued_at) pair so a
//! leaked token cannot be replayed against a different caller indefinitely.
//! Format: `nimbus_svc_<service>_<issued_at_unix>_<hmac_hex>`

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify Nimbus internal service tokens.
const TOKEN_PREFIX: &str = "nimbus_svc_";

/// Header carrying the token on every outbound Capability RPC.
pub const HEADER_NAME: &str = "x-internal-service-token";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("invalid timestamp in token: {0}")]
    InvalidTimestamp(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes, shared with every tool service.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    /// Create a new `TokenConfig` with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a `TokenConfig` from the `INTERNAL_SERVICE_TOKEN` environment
    /// variable (§6 configuration table).
    ///
    /// The value must be a hex-encoded string. Returns an error if the
    /// variable is missing or contains invalid hex.
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("INTERNAL_SERVICE_TOKEN").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("INTERNAL_SERVICE_TOKEN is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The calling service's name (e.g. `terraform`, `k8s`, `core`).
    pub service: String,
    /// Unix timestamp the token was issued at.
    pub issued_at: i64,
}

/// Generate a scoped internal-service token.
///
/// Format: `nimbus_svc_<service>_<issued_at>_<hmac_hex>` where the
/// HMAC-SHA256 is computed over `<service>:<issued_at>`.
pub fn generate_token(config: &TokenConfig, service: &str, issued_at: i64) -> String {
    let message = format!("{service}:{issued_at}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{service}_{issued_at}_{hmac_hex}")
}

/// Validate a scoped internal-service token and extract its claims.
///
/// 1. Parses the token format.
/// 2. Recomputes the HMAC.
/// 3. Uses constant-time comparison to verify the HMAC.
/// 4. Returns the extracted claims on success.
pub fn validate_token(config: &TokenConfig, token: &str) -> Result<TokenClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat("token must start with 'nimbus_svc_'".to_string())
    })?;

    // Format: <service>_<issued_at>_<hmac_hex>. Split from the right so
    // service names may themselves contain underscores (e.g. "git_commit").
    let (service_and_ts, hmac_hex) = rest
        .rsplit_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("missing hmac segment".to_string()))?;
    let (service, issued_at_str) = service_and_ts
        .rsplit_once('_')
        .ok_or_else(|| TokenError::InvalidFormat("missing timestamp segment".to_string()))?;

    if service.is_empty() {
        return Err(TokenError::InvalidFormat("empty service name".to_string()));
    }

    let issued_at: i64 = issued_at_str
        .parse()
        .map_err(|e: std::num::ParseIntError| TokenError::InvalidTimestamp(e.to_string()))?;

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    let message = format!("{service}:{issued_at}");
    verify_hmac_constant_time(&config.secret, message.as_bytes(), &provided_mac)?;

    Ok(TokenClaims {
        service: service.to_string(),
        issued_at,
    })
}

/// Compute HMAC-SHA256 over the given message with the given key.
fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using constant-time comparison, via `hmac`'s `verify_slice`.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    expected_mac: &[u8],
) -> Result<(), TokenError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(expected_mac)
        .map_err(|_| TokenError::HmacMismatch)
}
