//! On-disk CLI configuration: `~/.config/nimbus/config.toml`.
//!
//! Resolution chain for every setting (spec §6, §9 ambient stack): CLI flag
//! > environment variable > config file > compile-time default. The
//! environment-variable layer is handled by `nimbus_db::config::DbConfig`
//! and `nimbus_core::token::TokenConfig` themselves; this module only adds
//! the config-file layer underneath them and the CLI-flag layer above.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use nimbus_core::capability::http::RateLimitConfig;
use nimbus_core::token::TokenConfig;
use nimbus_db::config::DbConfig;

/// On-disk shape of `config.toml`. Every field is optional: an absent
/// section simply falls through to the next link in the resolution chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub auth: AuthSection,
    /// Tool services reachable via
    /// [`nimbus_core::capability::http::HttpCapabilityClient`], one entry
    /// per capability domain (e.g. `terraform`, `k8s`).
    #[serde(default)]
    pub capabilities: Vec<CapabilitySection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret shared with every tool service.
    pub token_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySection {
    pub name: String,
    pub base_url: String,
}

/// Directory holding `config.toml` and any other per-user Nimbus state.
pub fn config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("nimbus")
}

fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load `config.toml`, returning an empty [`ConfigFile`] if it doesn't
/// exist yet (every field falls through to its default in that case).
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write `config.toml`, creating the config directory if needed and
/// restricting permissions to the owner (it carries the token secret).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let dir = config_dir();
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    let path = config_path();
    let mut file = fs::File::create(&path).with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents.as_bytes()).with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Generate a fresh 32-byte HMAC secret, hex-encoded for storage in
/// `config.toml` or the `INTERNAL_SERVICE_TOKEN` environment variable.
pub fn generate_token_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Fully-resolved configuration for a `nimbus` invocation, built by
/// [`NimbusConfig::resolve`] from every layer of the chain.
#[derive(Debug, Clone)]
pub struct NimbusConfig {
    pub db_config: DbConfig,
    pub token_config: TokenConfig,
    pub rate_limit: RateLimitConfig,
    pub capabilities: Vec<CapabilitySection>,
}

impl NimbusConfig {
    /// Resolve settings in priority order: CLI flag, then environment
    /// variable, then `config.toml`, then compile-time default.
    ///
    /// `cli_database_url` and `cli_token_secret` are the values of the
    /// corresponding top-level CLI flags, if the caller passed them.
    pub fn resolve(cli_database_url: Option<&str>, cli_token_secret: Option<&str>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let database_url = cli_database_url
            .map(str::to_string)
            .or_else(|| std::env::var("STATE_SERVICE_URL").ok())
            .or_else(|| std::env::var("NIMBUS_DATABASE_URL").ok())
            .or_else(|| file.database.url.clone())
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_string());
        let db_config = DbConfig::new(database_url);

        let token_secret_hex = cli_token_secret
            .map(str::to_string)
            .or_else(|| std::env::var("INTERNAL_SERVICE_TOKEN").ok())
            .or_else(|| file.auth.token_secret.clone())
            .context("no token secret configured: pass --token-secret, set INTERNAL_SERVICE_TOKEN, or run `nimbus init`")?;
        let secret = hex::decode(&token_secret_hex).context("token secret is not valid hex")?;
        let token_config = TokenConfig::new(secret);

        Ok(Self {
            db_config,
            token_config,
            rate_limit: RateLimitConfig::from_env(),
            capabilities: file.capabilities,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_is_64_hex_chars() {
        let secret = generate_token_secret();
        assert_eq!(secret.len(), 64);
        assert!(hex::decode(&secret).is_ok());
    }

    #[test]
    fn empty_config_file_round_trips() {
        let config = ConfigFile::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&serialized).unwrap();
        assert!(parsed.database.url.is_none());
        assert!(parsed.auth.token_secret.is_none());
        assert!(parsed.capabilities.is_empty());
    }

    #[test]
    fn config_file_with_capabilities_round_trips() {
        let config = ConfigFile {
            database: DatabaseSection { url: Some("postgresql://localhost/nimbus".to_string()) },
            auth: AuthSection { token_secret: Some("deadbeef".to_string()) },
            capabilities: vec![CapabilitySection { name: "terraform".to_string(), base_url: "http://localhost:9001".to_string() }],
        };
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: ConfigFile = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.database.url.as_deref(), Some("postgresql://localhost/nimbus"));
        assert_eq!(parsed.capabilities.len(), 1);
        assert_eq!(parsed.capabilities[0].name, "terraform");
    }
}
