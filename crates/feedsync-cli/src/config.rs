use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::{eyre::eyre, Result};
use dirs::config_dir;
use feedsync_client::{client::DEFAULT_ENDPOINT, ClientConfig, RetryPolicy};
use feedsync_session::SessionConfig;
use feedsync_vault::file_vault::VaultOptions;
use serde::{Deserialize, Serialize};

/// User-level configuration loaded from `~/.config/feedsync/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the encrypted credential file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vault_path: Option<PathBuf>,
    pub endpoint: String,
    pub session_ttl_secs: u64,
    pub min_interval_ms: u64,
    pub max_transient_attempts: u32,
    pub max_rate_limited_attempts: u32,
    pub request_timeout_secs: u64,
    /// PBKDF2 rounds; values below 100000 are raised to it.
    pub kdf_iterations: u32,
    /// Store credentials obfuscated when AES is unavailable instead of failing.
    pub allow_weak_fallback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vault_path: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            session_ttl_secs: 24 * 60 * 60,
            min_interval_ms: 1000,
            max_transient_attempts: 3,
            max_rate_limited_attempts: 5,
            request_timeout_secs: 30,
            kdf_iterations: 100_000,
            allow_weak_fallback: false,
        }
    }
}

impl Config {
    pub fn session(&self) -> SessionConfig {
        let secs = i64::try_from(self.session_ttl_secs).unwrap_or(i64::MAX);
        SessionConfig {
            ttl: chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            policy: RetryPolicy::default()
                .with_max_attempts(self.max_transient_attempts, self.max_rate_limited_attempts),
            ..ClientConfig::default()
        }
    }

    pub fn vault(&self) -> VaultOptions {
        VaultOptions {
            kdf_iterations: self.kdf_iterations,
            allow_weak_fallback: self.allow_weak_fallback,
        }
    }
}

/// Load config from the default path and apply `FEEDSYNC_*` overrides.
pub fn load() -> Result<Config> {
    let path = default_path()?;
    let config = load_from_path(path)?;
    apply_env(config, |key| std::env::var(key).ok())
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    Ok(cfg)
}

/// Environment values win over the file.
pub fn apply_env(mut config: Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    if let Some(path) = lookup("FEEDSYNC_VAULT_PATH") {
        config.vault_path = Some(PathBuf::from(path));
    }
    if let Some(endpoint) = lookup("FEEDSYNC_ENDPOINT") {
        config.endpoint = endpoint;
    }
    if let Some(v) = parse_env(&lookup, "FEEDSYNC_SESSION_TTL_SECS")? {
        config.session_ttl_secs = v;
    }
    if let Some(v) = parse_env(&lookup, "FEEDSYNC_MIN_INTERVAL_MS")? {
        config.min_interval_ms = v;
    }
    if let Some(v) = parse_env(&lookup, "FEEDSYNC_MAX_TRANSIENT_ATTEMPTS")? {
        config.max_transient_attempts = v;
    }
    if let Some(v) = parse_env(&lookup, "FEEDSYNC_MAX_RATE_LIMITED_ATTEMPTS")? {
        config.max_rate_limited_attempts = v;
    }
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| eyre!("{key} must be a non-negative integer, got {raw:?}")),
    }
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| eyre!("no config dir available"))?;
    Ok(base.join("feedsync").join("config.toml"))
}

/// Write the given config to disk, creating parent directories as needed.
/// An existing file is left untouched.
pub fn write_default_if_missing(config: &Config) -> Result<PathBuf> {
    write_to_path_if_missing(config, &default_path()?)
}

fn write_to_path_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
