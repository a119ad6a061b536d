use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};

use crate::replicator::{ChunkFailurePolicy, MAX_BATCH_SIZE};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BODY_LIMIT_BYTES: usize = 50 * 1024 * 1024;
pub const DEFAULT_FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com";
pub const DEFAULT_STORAGE_BASE_URL: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub body_limit_bytes: usize,
    pub batch_size: usize,
    pub chunk_failure_policy: ChunkFailurePolicy,
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub shutdown_drain: Duration,
    pub staging_timeout: Duration,
    pub remote: RemoteConfig,
}

/// Which remote store receives replicated trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteBackend {
    /// Local staging only.
    #[default]
    None,
    Memory,
    Document,
    Tree,
    Blob,
}

impl FromStr for RemoteBackend {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "memory" => Ok(Self::Memory),
            "document" | "firestore" => Ok(Self::Document),
            "tree" | "realtime" => Ok(Self::Tree),
            "blob" | "storage" => Ok(Self::Blob),
            other => Err(format!(
                "unknown remote backend '{other}' (expected none, memory, document, tree or blob)"
            )),
        }
    }
}

/// Credential material for remote stores. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub backend: RemoteBackend,
    pub access_token: Option<AccessToken>,
    pub request_timeout: Duration,
    pub firestore_base_url: String,
    pub firestore_project_id: Option<String>,
    pub database_url: Option<String>,
    pub storage_base_url: String,
    pub storage_bucket: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            backend: RemoteBackend::None,
            access_token: None,
            request_timeout: Duration::from_secs(30),
            firestore_base_url: DEFAULT_FIRESTORE_BASE_URL.to_string(),
            firestore_project_id: None,
            database_url: None,
            storage_base_url: DEFAULT_STORAGE_BASE_URL.to_string(),
            storage_bucket: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let optional = |key: &str| -> Option<String> {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = env("PORT", &DEFAULT_PORT.to_string())
            .parse::<u16>()
            .context("PORT must be a valid port number")?;
        let host = env("BIND_HOST", "0.0.0.0");
        let bind_addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .with_context(|| format!("BIND_HOST '{host}' must be an IP address"))?;

        let data_dir = PathBuf::from(env("DATA_DIR", "data"));

        let body_limit_bytes = env("BODY_LIMIT_BYTES", &DEFAULT_BODY_LIMIT_BYTES.to_string())
            .parse::<usize>()
            .context("BODY_LIMIT_BYTES must be usize")?;

        let batch_size = env("BATCH_SIZE", &MAX_BATCH_SIZE.to_string())
            .parse::<usize>()
            .context("BATCH_SIZE must be usize")?;
        if batch_size == 0 || batch_size > MAX_BATCH_SIZE {
            bail!("BATCH_SIZE must be between 1 and {MAX_BATCH_SIZE}");
        }

        let chunk_failure_policy = env("CHUNK_FAILURE_POLICY", "continue")
            .parse::<ChunkFailurePolicy>()
            .map_err(anyhow::Error::msg)?;

        let queue_capacity = env("QUEUE_CAPACITY", "1024")
            .parse::<usize>()
            .context("QUEUE_CAPACITY must be usize")?
            .max(1);
        let max_in_flight = env("MAX_IN_FLIGHT", "4")
            .parse::<usize>()
            .context("MAX_IN_FLIGHT must be usize")?
            .max(1);

        let shutdown_drain = Duration::from_secs(
            env("SHUTDOWN_DRAIN_SECS", "30")
                .parse::<u64>()
                .context("SHUTDOWN_DRAIN_SECS must be u64")?,
        );
        let staging_timeout = Duration::from_secs(
            env("STAGING_TIMEOUT_SECS", "30")
                .parse::<u64>()
                .context("STAGING_TIMEOUT_SECS must be u64")?
                .max(1),
        );

        let remote = RemoteConfig {
            backend: env("REMOTE_BACKEND", "none")
                .parse::<RemoteBackend>()
                .map_err(anyhow::Error::msg)?,
            access_token: optional("REMOTE_ACCESS_TOKEN").map(AccessToken::new),
            request_timeout: Duration::from_secs(
                env("REMOTE_TIMEOUT_SECS", "30")
                    .parse::<u64>()
                    .context("REMOTE_TIMEOUT_SECS must be u64")?
                    .max(1),
            ),
            firestore_base_url: env("FIRESTORE_BASE_URL", DEFAULT_FIRESTORE_BASE_URL),
            firestore_project_id: optional("FIRESTORE_PROJECT_ID"),
            database_url: optional("FIREBASE_DATABASE_URL"),
            storage_base_url: env("STORAGE_BASE_URL", DEFAULT_STORAGE_BASE_URL),
            storage_bucket: optional("STORAGE_BUCKET"),
        };

        Ok(Self {
            bind_addr,
            data_dir,
            body_limit_bytes,
            batch_size,
            chunk_failure_policy,
            queue_capacity,
            max_in_flight,
            shutdown_drain,
            staging_timeout,
            remote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.body_limit_bytes, DEFAULT_BODY_LIMIT_BYTES);
        assert_eq!(config.batch_size, MAX_BATCH_SIZE);
        assert_eq!(config.chunk_failure_policy, ChunkFailurePolicy::Continue);
        assert_eq!(config.remote.backend, RemoteBackend::None);
        assert!(config.remote.access_token.is_none());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = config_from(&[
            ("PORT", "8080"),
            ("BIND_HOST", "127.0.0.1"),
            ("BATCH_SIZE", "250"),
            ("CHUNK_FAILURE_POLICY", "halt"),
            ("REMOTE_BACKEND", "firestore"),
            ("FIRESTORE_PROJECT_ID", "lab-prod"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.chunk_failure_policy, ChunkFailurePolicy::Halt);
        assert_eq!(config.remote.backend, RemoteBackend::Document);
        assert_eq!(config.remote.firestore_project_id.as_deref(), Some("lab-prod"));
    }

    #[test]
    fn batch_size_is_bounded_by_the_atomic_write_limit() {
        assert!(config_from(&[("BATCH_SIZE", "0")]).is_err());
        assert!(config_from(&[("BATCH_SIZE", "501")]).is_err());
        assert!(config_from(&[("REMOTE_BACKEND", "ftp")]).is_err());
    }

    #[test]
    fn access_token_is_redacted_in_debug_output() {
        let config = config_from(&[("REMOTE_ACCESS_TOKEN", "ya29.secret-value")]).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret-value"));
        assert_eq!(
            config.remote.access_token.as_ref().map(AccessToken::expose),
            Some("ya29.secret-value")
        );
    }
}
