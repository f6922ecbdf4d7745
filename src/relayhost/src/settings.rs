//! Provisioning settings.
//!
//! Built once from compiled defaults, an optional TOML file and `RELAY_*`
//! environment variables, then validated. A [`ProvisionSettings`] value only
//! exists once validation passed, so every stage downstream can trust it.
use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_LISTEN_PORT: &str = "RELAY_LISTEN_PORT";
pub const ENV_TARGET_HOST: &str = "RELAY_TARGET_HOST";
pub const ENV_TARGET_PORT: &str = "RELAY_TARGET_PORT";
pub const ENV_IMAGE: &str = "RELAY_IMAGE";
pub const ENV_CONCURRENCY: &str = "RELAY_CONCURRENCY";
pub const ENV_FD_LIMIT: &str = "RELAY_FD_LIMIT";
pub const ENV_CONNTRACK_MAX: &str = "RELAY_CONNTRACK_MAX";
pub const ENV_MAX_CONNECTIONS: &str = "RELAY_MAX_CONNECTIONS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "RELAY_CONNECT_TIMEOUT_MS";
pub const ENV_HEALTH_TIMEOUT_SECS: &str = "RELAY_HEALTH_TIMEOUT_SECS";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Failed to load settings file {path:?}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// Unvalidated settings. Deserialized from the TOML settings file, then
/// overridden from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsBuilder {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub relay_image_ref: String,
    /// `None` means one worker per host CPU.
    pub worker_concurrency: Option<usize>,
    pub fd_limit: u64,
    pub conntrack_max: u64,
    pub max_upstream_connections: u64,
    pub connect_timeout_ms: u64,
    pub health_timeout_secs: u64,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            target_host: DEFAULT_TARGET_HOST.to_string(),
            target_port: DEFAULT_TARGET_PORT,
            relay_image_ref: DEFAULT_RELAY_IMAGE.to_string(),
            worker_concurrency: None,
            fd_limit: DEFAULT_FD_LIMIT,
            conntrack_max: DEFAULT_CONNTRACK_MAX,
            max_upstream_connections: DEFAULT_MAX_UPSTREAM_CONNECTIONS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT.as_secs(),
        }
    }
}

impl SettingsBuilder {
    /// Parse a TOML settings document over the defaults.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a settings file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let builder = Self::from_toml(&content).map_err(|e| SettingsError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        tracing::info!("[Settings] Loaded settings file {:?}", path);
        Ok(builder)
    }

    /// Override fields from `RELAY_*` variables as returned by `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_LISTEN_PORT) {
            self.listen_port = parse_env(ENV_LISTEN_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_TARGET_HOST) {
            self.target_host = v;
        }
        if let Some(v) = lookup(ENV_TARGET_PORT) {
            self.target_port = parse_env(ENV_TARGET_PORT, &v)?;
        }
        if let Some(v) = lookup(ENV_IMAGE) {
            self.relay_image_ref = v;
        }
        if let Some(v) = lookup(ENV_CONCURRENCY) {
            self.worker_concurrency = Some(parse_env(ENV_CONCURRENCY, &v)?);
        }
        if let Some(v) = lookup(ENV_FD_LIMIT) {
            self.fd_limit = parse_env(ENV_FD_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_CONNTRACK_MAX) {
            self.conntrack_max = parse_env(ENV_CONNTRACK_MAX, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_CONNECTIONS) {
            self.max_upstream_connections = parse_env(ENV_MAX_CONNECTIONS, &v)?;
        }
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            self.connect_timeout_ms = parse_env(ENV_CONNECT_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_HEALTH_TIMEOUT_SECS) {
            self.health_timeout_secs = parse_env(ENV_HEALTH_TIMEOUT_SECS, &v)?;
        }
        Ok(self)
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<ProvisionSettings, SettingsError> {
        if self.listen_port == 0 {
            return Err(invalid("listen_port", "must be in 1-65535"));
        }
        if self.listen_port == ADMIN_PORT {
            return Err(invalid("listen_port", "must differ from the admin port 9901"));
        }
        if self.target_port == 0 {
            return Err(invalid("target_port", "must be in 1-65535"));
        }
        let target_host = self.target_host.trim().to_string();
        if target_host.is_empty() {
            return Err(invalid("target_host", "must not be empty"));
        }
        if target_host.len() > 253 {
            return Err(invalid("target_host", "longer than 253 characters"));
        }
        if !is_plain_token(&target_host) {
            return Err(invalid(
                "target_host",
                "must not contain whitespace or control characters",
            ));
        }
        let relay_image_ref = self.relay_image_ref.trim().to_string();
        if relay_image_ref.is_empty() {
            return Err(invalid("relay_image_ref", "must not be empty"));
        }
        if !is_plain_token(&relay_image_ref) {
            return Err(invalid(
                "relay_image_ref",
                "must not contain whitespace or control characters",
            ));
        }

        let worker_concurrency = match self.worker_concurrency {
            Some(0) => return Err(invalid("worker_concurrency", "must be positive")),
            Some(n) => n,
            None => host_cpu_count(),
        };
        if self.fd_limit == 0 {
            return Err(invalid("fd_limit", "must be positive"));
        }
        if self.conntrack_max == 0 {
            return Err(invalid("conntrack_max", "must be positive"));
        }
        if self.max_upstream_connections == 0 {
            return Err(invalid("max_upstream_connections", "must be positive"));
        }
        let connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        if connect_timeout < MIN_CONNECT_TIMEOUT || connect_timeout > MAX_CONNECT_TIMEOUT {
            return Err(invalid(
                "connect_timeout_ms",
                &format!(
                    "must be between {} and {}",
                    MIN_CONNECT_TIMEOUT.as_millis(),
                    MAX_CONNECT_TIMEOUT.as_millis()
                ),
            ));
        }
        if self.health_timeout_secs == 0 {
            return Err(invalid("health_timeout_secs", "must be positive"));
        }

        Ok(ProvisionSettings {
            listen_port: self.listen_port,
            target_host,
            target_port: self.target_port,
            relay_image_ref,
            worker_concurrency,
            fd_limit: self.fd_limit,
            conntrack_max: self.conntrack_max,
            max_upstream_connections: self.max_upstream_connections,
            connect_timeout,
            health_timeout: Duration::from_secs(self.health_timeout_secs),
        })
    }
}

/// Validated, immutable provisioning settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSettings {
    listen_port: u16,
    target_host: String,
    target_port: u16,
    relay_image_ref: String,
    worker_concurrency: usize,
    fd_limit: u64,
    conntrack_max: u64,
    max_upstream_connections: u64,
    connect_timeout: Duration,
    health_timeout: Duration,
}

impl ProvisionSettings {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// Defaults, then the settings file, then the process environment.
    ///
    /// An explicit `config_path` must exist; the default settings file is
    /// optional.
    pub fn load(config_path: Option<&Path>) -> Result<Self, SettingsError> {
        let builder = match config_path {
            Some(path) => SettingsBuilder::from_file(path)?,
            None if Path::new(SETTINGS_FILE_PATH).exists() => {
                SettingsBuilder::from_file(Path::new(SETTINGS_FILE_PATH))?
            }
            None => {
                tracing::debug!("[Settings] No settings file, using defaults");
                SettingsBuilder::default()
            }
        };
        builder.with_env(|key| std::env::var(key).ok())?.build()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn relay_image_ref(&self) -> &str {
        &self.relay_image_ref
    }

    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency
    }

    pub fn fd_limit(&self) -> u64 {
        self.fd_limit
    }

    pub fn conntrack_max(&self) -> u64 {
        self.conntrack_max
    }

    pub fn max_upstream_connections(&self) -> u64 {
        self.max_upstream_connections
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn health_timeout(&self) -> Duration {
        self.health_timeout
    }
}

fn invalid(field: &'static str, reason: &str) -> SettingsError {
    SettingsError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Env {
        var,
        value: value.to_string(),
    })
}

fn is_plain_token(s: &str) -> bool {
    !s.chars().any(|c| c.is_whitespace() || c.is_control())
}

fn host_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_build() {
        let settings = ProvisionSettings::builder().build().unwrap();
        assert_eq!(settings.listen_port(), 80);
        assert_eq!(settings.fd_limit(), 200_000);
        assert_eq!(settings.conntrack_max(), 524_288);
        assert!(settings.worker_concurrency() >= 1);
    }

    #[test]
    fn test_env_overrides_defaults() {
        let settings = SettingsBuilder::default()
            .with_env(env(&[
                (ENV_LISTEN_PORT, "8080"),
                (ENV_TARGET_HOST, "pool.example.net"),
                (ENV_CONCURRENCY, "6"),
            ]))
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(settings.listen_port(), 8080);
        assert_eq!(settings.target_host(), "pool.example.net");
        assert_eq!(settings.worker_concurrency(), 6);
        assert_eq!(settings.target_port(), DEFAULT_TARGET_PORT);
    }

    #[test]
    fn test_unparseable_env_is_rejected() {
        let err = SettingsBuilder::default()
            .with_env(env(&[(ENV_FD_LIMIT, "lots")]))
            .unwrap_err();
        assert!(matches!(err, SettingsError::Env { var: ENV_FD_LIMIT, .. }));
    }

    #[test]
    fn test_zero_listen_port_rejected() {
        let mut builder = SettingsBuilder::default();
        builder.listen_port = 0;
        let err = builder.build().unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "listen_port", .. }));
    }

    #[test]
    fn test_listen_port_on_admin_port_rejected() {
        let err = SettingsBuilder::default()
            .with_env(env(&[(ENV_LISTEN_PORT, "9901")]))
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "listen_port", .. }));
        assert!(err.to_string().contains("9901"));
    }

    #[test]
    fn test_empty_target_host_rejected() {
        let mut builder = SettingsBuilder::default();
        builder.target_host = "   ".to_string();
        let err = builder.build().unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { field: "target_host", .. }));
    }

    #[test]
    fn test_image_ref_with_whitespace_rejected() {
        let mut builder = SettingsBuilder::default();
        builder.relay_image_ref = "envoy:latest --privileged".to_string();
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut builder = SettingsBuilder::default();
        builder.worker_concurrency = Some(0);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_connect_timeout_bounds() {
        let mut builder = SettingsBuilder::default();
        builder.connect_timeout_ms = 30_000;
        assert!(builder.clone().build().is_err());
        builder.connect_timeout_ms = 500;
        assert_eq!(
            builder.build().unwrap().connect_timeout(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_toml_partial_document() {
        let builder = SettingsBuilder::from_toml(
            r#"
            listen_port = 3333
            target_host = "upstream.internal"
            worker_concurrency = 2
            "#,
        )
        .unwrap();
        assert_eq!(builder.listen_port, 3333);
        assert_eq!(builder.worker_concurrency, Some(2));
        assert_eq!(builder.fd_limit, DEFAULT_FD_LIMIT);
    }
}
