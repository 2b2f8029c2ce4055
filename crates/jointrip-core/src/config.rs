use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api/v1";
pub const DEFAULT_PROVIDER: &str = "google";
pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ENV_API_BASE_URL: &str = "JOINTRIP_API_BASE_URL";
const ENV_PROVIDER: &str = "JOINTRIP_AUTH_PROVIDER";
const ENV_TIMEOUT_SECS: &str = "JOINTRIP_HTTP_TIMEOUT_SECS";
const ENV_PROFILE: &str = "JOINTRIP_PROFILE";

/// Locates the per-user directory holding persisted tokens.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "jointrip", "jointrip")
            .ok_or(ConfigError::MissingProjectDirs)?;
        let config_dir = dirs.config_dir();
        fs::create_dir_all(config_dir).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(config_dir)?;
        Ok(Self {
            root: config_dir.to_path_buf(),
        })
    }

    /// Use an explicit directory instead of the platform default.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path to the token file for the given profile.
    pub fn tokens_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("tokens-{profile}.json"))
    }

    /// Path to the outstanding authorization request for the given profile.
    pub fn pending_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("pending-{profile}.json"))
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Settings for talking to the JoinTrip backend.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base_url: Url,
    pub provider: String,
    pub request_timeout: Duration,
    pub profile: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: Url::parse(DEFAULT_API_BASE_URL).expect("valid default API URL"),
            provider: DEFAULT_PROVIDER.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            profile: DEFAULT_PROFILE.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn new(api_base_url: Url) -> Self {
        Self {
            api_base_url,
            ..Self::default()
        }
    }

    /// Build a configuration from `JOINTRIP_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = non_empty(ENV_API_BASE_URL) {
            config.api_base_url = Url::parse(raw.trim())
                .map_err(|err| ConfigError::InvalidValue(ENV_API_BASE_URL, err.to_string()))?;
        }
        if let Some(provider) = non_empty(ENV_PROVIDER) {
            config.provider = provider.trim().to_ascii_lowercase();
        }
        if let Some(raw) = non_empty(ENV_TIMEOUT_SECS) {
            let secs = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::InvalidValue(ENV_TIMEOUT_SECS, raw.clone()))?;
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(profile) = non_empty(ENV_PROFILE) {
            config.profile = profile.trim().to_owned();
        }

        Ok(config)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn endpoints(&self) -> BackendEndpoints {
        BackendEndpoints::new(self.api_base_url.clone(), self.provider.clone())
    }
}

/// Backend routes consumed by the session client.
#[derive(Debug, Clone)]
pub struct BackendEndpoints {
    base: Url,
    provider: String,
}

impl BackendEndpoints {
    pub fn new(mut base: Url, provider: impl Into<String>) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            base,
            provider: provider.into(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Resolve a path relative to the API base URL.
    pub fn resolve(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base.join(path.trim_start_matches('/'))
    }

    pub fn authorization_url(&self) -> Result<Url, url::ParseError> {
        self.resolve(&format!("auth/{}/url", self.provider))
    }

    pub fn login(&self) -> Result<Url, url::ParseError> {
        self.resolve(&format!("auth/{}/login", self.provider))
    }

    pub fn refresh(&self) -> Result<Url, url::ParseError> {
        self.resolve("auth/refresh")
    }
}

/// Errors that can occur while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for jointrip")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
