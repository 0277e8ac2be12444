use std::time::Duration;

use crate::error::BackendError;

/// Configuration for a [`RamsCoordinator`](crate::RamsCoordinator).
///
/// Use [`CoordinatorConfig::builder()`] for ergonomic construction, or
/// [`CoordinatorConfig::default()`] for the standard table and function names.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Table holding generation job rows.
    pub jobs_table: String,

    /// Table of records a job can be linked to (job packs).
    pub linked_table: String,

    /// Boolean column set on the linked record after a successful generation.
    pub linked_flag_column: String,

    /// Remote function that performs the generation.
    pub function_name: String,

    /// Step label shown between submission and the first update.
    pub submission_step: String,

    /// Message used when a failure carries no text of its own.
    pub fallback_error: String,

    /// Buffer size of the notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            jobs_table: "rams_generation_jobs".to_string(),
            linked_table: "job_packs".to_string(),
            linked_flag_column: "has_rams".to_string(),
            function_name: "generate-rams".to_string(),
            submission_step: "Starting RAMS generation...".to_string(),
            fallback_error: "Failed to generate RAMS".to_string(),
            notification_capacity: 16,
        }
    }
}

impl CoordinatorConfig {
    /// Start building a config with the builder pattern.
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }
}

/// Builder for [`CoordinatorConfig`].
#[derive(Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    pub fn with_jobs_table(mut self, table: impl Into<String>) -> Self {
        self.config.jobs_table = table.into();
        self
    }

    /// Set the linked table and the boolean column flagged on success.
    pub fn with_linked_table(mut self, table: impl Into<String>, flag: impl Into<String>) -> Self {
        self.config.linked_table = table.into();
        self.config.linked_flag_column = flag.into();
        self
    }

    pub fn with_function_name(mut self, name: impl Into<String>) -> Self {
        self.config.function_name = name.into();
        self
    }

    pub fn with_submission_step(mut self, label: impl Into<String>) -> Self {
        self.config.submission_step = label.into();
        self
    }

    pub fn with_fallback_error(mut self, message: impl Into<String>) -> Self {
        self.config.fallback_error = message.into();
        self
    }

    /// Capacity of the notification channel (minimum 1).
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_capacity = capacity.max(1);
        self
    }

    /// Build the final [`CoordinatorConfig`].
    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}

/// Connection settings for [`RemoteBackend`](crate::remote::RemoteBackend).
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Project base URL, e.g. `https://abc.supabase.co`.
    pub base_url: String,

    /// Public API key sent as `apikey`.
    pub api_key: String,

    /// User access token. Falls back to the API key when unset.
    pub access_token: Option<String>,

    /// Timeout for each REST call.
    pub request_timeout: Duration,

    /// Interval between realtime heartbeats.
    pub heartbeat_interval: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
            request_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Load settings from the environment, reading a `.env` file first if
    /// one exists.
    ///
    /// | Env Var                     | Default    |
    /// |-----------------------------|------------|
    /// | `RAMS_BACKEND_URL`          | (required) |
    /// | `RAMS_BACKEND_KEY`          | (required) |
    /// | `RAMS_BACKEND_TOKEN`        | unset      |
    /// | `RAMS_REQUEST_TIMEOUT_SECS` | `30`       |
    pub fn from_env() -> Result<Self, BackendError> {
        let _ = dotenvy::dotenv();

        let base_url = require_env("RAMS_BACKEND_URL")?;
        let api_key = require_env("RAMS_BACKEND_KEY")?;
        let mut config = Self::new(base_url, api_key);

        if let Ok(token) = std::env::var("RAMS_BACKEND_TOKEN") {
            if !token.trim().is_empty() {
                config.access_token = Some(token);
            }
        }

        if let Ok(raw) = std::env::var("RAMS_REQUEST_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                BackendError::Other(format!(
                    "RAMS_REQUEST_TIMEOUT_SECS must be a whole number of seconds, got {:?}",
                    raw
                ))
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Bearer token for authenticated calls.
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }
}

fn require_env(name: &str) -> Result<String, BackendError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BackendError::Other(format!("{} is not set", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.jobs_table, "rams_generation_jobs");
        assert_eq!(config.linked_table, "job_packs");
        assert_eq!(config.function_name, "generate-rams");
    }

    #[test]
    fn test_builder_overrides() {
        let config = CoordinatorConfig::builder()
            .with_jobs_table("jobs")
            .with_linked_table("packs", "rams_ready")
            .with_notification_capacity(0)
            .build();
        assert_eq!(config.jobs_table, "jobs");
        assert_eq!(config.linked_flag_column, "rams_ready");
        assert_eq!(config.notification_capacity, 1);
    }

    #[test]
    fn test_remote_config_trims_url_and_prefers_token() {
        let config = RemoteConfig::new("https://abc.example.co//", "anon");
        assert_eq!(config.base_url, "https://abc.example.co");
        assert_eq!(config.bearer(), "anon");

        let config = config.with_access_token("user-jwt");
        assert_eq!(config.bearer(), "user-jwt");
    }
}
