//! Queue configuration
//!
//! Settings are layered: built-in defaults, then an optional config file,
//! then `BACKLOG_*` environment variables. Nested keys use a double
//! underscore, e.g. `BACKLOG_WORKER__MAX_JOBS=100`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::job::DEFAULT_QUEUE;
use crate::memory::DEFAULT_RETRY_AFTER_SECS;

pub const ENV_PREFIX: &str = "BACKLOG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Storage driver behind the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    #[default]
    Memory,
    Sqlite,
    Redis,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::Invalid(format!("unknown queue driver '{other}'"))),
        }
    }
}

/// Run-loop options for a [`Worker`](crate::worker::Worker)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Upper bound for the idle backoff sleep; 0 disables sleeping
    pub sleep_secs: u64,
    /// Caps every job's max attempts when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Stop once resident memory exceeds this many MB; 0 disables the check
    pub memory_limit_mb: u64,
    /// Timeout for jobs that declare none; 0 means unbounded
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_jobs: Option<u64>,
    pub stop_on_empty: bool,
    /// Jobs reserved per poll; above 1 the batch is run in priority order
    pub batch_size: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            sleep_secs: 5,
            max_retries: None,
            memory_limit_mb: 128,
            timeout_seconds: 60,
            max_jobs: None,
            stop_on_empty: false,
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub driver: Driver,
    /// Connection URL for durable drivers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub default_queue: String,
    /// Visibility timeout for reserved jobs
    pub retry_after_secs: u64,
    /// Key prefix for drivers with a flat keyspace
    pub prefix: String,
    pub max_connections: u32,
    pub worker: WorkerOptions,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            driver: Driver::Memory,
            url: None,
            default_queue: DEFAULT_QUEUE.to_string(),
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            prefix: "backlog".to_string(),
            max_connections: 5,
            worker: WorkerOptions::default(),
        }
    }
}

impl QueueSettings {
    /// Defaults overridden by `BACKLOG_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None::<&Path>)
    }

    /// Defaults, then `path` (any format the `config` crate knows, optional),
    /// then the environment
    pub fn load(path: Option<impl AsRef<Path>>) -> Result<Self, ConfigError> {
        Self::build(path, None)
    }

    /// Same layering as [`load`](Self::load) with an explicit variable set in
    /// place of the process environment
    pub fn load_with_vars(
        path: Option<impl AsRef<Path>>,
        vars: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        Self::build(path, Some(vars))
    }

    fn build(
        path: Option<impl AsRef<Path>>,
        vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&QueueSettings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path.as_ref()).required(false));
        }

        let mut env = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        if let Some(vars) = vars {
            env = env.source(Some(vars.into_iter().collect()));
        }

        let settings: QueueSettings = builder.add_source(env).build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("default_queue must not be empty".into()));
        }
        if self.retry_after_secs == 0 {
            return Err(ConfigError::Invalid("retry_after_secs must be positive".into()));
        }
        let missing_url = self.url.as_deref().map_or(true, |url| url.trim().is_empty());
        if self.driver != Driver::Memory && missing_url {
            return Err(ConfigError::Invalid(format!(
                "driver '{}' needs a url",
                self.driver
            )));
        }
        if self.worker.batch_size == 0 {
            return Err(ConfigError::Invalid("worker.batch_size must be at least 1".into()));
        }
        Ok(())
    }
}
