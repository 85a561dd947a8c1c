//! Configuration types, built from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use uuid::Uuid;

use crate::error::ConfigError;

/// Lower bound on the worker poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lower bound on the retention window used by the cleanup sweepers.
pub const MIN_RETENTION: Duration = Duration::from_secs(60);

/// Interval between confirmation polls. Fixed, no backoff.
pub const CONFIRMATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Interval between cancellation-watchdog polls.
pub const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP bind address.
    pub listen_addr: String,
    /// Identity written into `claimed_by` by this process's workers.
    pub worker_id: String,
    /// Fixed worker poll interval (the Trigger only shortens it).
    pub poll_interval: Duration,
    /// Retention window for finished jobs and run events.
    pub retention: Duration,
    /// How often the cleanup sweepers run.
    pub cleanup_interval: Duration,
    /// Offset from creation after which an idle run expires.
    pub run_ttl: Duration,
    /// Whether built-in tools that ask for confirmation must wait for one.
    pub confirm_tools: bool,
    /// Whether to use the in-process Trigger (false = pure polling).
    pub triggers_enabled: bool,
    /// Directory for rolling log files, if any.
    pub log_dir: Option<PathBuf>,
    /// Upstream chat-completion API.
    pub llm: LlmConfig,
}

/// Upstream model API settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub default_model: String,
}

impl EngineConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        let poll_interval =
            Duration::from_millis(env_parse("ASSISTANTS_POLL_INTERVAL_MS", 1000u64)?);
        let retention = Duration::from_secs(env_parse("ASSISTANTS_RETENTION_SECS", 3600u64)?);

        let config = Self {
            db_path: std::env::var("ASSISTANTS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/assistants.db")),
            listen_addr: std::env::var("ASSISTANTS_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            worker_id: std::env::var("ASSISTANTS_WORKER_ID")
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            poll_interval,
            retention,
            cleanup_interval: Duration::from_secs(env_parse(
                "ASSISTANTS_CLEANUP_INTERVAL_SECS",
                300u64,
            )?),
            run_ttl: Duration::from_secs(env_parse("ASSISTANTS_RUN_TTL_SECS", 600u64)?),
            confirm_tools: env_parse("ASSISTANTS_CONFIRM_TOOLS", true)?,
            triggers_enabled: env_parse("ASSISTANTS_TRIGGERS", true)?,
            log_dir: std::env::var("ASSISTANTS_LOG_DIR").ok().map(PathBuf::from),
            llm: LlmConfig {
                base_url: std::env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                api_key: SecretString::from(api_key),
                default_model: std::env::var("ASSISTANTS_DEFAULT_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values below the documented minimums.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::InvalidValue {
                key: "ASSISTANTS_POLL_INTERVAL_MS".to_string(),
                message: format!("must be at least {}ms", MIN_POLL_INTERVAL.as_millis()),
            });
        }
        if self.retention < MIN_RETENTION {
            return Err(ConfigError::InvalidValue {
                key: "ASSISTANTS_RETENTION_SECS".to_string(),
                message: format!("must be at least {}s", MIN_RETENTION.as_secs()),
            });
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ASSISTANTS_CLEANUP_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
