//! Configuration management for slotcast
//!
//! Settings come from a TOML file (`slotcast.toml`) or from `SLOTCAST_*`
//! environment variables. Missing keys fall back to defaults.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gateway::retry::RetryConfig;
use crate::gateway::telegram::TelegramConfig;
use crate::reconciler::ReconcilerConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Trigger engine and cycle configuration
    pub scheduler: SchedulerConfig,

    /// Messaging platform configuration
    pub gateway: GatewayConfig,

    /// Background removal configuration
    pub cleanup: CleanupConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// IANA timezone every cron expression and rotation date is evaluated in
    pub timezone: String,

    /// Destinations processed concurrently within one cycle
    pub max_parallel_destinations: usize,

    /// Upper bound for one destination's replacement in seconds
    pub destination_timeout_secs: u64,

    /// How often expired placements are swept, in seconds
    pub sweep_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: String::from("Asia/Shanghai"),
            max_parallel_destinations: 4,
            destination_timeout_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bot API settings
    #[serde(flatten)]
    pub telegram: TelegramConfig,

    /// Retries after the first attempt for retryable failures
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    pub base_delay_ms: u64,

    /// Added on top of a platform-provided retry-after
    pub rate_limit_buffer_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            telegram: TelegramConfig::new(String::new()),
            max_retries: retry.max_retries,
            base_delay_ms: retry.base_delay_ms,
            rate_limit_buffer_ms: retry.rate_limit_buffer_ms,
        }
    }
}

/// Cleanup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Pause between background removals in milliseconds
    pub removal_pause_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            removal_pause_ms: 300,
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/slotcast.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let scheduler = SchedulerConfig {
            timezone: std::env::var("SLOTCAST_TIMEZONE").unwrap_or(defaults.scheduler.timezone),
            max_parallel_destinations: env_or(
                "SLOTCAST_MAX_PARALLEL_DESTINATIONS",
                defaults.scheduler.max_parallel_destinations,
            ),
            destination_timeout_secs: env_or(
                "SLOTCAST_DESTINATION_TIMEOUT",
                defaults.scheduler.destination_timeout_secs,
            ),
            sweep_interval_secs: env_or("SLOTCAST_SWEEP_INTERVAL", defaults.scheduler.sweep_interval_secs),
        };

        let telegram = TelegramConfig {
            api_base: std::env::var("SLOTCAST_API_BASE").unwrap_or(defaults.gateway.telegram.api_base),
            bot_token: std::env::var("SLOTCAST_BOT_TOKEN")
                .or_else(|_| std::env::var("TELEGRAM_BOT_TOKEN"))
                .unwrap_or_default(),
            request_timeout_secs: env_or(
                "SLOTCAST_REQUEST_TIMEOUT",
                defaults.gateway.telegram.request_timeout_secs,
            ),
            pin_notification: env_or("SLOTCAST_PIN_NOTIFICATION", defaults.gateway.telegram.pin_notification),
        };

        let gateway = GatewayConfig {
            telegram,
            max_retries: env_or("SLOTCAST_MAX_RETRIES", defaults.gateway.max_retries),
            base_delay_ms: env_or("SLOTCAST_BASE_DELAY_MS", defaults.gateway.base_delay_ms),
            rate_limit_buffer_ms: env_or(
                "SLOTCAST_RATE_LIMIT_BUFFER_MS",
                defaults.gateway.rate_limit_buffer_ms,
            ),
        };

        Ok(Self {
            scheduler,
            gateway,
            cleanup: CleanupConfig {
                removal_pause_ms: env_or("SLOTCAST_REMOVAL_PAUSE_MS", defaults.cleanup.removal_pause_ms),
            },
            database: DatabaseConfig {
                sqlite_path: std::env::var("SLOTCAST_SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.database.sqlite_path),
            },
            logging: LoggingConfig {
                level: std::env::var("SLOTCAST_LOG_LEVEL").unwrap_or(defaults.logging.level),
                format: std::env::var("SLOTCAST_LOG_FORMAT").unwrap_or(defaults.logging.format),
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// The bot token is not checked here; commands that never reach the
    /// platform run without one.
    pub fn validate(&self) -> Result<()> {
        self.timezone()?;

        if self.scheduler.max_parallel_destinations == 0 {
            anyhow::bail!("max_parallel_destinations must be greater than 0");
        }

        if self.scheduler.destination_timeout_secs == 0 {
            anyhow::bail!("destination_timeout_secs must be greater than 0");
        }

        if self.scheduler.sweep_interval_secs == 0 {
            anyhow::bail!("sweep_interval_secs must be greater than 0");
        }

        if self.gateway.telegram.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than 0");
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => anyhow::bail!("Unknown log format '{other}' (expected text or json)"),
        }

        Ok(())
    }

    /// The configured timezone, parsed
    pub fn timezone(&self) -> Result<Tz> {
        self.scheduler
            .timezone
            .parse::<Tz>()
            .map_err(|_| anyhow::anyhow!("Unknown timezone '{}'", self.scheduler.timezone))
    }

    /// Retry contract for every gateway call
    #[must_use]
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.gateway.max_retries,
            base_delay_ms: self.gateway.base_delay_ms,
            rate_limit_buffer_ms: self.gateway.rate_limit_buffer_ms,
            ..RetryConfig::default()
        }
    }

    #[must_use]
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            max_parallel_destinations: self.scheduler.max_parallel_destinations,
            destination_timeout: Duration::from_secs(self.scheduler.destination_timeout_secs),
        }
    }

    #[must_use]
    pub fn removal_pause(&self) -> Duration {
        Duration::from_millis(self.cleanup.removal_pause_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.sweep_interval_secs)
    }
}
