//! Configuration loading and representation.
//!
//! All settings come from environment variables with fixed defaults:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `PORT` | `3001` |
//! | `BIND_ADDR` | `0.0.0.0` |
//! | `DATABASE_URL` | unset (in-memory stores) |
//! | `JOB_POLL_INTERVAL_MS` | `250` |
//! | `NOTIFY_CONCURRENCY` / `SLA_CONCURRENCY` | `4` / `2` |
//! | `NOTIFY_MAX_ATTEMPTS` | `3` |
//! | `JOB_BACKOFF_BASE_MS` | `2000` |
//! | `JOB_BACKOFF_MAX_MS` | unset (uncapped) |
//! | `SLA_DELAY_SECS` | `900` |
//! | `STUCK_ACTIVE_TIMEOUT_SECS` | unset (no recovery sweep) |
//! | `RETAIN_CANCELLED_JOBS` | `false` |

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::types::{QueueName, RetryPolicy};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    #[error("no handler registered for queue {0}")]
    MissingHandler(QueueName),
    #[error("a handler is already registered for queue {0}")]
    DuplicateHandler(QueueName),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl ConfigurationError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Dispatch settings for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum executions in flight on this queue
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

/// Job engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEngineConfig {
    pub poll_interval: Duration,
    pub notify: QueueSettings,
    pub sla: QueueSettings,
    /// How long after creation a ticket's SLA check fires
    pub sla_delay: Duration,
    /// Enables the recovery sweep for jobs left `active` longer than this
    pub stuck_active_timeout: Option<Duration>,
    /// Keep cancelled records instead of deleting them
    pub retain_cancelled: bool,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        let base_delay = Duration::from_millis(2000);
        Self {
            poll_interval: Duration::from_millis(250),
            notify: QueueSettings {
                concurrency: 4,
                retry: RetryPolicy::exponential(3, base_delay),
            },
            sla: QueueSettings {
                concurrency: 2,
                retry: RetryPolicy {
                    base_delay,
                    ..RetryPolicy::no_retry()
                },
            },
            sla_delay: Duration::from_secs(15 * 60),
            stuck_active_timeout: None,
            retain_cancelled: false,
        }
    }
}

impl JobEngineConfig {
    pub fn queue(&self, queue: QueueName) -> &QueueSettings {
        match queue {
            QueueName::Notify => &self.notify,
            QueueName::Sla => &self.sla,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: IpAddr,
    pub port: u16,
    pub database_url: Option<String>,
    pub jobs: JobEngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 3001,
            database_url: None,
            jobs: JobEngineConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let defaults = Self::default();
        let env = Env(&lookup);

        let backoff_base = env.millis("JOB_BACKOFF_BASE_MS", defaults.jobs.notify.retry.base_delay)?;
        let backoff_max = env
            .optional::<u64>("JOB_BACKOFF_MAX_MS")?
            .map(Duration::from_millis);
        let notify_max_attempts = env.parse("NOTIFY_MAX_ATTEMPTS", defaults.jobs.notify.retry.max_attempts)?;
        if notify_max_attempts == 0 {
            return Err(ConfigurationError::invalid("NOTIFY_MAX_ATTEMPTS", "must be at least 1"));
        }

        let retry = |max_attempts| RetryPolicy {
            max_attempts,
            base_delay: backoff_base,
            max_delay: backoff_max,
        };

        let jobs = JobEngineConfig {
            poll_interval: env.millis("JOB_POLL_INTERVAL_MS", defaults.jobs.poll_interval)?,
            notify: QueueSettings {
                concurrency: env.concurrency("NOTIFY_CONCURRENCY", defaults.jobs.notify.concurrency)?,
                retry: retry(notify_max_attempts),
            },
            sla: QueueSettings {
                concurrency: env.concurrency("SLA_CONCURRENCY", defaults.jobs.sla.concurrency)?,
                retry: retry(1),
            },
            sla_delay: Duration::from_secs(
                env.parse("SLA_DELAY_SECS", defaults.jobs.sla_delay.as_secs())?,
            ),
            stuck_active_timeout: env
                .optional::<u64>("STUCK_ACTIVE_TIMEOUT_SECS")?
                .map(Duration::from_secs),
            retain_cancelled: env.parse("RETAIN_CANCELLED_JOBS", defaults.jobs.retain_cancelled)?,
        };

        Ok(Self {
            bind_addr: env.parse("BIND_ADDR", defaults.bind_addr)?,
            port: env.parse("PORT", defaults.port)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            jobs,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn optional<T>(&self, name: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(name) {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigurationError::invalid(name, format!("{raw:?}: {e}"))),
            _ => Ok(None),
        }
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigurationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(name)?.unwrap_or(default))
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, ConfigurationError> {
        Ok(self
            .optional::<u64>(name)?
            .map(Duration::from_millis)
            .unwrap_or(default))
    }

    fn concurrency(&self, name: &str, default: usize) -> Result<usize, ConfigurationError> {
        match self.parse(name, default)? {
            0 => Err(ConfigurationError::invalid(name, "must be at least 1")),
            n => Ok(n),
        }
    }
}
