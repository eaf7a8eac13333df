//! Process configuration read from environment variables.

use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use novel_engine_pipeline::application::worker::WorkerConfig;
use novel_engine_store::pg_task_queue::RetryPolicy;

use crate::error::AppError;

/// Settings shared by the API server and the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub database_max_connections: u32,
    /// Revision budget used when a run request does not name one.
    pub default_max_attempts: u32,
    /// Upper bound on one task execution.
    pub job_timeout: Duration,
    pub queue_max_deliveries: u32,
    pub queue_retry_backoff: Duration,
    pub worker_concurrency: usize,
    pub worker_poll_interval: Duration,
    pub reconcile_interval: Duration,
    /// Age after which an unclaimed pending task is re-enqueued.
    pub reconcile_stall_after: Duration,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is unset or a variable
    /// does not parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, applying defaults for
    /// everything but `DATABASE_URL`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is missing or a value
    /// does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_url = lookup("DATABASE_URL").ok_or_else(|| {
            AppError::Config("DATABASE_URL environment variable must be set".to_owned())
        })?;
        let worker_concurrency: usize = parse(&lookup, "WORKER_CONCURRENCY", 4)?;
        if worker_concurrency == 0 {
            return Err(AppError::Config(
                "WORKER_CONCURRENCY must be at least 1".to_owned(),
            ));
        }

        Ok(Self {
            database_url,
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: parse(&lookup, "PORT", 3000)?,
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            default_max_attempts: parse(&lookup, "DEFAULT_MAX_ATTEMPTS", 3)?,
            job_timeout: Duration::from_secs(parse(&lookup, "JOB_TIMEOUT_SECS", 600)?),
            queue_max_deliveries: parse(&lookup, "QUEUE_MAX_DELIVERIES", 3)?,
            queue_retry_backoff: Duration::from_secs(parse(
                &lookup,
                "QUEUE_RETRY_BACKOFF_SECS",
                30,
            )?),
            worker_concurrency,
            worker_poll_interval: Duration::from_millis(parse(
                &lookup,
                "WORKER_POLL_INTERVAL_MS",
                500,
            )?),
            reconcile_interval: Duration::from_secs(parse(&lookup, "RECONCILE_INTERVAL_SECS", 60)?),
            reconcile_stall_after: Duration::from_secs(parse(
                &lookup,
                "RECONCILE_STALL_SECS",
                120,
            )?),
        })
    }

    /// The HTTP bind address.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `HOST:PORT` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::Config(format!("invalid HOST:PORT combination: {e}")))
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_deliveries: self.queue_max_deliveries,
            backoff: self.queue_retry_backoff,
        }
    }

    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            poll_interval: self.worker_poll_interval,
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key} is invalid: {e}"))),
        None => Ok(default),
    }
}
