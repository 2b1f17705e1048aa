//! Operator configuration
//!
//! Defines all configurable parameters for the operator including loop
//! intervals, discovery polling, workload defaults and cleanup bounds.

use std::path::PathBuf;
use std::time::Duration;

/// Operator configuration
///
/// All intervals are configurable to allow tuning for different deployment
/// scenarios (tests vs prod, small vs large installations).
#[derive(Debug, Clone)]
pub struct Config {
    /// How often the executor loop runs
    pub executor_interval: Duration,

    /// How often the discovery wait loop polls the probe workload
    pub discovery_poll_interval: Duration,

    /// How often a freshly created probe is looked up before giving up
    pub discovery_lookup_retries: u32,

    /// Delay between probe lookups
    pub discovery_lookup_delay: Duration,

    /// How often every tenant is reconciled regardless of events
    pub resync_interval: Duration,

    /// Delete execution workloads once they completed successfully
    pub delete_successful_jobs: bool,

    /// Maximum time a workload may run
    pub job_timeout: Duration,

    /// Number of retries of a failing workload
    pub job_backoff_limit: i32,

    /// How long finished execution workloads are kept, `None` keeps them
    pub job_ttl_after_finished: Option<i32>,

    /// Pull secrets added to every workload
    pub image_pull_secrets: Vec<String>,

    /// Upper bound for removing superseded workload generations
    pub cleanup_timeout: Duration,

    /// Manifest with the tenants and secrets of the standalone store
    pub tenants_file: PathBuf,
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new() -> Self {
        Self {
            executor_interval: Duration::from_secs(10),
            discovery_poll_interval: Duration::from_secs(5),
            discovery_lookup_retries: 5,
            discovery_lookup_delay: Duration::from_millis(1000),
            resync_interval: Duration::from_secs(60),
            delete_successful_jobs: false,
            job_timeout: Duration::from_secs(1800), // 30 minutes
            job_backoff_limit: 3,
            job_ttl_after_finished: None,
            image_pull_secrets: Vec::new(),
            cleanup_timeout: Duration::from_secs(30),
            tenants_file: PathBuf::from("renovate-jobs.json"),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional and falls back to its default:
    /// - EXECUTOR_INTERVAL_SECONDS (default: 10)
    /// - DISCOVERY_POLL_INTERVAL_SECONDS (default: 5)
    /// - DISCOVERY_LOOKUP_RETRIES (default: 5)
    /// - DISCOVERY_LOOKUP_DELAY_MS (default: 1000)
    /// - RESYNC_INTERVAL_SECONDS (default: 60)
    /// - DELETE_SUCCESSFUL_JOBS (default: false)
    /// - JOB_TIMEOUT_SECONDS (default: 1800)
    /// - JOB_BACKOFF_LIMIT (default: 3)
    /// - JOB_TTL_SECONDS_AFTER_FINISHED (default: unset, -1 disables)
    /// - IMAGE_PULL_SECRETS (comma separated, default: empty)
    /// - CLEANUP_TIMEOUT_SECONDS (default: 30)
    /// - TENANTS_FILE (default: renovate-jobs.json)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::new();

        let job_ttl_after_finished = match env_parse::<i32>("JOB_TTL_SECONDS_AFTER_FINISHED")? {
            Some(ttl) if ttl >= 0 => Some(ttl),
            _ => None,
        };

        let image_pull_secrets = std::env::var("IMAGE_PULL_SECRETS")
            .map(|s| split_list(&s))
            .unwrap_or_default();

        Ok(Self {
            executor_interval: env_secs("EXECUTOR_INTERVAL_SECONDS")?
                .unwrap_or(defaults.executor_interval),
            discovery_poll_interval: env_secs("DISCOVERY_POLL_INTERVAL_SECONDS")?
                .unwrap_or(defaults.discovery_poll_interval),
            discovery_lookup_retries: env_parse("DISCOVERY_LOOKUP_RETRIES")?
                .unwrap_or(defaults.discovery_lookup_retries),
            discovery_lookup_delay: env_parse::<u64>("DISCOVERY_LOOKUP_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.discovery_lookup_delay),
            resync_interval: env_secs("RESYNC_INTERVAL_SECONDS")?
                .unwrap_or(defaults.resync_interval),
            delete_successful_jobs: env_parse("DELETE_SUCCESSFUL_JOBS")?
                .unwrap_or(defaults.delete_successful_jobs),
            job_timeout: env_secs("JOB_TIMEOUT_SECONDS")?.unwrap_or(defaults.job_timeout),
            job_backoff_limit: env_parse("JOB_BACKOFF_LIMIT")?
                .unwrap_or(defaults.job_backoff_limit),
            job_ttl_after_finished,
            image_pull_secrets,
            cleanup_timeout: env_secs("CLEANUP_TIMEOUT_SECONDS")?
                .unwrap_or(defaults.cleanup_timeout),
            tenants_file: std::env::var("TENANTS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tenants_file),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.executor_interval.is_zero() {
            anyhow::bail!("executor_interval must be greater than 0");
        }

        if self.discovery_poll_interval.is_zero() {
            anyhow::bail!("discovery_poll_interval must be greater than 0");
        }

        if self.discovery_lookup_retries == 0 {
            anyhow::bail!("discovery_lookup_retries must be greater than 0");
        }

        if self.resync_interval.is_zero() {
            anyhow::bail!("resync_interval must be greater than 0");
        }

        if self.cleanup_timeout.is_zero() {
            anyhow::bail!("cleanup_timeout must be greater than 0");
        }

        if self.job_backoff_limit < 0 {
            anyhow::bail!("job_backoff_limit cannot be negative");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid value '{}' for {}: {}", raw, key, e)),
        _ => Ok(None),
    }
}

fn env_secs(key: &str) -> anyhow::Result<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_secs))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
