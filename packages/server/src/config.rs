use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// NATS endpoint for best-effort job wakeups. Absent in single-node
    /// deployments; workers poll regardless.
    pub nats_url: Option<String>,
    /// Public base URL used to build alert links in sink payloads.
    pub base_url: String,
    pub scheduler: SchedulerConfig,
    pub reaper: ReaperConfig,
}

/// Knobs for the scheduler tick loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often each replica scans for due tasks.
    pub tick_interval: Duration,
    /// Maximum due tasks consumed per tick.
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            batch_size: 25,
        }
    }
}

/// Retention and failover windows for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub pending_max_age: Duration,
    pub completed_max_age: Duration,
    pub failed_max_age: Duration,
    pub job_results_max_age: Duration,
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            pending_max_age: Duration::from_secs(60 * 60),
            completed_max_age: Duration::from_secs(24 * 60 * 60),
            failed_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            job_results_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            batch_size: 500,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            nats_url: env::var("NATS_URL").ok(),
            base_url: env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            scheduler: SchedulerConfig {
                tick_interval: duration_secs("SCHEDULER_TICK_SECS", 10)?,
                batch_size: int_var("SCHEDULER_BATCH_SIZE", 25)?,
            },
            reaper: ReaperConfig {
                interval: duration_secs("REAPER_INTERVAL_SECS", 300)?,
                pending_max_age: duration_secs("REAPER_PENDING_MAX_AGE_SECS", 60 * 60)?,
                completed_max_age: duration_secs("REAPER_COMPLETED_MAX_AGE_SECS", 24 * 60 * 60)?,
                failed_max_age: duration_secs("REAPER_FAILED_MAX_AGE_SECS", 7 * 24 * 60 * 60)?,
                job_results_max_age: duration_secs(
                    "REAPER_JOB_RESULTS_MAX_AGE_SECS",
                    30 * 24 * 60 * 60,
                )?,
                batch_size: int_var("REAPER_BATCH_SIZE", 500)?,
            },
        })
    }
}

fn duration_secs(var: &str, default: u64) -> Result<Duration> {
    let secs = match env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{var} must be a number of seconds"))?,
        Err(_) => default,
    };
    Ok(Duration::from_secs(secs))
}

fn int_var(var: &str, default: i64) -> Result<i64> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<i64>()
            .with_context(|| format!("{var} must be a valid number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.tick_interval, Duration::from_secs(10));
    }

    #[test]
    fn reaper_defaults_are_ordered() {
        let config = ReaperConfig::default();
        assert!(config.pending_max_age < config.completed_max_age);
        assert!(config.completed_max_age < config.failed_max_age);
    }
}
