//! Configuration for the scheduler.

use std::env;
use std::time::Duration;

/// Default age of an unanswered customer message before it counts as stale.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_millis(30_000);

/// Default number of recovery passes before escalating to a human.
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: i64 = 5;

/// Default consecutive processing failures classified as repeated failures.
pub const DEFAULT_REPEATED_FAILURE_THRESHOLD: i64 = 3;

/// Configuration for the scheduler driver, stale detector and recovery engine.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Unanswered customer messages older than this are stale.
    pub stale_threshold: Duration,

    /// Recovery passes allowed before escalating to a human.
    pub max_recovery_attempts: i64,

    /// Consecutive processing failures that count as repeated failures.
    pub repeated_failure_threshold: i64,

    /// How often ready conversations are handed to the processing pipeline.
    pub processing_interval: Duration,

    /// How often the stale detector runs.
    pub detection_interval: Duration,

    /// Lease length granted to a worker that claims a conversation.
    pub lease_ttl: Duration,

    /// Maximum conversations handled per tick.
    pub batch_size: i64,

    /// Maximum recoveries running at once within a tick.
    pub recovery_concurrency: usize,

    /// Classify and log only; never mutate.
    pub dry_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            stale_threshold: DEFAULT_STALE_THRESHOLD,
            max_recovery_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
            repeated_failure_threshold: DEFAULT_REPEATED_FAILURE_THRESHOLD,
            processing_interval: Duration::from_secs(5),
            detection_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(120),
            batch_size: 50,
            recovery_concurrency: 4,
            dry_run: false,
        }
    }
}

impl SchedulerConfig {
    /// Create configuration from environment variables.
    ///
    /// All variables are optional; unparseable values fall back to defaults.
    /// - `SCHEDULER_STALE_THRESHOLD_MS` (default: 30000)
    /// - `SCHEDULER_MAX_RECOVERY_ATTEMPTS` (default: 5)
    /// - `SCHEDULER_REPEATED_FAILURE_THRESHOLD` (default: 3)
    /// - `SCHEDULER_PROCESSING_INTERVAL_MS` (default: 5000)
    /// - `SCHEDULER_DETECTION_INTERVAL_MS` (default: 60000)
    /// - `SCHEDULER_LEASE_TTL_MS` (default: 120000)
    /// - `SCHEDULER_BATCH_SIZE` (default: 50)
    /// - `SCHEDULER_RECOVERY_CONCURRENCY` (default: 4)
    /// - `SCHEDULER_DRY_RUN` (default: false)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            stale_threshold: env_millis("SCHEDULER_STALE_THRESHOLD_MS")
                .unwrap_or(defaults.stale_threshold),
            max_recovery_attempts: env_parse("SCHEDULER_MAX_RECOVERY_ATTEMPTS")
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.max_recovery_attempts),
            repeated_failure_threshold: env_parse("SCHEDULER_REPEATED_FAILURE_THRESHOLD")
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.repeated_failure_threshold),
            processing_interval: env_millis("SCHEDULER_PROCESSING_INTERVAL_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.processing_interval),
            detection_interval: env_millis("SCHEDULER_DETECTION_INTERVAL_MS")
                .filter(|d| !d.is_zero())
                .unwrap_or(defaults.detection_interval),
            lease_ttl: env_millis("SCHEDULER_LEASE_TTL_MS").unwrap_or(defaults.lease_ttl),
            batch_size: env_parse("SCHEDULER_BATCH_SIZE")
                .filter(|n: &i64| *n > 0)
                .unwrap_or(defaults.batch_size),
            recovery_concurrency: env_parse("SCHEDULER_RECOVERY_CONCURRENCY")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.recovery_concurrency),
            dry_run: env::var("SCHEDULER_DRY_RUN")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.dry_run),
        }
    }

    /// Stale threshold in milliseconds, as stored timestamps are.
    pub fn stale_threshold_ms(&self) -> i64 {
        duration_ms(self.stale_threshold)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
