use std::env;
use std::time::Duration;

use super::backoff::BackoffPolicy;

/// Tunables of a bulk session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkConfig {
    /// A batch is sealed as soon as its estimated size reaches this many bytes.
    pub flush_bytes: usize,
    /// Ceiling on how long closing a session waits for in-flight batches.
    pub drain_timeout: Duration,
    /// Cadence of progress lines for large sessions.
    pub progress_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for BulkConfig {
    fn default() -> Self {
        BulkConfig {
            flush_bytes: 1024 * 1024,
            drain_timeout: Duration::from_secs(10 * 60),
            progress_interval: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

impl BulkConfig {
    /// Read `BATTER_*` variables, keeping the default for anything unset or
    /// unparsable.
    pub fn from_env() -> Self {
        let defaults = BulkConfig::default();
        BulkConfig {
            flush_bytes: env_parse("BATTER_FLUSH_BYTES")
                .filter(|b: &usize| *b > 0)
                .unwrap_or(defaults.flush_bytes),
            drain_timeout: env_parse("BATTER_DRAIN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.drain_timeout),
            progress_interval: env_parse("BATTER_PROGRESS_INTERVAL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.progress_interval),
            backoff: BackoffPolicy {
                initial_delay: env_parse("BATTER_BACKOFF_INITIAL_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.initial_delay),
                max_delay: env_parse("BATTER_BACKOFF_MAX_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.backoff.max_delay),
            },
        }
    }

    pub fn with_flush_bytes(mut self, flush_bytes: usize) -> Self {
        self.flush_bytes = flush_bytes;
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn with_progress_interval(mut self, progress_interval: Duration) -> Self {
        self.progress_interval = progress_interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}
