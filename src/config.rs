//! Manager and worker configuration.

use crate::types::RetrievalMode;
use std::time::Duration;

/// Feed worker tuning.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// First reconnect delay after a transient failure.
    pub initial_backoff: Duration,

    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,

    /// Growth factor applied to the delay after each consecutive failure.
    pub backoff_multiplier: f64,

    /// Consecutive failures after which the worker gives up (None = never).
    pub max_consecutive_failures: Option<u32>,

    /// How long a session poll waits before checking for shutdown.
    pub poll_interval: Duration,

    /// How long `start` waits for the first open attempt to report.
    pub connect_timeout: Duration,

    /// How long `stop` waits for the worker thread before abandoning it.
    pub stop_timeout: Duration,

    /// Delay before reopening after the store rejected the resume token.
    pub invalid_token_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_consecutive_failures: None,
            poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            invalid_token_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = Some(failures);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_invalid_token_delay(mut self, delay: Duration) -> Self {
        self.invalid_token_delay = delay;
        self
    }

    /// Delay to wait after `failures` consecutive failures (1-based).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What to do when a registration asks for a mode other than the active one.
///
/// The requested mode never changes what is delivered; this only controls
/// whether the mismatch is accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModeConflictPolicy {
    /// Accept the registration and log the mismatch.
    #[default]
    Ignore,
    /// Refuse the registration with `NotifyError::ModeConflict`.
    Reject,
}

/// Notification manager configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Retrieval mode used by `start` when none is given.
    pub default_mode: RetrievalMode,

    /// Handling of conflicting per-registration mode requests.
    pub mode_conflict: ModeConflictPolicy,

    /// Settings for every feed worker.
    pub worker: WorkerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_mode: RetrievalMode::UpdateLookup,
            mode_conflict: ModeConflictPolicy::Ignore,
            worker: WorkerConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn with_default_mode(mut self, mode: RetrievalMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_mode_conflict(mut self, policy: ModeConflictPolicy) -> Self {
        self.mode_conflict = policy;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = WorkerConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(1000));

        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(400));
        assert_eq!(config.backoff_for(5), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.default_mode, RetrievalMode::UpdateLookup);
        assert_eq!(config.mode_conflict, ModeConflictPolicy::Ignore);
        assert!(config.worker.max_consecutive_failures.is_none());
    }
}
