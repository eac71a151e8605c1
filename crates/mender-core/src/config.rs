//! Explicit configuration for every component.
//!
//! Thresholds, timeouts, and retry limits are passed in through this struct
//! rather than read from ambient global state, so each component can be
//! exercised in isolation with non-default values.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MenderConfig {
    /// Consecutive failures before a source is quarantined.
    pub quarantine_threshold: u32,

    /// How long a quarantine window lasts before the probe rule kicks in.
    pub quarantine_window: Duration,

    /// Maximum repair attempts per source in a trailing 24h window.
    pub max_fix_attempts_per_day: u32,

    /// Diagnosis confidence below this floor rejects without patching.
    pub min_diagnosis_confidence: f64,

    /// Task retry budget.
    pub max_task_retries: u32,

    /// Upper bound on any single collaborator call (fetch, diagnosis,
    /// patch, sample run).
    pub collaborator_timeout: Duration,

    /// In-progress tasks older than this are treated as abandoned.
    pub stale_task_threshold: Duration,

    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for MenderConfig {
    fn default() -> Self {
        Self {
            quarantine_threshold: 3,
            quarantine_window: Duration::from_secs(24 * 60 * 60),
            max_fix_attempts_per_day: 3,
            min_diagnosis_confidence: 0.3,
            max_task_retries: 3,
            collaborator_timeout: Duration::from_secs(60),
            stale_task_threshold: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operating_limits() {
        let config = MenderConfig::default();
        assert_eq!(config.quarantine_threshold, 3);
        assert_eq!(config.max_fix_attempts_per_day, 3);
        assert_eq!(config.max_task_retries, 3);
        assert_eq!(config.quarantine_window, Duration::from_secs(86_400));
    }
}
