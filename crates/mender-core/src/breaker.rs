//! Circuit breaker for repair attempts.
//!
//! The budget is a rolling count over the fix-attempt audit log, so it
//! survives restarts for free and never needs its own bookkeeping row.
//! Evaluation is advisory: the repair workflow asks before doing any work
//! and records the skip when denied.

use std::sync::Arc;

use chrono::Duration;
use tracing::debug;

use crate::config::MenderConfig;
use crate::domain::{SourceHealth, SourceState};
use crate::error::MenderError;
use crate::store::SqliteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Attempt may proceed; `remaining` counts budget left after this one.
    Allow { remaining: u32 },
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MaxAttemptsReached,
    DomainDead,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::MaxAttemptsReached => "max attempts reached",
            DenyReason::DomainDead => "domain dead",
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<SqliteStore>,
    config: MenderConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<SqliteStore>, config: MenderConfig) -> Self {
        Self { store, config }
    }

    /// Decide whether one more repair attempt is allowed right now.
    ///
    /// Dead sources are never repaired automatically. Otherwise the attempt
    /// budget is a trailing 24h count over the audit log, with one
    /// exception: once the quarantine window has elapsed with no attempt
    /// since, a single probe is allowed even on a spent budget. The probe
    /// still writes an audit row, so it consumes the next slot.
    pub fn evaluate(
        &self,
        health: &SourceHealth,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<BreakerDecision, MenderError> {
        if health.state == SourceState::Dead {
            return Ok(BreakerDecision::Deny(DenyReason::DomainDead));
        }

        let max = self.config.max_fix_attempts_per_day;
        let window_start = now - Duration::hours(24);
        let used = self
            .store
            .count_fix_attempts_since(&health.source_name, window_start)?;

        if used >= max {
            if self.probe_due(health, now)? {
                debug!(source = health.source_name, "probe attempt allowed past budget");
                return Ok(BreakerDecision::Allow { remaining: 0 });
            }
            return Ok(BreakerDecision::Deny(DenyReason::MaxAttemptsReached));
        }

        Ok(BreakerDecision::Allow {
            remaining: max - used - 1,
        })
    }

    /// The quarantine window has elapsed and nothing has been tried since.
    fn probe_due(
        &self,
        health: &SourceHealth,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<bool, MenderError> {
        let Some(until) = health.quarantine_until else {
            return Ok(false);
        };
        if now < until {
            return Ok(false);
        }
        let since_window_end = self
            .store
            .count_fix_attempts_since(&health.source_name, until)?;
        Ok(since_window_end == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureKind, FixAttempt, FixAttemptId, FixOutcome};
    use chrono::{DateTime, TimeZone, Utc};
    use ulid::Ulid;

    fn log_attempt(store: &SqliteStore, source: &str, at: DateTime<Utc>) {
        store
            .append_fix_attempt(&FixAttempt {
                id: FixAttemptId::from_ulid(Ulid::new()),
                source_name: source.to_string(),
                classification: FailureKind::StructuralMismatch,
                diagnosis: None,
                patch_ref: None,
                validation: None,
                outcome: FixOutcome::Rejected,
                created_at: at,
            })
            .unwrap();
    }

    fn fixture() -> (CircuitBreaker, Arc<SqliteStore>, DateTime<Utc>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let breaker = CircuitBreaker::new(store.clone(), MenderConfig::default());
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        (breaker, store, now)
    }

    #[test]
    fn fresh_source_gets_full_budget() {
        let (breaker, _store, now) = fixture();
        let health = SourceHealth::new("widgets");
        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Allow { remaining: 2 }
        );
    }

    #[test]
    fn budget_exhausts_after_three_attempts_in_window() {
        let (breaker, store, now) = fixture();
        let health = SourceHealth::new("widgets");
        for i in 0..3i64 {
            log_attempt(&store, "widgets", now - Duration::hours(i));
        }
        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Deny(DenyReason::MaxAttemptsReached)
        );
    }

    #[test]
    fn old_attempts_age_out_of_the_window() {
        let (breaker, store, now) = fixture();
        let health = SourceHealth::new("widgets");
        log_attempt(&store, "widgets", now - Duration::hours(25));
        log_attempt(&store, "widgets", now - Duration::hours(30));
        log_attempt(&store, "widgets", now - Duration::hours(1));

        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Allow { remaining: 1 }
        );
    }

    #[test]
    fn dead_source_is_always_denied() {
        let (breaker, _store, now) = fixture();
        let mut health = SourceHealth::new("widgets");
        health.state = SourceState::Dead;
        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Deny(DenyReason::DomainDead)
        );
    }

    #[test]
    fn probe_allowed_after_quarantine_window_despite_spent_budget() {
        let (breaker, store, now) = fixture();
        let mut health = SourceHealth::new("widgets");
        health.state = SourceState::Quarantined;
        health.quarantine_until = Some(now - Duration::hours(1));

        // Budget spent inside the trailing 24h, all before the window ended.
        for i in 2..5i64 {
            log_attempt(&store, "widgets", now - Duration::hours(i));
        }

        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Allow { remaining: 0 }
        );

        // The probe itself lands in the audit log; the next ask is denied.
        log_attempt(&store, "widgets", now);
        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Deny(DenyReason::MaxAttemptsReached)
        );
    }

    #[test]
    fn no_probe_while_quarantine_window_is_open() {
        let (breaker, store, now) = fixture();
        let mut health = SourceHealth::new("widgets");
        health.state = SourceState::Quarantined;
        health.quarantine_until = Some(now + Duration::hours(1));

        for i in 0..3i64 {
            log_attempt(&store, "widgets", now - Duration::hours(i + 1));
        }
        assert_eq!(
            breaker.evaluate(&health, now).unwrap(),
            BreakerDecision::Deny(DenyReason::MaxAttemptsReached)
        );
    }
}
