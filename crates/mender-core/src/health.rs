//! Health tracker: per-source strike counting and state transitions.
//!
//! Every outcome is a read-modify-write on the source's row inside one
//! transaction, so counts never drift even with concurrent reporters. The
//! tracker only moves state; queueing the repair that a quarantine calls
//! for is the orchestrator's job, signalled through `FailureReport`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Row, Transaction, params};
use tracing::{info, warn};

use crate::config::MenderConfig;
use crate::domain::{FixOutcome, SourceHealth, SourceState};
use crate::error::MenderError;
use crate::ports::Clock;
use crate::store::{SqliteStore, bad_column};

/// What a reported failure did to the source.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub health: SourceHealth,
    /// True exactly when this failure crossed the strike threshold.
    pub newly_quarantined: bool,
}

#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    config: MenderConfig,
}

impl HealthTracker {
    pub fn new(store: Arc<SqliteStore>, clock: Arc<dyn Clock>, config: MenderConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Record a successful operation. Clears the strike counter and returns
    /// a degraded source to Active. Quarantined and Dead states are sticky;
    /// only a promoted repair (or manual reactivation) leaves them.
    pub fn record_success(&self, source_name: &str) -> Result<SourceHealth, MenderError> {
        let now = self.clock.now();
        self.update(source_name, |health| {
            health.success_count += 1;
            health.consecutive_failures = 0;
            health.last_success_at = Some(now);
            if health.state == SourceState::Degraded {
                health.state = SourceState::Active;
            }
        })
    }

    /// Record a failed operation. Strikes accumulate; crossing the threshold
    /// quarantines the source and stamps the quarantine window.
    pub fn record_failure(
        &self,
        source_name: &str,
        error: &str,
    ) -> Result<FailureReport, MenderError> {
        let now = self.clock.now();
        let threshold = self.config.quarantine_threshold;
        let window = Duration::from_std(self.config.quarantine_window)
            .unwrap_or_else(|_| Duration::hours(24));

        let mut newly_quarantined = false;
        let health = self.update(source_name, |health| {
            health.failure_count += 1;
            health.consecutive_failures += 1;
            health.last_failure_at = Some(now);
            health.last_error = Some(error.to_string());

            // Dead stays dead; quarantined stays quarantined.
            if matches!(health.state, SourceState::Dead | SourceState::Quarantined) {
                return;
            }
            if let Some(state) =
                SourceHealth::state_for_failures(health.consecutive_failures, threshold)
            {
                if state == SourceState::Quarantined {
                    newly_quarantined = true;
                    health.quarantine_until = Some(now + window);
                }
                health.state = state;
            }
        })?;

        if newly_quarantined {
            warn!(
                source = source_name,
                strikes = health.consecutive_failures,
                until = ?health.quarantine_until,
                "source quarantined"
            );
        }
        Ok(FailureReport {
            health,
            newly_quarantined,
        })
    }

    /// Count one repair attempt against today's budget. The counter resets
    /// when the UTC date rolls over since the last reset.
    pub fn record_fix_attempt(&self, source_name: &str) -> Result<SourceHealth, MenderError> {
        let now = self.clock.now();
        self.update(source_name, |health| {
            reset_daily_budget(health, now);
            health.fix_attempts_today += 1;
            health.fix_attempts_reset_at.get_or_insert(now);
        })
    }

    /// Apply a terminal repair outcome. Promotion reopens the source and
    /// clears the quarantine; rejection leaves state untouched.
    pub fn record_repair_outcome(
        &self,
        source_name: &str,
        outcome: FixOutcome,
    ) -> Result<SourceHealth, MenderError> {
        let health = self.update(source_name, |health| {
            if outcome == FixOutcome::Promoted {
                health.state = SourceState::Active;
                health.consecutive_failures = 0;
                health.quarantine_until = None;
            }
        })?;
        info!(source = source_name, outcome = outcome.as_str(), "repair outcome recorded");
        Ok(health)
    }

    /// The repair workflow concluded the target itself is gone. Dead is
    /// terminal until `reactivate`.
    pub fn mark_dead(&self, source_name: &str, reason: &str) -> Result<SourceHealth, MenderError> {
        let now = self.clock.now();
        let health = self.update(source_name, |health| {
            health.state = SourceState::Dead;
            health.last_error = Some(reason.to_string());
            health.last_failure_at = Some(now);
            health.quarantine_until = None;
        })?;
        warn!(source = source_name, reason, "source marked dead");
        Ok(health)
    }

    /// Manual override: quarantine a source for a given number of hours,
    /// regardless of its strike count.
    pub fn quarantine(&self, source_name: &str, hours: i64) -> Result<SourceHealth, MenderError> {
        let now = self.clock.now();
        let health = self.update(source_name, |health| {
            health.state = SourceState::Quarantined;
            health.quarantine_until = Some(now + Duration::hours(hours));
        })?;
        warn!(source = source_name, hours, "source quarantined by operator");
        Ok(health)
    }

    /// Manual override: bring any source back to Active with a clean slate.
    pub fn reactivate(&self, source_name: &str) -> Result<SourceHealth, MenderError> {
        let health = self.update(source_name, |health| {
            health.state = SourceState::Active;
            health.consecutive_failures = 0;
            health.quarantine_until = None;
            health.fix_attempts_today = 0;
        })?;
        info!(source = source_name, "source reactivated");
        Ok(health)
    }

    pub fn get(&self, source_name: &str) -> Result<Option<SourceHealth>, MenderError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(SELECT_HEALTH)?;
        let mut rows = stmt.query_map(params![source_name], map_health_row)?;
        match rows.next() {
            None => Ok(None),
            Some(row) => Ok(Some(row?)),
        }
    }

    pub fn all(&self) -> Result<Vec<SourceHealth>, MenderError> {
        let conn = self.store.lock();
        let mut stmt = conn.prepare(
            "SELECT source_name, state, success_count, failure_count,
                    consecutive_failures, last_success_at, last_failure_at,
                    last_error, fix_attempts_today, fix_attempts_reset_at,
                    quarantine_until
             FROM source_health ORDER BY source_name",
        )?;
        let rows = stmt.query_map([], map_health_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Sources in a state that calls for repair.
    pub fn needing_fix(&self) -> Result<Vec<SourceHealth>, MenderError> {
        Ok(self.all()?.into_iter().filter(|h| h.needs_fix()).collect())
    }

    pub fn degraded(&self) -> Result<Vec<SourceHealth>, MenderError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|h| h.state == SourceState::Degraded)
            .collect())
    }

    /// Read-modify-write one source's row. Creates the row on first contact.
    fn update(
        &self,
        source_name: &str,
        apply: impl FnOnce(&mut SourceHealth),
    ) -> Result<SourceHealth, MenderError> {
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;

        let mut health = load_health(&tx, source_name)?
            .unwrap_or_else(|| SourceHealth::new(source_name));
        apply(&mut health);
        write_health(&tx, &health)?;

        tx.commit()?;
        Ok(health)
    }
}

/// Zero the daily fix-attempt budget when the UTC date has rolled over.
fn reset_daily_budget(health: &mut SourceHealth, now: DateTime<Utc>) {
    if let Some(reset_at) = health.fix_attempts_reset_at {
        if reset_at.date_naive() < now.date_naive() {
            health.fix_attempts_today = 0;
            health.fix_attempts_reset_at = Some(now);
        }
    }
}

const SELECT_HEALTH: &str = "SELECT source_name, state, success_count, failure_count,
        consecutive_failures, last_success_at, last_failure_at, last_error,
        fix_attempts_today, fix_attempts_reset_at, quarantine_until
 FROM source_health WHERE source_name = ?1";

fn load_health(
    tx: &Transaction<'_>,
    source_name: &str,
) -> Result<Option<SourceHealth>, MenderError> {
    let mut stmt = tx.prepare(SELECT_HEALTH)?;
    let mut rows = stmt.query_map(params![source_name], map_health_row)?;
    match rows.next() {
        None => Ok(None),
        Some(row) => Ok(Some(row?)),
    }
}

fn write_health(tx: &Transaction<'_>, health: &SourceHealth) -> Result<(), MenderError> {
    tx.execute(
        "INSERT INTO source_health
             (source_name, state, success_count, failure_count,
              consecutive_failures, last_success_at, last_failure_at,
              last_error, fix_attempts_today, fix_attempts_reset_at,
              quarantine_until)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(source_name) DO UPDATE SET
             state = excluded.state,
             success_count = excluded.success_count,
             failure_count = excluded.failure_count,
             consecutive_failures = excluded.consecutive_failures,
             last_success_at = excluded.last_success_at,
             last_failure_at = excluded.last_failure_at,
             last_error = excluded.last_error,
             fix_attempts_today = excluded.fix_attempts_today,
             fix_attempts_reset_at = excluded.fix_attempts_reset_at,
             quarantine_until = excluded.quarantine_until",
        params![
            health.source_name,
            health.state.as_str(),
            health.success_count as i64,
            health.failure_count as i64,
            health.consecutive_failures,
            health.last_success_at,
            health.last_failure_at,
            health.last_error,
            health.fix_attempts_today,
            health.fix_attempts_reset_at,
            health.quarantine_until,
        ],
    )?;
    Ok(())
}

fn map_health_row(row: &Row<'_>) -> rusqlite::Result<SourceHealth> {
    let state: String = row.get(1)?;
    Ok(SourceHealth {
        source_name: row.get(0)?,
        state: SourceState::parse(&state)
            .ok_or_else(|| bad_column(1, format!("source state '{state}'")))?,
        success_count: row.get::<_, i64>(2)? as u64,
        failure_count: row.get::<_, i64>(3)? as u64,
        consecutive_failures: row.get(4)?,
        last_success_at: row.get(5)?,
        last_failure_at: row.get(6)?,
        last_error: row.get(7)?,
        fix_attempts_today: row.get(8)?,
        fix_attempts_reset_at: row.get(9)?,
        quarantine_until: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FixedClock;
    use chrono::TimeZone;

    fn fixture() -> (HealthTracker, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let tracker = HealthTracker::new(store, clock.clone(), MenderConfig::default());
        (tracker, clock)
    }

    #[test]
    fn three_strikes_quarantine() {
        let (tracker, _clock) = fixture();

        let first = tracker.record_failure("widgets", "timeout").unwrap();
        assert_eq!(first.health.state, SourceState::Active);
        assert!(!first.newly_quarantined);

        let second = tracker.record_failure("widgets", "timeout").unwrap();
        assert_eq!(second.health.state, SourceState::Degraded);

        let third = tracker.record_failure("widgets", "timeout").unwrap();
        assert_eq!(third.health.state, SourceState::Quarantined);
        assert!(third.newly_quarantined);
        assert!(third.health.quarantine_until.is_some());

        // Further failures do not re-trigger the quarantine signal.
        let fourth = tracker.record_failure("widgets", "timeout").unwrap();
        assert!(!fourth.newly_quarantined);
        assert_eq!(fourth.health.consecutive_failures, 4);
    }

    #[test]
    fn success_clears_strikes_and_degraded_state() {
        let (tracker, _clock) = fixture();
        tracker.record_failure("widgets", "500").unwrap();
        tracker.record_failure("widgets", "500").unwrap();

        let health = tracker.record_success("widgets").unwrap();
        assert_eq!(health.state, SourceState::Active);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.failure_count, 2);
        assert_eq!(health.success_count, 1);
    }

    #[test]
    fn success_does_not_lift_quarantine() {
        let (tracker, _clock) = fixture();
        for _ in 0..3 {
            tracker.record_failure("widgets", "500").unwrap();
        }

        // A stray success (e.g. stale worker) must not bypass repair.
        let health = tracker.record_success("widgets").unwrap();
        assert_eq!(health.state, SourceState::Quarantined);
    }

    #[test]
    fn promotion_reopens_quarantined_source() {
        let (tracker, _clock) = fixture();
        for _ in 0..3 {
            tracker.record_failure("widgets", "500").unwrap();
        }

        let health = tracker
            .record_repair_outcome("widgets", FixOutcome::Promoted)
            .unwrap();
        assert_eq!(health.state, SourceState::Active);
        assert_eq!(health.consecutive_failures, 0);
        assert!(health.quarantine_until.is_none());
    }

    #[test]
    fn rejection_keeps_quarantine() {
        let (tracker, _clock) = fixture();
        for _ in 0..3 {
            tracker.record_failure("widgets", "500").unwrap();
        }

        let health = tracker
            .record_repair_outcome("widgets", FixOutcome::Rejected)
            .unwrap();
        assert_eq!(health.state, SourceState::Quarantined);
        assert!(health.quarantine_until.is_some());
    }

    #[test]
    fn daily_budget_resets_on_utc_date_rollover() {
        let (tracker, clock) = fixture();
        tracker.record_fix_attempt("widgets").unwrap();
        let health = tracker.record_fix_attempt("widgets").unwrap();
        assert_eq!(health.fix_attempts_today, 2);

        // Same UTC day: no reset.
        clock.advance(Duration::hours(6));
        let health = tracker.record_fix_attempt("widgets").unwrap();
        assert_eq!(health.fix_attempts_today, 3);

        // Next UTC day: counter starts over.
        clock.advance(Duration::hours(12));
        let health = tracker.record_fix_attempt("widgets").unwrap();
        assert_eq!(health.fix_attempts_today, 1);
    }

    #[test]
    fn dead_is_sticky_until_reactivated() {
        let (tracker, _clock) = fixture();
        tracker.mark_dead("widgets", "domain gone").unwrap();

        let after_failure = tracker.record_failure("widgets", "500").unwrap();
        assert_eq!(after_failure.health.state, SourceState::Dead);

        let health = tracker.reactivate("widgets").unwrap();
        assert_eq!(health.state, SourceState::Active);
        assert_eq!(health.consecutive_failures, 0);
    }

    #[test]
    fn manual_quarantine_sets_window() {
        let (tracker, clock) = fixture();
        let health = tracker.quarantine("widgets", 12).unwrap();
        assert_eq!(health.state, SourceState::Quarantined);
        assert_eq!(
            health.quarantine_until,
            Some(clock.now() + Duration::hours(12))
        );
    }

    #[test]
    fn needing_fix_lists_degraded_and_quarantined() {
        let (tracker, _clock) = fixture();
        tracker.record_success("healthy").unwrap();
        tracker.record_failure("limping", "500").unwrap();
        tracker.record_failure("limping", "500").unwrap();
        for _ in 0..3 {
            tracker.record_failure("broken", "500").unwrap();
        }

        let names: Vec<_> = tracker
            .needing_fix()
            .unwrap()
            .into_iter()
            .map(|h| h.source_name)
            .collect();
        assert_eq!(names, vec!["broken", "limping"]);
    }
}
