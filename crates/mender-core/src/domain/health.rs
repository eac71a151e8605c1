//! Per-source health record and state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source state.
///
/// Transitions:
/// - Active <-> Degraded (strikes accumulate, success clears them)
/// - Degraded -> Quarantined (strike threshold reached)
/// - Quarantined -> Active (successful repair promotion)
/// - Quarantined -> Dead (repair determined the target is gone)
/// - Dead -> Active only via manual reactivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceState {
    Active,
    Degraded,
    Quarantined,
    Dead,
}

impl SourceState {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceState::Active => "ACTIVE",
            SourceState::Degraded => "DEGRADED",
            SourceState::Quarantined => "QUARANTINED",
            SourceState::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SourceState::Active),
            "DEGRADED" => Some(SourceState::Degraded),
            "QUARANTINED" => Some(SourceState::Quarantined),
            "DEAD" => Some(SourceState::Dead),
            _ => None,
        }
    }
}

/// Health record for one source. One row per source, created on first
/// outcome, updated on every outcome, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_name: String,
    pub state: SourceState,

    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,

    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    /// Repair attempts consumed today; the breaker's daily budget.
    pub fix_attempts_today: u32,
    /// When the daily counter was last reset (UTC date comparison).
    pub fix_attempts_reset_at: Option<DateTime<Utc>>,

    /// End of the quarantine window; after this the source is eligible for
    /// one probe repair even if the daily budget is spent.
    pub quarantine_until: Option<DateTime<Utc>>,
}

impl SourceHealth {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            state: SourceState::Active,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            last_error: None,
            fix_attempts_today: 0,
            fix_attempts_reset_at: None,
            quarantine_until: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == SourceState::Active
    }

    /// Degraded and quarantined sources are candidates for repair.
    pub fn needs_fix(&self) -> bool {
        matches!(
            self.state,
            SourceState::Degraded | SourceState::Quarantined
        )
    }

    /// State implied by the strike counter. Does not apply to Dead, which is
    /// only entered explicitly.
    pub fn state_for_failures(consecutive_failures: u32, threshold: u32) -> Option<SourceState> {
        if consecutive_failures >= threshold {
            Some(SourceState::Quarantined)
        } else if consecutive_failures >= 2 {
            Some(SourceState::Degraded)
        } else {
            None // one strike leaves the state as-is
        }
    }
}
