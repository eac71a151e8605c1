//! Read-only status views for dashboards and CLIs.
//!
//! These are projections of persisted state; the core never depends on who
//! consumes them, and they reflect last-known state even when collaborators
//! are down.

use serde::{Deserialize, Serialize};

use crate::domain::{SourceHealth, SourceState};

/// Task counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub quarantined: usize,
}

/// Snapshot of the whole system for `get_status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub tasks: TaskCounts,
    pub health: HealthSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_sources: usize,
    pub active: usize,
    pub degraded: usize,
    pub quarantined: usize,
    pub dead: usize,
    pub sources: Vec<SourceHealth>,
}

impl HealthSummary {
    pub fn from_sources(sources: Vec<SourceHealth>) -> Self {
        let count = |state: SourceState| sources.iter().filter(|s| s.state == state).count();
        Self {
            total_sources: sources.len(),
            active: count(SourceState::Active),
            degraded: count(SourceState::Degraded),
            quarantined: count(SourceState::Quarantined),
            dead: count(SourceState::Dead),
            sources,
        }
    }
}
