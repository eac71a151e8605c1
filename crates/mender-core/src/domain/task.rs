//! Task record and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;

/// What a task does when claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    /// Discover a new source from a URL and deploy a scraper for it.
    Ingest,

    /// Run the repair workflow for a broken source.
    Repair,

    /// Run an existing source's scraper and store the output.
    Refresh,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Ingest => "INGEST",
            TaskKind::Repair => "REPAIR",
            TaskKind::Refresh => "REFRESH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INGEST" => Some(TaskKind::Ingest),
            "REPAIR" => Some(TaskKind::Repair),
            "REFRESH" => Some(TaskKind::Refresh),
            _ => None,
        }
    }
}

/// Task state.
///
/// Transitions are one-directional except Failed -> Pending on retry,
/// bounded by `max_retries`:
/// - Pending -> InProgress -> Completed
/// - Pending -> InProgress -> Pending (retry with backoff)
/// - Pending -> InProgress -> Failed (retries exhausted)
/// - Pending | InProgress -> Quarantined (owning source quarantined mid-flight)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Quarantined,
}

impl TaskState {
    /// Terminal states persist forever for audit; they are never recycled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Quarantined
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Quarantined => "QUARANTINED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TaskState::Pending),
            "IN_PROGRESS" => Some(TaskState::InProgress),
            "COMPLETED" => Some(TaskState::Completed),
            "FAILED" => Some(TaskState::Failed),
            "QUARANTINED" => Some(TaskState::Quarantined),
            _ => None,
        }
    }
}

/// A unit of queued work.
///
/// The queue is the single owner of this record: created on enqueue, mutated
/// only through claim/resolve/recover, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,

    /// Source name, or a URL for ingest tasks.
    pub target: String,

    pub state: TaskState,
    pub priority: i32,

    /// Enqueue time. Pushed forward on retry so the backoff delay falls out
    /// of the ordinary "oldest eligible first" claim ordering.
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,

    /// Free-form payload for the dispatched workflow.
    pub context: serde_json::Value,
}

impl Task {
    /// Seconds of backoff before a recycled task becomes claimable again.
    pub fn backoff_secs(retry_count: u32) -> i64 {
        // 2^retry_count, clamped so a corrupt counter cannot overflow
        1i64 << retry_count.min(20)
    }
}

/// Default priorities per kind: repairs jump the queue, refreshes yield to
/// everything else.
pub mod priority {
    pub const DEFAULT: i32 = 5;
    pub const REPAIR: i32 = 8;
    pub const REFRESH: i32 = 3;
    pub const URGENT: i32 = 10;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::completed(TaskState::Completed, true)]
    #[case::failed(TaskState::Failed, true)]
    #[case::quarantined(TaskState::Quarantined, true)]
    #[case::pending(TaskState::Pending, false)]
    #[case::in_progress(TaskState::InProgress, false)]
    fn terminal_states(#[case] state: TaskState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn state_names_roundtrip() {
        for state in [
            TaskState::Pending,
            TaskState::InProgress,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Quarantined,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("bogus"), None);
    }

    #[test]
    fn kind_names_match_wire_format() {
        assert_eq!(TaskKind::Repair.as_str(), "REPAIR");
        assert_eq!(TaskKind::parse("INGEST"), Some(TaskKind::Ingest));
        assert_eq!(
            serde_json::to_string(&TaskKind::Refresh).unwrap(),
            "\"REFRESH\""
        );
    }

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(Task::backoff_secs(1), 2);
        assert_eq!(Task::backoff_secs(2), 4);
        assert_eq!(Task::backoff_secs(3), 8);
    }
}
