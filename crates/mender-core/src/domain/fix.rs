//! Failure taxonomy and the repair audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::FixAttemptId;

/// Fixed classification of scraper failures. The classification determines
/// the fix strategy hint passed to the patch collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Target unreachable or HTTP failure.
    FetchError,

    /// Expected data container not found in the page.
    StructuralMismatch,

    /// Output shape no longer matches the expected schema.
    SchemaMismatch,

    Timeout,
    RateLimited,

    /// Required diagnosis input missing; the workflow fails closed.
    ContextUnavailable,

    /// Staged candidate did not pass validation.
    ValidationFailed,

    /// Target is permanently gone. The only classification that moves a
    /// source to the terminal Dead state.
    DomainDead,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::FetchError => "FETCH_ERROR",
            FailureKind::StructuralMismatch => "STRUCTURAL_MISMATCH",
            FailureKind::SchemaMismatch => "SCHEMA_MISMATCH",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::RateLimited => "RATE_LIMITED",
            FailureKind::ContextUnavailable => "CONTEXT_UNAVAILABLE",
            FailureKind::ValidationFailed => "VALIDATION_FAILED",
            FailureKind::DomainDead => "DOMAIN_DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FETCH_ERROR" => Some(FailureKind::FetchError),
            "STRUCTURAL_MISMATCH" => Some(FailureKind::StructuralMismatch),
            "SCHEMA_MISMATCH" => Some(FailureKind::SchemaMismatch),
            "TIMEOUT" => Some(FailureKind::Timeout),
            "RATE_LIMITED" => Some(FailureKind::RateLimited),
            "CONTEXT_UNAVAILABLE" => Some(FailureKind::ContextUnavailable),
            "VALIDATION_FAILED" => Some(FailureKind::ValidationFailed),
            "DOMAIN_DEAD" => Some(FailureKind::DomainDead),
            _ => None,
        }
    }
}

/// How the repair attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixOutcome {
    /// Candidate validated and now serves production.
    Promoted,

    /// Attempt terminated before promotion; staging (if any) is retained.
    Rejected,

    /// Candidate staged but validation never ran (operator-driven flows).
    StagedOnly,
}

impl FixOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            FixOutcome::Promoted => "PROMOTED",
            FixOutcome::Rejected => "REJECTED",
            FixOutcome::StagedOnly => "STAGED_ONLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROMOTED" => Some(FixOutcome::Promoted),
            "REJECTED" => Some(FixOutcome::Rejected),
            "STAGED_ONLY" => Some(FixOutcome::StagedOnly),
            _ => None,
        }
    }
}

/// One row in the append-only repair audit log. Written exactly once per
/// terminal workflow transition, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixAttempt {
    pub id: FixAttemptId,
    pub source_name: String,
    pub classification: FailureKind,

    /// Root-cause summary from the diagnosis step.
    pub diagnosis: Option<String>,

    /// Reference to the candidate artifact, if one was produced.
    pub patch_ref: Option<String>,

    /// Validation report as JSON, if validation ran.
    pub validation: Option<serde_json::Value>,

    pub outcome: FixOutcome,
    pub created_at: DateTime<Utc>,
}

/// Diagnosis result: classification plus the strategy hint handed to the
/// patch collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub kind: FailureKind,
    pub root_cause: String,
    pub fix_strategy: FixStrategy,
    /// 0.0..=1.0; attempts below the configured floor are rejected without
    /// patching.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStrategy {
    Patch,
    Rebuild,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_roundtrips() {
        for kind in [
            FailureKind::FetchError,
            FailureKind::StructuralMismatch,
            FailureKind::SchemaMismatch,
            FailureKind::Timeout,
            FailureKind::RateLimited,
            FailureKind::ContextUnavailable,
            FailureKind::ValidationFailed,
            FailureKind::DomainDead,
        ] {
            assert_eq!(FailureKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn outcome_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&FixOutcome::Promoted).unwrap(),
            "\"PROMOTED\""
        );
        assert_eq!(FixOutcome::parse("STAGED_ONLY"), Some(FixOutcome::StagedOnly));
    }
}
