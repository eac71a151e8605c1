//! Code generation port: the generative collaborators behind diagnosis,
//! patching, and scaffolding.
//!
//! Implementations may be LLM-backed; the core treats them as black boxes
//! with bounded latency and the declared `CollaboratorError` failure modes.
//! Every call is wrapped in the configured timeout by the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fetcher::{RawSnapshot, StructuralDiff};
use crate::domain::{Classification, ExpectedSchema};
use crate::error::CollaboratorError;

/// Everything the diagnosis step hands to the collaborator. Assembled by the
/// repair workflow during context collection; the workflow fails closed if a
/// required piece is unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisContext {
    pub source_name: String,
    pub last_error: String,
    pub consecutive_failures: u32,
    pub fix_attempts_today: u32,

    /// Current production scraper artifact.
    pub current_artifact: String,

    /// Fresh snapshot of the target.
    pub snapshot: RawSnapshot,

    /// Structural comparison against the last good snapshot.
    pub diff: StructuralDiff,

    /// What the scraper is expected to produce.
    pub expected_schema: ExpectedSchema,
}

/// A candidate replacement artifact produced by the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateArtifact {
    pub source_name: String,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

impl CandidateArtifact {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

#[async_trait]
pub trait CodeGenerator: Send + Sync {
    /// Build a brand-new scraper for a freshly ingested source.
    async fn scaffold(
        &self,
        source_name: &str,
        url: &str,
        snapshot: &RawSnapshot,
        schema: &ExpectedSchema,
    ) -> Result<CandidateArtifact, CollaboratorError>;

    /// Classify a failure when deterministic rules could not.
    async fn diagnose(&self, context: &DiagnosisContext)
    -> Result<Classification, CollaboratorError>;

    /// Produce a candidate replacement artifact for a diagnosed failure.
    async fn patch(
        &self,
        context: &DiagnosisContext,
        classification: &Classification,
    ) -> Result<CandidateArtifact, CollaboratorError>;

    /// Cheap shape check: is the candidate syntactically parseable in the
    /// target language? The workflow rejects candidates that fail this
    /// before staging anything.
    fn syntax_check(&self, artifact: &CandidateArtifact) -> bool;
}

/// Executes a scraper artifact against a controlled sample and returns the
/// extracted records. Used by validation (staged candidates) and by the
/// refresh workflow (production artifacts).
#[async_trait]
pub trait CandidateRunner: Send + Sync {
    async fn run_sample(
        &self,
        source_name: &str,
        artifact: &CandidateArtifact,
    ) -> Result<Vec<serde_json::Value>, CollaboratorError>;
}
