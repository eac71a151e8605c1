//! Repair workflow: diagnose a failing source, generate a candidate fix,
//! validate it in staging, and promote it if it holds up.
//!
//! The workflow is fail-closed. Missing context, low diagnosis confidence,
//! an unparseable candidate, or a critical validation report all terminate
//! in Rejected; production is only touched on the promote step. Every
//! terminal transition writes exactly one audit row. A breaker denial skips
//! the attempt entirely and writes nothing.

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::breaker::{BreakerDecision, CircuitBreaker, DenyReason};
use crate::config::MenderConfig;
use crate::domain::{
    Classification, ExpectedSchema, FailureKind, FixAttempt, FixOutcome, FixStrategy,
    SourceHealth, validate_records,
};
use crate::error::{CollaboratorError, MenderError};
use crate::health::HealthTracker;
use crate::ports::{
    ArtifactStore, CandidateArtifact, CandidateRunner, Clock, CodeGenerator, DiagnosisContext,
    Fetcher, IdGenerator, SnapshotDiff,
};
use crate::store::SqliteStore;

/// The external services a repair (or ingest) needs. Bundled so the doctor
/// and the orchestrator share one wiring point.
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn Fetcher>,
    pub differ: Arc<dyn SnapshotDiff>,
    pub generator: Arc<dyn CodeGenerator>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub runner: Arc<dyn CandidateRunner>,
}

/// Where the workflow currently is; carried in logs so a stuck repair can be
/// placed immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairStage {
    CollectingContext,
    Diagnosing,
    Patching,
    Staged,
    Validating,
}

impl RepairStage {
    fn as_str(self) -> &'static str {
        match self {
            RepairStage::CollectingContext => "collecting_context",
            RepairStage::Diagnosing => "diagnosing",
            RepairStage::Patching => "patching",
            RepairStage::Staged => "staged",
            RepairStage::Validating => "validating",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RepairOutcome {
    Promoted,
    /// Terminal rejection; the classification the attempt ended under.
    Rejected(FailureKind),
    /// Breaker denial. No work done, no audit row written.
    Skipped(DenyReason),
}

#[derive(Clone)]
pub struct Doctor {
    store: Arc<SqliteStore>,
    health: HealthTracker,
    breaker: CircuitBreaker,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: MenderConfig,
}

impl Doctor {
    pub fn new(
        store: Arc<SqliteStore>,
        health: HealthTracker,
        breaker: CircuitBreaker,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: MenderConfig,
    ) -> Self {
        Self {
            store,
            health,
            breaker,
            collaborators,
            clock,
            ids,
            config,
        }
    }

    /// Run one repair attempt for a source, end to end.
    pub async fn repair(&self, source_name: &str) -> Result<RepairOutcome, MenderError> {
        let now = self.clock.now();
        let health = self
            .health
            .get(source_name)?
            .unwrap_or_else(|| SourceHealth::new(source_name));

        match self.breaker.evaluate(&health, now)? {
            BreakerDecision::Deny(reason) => {
                info!(source = source_name, reason = reason.as_str(), "repair skipped");
                return Ok(RepairOutcome::Skipped(reason));
            }
            BreakerDecision::Allow { remaining } => {
                info!(source = source_name, remaining, "repair attempt starting");
            }
        }

        // The attempt counts against the budget from here on, whatever the
        // outcome.
        self.health.record_fix_attempt(source_name)?;

        let spec = self
            .store
            .get_source(source_name)?
            .ok_or_else(|| MenderError::SourceNotFound(source_name.to_string()))?;

        // -- collecting context -----------------------------------------------
        let stage = RepairStage::CollectingContext;
        let snapshot = match self.bounded(self.collaborators.fetcher.fetch(&spec.url)).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                // A failed fetch is itself the diagnosis; classify it
                // deterministically and stop.
                let classification = classify_fetch_failure(&err);
                if classification.kind == FailureKind::DomainDead {
                    self.health.mark_dead(source_name, &classification.root_cause)?;
                }
                return self
                    .reject(source_name, stage, classification, None, None)
                    .await;
            }
        };

        let Some(current) = self.collaborators.artifacts.production(source_name).await? else {
            // No production artifact to diagnose against: fail closed.
            let classification = Classification {
                kind: FailureKind::ContextUnavailable,
                root_cause: "no production artifact to diagnose".to_string(),
                fix_strategy: FixStrategy::Rebuild,
                confidence: 1.0,
            };
            return self
                .reject(source_name, stage, classification, None, None)
                .await;
        };

        let diff = self
            .collaborators
            .differ
            .compute(spec.last_snapshot_hash.as_deref(), &snapshot);

        let context = DiagnosisContext {
            source_name: source_name.to_string(),
            last_error: health.last_error.clone().unwrap_or_default(),
            consecutive_failures: health.consecutive_failures,
            fix_attempts_today: health.fix_attempts_today,
            current_artifact: current.content.clone(),
            snapshot,
            diff,
            expected_schema: spec.schema.clone(),
        };

        // -- diagnosing -------------------------------------------------------
        // Cheap deterministic rules first; the generative collaborator only
        // sees failures the sample run cannot explain.
        let stage = RepairStage::Diagnosing;
        let deterministic = self
            .probe_current_artifact(source_name, &current, &spec.schema)
            .await;
        let classification = match deterministic {
            Some(classification) => {
                info!(
                    source = source_name,
                    kind = classification.kind.as_str(),
                    "failure classified from sample run"
                );
                classification
            }
            None => match self
                .bounded(self.collaborators.generator.diagnose(&context))
                .await
            {
                Ok(classification) => classification,
                Err(err) => {
                    let classification = Classification {
                        kind: FailureKind::ContextUnavailable,
                        root_cause: format!("diagnosis unavailable: {err}"),
                        fix_strategy: FixStrategy::Patch,
                        confidence: 1.0,
                    };
                    return self
                        .reject(source_name, stage, classification, None, None)
                        .await;
                }
            },
        };

        if classification.kind == FailureKind::DomainDead {
            self.health.mark_dead(source_name, &classification.root_cause)?;
            let diagnosis = classification.root_cause.clone();
            return self
                .reject(source_name, stage, classification, Some(diagnosis), None)
                .await;
        }

        if classification.confidence < self.config.min_diagnosis_confidence {
            warn!(
                source = source_name,
                confidence = classification.confidence,
                "diagnosis below confidence floor"
            );
            let diagnosis = format!(
                "low confidence ({:.2}): {}",
                classification.confidence, classification.root_cause
            );
            return self
                .reject(source_name, stage, classification, Some(diagnosis), None)
                .await;
        }

        // -- patching ---------------------------------------------------------
        let stage = RepairStage::Patching;
        let diagnosis = classification.root_cause.clone();
        let candidate = match self
            .bounded(self.collaborators.generator.patch(&context, &classification))
            .await
        {
            Ok(candidate) => candidate,
            Err(err) => {
                let diagnosis = format!("{diagnosis}; patch generation failed: {err}");
                return self
                    .reject(source_name, stage, classification, Some(diagnosis), None)
                    .await;
            }
        };

        if candidate.is_empty() || !self.collaborators.generator.syntax_check(&candidate) {
            let diagnosis = format!("{diagnosis}; candidate failed syntax check");
            return self
                .reject(source_name, stage, classification, Some(diagnosis), None)
                .await;
        }

        // -- staged -----------------------------------------------------------
        self.collaborators.artifacts.write_staged(&candidate).await?;
        info!(source = source_name, stage = RepairStage::Staged.as_str(), "candidate staged");
        let patch_ref = format!("staging/{source_name}");

        // -- validating -------------------------------------------------------
        let stage = RepairStage::Validating;
        let records = match self
            .bounded(self.collaborators.runner.run_sample(source_name, &candidate))
            .await
        {
            Ok(records) => records,
            Err(err) => {
                let classification = Classification {
                    kind: FailureKind::ValidationFailed,
                    root_cause: format!("sample run failed: {err}"),
                    fix_strategy: classification.fix_strategy,
                    confidence: classification.confidence,
                };
                return self
                    .reject(
                        source_name,
                        stage,
                        classification,
                        Some(diagnosis),
                        Some(patch_ref.as_str()),
                    )
                    .await;
            }
        };

        let report = validate_records(&spec.schema, &records);
        let report_json = serde_json::to_value(&report)?;

        if !report.passed() {
            warn!(
                source = source_name,
                errors = report.errors.len(),
                score = report.score,
                "candidate failed validation; staging retained for inspection"
            );
            let attempt = self.append_attempt(
                source_name,
                FailureKind::ValidationFailed,
                Some(diagnosis),
                Some(patch_ref),
                Some(report_json),
                FixOutcome::Rejected,
            )?;
            self.health
                .record_repair_outcome(source_name, attempt.outcome)?;
            return Ok(RepairOutcome::Rejected(FailureKind::ValidationFailed));
        }

        // -- promoting --------------------------------------------------------
        self.collaborators.artifacts.promote(source_name).await?;
        self.store
            .set_snapshot_hash(source_name, &context.snapshot.content_hash)?;

        let attempt = self.append_attempt(
            source_name,
            classification.kind,
            Some(diagnosis),
            Some(patch_ref),
            Some(report_json),
            FixOutcome::Promoted,
        )?;
        self.health
            .record_repair_outcome(source_name, attempt.outcome)?;

        info!(source = source_name, score = report.score, "candidate promoted to production");
        Ok(RepairOutcome::Promoted)
    }

    async fn reject(
        &self,
        source_name: &str,
        stage: RepairStage,
        classification: Classification,
        diagnosis: Option<String>,
        patch_ref: Option<&str>,
    ) -> Result<RepairOutcome, MenderError> {
        warn!(
            source = source_name,
            stage = stage.as_str(),
            kind = classification.kind.as_str(),
            "repair rejected: {}",
            classification.root_cause
        );
        let kind = classification.kind;
        self.append_attempt(
            source_name,
            kind,
            diagnosis,
            patch_ref.map(str::to_string),
            None,
            FixOutcome::Rejected,
        )?;
        self.health
            .record_repair_outcome(source_name, FixOutcome::Rejected)?;
        Ok(RepairOutcome::Rejected(kind))
    }

    fn append_attempt(
        &self,
        source_name: &str,
        classification: FailureKind,
        diagnosis: Option<String>,
        patch_ref: Option<String>,
        validation: Option<serde_json::Value>,
        outcome: FixOutcome,
    ) -> Result<FixAttempt, MenderError> {
        let attempt = FixAttempt {
            id: self.ids.fix_attempt_id(),
            source_name: source_name.to_string(),
            classification,
            diagnosis,
            patch_ref,
            validation,
            outcome,
            created_at: self.clock.now(),
        };
        self.store.append_fix_attempt(&attempt)?;
        Ok(attempt)
    }

    /// Deterministic classification by running the current production
    /// artifact against a sample. Zero records means the page structure
    /// drifted out from under the extractor; records in the wrong shape
    /// mean the schema did. Returns `None` when the sample run explains
    /// nothing, leaving the call to the generative collaborator.
    async fn probe_current_artifact(
        &self,
        source_name: &str,
        artifact: &CandidateArtifact,
        schema: &ExpectedSchema,
    ) -> Option<Classification> {
        let records = match self
            .bounded(self.collaborators.runner.run_sample(source_name, artifact))
            .await
        {
            Ok(records) => records,
            // Runner unavailable is not evidence about the artifact.
            Err(_) => return None,
        };

        if records.is_empty() {
            return Some(Classification {
                kind: FailureKind::StructuralMismatch,
                root_cause: "current scraper extracts no records from the page".to_string(),
                fix_strategy: FixStrategy::Rebuild,
                confidence: 1.0,
            });
        }

        let report = validate_records(schema, &records);
        if !report.errors.is_empty() {
            return Some(Classification {
                kind: FailureKind::SchemaMismatch,
                root_cause: format!(
                    "current scraper output drifted from the expected schema: {}",
                    report.errors.join("; ")
                ),
                fix_strategy: FixStrategy::Patch,
                confidence: 1.0,
            });
        }
        None
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        match timeout(self.config.collaborator_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout),
        }
    }
}

/// Deterministic classification of a fetch failure. Generative diagnosis is
/// only consulted when the page was actually retrievable.
fn classify_fetch_failure(err: &CollaboratorError) -> Classification {
    let (kind, root_cause) = match err {
        CollaboratorError::HttpStatus(status @ (404 | 410)) => (
            FailureKind::DomainDead,
            format!("target permanently gone (http {status})"),
        ),
        CollaboratorError::HttpStatus(status) => {
            (FailureKind::FetchError, format!("http {status} from target"))
        }
        CollaboratorError::Unreachable(detail) => {
            (FailureKind::FetchError, format!("target unreachable: {detail}"))
        }
        CollaboratorError::Timeout => (FailureKind::Timeout, "fetch timed out".to_string()),
        CollaboratorError::RateLimited => {
            (FailureKind::RateLimited, "target rate limited us".to_string())
        }
        CollaboratorError::Failed(detail) => {
            (FailureKind::FetchError, format!("fetch failed: {detail}"))
        }
    };
    Classification {
        kind,
        root_cause,
        fix_strategy: FixStrategy::Patch,
        confidence: 1.0,
    }
}
