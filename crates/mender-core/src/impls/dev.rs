//! Development collaborators: deterministic stand-ins for the fetcher and
//! the generative backends.
//!
//! A dev "artifact" is simply a JSON array of the records it would extract.
//! That keeps the whole ingest/repair/validate loop runnable end-to-end with
//! no network and no model behind it.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Classification, ExpectedSchema, FailureKind, FieldKind, FixStrategy};
use crate::error::CollaboratorError;
use crate::ports::{
    CandidateArtifact, CandidateRunner, Clock, CodeGenerator, DiagnosisContext, Fetcher,
    RawSnapshot,
};
use std::sync::Arc;

/// Serves a fixed page body for every target.
pub struct DevFetcher {
    clock: Arc<dyn Clock>,
    body: String,
}

impl DevFetcher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            body: "<html><body><table id=\"data\"></table></body></html>".to_string(),
        }
    }

    pub fn with_body(clock: Arc<dyn Clock>, body: impl Into<String>) -> Self {
        Self {
            clock,
            body: body.into(),
        }
    }
}

#[async_trait]
impl Fetcher for DevFetcher {
    async fn fetch(&self, _target: &str) -> Result<RawSnapshot, CollaboratorError> {
        Ok(RawSnapshot {
            content_hash: content_hash(&self.body),
            body: self.body.clone(),
            fetched_at: self.clock.now(),
        })
    }
}

/// FNV-1a over the body. Stable across runs, good enough for change
/// detection in dev.
pub fn content_hash(body: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in body.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// Generator that emits record sets satisfying the expected schema.
pub struct DevGenerator {
    clock: Arc<dyn Clock>,
}

impl DevGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn records_for(schema: &ExpectedSchema) -> Value {
        let record: serde_json::Map<String, Value> = schema
            .fields
            .iter()
            .map(|(name, kind)| {
                let value = match kind {
                    FieldKind::String => Value::String(format!("sample {name}")),
                    FieldKind::Number => Value::from(1),
                    FieldKind::Boolean => Value::Bool(true),
                };
                (name.clone(), value)
            })
            .collect();
        Value::Array(vec![Value::Object(record)])
    }
}

#[async_trait]
impl CodeGenerator for DevGenerator {
    async fn scaffold(
        &self,
        source_name: &str,
        _url: &str,
        _snapshot: &RawSnapshot,
        schema: &ExpectedSchema,
    ) -> Result<CandidateArtifact, CollaboratorError> {
        Ok(CandidateArtifact {
            source_name: source_name.to_string(),
            content: Self::records_for(schema).to_string(),
            generated_at: self.clock.now(),
        })
    }

    async fn diagnose(
        &self,
        context: &DiagnosisContext,
    ) -> Result<Classification, CollaboratorError> {
        Ok(Classification {
            kind: FailureKind::StructuralMismatch,
            root_cause: format!(
                "page layout drifted under '{}': {}",
                context.source_name, context.diff.summary
            ),
            fix_strategy: FixStrategy::Patch,
            confidence: 0.9,
        })
    }

    async fn patch(
        &self,
        context: &DiagnosisContext,
        _classification: &Classification,
    ) -> Result<CandidateArtifact, CollaboratorError> {
        Ok(CandidateArtifact {
            source_name: context.source_name.clone(),
            content: Self::records_for(&context.expected_schema).to_string(),
            generated_at: self.clock.now(),
        })
    }

    fn syntax_check(&self, artifact: &CandidateArtifact) -> bool {
        serde_json::from_str::<Value>(&artifact.content).is_ok()
    }
}

/// Runs a dev artifact by parsing its embedded record array.
#[derive(Default)]
pub struct DevRunner;

#[async_trait]
impl CandidateRunner for DevRunner {
    async fn run_sample(
        &self,
        _source_name: &str,
        artifact: &CandidateArtifact,
    ) -> Result<Vec<Value>, CollaboratorError> {
        let parsed: Value = serde_json::from_str(&artifact.content)
            .map_err(|e| CollaboratorError::Failed(format!("artifact not runnable: {e}")))?;
        match parsed {
            Value::Array(records) => Ok(records),
            _ => Err(CollaboratorError::Failed(
                "artifact did not produce a record array".to_string(),
            )),
        }
    }
}
