//! Artifact store port: staging, production, and archive slots per source.
//!
//! The executing runtime always loads "latest production artifact for source
//! X" through this interface, which is what decouples the orchestration core
//! from however artifacts are actually stored and executed.

use async_trait::async_trait;

use super::generator::CandidateArtifact;
use crate::error::CollaboratorError;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write a candidate into the staging slot for its source. At most one
    /// staged candidate per source; later writes overwrite earlier ones.
    async fn write_staged(&self, artifact: &CandidateArtifact) -> Result<(), CollaboratorError>;

    async fn staged(&self, source_name: &str)
    -> Result<Option<CandidateArtifact>, CollaboratorError>;

    /// Latest production artifact for a source.
    async fn production(
        &self,
        source_name: &str,
    ) -> Result<Option<CandidateArtifact>, CollaboratorError>;

    /// Deploy an artifact directly to production (initial ingestion).
    async fn write_production(&self, artifact: &CandidateArtifact)
    -> Result<(), CollaboratorError>;

    /// Atomically replace production with the staged candidate, archiving
    /// the previous production artifact first. Fails if nothing is staged.
    async fn promote(&self, source_name: &str) -> Result<(), CollaboratorError>;

    /// Archived prior production artifacts, newest last. Archives are never
    /// deleted.
    async fn archived(&self, source_name: &str) -> Result<Vec<CandidateArtifact>, CollaboratorError>;
}
