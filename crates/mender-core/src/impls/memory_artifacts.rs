//! In-memory artifact store for development and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::ports::{ArtifactStore, CandidateArtifact};

#[derive(Default)]
struct Slots {
    staging: HashMap<String, CandidateArtifact>,
    production: HashMap<String, CandidateArtifact>,
    archive: HashMap<String, Vec<CandidateArtifact>>,
}

/// Keeps staging, production, and archive slots in process memory. The
/// promote path mirrors the durable contract: archive the old production
/// artifact, then move staged into its place, atomically under one lock.
#[derive(Default)]
pub struct MemoryArtifactStore {
    slots: Mutex<Slots>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().expect("artifact store mutex poisoned")
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn write_staged(&self, artifact: &CandidateArtifact) -> Result<(), CollaboratorError> {
        self.lock()
            .staging
            .insert(artifact.source_name.clone(), artifact.clone());
        Ok(())
    }

    async fn staged(
        &self,
        source_name: &str,
    ) -> Result<Option<CandidateArtifact>, CollaboratorError> {
        Ok(self.lock().staging.get(source_name).cloned())
    }

    async fn production(
        &self,
        source_name: &str,
    ) -> Result<Option<CandidateArtifact>, CollaboratorError> {
        Ok(self.lock().production.get(source_name).cloned())
    }

    async fn write_production(
        &self,
        artifact: &CandidateArtifact,
    ) -> Result<(), CollaboratorError> {
        self.lock()
            .production
            .insert(artifact.source_name.clone(), artifact.clone());
        Ok(())
    }

    async fn promote(&self, source_name: &str) -> Result<(), CollaboratorError> {
        let mut slots = self.lock();
        let staged = slots
            .staging
            .remove(source_name)
            .ok_or_else(|| CollaboratorError::Failed(format!("nothing staged for '{source_name}'")))?;
        if let Some(old) = slots.production.insert(source_name.to_string(), staged) {
            slots
                .archive
                .entry(source_name.to_string())
                .or_default()
                .push(old);
        }
        Ok(())
    }

    async fn archived(
        &self,
        source_name: &str,
    ) -> Result<Vec<CandidateArtifact>, CollaboratorError> {
        Ok(self.lock().archive.get(source_name).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn artifact(source: &str, content: &str) -> CandidateArtifact {
        CandidateArtifact {
            source_name: source.to_string(),
            content: content.to_string(),
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn promote_archives_previous_production() {
        let store = MemoryArtifactStore::new();
        store.write_production(&artifact("widgets", "v1")).await.unwrap();
        store.write_staged(&artifact("widgets", "v2")).await.unwrap();

        store.promote("widgets").await.unwrap();

        let production = store.production("widgets").await.unwrap().unwrap();
        assert_eq!(production.content, "v2");
        assert!(store.staged("widgets").await.unwrap().is_none());

        let archive = store.archived("widgets").await.unwrap();
        assert_eq!(archive.len(), 1);
        assert_eq!(archive[0].content, "v1");
    }

    #[tokio::test]
    async fn promote_without_staged_fails() {
        let store = MemoryArtifactStore::new();
        store.write_production(&artifact("widgets", "v1")).await.unwrap();

        assert!(store.promote("widgets").await.is_err());
        // Production untouched by the failed promote.
        let production = store.production("widgets").await.unwrap().unwrap();
        assert_eq!(production.content, "v1");
    }

    #[tokio::test]
    async fn staging_overwrites_per_source() {
        let store = MemoryArtifactStore::new();
        store.write_staged(&artifact("widgets", "v2")).await.unwrap();
        store.write_staged(&artifact("widgets", "v3")).await.unwrap();

        let staged = store.staged("widgets").await.unwrap().unwrap();
        assert_eq!(staged.content, "v3");
    }
}
