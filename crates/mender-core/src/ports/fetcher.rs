//! Fetcher port: retrieves the current state of a source's target.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// Raw snapshot of a target as fetched right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub body: String,

    /// Stable hash of the body, used for structural-change detection.
    pub content_hash: String,

    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &str) -> Result<RawSnapshot, CollaboratorError>;
}

/// Structural comparison between the stored snapshot hash and a fresh fetch.
/// Pure computation; implementations decide how deep the comparison goes.
pub trait SnapshotDiff: Send + Sync {
    fn compute(&self, old_hash: Option<&str>, new: &RawSnapshot) -> StructuralDiff;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralDiff {
    pub changed: bool,
    pub summary: String,
}

/// Default diff: hash comparison only.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashDiff;

impl SnapshotDiff for HashDiff {
    fn compute(&self, old_hash: Option<&str>, new: &RawSnapshot) -> StructuralDiff {
        match old_hash {
            None => StructuralDiff {
                changed: false,
                summary: "no previous snapshot to compare".to_string(),
            },
            Some(old) if old == new.content_hash => StructuralDiff {
                changed: false,
                summary: "content hash unchanged".to_string(),
            },
            Some(_) => StructuralDiff {
                changed: true,
                summary: "content hash changed since last successful scrape".to_string(),
            },
        }
    }
}
