//! Source registry entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::validation::ExpectedSchema;

/// Registry entry describing one configured source: where it lives and what
/// its scraper is expected to produce. Created by ingestion, read by the
/// refresh and repair workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    pub url: String,
    pub schema: ExpectedSchema,

    /// Content hash of the last successfully scraped snapshot, used for
    /// structural-change detection during diagnosis.
    pub last_snapshot_hash: Option<String>,

    pub registered_at: DateTime<Utc>,
}

impl SourceSpec {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        schema: ExpectedSchema,
        registered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            schema,
            last_snapshot_hash: None,
            registered_at,
        }
    }
}
