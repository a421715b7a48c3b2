use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rvh_core::{RawRecord, StoredReview};
use rvh_storage::{ReviewStore, StoreError};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupOutcome {
    pub raw: usize,
    pub unique: usize,
    pub persisted: usize,
}

impl DedupOutcome {
    /// Unique records already stored for the source.
    pub fn skipped(&self) -> usize {
        self.unique - self.persisted
    }
}

pub struct Deduplicator {
    store: Arc<dyn ReviewStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ReviewStore>) -> Self {
        Self { store }
    }

    /// Collapses in-batch duplicates (first occurrence wins), drops fingerprints the
    /// store already has for `source_key`, and writes the rest as one batch.
    pub async fn process(
        &self,
        source_key: &str,
        raw: Vec<RawRecord>,
        fetched_at: DateTime<Utc>,
    ) -> Result<DedupOutcome, StoreError> {
        let raw_count = raw.len();
        let mut seen = HashSet::with_capacity(raw_count);
        let unique = raw
            .iter()
            .map(RawRecord::canonicalize)
            .filter_map(|canonical| {
                let fingerprint = canonical.fingerprint();
                seen.insert(fingerprint.clone())
                    .then(|| canonical.into_stored(source_key, fingerprint, fetched_at))
            })
            .collect::<Vec<StoredReview>>();

        let fingerprints = unique
            .iter()
            .map(|r| r.fingerprint.clone())
            .collect::<Vec<_>>();
        let existing = self
            .store
            .find_existing_fingerprints(source_key, &fingerprints)
            .await?;

        let unique_count = unique.len();
        let fresh = unique
            .into_iter()
            .filter(|r| !existing.contains(&r.fingerprint))
            .collect::<Vec<_>>();

        let persisted = if fresh.is_empty() {
            0
        } else {
            self.store.save_all(fresh).await?
        };

        debug!(
            source_key,
            raw = raw_count,
            unique = unique_count,
            persisted,
            "dedup finished"
        );
        Ok(DedupOutcome {
            raw: raw_count,
            unique: unique_count,
            persisted,
        })
    }
}
