//! In-process weight store.
//!
//! Backs dry runs, replays, and tests. Versioning follows the same contract
//! as the durable store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{VariantEntry, WeightSink, WeightsDocument};
use crate::{BanditError, PageType};

/// Weight store holding one document in memory.
#[derive(Debug, Default)]
pub struct InMemoryWeightStore {
    document: Mutex<Option<WeightsDocument>>,
}

impl InMemoryWeightStore {
    /// Create a store seeded with an empty document at version 1.
    pub fn new() -> Self {
        Self::seeded(WeightsDocument {
            version: 1,
            ..WeightsDocument::default()
        })
    }

    /// Create a store seeded with `document` (its `version` is kept).
    pub fn seeded(document: WeightsDocument) -> Self {
        Self {
            document: Mutex::new(Some(document)),
        }
    }

    /// Create a store with no document; reads fail with
    /// [`BanditError::DocumentNotFound`].
    pub fn empty() -> Self {
        Self::default()
    }

    /// Advance the version without changing content, as a competing writer would.
    pub async fn bump_version(&self) {
        if let Some(doc) = self.document.lock().await.as_mut() {
            doc.version += 1;
        }
    }
}

#[async_trait]
impl WeightSink for InMemoryWeightStore {
    async fn read_latest(&self) -> Result<WeightsDocument, BanditError> {
        self.document
            .lock()
            .await
            .clone()
            .ok_or_else(|| BanditError::DocumentNotFound("in-memory store is empty".to_string()))
    }

    async fn publish(
        &self,
        page_type: &PageType,
        variants: BTreeMap<String, VariantEntry>,
        expected_version: u64,
    ) -> Result<u64, BanditError> {
        let mut guard = self.document.lock().await;
        let doc = guard.as_mut().ok_or_else(|| BanditError::PublishFailed {
            page_type: page_type.to_string(),
            reason: "no document to update".to_string(),
        })?;

        if doc.version != expected_version {
            return Err(BanditError::ConcurrentModification {
                page_type: page_type.to_string(),
                expected: expected_version,
                found: doc.version,
            });
        }

        doc.apply(page_type, variants);
        doc.version += 1;
        Ok(doc.version)
    }
}
