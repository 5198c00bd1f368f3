//! # Stage: Weight Store
//!
//! ## Responsibility
//! Persist published weights for the serving layer. The store holds a single
//! versioned [`WeightsDocument`] keyed by page type; publishing replaces one
//! page type's entry and leaves the others untouched.
//!
//! ## Guarantees
//! - Optimistic concurrency: a publish carries the version the caller read
//!   and fails with [`crate::BanditError::ConcurrentModification`] if the
//!   store moved on in between
//! - Monotonic: every successful publish yields a strictly greater version
//! - No retry: a failed publish is reported to the caller, never repeated
//!
//! ## NOT Responsible For
//! - Computing weights (that belongs to `bandit`)
//! - Deciding whether to publish (dry-run handling belongs to `updater`)

pub mod elastic;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BanditError, PageType};

pub use elastic::{ElasticConfig, ElasticWeightStore};
pub use memory::InMemoryWeightStore;

/// Timestamp format of [`PageTypeWeights::updated`].
pub const UPDATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Published state of one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantEntry {
    /// Traffic share served for this variant.
    pub prob: f64,
    /// Smoothed conversion the share was derived from, if any.
    #[serde(default)]
    pub conversion: Option<f64>,
    /// Opaque variant parameters from configuration.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Published state of one page type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageTypeWeights {
    /// UTC time of the publish, formatted with [`UPDATED_FORMAT`].
    #[serde(default)]
    pub updated: Option<String>,
    /// Entries keyed by variant id.
    #[serde(default)]
    pub variants: BTreeMap<String, VariantEntry>,
}

/// The whole weights configuration as the serving layer reads it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightsDocument {
    /// Store-assigned version. Not part of the stored body.
    #[serde(skip)]
    pub version: u64,
    /// Per-page-type entries.
    #[serde(default)]
    pub page_types: BTreeMap<String, PageTypeWeights>,
}

impl WeightsDocument {
    /// Replace `page_type`'s entry, stamping it with the current UTC time.
    pub fn apply(&mut self, page_type: &PageType, variants: BTreeMap<String, VariantEntry>) {
        self.page_types.insert(
            page_type.to_string(),
            PageTypeWeights {
                updated: Some(chrono::Utc::now().format(UPDATED_FORMAT).to_string()),
                variants,
            },
        );
    }

    /// Weights of `page_type`, if published.
    pub fn weights(&self, page_type: &str) -> Option<BTreeMap<String, f64>> {
        self.page_types.get(page_type).map(|pt| {
            pt.variants
                .iter()
                .map(|(id, entry)| (id.clone(), entry.prob))
                .collect()
        })
    }
}

/// Durable, versioned destination for published weights.
#[async_trait]
pub trait WeightSink: Send + Sync {
    /// Read the latest document together with its version.
    ///
    /// # Errors
    ///
    /// [`BanditError::DocumentNotFound`] if the store holds no document,
    /// [`BanditError::Storage`] on any other read failure.
    async fn read_latest(&self) -> Result<WeightsDocument, BanditError>;

    /// Replace `page_type`'s entries, provided the stored version still equals
    /// `expected_version`.
    ///
    /// # Returns
    ///
    /// The new document version, strictly greater than `expected_version`.
    ///
    /// # Errors
    ///
    /// [`BanditError::ConcurrentModification`] if the version check fails,
    /// [`BanditError::PublishFailed`] for any other write failure.
    async fn publish(
        &self,
        page_type: &PageType,
        variants: BTreeMap<String, VariantEntry>,
        expected_version: u64,
    ) -> Result<u64, BanditError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prob: f64) -> VariantEntry {
        VariantEntry {
            prob,
            conversion: Some(0.02),
            parameters: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_apply_replaces_only_target_page_type() {
        let mut doc = WeightsDocument::default();
        doc.apply(
            &PageType::new("mobile"),
            BTreeMap::from([("1".to_string(), entry(1.0))]),
        );
        doc.apply(
            &PageType::new("desktop"),
            BTreeMap::from([("7".to_string(), entry(0.4)), ("8".to_string(), entry(0.6))]),
        );
        doc.apply(
            &PageType::new("desktop"),
            BTreeMap::from([("9".to_string(), entry(1.0))]),
        );

        let desktop = doc.weights("desktop").unwrap_or_default();
        assert_eq!(desktop.len(), 1, "stale variants must be dropped");
        assert!(doc.weights("mobile").is_some());
        assert!(doc.page_types["desktop"].updated.is_some());
    }

    #[test]
    fn test_updated_timestamp_format() {
        let mut doc = WeightsDocument::default();
        doc.apply(&PageType::new("desktop"), BTreeMap::new());
        let stamp = doc.page_types["desktop"].updated.clone().unwrap_or_default();
        assert!(chrono::NaiveDateTime::parse_from_str(&stamp, UPDATED_FORMAT).is_ok());
    }

    #[test]
    fn test_document_body_omits_version_and_null_parameters() {
        let mut doc = WeightsDocument {
            version: 7,
            ..WeightsDocument::default()
        };
        doc.apply(
            &PageType::new("desktop"),
            BTreeMap::from([("7".to_string(), entry(1.0))]),
        );
        let json = serde_json::to_value(&doc)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: serialize: {e}")));
        assert!(json.get("version").is_none());
        assert!(json["page_types"]["desktop"]["variants"]["7"]
            .get("parameters")
            .is_none());
        assert!((json["page_types"]["desktop"]["variants"]["7"]["prob"]
            .as_f64()
            .unwrap_or_default()
            - 1.0)
            .abs()
            < f64::EPSILON);
    }
}
