//! # Stage: Batch Boundary
//!
//! ## Responsibility
//! Bring one cycle's aggregated counters into the process as typed
//! [`BatchRow`]s. Raw warehouse output ([`RawBatchRow`]) is validated once,
//! here, so the bandit never sees negative counters, blank ids, or
//! duplicate rows.
//!
//! ## Guarantees
//! - One row per `(page_type, variant_id)` pair in a validated [`Batch`]
//! - Null counters survive as explicit `None` ("no data"), never as zero
//! - An empty batch is [`BanditError::BatchUnavailable`], never an empty cycle
//!
//! ## NOT Responsible For
//! - The warehouse aggregation query itself
//! - Interpreting counters (that belongs to `bandit`)

pub mod file;

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{BanditError, PageType};

pub use file::FileBatchSource;

/// One validated row: aggregated counters of a variant in the latest window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRow {
    /// Traffic segment.
    pub page_type: PageType,
    /// Variant identifier (model version).
    pub variant_id: String,
    /// Clicks in the window, `None` when unknown.
    pub clicks: Option<u64>,
    /// Shows in the window, `None` when unknown.
    pub shows: Option<u64>,
}

/// Row as produced by the warehouse export, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBatchRow {
    /// Traffic segment. May be absent when the export covers one page type.
    #[serde(default)]
    pub page_type: Option<String>,
    /// Variant identifier; also accepted as `model_version`.
    #[serde(default, alias = "model_version")]
    pub variant_id: Option<String>,
    /// Clicks in the window.
    #[serde(default)]
    pub clicks: Option<i64>,
    /// Shows in the window.
    #[serde(default)]
    pub shows: Option<i64>,
}

/// All rows of one cycle plus the population size they were drawn from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// Validated rows.
    pub rows: Vec<BatchRow>,
    /// Size of the event population behind the batch (the "last N events"
    /// window). Shared by every variant of the cycle.
    pub events_cnt: Option<u64>,
}

impl Batch {
    /// Validate raw rows into a batch.
    ///
    /// # Arguments
    ///
    /// * `rows` — Raw rows in source order.
    /// * `events_cnt` — Population size behind the batch, if known.
    /// * `default_page_type` — Applied to rows that carry no page type.
    ///
    /// # Errors
    ///
    /// - [`BanditError::BatchUnavailable`] if `rows` is empty.
    /// - [`BanditError::MalformedRow`] for a missing page type without a
    ///   default, a blank id, a negative counter, or a duplicate
    ///   `(page_type, variant_id)` pair.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn from_raw(
        rows: Vec<RawBatchRow>,
        events_cnt: Option<u64>,
        default_page_type: Option<&PageType>,
    ) -> Result<Self, BanditError> {
        if rows.is_empty() {
            return Err(BanditError::BatchUnavailable(
                "batch source returned no rows".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut validated = Vec::with_capacity(rows.len());
        for (index, raw) in rows.into_iter().enumerate() {
            let page_type = match raw.page_type.as_deref().map(str::trim) {
                Some(pt) if !pt.is_empty() => PageType::new(pt),
                _ => default_page_type.cloned().ok_or_else(|| BanditError::MalformedRow {
                    index,
                    reason: "missing page_type".to_string(),
                })?,
            };

            let variant_id = match raw.variant_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    return Err(BanditError::MalformedRow {
                        index,
                        reason: "missing variant_id".to_string(),
                    })
                }
            };

            let clicks = non_negative(raw.clicks, "clicks", index)?;
            let shows = non_negative(raw.shows, "shows", index)?;

            if !seen.insert((page_type.clone(), variant_id.clone())) {
                return Err(BanditError::MalformedRow {
                    index,
                    reason: format!("duplicate row for {page_type}/{variant_id}"),
                });
            }

            validated.push(BatchRow {
                page_type,
                variant_id,
                clicks,
                shows,
            });
        }

        Ok(Self {
            rows: validated,
            events_cnt,
        })
    }

    /// Rows belonging to `page_type`.
    pub fn rows_for<'a>(&'a self, page_type: &'a PageType) -> impl Iterator<Item = &'a BatchRow> {
        self.rows.iter().filter(move |r| &r.page_type == page_type)
    }

    /// Distinct page types present in the batch.
    pub fn page_types(&self) -> BTreeSet<PageType> {
        self.rows.iter().map(|r| r.page_type.clone()).collect()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn non_negative(value: Option<i64>, field: &str, index: usize) -> Result<Option<u64>, BanditError> {
    match value {
        None => Ok(None),
        Some(v) => u64::try_from(v).map(Some).map_err(|_| BanditError::MalformedRow {
            index,
            reason: format!("{field} must be >= 0, got {v}"),
        }),
    }
}

/// Source of one cycle's aggregated counters.
///
/// Called once per run. Implementations must be `Send + Sync` so the job can
/// hold them behind `Arc<dyn BatchSource>`.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Fetch and validate the batch.
    ///
    /// # Errors
    ///
    /// [`BanditError::BatchUnavailable`] when nothing can be retrieved,
    /// [`BanditError::MalformedRow`] when a row fails validation.
    async fn fetch(&self) -> Result<Batch, BanditError>;
}

/// Batch source serving a fixed, already validated batch.
///
/// Used for replays and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticBatchSource {
    batch: Batch,
}

impl StaticBatchSource {
    /// Serve `batch` on every fetch.
    pub fn new(batch: Batch) -> Self {
        Self { batch }
    }
}

#[async_trait]
impl BatchSource for StaticBatchSource {
    async fn fetch(&self) -> Result<Batch, BanditError> {
        if self.batch.is_empty() {
            return Err(BanditError::BatchUnavailable(
                "static batch is empty".to_string(),
            ));
        }
        Ok(self.batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(page_type: Option<&str>, id: Option<&str>, clicks: Option<i64>, shows: Option<i64>) -> RawBatchRow {
        RawBatchRow {
            page_type: page_type.map(str::to_string),
            variant_id: id.map(str::to_string),
            clicks,
            shows,
        }
    }

    #[test]
    fn test_from_raw_valid_rows_succeed() {
        let batch = Batch::from_raw(
            vec![
                raw(Some("desktop"), Some("7"), Some(10), Some(100)),
                raw(Some("mobile"), Some("7"), Some(5), Some(50)),
            ],
            Some(50_000),
            None,
        )
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: batch: {e}")));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.events_cnt, Some(50_000));
        assert_eq!(batch.page_types().len(), 2);
    }

    #[test]
    fn test_from_raw_empty_is_batch_unavailable() {
        let result = Batch::from_raw(vec![], None, None);
        assert!(matches!(result, Err(BanditError::BatchUnavailable(_))));
    }

    #[test]
    fn test_from_raw_missing_page_type_uses_default() {
        let default = PageType::new("desktop");
        let batch = Batch::from_raw(
            vec![raw(None, Some("7"), Some(1), Some(10))],
            None,
            Some(&default),
        )
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: batch: {e}")));
        assert_eq!(batch.rows[0].page_type, default);
    }

    #[test]
    fn test_from_raw_missing_page_type_without_default_fails() {
        let result = Batch::from_raw(vec![raw(None, Some("7"), Some(1), Some(10))], None, None);
        assert!(matches!(result, Err(BanditError::MalformedRow { index: 0, .. })));
    }

    #[test]
    fn test_from_raw_blank_variant_id_fails() {
        let result = Batch::from_raw(
            vec![
                raw(Some("desktop"), Some("7"), Some(1), Some(10)),
                raw(Some("desktop"), Some("  "), Some(1), Some(10)),
            ],
            None,
            None,
        );
        assert!(matches!(result, Err(BanditError::MalformedRow { index: 1, .. })));
    }

    #[test]
    fn test_from_raw_negative_counter_fails() {
        let result = Batch::from_raw(
            vec![raw(Some("desktop"), Some("7"), Some(-1), Some(10))],
            None,
            None,
        );
        match result {
            Err(BanditError::MalformedRow { reason, .. }) => assert!(reason.contains("clicks")),
            other => std::panic::panic_any(format!("expected MalformedRow, got {other:?}")),
        }
    }

    #[test]
    fn test_from_raw_duplicate_pair_fails() {
        let result = Batch::from_raw(
            vec![
                raw(Some("desktop"), Some("7"), Some(1), Some(10)),
                raw(Some("desktop"), Some("7"), Some(2), Some(20)),
            ],
            None,
            None,
        );
        assert!(matches!(result, Err(BanditError::MalformedRow { index: 1, .. })));
    }

    #[test]
    fn test_from_raw_keeps_null_counters_explicit() {
        let batch = Batch::from_raw(vec![raw(Some("desktop"), Some("7"), None, Some(10))], None, None)
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: batch: {e}")));
        assert_eq!(batch.rows[0].clicks, None);
        assert_eq!(batch.rows[0].shows, Some(10));
    }

    #[test]
    fn test_raw_row_accepts_model_version_alias() {
        let row: RawBatchRow =
            serde_json::from_str(r#"{"model_version": "8", "clicks": 3, "shows": 40}"#)
                .unwrap_or_else(|e| std::panic::panic_any(format!("test: deserialize: {e}")));
        assert_eq!(row.variant_id.as_deref(), Some("8"));
        assert!(row.page_type.is_none());
    }

    #[test]
    fn test_rows_for_filters_by_page_type() {
        let batch = Batch::from_raw(
            vec![
                raw(Some("desktop"), Some("7"), Some(1), Some(10)),
                raw(Some("mobile"), Some("7"), Some(1), Some(10)),
                raw(Some("desktop"), Some("8"), Some(1), Some(10)),
            ],
            None,
            None,
        )
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: batch: {e}")));
        let desktop = PageType::new("desktop");
        assert_eq!(batch.rows_for(&desktop).count(), 2);
    }

    #[tokio::test]
    async fn test_static_source_serves_batch() {
        let batch = Batch::from_raw(
            vec![raw(Some("desktop"), Some("7"), Some(1), Some(10))],
            Some(10),
            None,
        )
        .unwrap_or_else(|e| std::panic::panic_any(format!("test: batch: {e}")));
        let source = StaticBatchSource::new(batch.clone());
        let fetched = source
            .fetch()
            .await
            .unwrap_or_else(|e| std::panic::panic_any(format!("test: fetch: {e}")));
        assert_eq!(fetched, batch);
    }

    #[tokio::test]
    async fn test_static_source_empty_is_unavailable() {
        let source = StaticBatchSource::default();
        assert!(matches!(
            source.fetch().await,
            Err(BanditError::BatchUnavailable(_))
        ));
    }
}
