//! Batch source backed by a JSON export of the warehouse aggregation.
//!
//! Accepted shapes:
//!
//! ```json
//! {"events_cnt": 50000, "rows": [{"page_type": "desktop", "model_version": "7", "clicks": 210, "shows": 9800}]}
//! ```
//!
//! or a bare array of rows. A missing `events_cnt` falls back to the
//! configured window size.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{Batch, BatchSource, RawBatchRow};
use crate::{BanditError, PageType};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchFile {
    Envelope {
        #[serde(default)]
        events_cnt: Option<u64>,
        rows: Vec<RawBatchRow>,
    },
    Rows(Vec<RawBatchRow>),
}

/// Reads a batch from a JSON file on every fetch.
#[derive(Debug, Clone)]
pub struct FileBatchSource {
    path: PathBuf,
    events_cnt: Option<u64>,
    default_page_type: Option<PageType>,
}

impl FileBatchSource {
    /// Create a source reading `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            events_cnt: None,
            default_page_type: None,
        }
    }

    /// Population size used when the file does not carry one.
    pub fn with_events_cnt(mut self, events_cnt: u64) -> Self {
        self.events_cnt = Some(events_cnt);
        self
    }

    /// Page type applied to rows that carry none.
    pub fn with_default_page_type(mut self, page_type: PageType) -> Self {
        self.default_page_type = Some(page_type);
        self
    }

    /// The file this source reads.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parse file content into a validated batch.
    ///
    /// # Errors
    ///
    /// [`BanditError::BatchUnavailable`] if the JSON is malformed or holds no
    /// rows; [`BanditError::MalformedRow`] if a row fails validation.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn parse(&self, content: &str) -> Result<Batch, BanditError> {
        let parsed: BatchFile = serde_json::from_str(content).map_err(|e| {
            BanditError::BatchUnavailable(format!("cannot parse {}: {e}", self.path.display()))
        })?;

        let (file_events_cnt, rows) = match parsed {
            BatchFile::Envelope { events_cnt, rows } => (events_cnt, rows),
            BatchFile::Rows(rows) => (None, rows),
        };

        Batch::from_raw(
            rows,
            file_events_cnt.or(self.events_cnt),
            self.default_page_type.as_ref(),
        )
    }
}

#[async_trait]
impl BatchSource for FileBatchSource {
    async fn fetch(&self) -> Result<Batch, BanditError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            BanditError::BatchUnavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;

        let batch = self.parse(&content)?;
        info!(
            path = %self.path.display(),
            rows = batch.len(),
            events_cnt = ?batch.events_cnt,
            "batch loaded"
        );
        Ok(batch)
    }
}
