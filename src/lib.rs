//! # traffic-bandit
//!
//! Periodic reallocation of traffic share between competing
//! recommendation-model variants, one independent bandit per page type.
//!
//! ## Architecture
//!
//! One run of the job is a single synchronous cycle:
//! ```text
//! BatchSource ─► Batch ─► Bandit(page_type) ×N ─► WeightSink
//!                          evaluate → recalc        publish
//! ```
//!
//! The bandit core (`bandit`) is pure in-memory numeric work. The only
//! blocking calls are the batch fetch (once per run) and the publish (once per
//! page type).

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod bandit;
pub mod batch;
pub mod config;
pub mod metrics;
pub mod storage;
pub mod updater;

// Re-exports for convenience
pub use bandit::{Bandit, BanditSettings, ClickThroughRate, Policy, Variant};
pub use batch::{Batch, BatchRow, BatchSource, FileBatchSource, RawBatchRow, StaticBatchSource};
pub use storage::{
    ElasticConfig, ElasticWeightStore, InMemoryWeightStore, VariantEntry, WeightSink,
    WeightsDocument,
};
pub use updater::{run_once, BanditUpdater, CycleReport, CycleState, PageTypeReport};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`BanditError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), BanditError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| BanditError::Other(format!("tracing init failed: {e}")))
}

/// Top-level error taxonomy.
///
/// Numeric edge cases (null counters, zero-sum normalisation) never surface
/// here; they are absorbed by epsilon substitution inside the bandit. Only
/// missing signal and I/O conditions become typed failures.
#[derive(Error, Debug)]
pub enum BanditError {
    /// Invalid configuration, e.g. a variant whose page type does not match
    /// its bandit. Fatal: aborts before any page type is processed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every variant's resolved conversion is null or indistinguishable from
    /// zero. Recoverable: the page type is skipped for this cycle.
    #[error("zero signal for page type '{page_type}': all conversions are zero")]
    ZeroSignal {
        /// The page type whose bandit had no signal.
        page_type: String,
    },

    /// The batch source returned no rows or could not be read. Fatal.
    #[error("batch unavailable: {0}")]
    BatchUnavailable(String),

    /// A batch row failed boundary validation. Fatal.
    #[error("malformed batch row {index}: {reason}")]
    MalformedRow {
        /// Zero-based position of the row in the source output.
        index: usize,
        /// Human-readable explanation.
        reason: String,
    },

    /// The weight store holds no configuration document to update. Fatal.
    #[error("weights document not found: {0}")]
    DocumentNotFound(String),

    /// The stored document version moved between read and write.
    #[error(
        "concurrent modification of page type '{page_type}': expected version {expected}, found {found}"
    )]
    ConcurrentModification {
        /// Page type being published.
        page_type: String,
        /// Version the publisher read before writing.
        expected: u64,
        /// Version observed in the store.
        found: u64,
    },

    /// The weight store rejected or failed the write for another reason.
    #[error("publish failed for page type '{page_type}': {reason}")]
    PublishFailed {
        /// Page type being published.
        page_type: String,
        /// Human-readable explanation.
        reason: String,
    },

    /// Reading from the weight store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl BanditError {
    /// Whether this error aborts the whole run rather than a single page type.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::BatchUnavailable(_)
                | Self::MalformedRow { .. }
                | Self::DocumentNotFound(_)
        )
    }

    /// Short stable label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::ZeroSignal { .. } => "zero_signal",
            Self::BatchUnavailable(_) => "batch_unavailable",
            Self::MalformedRow { .. } => "malformed_row",
            Self::DocumentNotFound(_) => "document_not_found",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::PublishFailed { .. } => "publish_failed",
            Self::Storage(_) => "storage",
            Self::Other(_) => "other",
        }
    }
}

/// A traffic segment (e.g. `desktop`, `mobile`) with its own bandit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageType(
    /// The raw page type name as it appears in the batch and the store.
    pub String,
);

impl PageType {
    /// Create a new [`PageType`] from any string-like value.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Return the page type as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
