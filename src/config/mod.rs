//! # Stage: Declarative Job Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that drives one run of the job: bandit
//! policy and floor, where the batch comes from, where weights go, and which
//! variants compete in each page type.
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `UpdaterConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Typed: the dict-of-dicts page type table becomes explicit records at parse time
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building bandits from config (that belongs to `updater`)
//! - Connecting to the weight store (that belongs to `storage`)

pub mod loader;
pub mod validation;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::bandit::engine::DEFAULT_MIN_WEIGHT;
use crate::bandit::metric::DEFAULT_SMOOTHING;
use crate::bandit::{BanditSettings, Policy};
use crate::batch::FileBatchSource;
use crate::storage::ElasticConfig;
use crate::PageType;

pub use validation::ConfigError;

// ── Default value functions ──────────────────────────────────────────────

/// Default traffic floor per variant: 5%.
fn default_min_weight() -> f64 {
    DEFAULT_MIN_WEIGHT
}

/// Default click-through smoothing: 1000 shows.
fn default_smoothing() -> f64 {
    DEFAULT_SMOOTHING
}

/// Default batch export path.
fn default_events_path() -> PathBuf {
    PathBuf::from("batch.json")
}

/// Default "last N events" window: 50 000 events.
fn default_last_events_cnt() -> u64 {
    50_000
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for one run of the job.
///
/// # Example
///
/// ```toml
/// [bandit]
/// policy = "ucb"
/// min_weight = 0.05
///
/// [page_types.desktop.7]
/// parameters = { item_boost = 1.0 }
///
/// [page_types.desktop.8]
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct UpdaterConfig {
    /// Allocation policy and its numeric knobs.
    #[serde(default)]
    pub bandit: BanditSection,
    /// Where the batch comes from.
    #[serde(default)]
    pub events: EventsSection,
    /// Where weights are published.
    #[serde(default)]
    pub storage: ElasticConfig,
    /// Variants per page type: `page_types.<page_type>.<variant_id>`.
    #[serde(default)]
    pub page_types: BTreeMap<String, BTreeMap<String, VariantConfig>>,
}

impl UpdaterConfig {
    /// Settings shared by every bandit of the run.
    pub fn bandit_settings(&self) -> BanditSettings {
        BanditSettings {
            policy: self.bandit.policy,
            min_weight: self.bandit.min_weight,
            smoothing: self.bandit.smoothing,
            zero_signal_exempt: self
                .bandit
                .zero_signal_exempt
                .iter()
                .map(|pt| PageType::new(pt.as_str()))
                .collect::<BTreeSet<_>>(),
        }
    }

    /// Batch source reading the configured export.
    pub fn batch_source(&self) -> FileBatchSource {
        let source = FileBatchSource::new(self.events.path.clone())
            .with_events_cnt(self.events.last_events_cnt);
        match &self.events.default_page_type {
            Some(pt) => source.with_default_page_type(PageType::new(pt.as_str())),
            None => source,
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Allocation policy settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BanditSection {
    /// Raw score strategy: `"proportional"` or `"ucb"`.
    #[serde(default)]
    pub policy: Policy,
    /// Minimum traffic share per variant, in `(0, 1)`.
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    /// Additive smoothing on the shows denominator.
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    /// Page types that get a near-uniform allocation instead of being skipped
    /// when no variant has any conversion.
    #[serde(default)]
    pub zero_signal_exempt: Vec<String>,
}

impl Default for BanditSection {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            min_weight: default_min_weight(),
            smoothing: default_smoothing(),
            zero_signal_exempt: Vec::new(),
        }
    }
}

/// Batch source settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EventsSection {
    /// JSON export of the aggregated counters.
    #[serde(default = "default_events_path")]
    pub path: PathBuf,
    /// Size of the "last N events" window each variant's counters cover.
    /// Used as the population size when the export does not carry one.
    #[serde(default = "default_last_events_cnt")]
    pub last_events_cnt: u64,
    /// Page type assigned to rows that carry none.
    #[serde(default)]
    pub default_page_type: Option<String>,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            path: default_events_path(),
            last_events_cnt: default_last_events_cnt(),
            default_page_type: None,
        }
    }
}

/// One variant's configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct VariantConfig {
    /// Opaque parameters handed to the serving layer with the weight.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Export the JSON Schema for `UpdaterConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(UpdaterConfig);
    serde_json::to_string_pretty(&schema)
}
