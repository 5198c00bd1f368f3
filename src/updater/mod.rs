//! # Stage: Cycle Orchestration
//!
//! ## Responsibility
//! Own one [`Bandit`] per configured page type and drive each through one
//! cycle: evaluate the batch, recalculate weights, publish. Every page type
//! runs its own state machine:
//!
//! ```text
//! Configured ─► Evaluated ─► Recalculated ─┬─► Published
//!                                │          ├─► (dry run: stays Recalculated)
//!                                │          └─► Failed (publish error)
//!                                └─► SkippedZeroSignal
//! ```
//!
//! ## Guarantees
//! - Failure isolation: one page type's zero signal or publish failure never
//!   stops the others
//! - Skipped and failed page types leave their stored weights untouched
//! - Dry run never calls [`WeightSink::publish`]
//! - Every outcome is logged with the resulting weights
//!
//! ## NOT Responsible For
//! - The weight arithmetic (that belongs to `bandit`)
//! - Version checks and retries (the sink checks; nobody retries)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::bandit::{Bandit, BanditSettings, ClickThroughRate, Variant};
use crate::batch::{Batch, BatchSource};
use crate::config::{UpdaterConfig, VariantConfig};
use crate::metrics;
use crate::storage::{VariantEntry, WeightSink};
use crate::{BanditError, PageType};

/// Position of one page type in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Bandit built from configuration; no data applied yet.
    Configured,
    /// The batch has been applied to the variants' metrics.
    Evaluated,
    /// Weights recomputed. Terminal in dry-run mode.
    Recalculated,
    /// Weights written to the sink.
    Published,
    /// No variant had any signal; stored weights left as they were.
    SkippedZeroSignal,
    /// Publishing failed; stored weights left as they were.
    Failed,
}

impl CycleState {
    /// Metric and log label of a finished cycle.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Configured | Self::Evaluated => "incomplete",
            Self::Recalculated => "dry_run",
            Self::Published => "published",
            Self::SkippedZeroSignal => "skipped_zero_signal",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.outcome())
    }
}

/// Result of one page type's cycle.
#[derive(Debug)]
pub struct PageTypeReport {
    /// The page type.
    pub page_type: PageType,
    /// Where the cycle stopped.
    pub state: CycleState,
    /// Weights after the cycle. The pre-cycle uniform weights when skipped.
    pub weights: BTreeMap<String, f64>,
    /// Smoothed conversion per variant after evaluation.
    pub conversions: BTreeMap<String, Option<f64>>,
    /// Store version after a successful publish.
    pub version: Option<u64>,
    /// Why the cycle did not publish, if it did not.
    pub error: Option<BanditError>,
}

/// Outcome of one run over every configured page type.
#[derive(Debug, Default)]
pub struct CycleReport {
    pages: Vec<PageTypeReport>,
}

impl CycleReport {
    /// All page type reports in processing order.
    pub fn pages(&self) -> &[PageTypeReport] {
        &self.pages
    }

    /// Report of `page_type`, if it was processed.
    pub fn get(&self, page_type: &str) -> Option<&PageTypeReport> {
        self.pages.iter().find(|p| p.page_type.as_str() == page_type)
    }

    /// Page types whose weights were written.
    pub fn published(&self) -> impl Iterator<Item = &PageTypeReport> {
        self.in_state(CycleState::Published)
    }

    /// Page types skipped for lack of signal.
    pub fn skipped(&self) -> impl Iterator<Item = &PageTypeReport> {
        self.in_state(CycleState::SkippedZeroSignal)
    }

    /// Page types whose publish failed.
    pub fn failed(&self) -> impl Iterator<Item = &PageTypeReport> {
        self.in_state(CycleState::Failed)
    }

    fn in_state(&self, state: CycleState) -> impl Iterator<Item = &PageTypeReport> {
        self.pages.iter().filter(move |p| p.state == state)
    }
}

/// Owns the bandits of one run and publishes their weights.
pub struct BanditUpdater {
    settings: BanditSettings,
    sink: Arc<dyn WeightSink>,
    dry_run: bool,
    bandits: BTreeMap<PageType, Bandit>,
}

impl BanditUpdater {
    /// Create an updater with no bandits.
    ///
    /// With `dry_run` set, cycles stop after recalculation and nothing is
    /// written to `sink`.
    pub fn new(settings: BanditSettings, sink: Arc<dyn WeightSink>, dry_run: bool) -> Self {
        Self {
            settings,
            sink,
            dry_run,
            bandits: BTreeMap::new(),
        }
    }

    /// Whether this updater only computes weights.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// The bandit of `page_type`, if configured.
    pub fn bandit(&self, page_type: &str) -> Option<&Bandit> {
        self.bandits.get(&PageType::new(page_type))
    }

    /// Build one fresh bandit per page type from the variant tables.
    ///
    /// Page types with no variants are skipped. Any previously built bandits
    /// are discarded.
    ///
    /// # Returns
    ///
    /// The number of bandits built.
    ///
    /// # Errors
    ///
    /// Returns [`BanditError::Configuration`] if a page type's variants
    /// cannot form a bandit.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn init_bandits(
        &mut self,
        page_types: &BTreeMap<String, BTreeMap<String, VariantConfig>>,
    ) -> Result<usize, BanditError> {
        self.bandits.clear();

        for (name, variant_configs) in page_types {
            let page_type = PageType::new(name.as_str());
            if variant_configs.is_empty() {
                info!(page_type = %page_type, "no variants configured, page type skipped");
                continue;
            }

            let variants: Vec<Variant> = variant_configs
                .iter()
                .map(|(id, cfg)| {
                    Variant::new(
                        id.as_str(),
                        page_type.clone(),
                        ClickThroughRate::with_smoothing(self.settings.smoothing),
                    )
                    .with_parameters(cfg.parameters.clone())
                })
                .collect();

            let bandit = Bandit::new(page_type.clone(), variants, &self.settings)?;
            self.bandits.insert(page_type, bandit);
        }

        debug!(bandits = self.bandits.len(), "bandits initialised");
        Ok(self.bandits.len())
    }

    /// Run one cycle for every bandit, sequentially.
    ///
    /// Never fails as a whole: per-page-type errors land in the report.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn update_bandits(&mut self, batch: &Batch) -> CycleReport {
        for page_type in batch.page_types() {
            if !self.bandits.contains_key(&page_type) {
                debug!(page_type = %page_type, "batch rows for unconfigured page type ignored");
            }
        }

        let page_types: Vec<PageType> = self.bandits.keys().cloned().collect();
        let mut report = CycleReport::default();
        for page_type in page_types {
            let started = Instant::now();
            let page = self.run_page_type(&page_type, batch).await;
            metrics::record_stage_duration("cycle", started.elapsed());
            metrics::record_cycle(page_type.as_str(), page.state.outcome());
            report.pages.push(page);
        }
        report
    }

    async fn run_page_type(&mut self, page_type: &PageType, batch: &Batch) -> PageTypeReport {
        let Some(bandit) = self.bandits.get_mut(page_type) else {
            return PageTypeReport {
                page_type: page_type.clone(),
                state: CycleState::Configured,
                weights: BTreeMap::new(),
                conversions: BTreeMap::new(),
                version: None,
                error: None,
            };
        };

        let mut state = CycleState::Configured;
        let updated = bandit.evaluate_batch(batch);
        state = advance(state, CycleState::Evaluated);
        debug!(page_type = %page_type, variants_updated = updated, "batch evaluated");

        let recalc = bandit.recalc_weights();
        let weights = bandit.get_weights();
        let conversions = bandit.conversions();

        let mut page = PageTypeReport {
            page_type: page_type.clone(),
            state,
            weights,
            conversions,
            version: None,
            error: None,
        };

        if let Err(e) = recalc {
            warn!(
                page_type = %page_type,
                conversions = ?page.conversions,
                "zero signal, keeping stored weights"
            );
            page.state = advance(page.state, CycleState::SkippedZeroSignal);
            page.error = Some(e);
            return page;
        }
        page.state = advance(page.state, CycleState::Recalculated);

        for (id, weight) in &page.weights {
            let conversion = page.conversions.get(id).copied().flatten();
            metrics::set_variant_state(page_type.as_str(), id, *weight, conversion);
        }

        if self.dry_run {
            info!(
                page_type = %page_type,
                weights = ?page.weights,
                conversions = ?page.conversions,
                "dry run, weights not published"
            );
            return page;
        }

        let entries = self.entries(page_type, &page.weights, &page.conversions);
        match self.publish(page_type, entries).await {
            Ok(version) => {
                info!(
                    page_type = %page_type,
                    version,
                    weights = ?page.weights,
                    "weights published"
                );
                page.state = advance(page.state, CycleState::Published);
                page.version = Some(version);
            }
            Err(e) => {
                error!(
                    page_type = %page_type,
                    error = %e,
                    weights = ?page.weights,
                    "publish failed, keeping stored weights"
                );
                page.state = advance(page.state, CycleState::Failed);
                page.error = Some(e);
            }
        }
        page
    }

    fn entries(
        &self,
        page_type: &PageType,
        weights: &BTreeMap<String, f64>,
        conversions: &BTreeMap<String, Option<f64>>,
    ) -> BTreeMap<String, VariantEntry> {
        let bandit = self.bandits.get(page_type);
        weights
            .iter()
            .map(|(id, weight)| {
                let entry = VariantEntry {
                    prob: *weight,
                    conversion: conversions.get(id).copied().flatten(),
                    parameters: bandit
                        .and_then(|b| b.variant(id))
                        .map(|v| v.parameters.clone())
                        .unwrap_or(serde_json::Value::Null),
                };
                (id.clone(), entry)
            })
            .collect()
    }

    /// Read the current version, then write against it.
    async fn publish(
        &self,
        page_type: &PageType,
        entries: BTreeMap<String, VariantEntry>,
    ) -> Result<u64, BanditError> {
        let current = self.sink.read_latest().await.map_err(|e| BanditError::PublishFailed {
            page_type: page_type.to_string(),
            reason: format!("cannot read current version: {e}"),
        })?;
        self.sink.publish(page_type, entries, current.version).await
    }
}

/// Move to `next`, logging transitions the state machine does not allow.
fn advance(from: CycleState, next: CycleState) -> CycleState {
    use CycleState::*;
    let allowed = matches!(
        (from, next),
        (Configured, Evaluated)
            | (Evaluated, Recalculated)
            | (Evaluated, SkippedZeroSignal)
            | (Recalculated, Published)
            | (Recalculated, Failed)
    );
    if !allowed {
        debug!(from = %from, to = %next, "unexpected cycle transition");
    }
    next
}

/// Run one complete job: read the stored weights, fetch the batch once,
/// build bandits from `config`, and run a cycle for every page type.
///
/// # Errors
///
/// Fatal conditions only: the weights document cannot be read, the batch is
/// unavailable or malformed, or the configuration cannot form a bandit.
/// Per-page-type failures are in the returned report.
///
/// # Panics
///
/// This function never panics.
pub async fn run_once(
    config: &UpdaterConfig,
    source: &dyn BatchSource,
    sink: Arc<dyn WeightSink>,
    dry_run: bool,
) -> Result<CycleReport, BanditError> {
    let previous = sink.read_latest().await?;
    info!(
        version = previous.version,
        document = %serde_json::to_string(&previous).unwrap_or_default(),
        "previous config"
    );

    let started = Instant::now();
    let batch = source.fetch().await?;
    metrics::record_stage_duration("fetch", started.elapsed());

    let mut updater = BanditUpdater::new(config.bandit_settings(), sink.clone(), dry_run);
    updater.init_bandits(&config.page_types)?;
    let report = updater.update_bandits(&batch).await;

    if !dry_run {
        match sink.read_latest().await {
            Ok(doc) => info!(
                version = doc.version,
                document = %serde_json::to_string(&doc).unwrap_or_default(),
                "new config"
            ),
            Err(e) => warn!(error = %e, "cannot read back published config"),
        }
    }

    info!(
        published = report.published().count(),
        skipped = report.skipped().count(),
        failed = report.failed().count(),
        dry_run,
        "cycle complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchRow;
    use crate::storage::InMemoryWeightStore;

    fn row(page_type: &str, id: &str, clicks: u64, shows: u64) -> BatchRow {
        BatchRow {
            page_type: PageType::new(page_type),
            variant_id: id.to_string(),
            clicks: Some(clicks),
            shows: Some(shows),
        }
    }

    fn page_types(
        layout: &[(&str, &[&str])],
    ) -> BTreeMap<String, BTreeMap<String, VariantConfig>> {
        layout
            .iter()
            .map(|(pt, ids)| {
                let variants = ids
                    .iter()
                    .map(|id| (id.to_string(), VariantConfig::default()))
                    .collect();
                (pt.to_string(), variants)
            })
            .collect()
    }

    fn batch(rows: Vec<BatchRow>) -> Batch {
        Batch {
            rows,
            events_cnt: Some(50_000),
        }
    }

    #[test]
    fn test_cycle_state_outcome_labels() {
        assert_eq!(CycleState::Published.outcome(), "published");
        assert_eq!(CycleState::SkippedZeroSignal.outcome(), "skipped_zero_signal");
        assert_eq!(CycleState::Recalculated.outcome(), "dry_run");
        assert_eq!(CycleState::Failed.to_string(), "failed");
    }

    #[test]
    fn test_init_bandits_skips_empty_page_types() {
        let store = Arc::new(InMemoryWeightStore::new());
        let mut updater = BanditUpdater::new(BanditSettings::default(), store, true);
        let built = updater
            .init_bandits(&page_types(&[("desktop", &["7", "8"]), ("mobile", &[])]))
            .expect("test: init");
        assert_eq!(built, 1);
        assert!(updater.bandit("desktop").is_some());
        assert!(updater.bandit("mobile").is_none());
    }

    #[test]
    fn test_init_bandits_uses_configured_smoothing() {
        let store = Arc::new(InMemoryWeightStore::new());
        let settings = BanditSettings {
            smoothing: 10.0,
            ..BanditSettings::default()
        };
        let mut updater = BanditUpdater::new(settings, store, true);
        updater
            .init_bandits(&page_types(&[("desktop", &["7"])]))
            .expect("test: init");
        let smoothing = updater
            .bandit("desktop")
            .and_then(|b| b.variant("7"))
            .map(|v| v.metric.smoothing())
            .unwrap_or_default();
        assert!((smoothing - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_publishes_each_page_type() {
        let store = Arc::new(InMemoryWeightStore::new());
        let mut updater = BanditUpdater::new(BanditSettings::default(), store.clone(), false);
        updater
            .init_bandits(&page_types(&[("desktop", &["7", "8"]), ("mobile", &["1", "2"])]))
            .expect("test: init");

        let report = updater
            .update_bandits(&batch(vec![
                row("desktop", "7", 100, 10_000),
                row("desktop", "8", 300, 10_000),
                row("mobile", "1", 50, 5_000),
                row("mobile", "2", 50, 5_000),
            ]))
            .await;

        assert_eq!(report.published().count(), 2);
        let doc = store.read_latest().await.expect("test: read");
        assert_eq!(doc.version, 3, "one version per published page type");
        let desktop = doc.weights("desktop").unwrap_or_default();
        assert!(desktop["8"] > desktop["7"]);
    }

    #[tokio::test]
    async fn test_zero_signal_page_type_is_skipped_and_others_publish() {
        let store = Arc::new(InMemoryWeightStore::new());
        let mut updater = BanditUpdater::new(BanditSettings::default(), store.clone(), false);
        updater
            .init_bandits(&page_types(&[("desktop", &["7", "8"]), ("mobile", &["1", "2"])]))
            .expect("test: init");

        let report = updater
            .update_bandits(&batch(vec![
                row("desktop", "7", 100, 10_000),
                row("desktop", "8", 300, 10_000),
                row("mobile", "1", 0, 5_000),
                row("mobile", "2", 0, 5_000),
            ]))
            .await;

        let mobile = report.get("mobile").expect("test: mobile report");
        assert_eq!(mobile.state, CycleState::SkippedZeroSignal);
        assert!(matches!(mobile.error, Some(BanditError::ZeroSignal { .. })));
        assert_eq!(report.published().count(), 1);

        let doc = store.read_latest().await.expect("test: read");
        assert!(doc.weights("mobile").is_none(), "skipped page type must not be written");
        assert!(doc.weights("desktop").is_some());
    }

    #[tokio::test]
    async fn test_dry_run_never_publishes() {
        let store = Arc::new(InMemoryWeightStore::new());
        let mut updater = BanditUpdater::new(BanditSettings::default(), store.clone(), true);
        updater
            .init_bandits(&page_types(&[("desktop", &["7", "8"])]))
            .expect("test: init");

        let report = updater
            .update_bandits(&batch(vec![
                row("desktop", "7", 100, 10_000),
                row("desktop", "8", 300, 10_000),
            ]))
            .await;

        let desktop = report.get("desktop").expect("test: desktop report");
        assert_eq!(desktop.state, CycleState::Recalculated);
        assert!(desktop.version.is_none());
        let sum: f64 = desktop.weights.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);

        let doc = store.read_latest().await.expect("test: read");
        assert_eq!(doc.version, 1);
        assert!(doc.page_types.is_empty());
    }

    #[tokio::test]
    async fn test_published_entries_carry_parameters_and_conversion() {
        let store = Arc::new(InMemoryWeightStore::new());
        let mut updater = BanditUpdater::new(BanditSettings::default(), store.clone(), false);
        let mut config = page_types(&[("desktop", &["7", "8"])]);
        if let Some(v) = config.get_mut("desktop").and_then(|d| d.get_mut("7")) {
            v.parameters = serde_json::json!({"item_boost": 1.0});
        }
        updater.init_bandits(&config).expect("test: init");

        updater
            .update_bandits(&batch(vec![row("desktop", "7", 100, 9_000)]))
            .await;

        let doc = store.read_latest().await.expect("test: read");
        let entries = &doc.page_types["desktop"].variants;
        assert_eq!(entries["7"].parameters["item_boost"], serde_json::json!(1.0));
        assert!((entries["7"].conversion.unwrap_or_default() - 0.01).abs() < 1e-12);
        assert!(entries["8"].conversion.is_none(), "variant without a row has no conversion");
        assert!(entries["8"].parameters.is_null());
    }

    #[tokio::test]
    async fn test_publish_into_empty_store_fails_page_type() {
        let store = Arc::new(InMemoryWeightStore::empty());
        let mut updater = BanditUpdater::new(BanditSettings::default(), store, false);
        updater
            .init_bandits(&page_types(&[("desktop", &["7"])]))
            .expect("test: init");

        let report = updater
            .update_bandits(&batch(vec![row("desktop", "7", 10, 100)]))
            .await;

        let desktop = report.get("desktop").expect("test: desktop report");
        assert_eq!(desktop.state, CycleState::Failed);
        assert!(matches!(desktop.error, Some(BanditError::PublishFailed { .. })));
    }
}
