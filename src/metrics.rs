//! Prometheus metrics for the bandit updater.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup before running a cycle. The
//! helper functions (`record_cycle`, `set_variant_state`, …) are no-ops if
//! `init_metrics` was never called, so library users and tests can run cycles
//! without any registry.
//!
//! The job is short-lived, so there is no scrape endpoint: the binary writes
//! [`gather_metrics`] to a textfile for the node exporter's collector.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `bandit_cycles_total` | Counter | `page_type`, `outcome` |
//! | `bandit_variant_weight` | Gauge | `page_type`, `variant` |
//! | `bandit_variant_conversion` | Gauge | `page_type`, `variant` |
//! | `bandit_run_duration_seconds` | Histogram | `stage` |

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    core::Collector, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use crate::BanditError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics of the updater, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Per-page-type cycle outcomes.
    pub cycles_total: CounterVec,
    /// Last computed weight per variant.
    pub variant_weight: GaugeVec,
    /// Last smoothed conversion per variant.
    pub variant_conversion: GaugeVec,
    /// Wall time of the run stages (`fetch`, `cycle`).
    pub run_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn registration_error(e: prometheus::Error) -> BanditError {
    BanditError::Other(format!("metrics registration failed: {e}"))
}

fn register<C>(registry: &Registry, collector: C) -> Result<C, BanditError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(registration_error)?;
    Ok(collector)
}

/// Build a metrics bundle backed by `registry`, with every name prefixed by
/// `prefix`.
fn build(registry: Registry, prefix: &str) -> Result<Metrics, BanditError> {
    let cycles_total = register(
        &registry,
        CounterVec::new(
            Opts::new(
                format!("{prefix}cycles_total"),
                "Bandit cycles by page type and outcome",
            ),
            &["page_type", "outcome"],
        )
        .map_err(registration_error)?,
    )?;

    let variant_weight = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                format!("{prefix}variant_weight"),
                "Traffic share computed for each variant",
            ),
            &["page_type", "variant"],
        )
        .map_err(registration_error)?,
    )?;

    let variant_conversion = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                format!("{prefix}variant_conversion"),
                "Smoothed click-through rate of each variant",
            ),
            &["page_type", "variant"],
        )
        .map_err(registration_error)?,
    )?;

    let run_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                format!("{prefix}run_duration_seconds"),
                "Duration of each run stage",
            ),
            &["stage"],
        )
        .map_err(registration_error)?,
    )?;

    Ok(Metrics {
        registry,
        cycles_total,
        variant_weight,
        variant_conversion,
        run_duration,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`BanditError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), BanditError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let bundle = build(Registry::new(), "bandit_")?;
    // A racing initialiser builds identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count one cycle outcome (`published`, `skipped_zero_signal`, `dry_run`,
/// `failed`) for a page type.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_cycle(page_type: &str, outcome: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .cycles_total
            .get_metric_with_label_values(&[page_type, outcome])
        {
            c.inc();
        }
    }
}

/// Record a variant's weight and conversion after recalculation.
///
/// A null conversion is recorded as `0`. No-op if metrics have not been
/// initialised.
///
/// # Panics
///
/// This function never panics.
pub fn set_variant_state(page_type: &str, variant: &str, weight: f64, conversion: Option<f64>) {
    if let Some(m) = metrics() {
        if let Ok(g) = m
            .variant_weight
            .get_metric_with_label_values(&[page_type, variant])
        {
            g.set(weight);
        }
        if let Ok(g) = m
            .variant_conversion
            .get_metric_with_label_values(&[page_type, variant])
        {
            g.set(conversion.unwrap_or(0.0));
        }
    }
}

/// Record how long a run stage took.
///
/// No-op if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn record_stage_duration(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.run_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = metrics().map_or_else(Vec::new, |m| m.registry.gather());
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Cycle outcome counts keyed by `"page_type:outcome"`.
///
/// Returns an empty map if metrics have not been initialised.
///
/// # Panics
///
/// This function never panics.
pub fn cycle_summary() -> BTreeMap<String, u64> {
    let Some(m) = metrics() else {
        return BTreeMap::new();
    };

    let mut summary = BTreeMap::new();
    for family in m.cycles_total.collect() {
        for metric in family.get_metric() {
            let label = |name: &str| {
                metric
                    .get_label()
                    .iter()
                    .find(|l| l.get_name() == name)
                    .map_or("unknown", |l| l.get_value())
                    .to_string()
            };
            let key = format!("{}:{}", label("page_type"), label("outcome"));
            summary.insert(key, metric.get_counter().get_value() as u64);
        }
    }
    summary
}
