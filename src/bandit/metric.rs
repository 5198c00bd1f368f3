//! Smoothed click-through rate.
//!
//! `value = clicks / (shows + smoothing)`. The smoothing constant is always
//! added, which keeps the ratio defined when `shows == 0` and pulls
//! low-volume variants towards zero instead of towards a noisy ratio.

use crate::batch::BatchRow;

/// Default additive smoothing on the shows denominator.
pub const DEFAULT_SMOOTHING: f64 = 1000.0;

/// Click-through rate of one variant over the latest batch window.
///
/// All counters are `None` until the first batch is applied. Each call to
/// [`ClickThroughRate::update`] replaces the previous state entirely.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickThroughRate {
    clicks: Option<u64>,
    shows: Option<u64>,
    smoothing: f64,
    events_cnt: Option<u64>,
    value: Option<f64>,
}

impl ClickThroughRate {
    /// Create an empty metric with [`DEFAULT_SMOOTHING`].
    pub fn new() -> Self {
        Self::with_smoothing(DEFAULT_SMOOTHING)
    }

    /// Create an empty metric with a custom smoothing constant.
    ///
    /// # Arguments
    ///
    /// * `smoothing` — Added to `shows` in the denominator. Expected `> 0`.
    pub fn with_smoothing(smoothing: f64) -> Self {
        Self {
            clicks: None,
            shows: None,
            smoothing,
            events_cnt: None,
            value: None,
        }
    }

    /// Apply the latest batch row for this variant.
    ///
    /// A missing `clicks` or `shows` leaves `value` as `None` ("no data")
    /// rather than coercing to zero. Prior state is overwritten
    /// unconditionally.
    ///
    /// # Arguments
    ///
    /// * `row` — The aggregated counters for this variant.
    /// * `events_cnt` — Population size the batch was drawn from, if known.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn update(&mut self, row: &BatchRow, events_cnt: Option<u64>) {
        self.clicks = row.clicks;
        self.shows = row.shows;
        self.events_cnt = events_cnt;
        self.value = match (row.clicks, row.shows) {
            (Some(clicks), Some(shows)) => {
                let denominator = shows as f64 + self.smoothing;
                if denominator > 0.0 && denominator.is_finite() {
                    Some(clicks as f64 / denominator)
                } else {
                    None
                }
            }
            _ => None,
        };
    }

    /// Smoothed rate, or `None` if no usable batch has been applied.
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    /// Clicks from the latest batch.
    pub fn clicks(&self) -> Option<u64> {
        self.clicks
    }

    /// Shows from the latest batch.
    pub fn shows(&self) -> Option<u64> {
        self.shows
    }

    /// Population size of the latest batch.
    pub fn events_cnt(&self) -> Option<u64> {
        self.events_cnt
    }

    /// The smoothing constant.
    pub fn smoothing(&self) -> f64 {
        self.smoothing
    }
}

impl Default for ClickThroughRate {
    fn default() -> Self {
        Self::new()
    }
}
