//! Raw score policies.
//!
//! A policy only decides the pre-normalisation score of each variant; the
//! normalisation and floor are shared (see [`super::normalize`]).
//!
//! | Policy | Score |
//! |--------|-------|
//! | `proportional` | resolved conversion |
//! | `ucb` | resolved conversion + `2·ln(max(events_cnt, 1)) / max(1, shows)` |

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::bandit::metric::ClickThroughRate;
use crate::bandit::normalize::resolve_or_floor;

/// Strategy for turning a variant's metric into a raw score.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Policy {
    /// Traffic proportional to conversion.
    #[default]
    #[serde(rename = "proportional")]
    Proportional,
    /// Conversion plus an exploration bonus for under-sampled variants.
    #[serde(rename = "ucb", alias = "upper_confidence_bound")]
    UpperConfidenceBound,
}

impl Policy {
    /// Compute the raw score of one variant.
    ///
    /// Null or zero conversions are replaced with a tiny positive floor so a
    /// single silent variant never forces a division by zero.
    ///
    /// # Arguments
    ///
    /// * `metric` — The variant's metric after the latest batch.
    /// * `events_cnt` — The cycle's population size (UCB only).
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn score(&self, metric: &ClickThroughRate, events_cnt: Option<u64>) -> f64 {
        let conversion = resolve_or_floor(metric.value());
        match self {
            Self::Proportional => conversion,
            Self::UpperConfidenceBound => conversion + ucb_bonus(events_cnt, metric.shows()),
        }
    }

    /// Configuration name of this policy.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Proportional => "proportional",
            Self::UpperConfidenceBound => "ucb",
        }
    }
}

/// Exploration bonus: `2 · ln(max(events_cnt, 1)) / max(1, shows)`.
///
/// An unknown population counts as zero and unknown shows as zero, so the
/// bonus is always finite and non-negative.
///
/// # Example
///
/// ```rust
/// use traffic_bandit::bandit::ucb_bonus;
///
/// let starved = ucb_bonus(Some(100_000), Some(0));
/// let sampled = ucb_bonus(Some(100_000), Some(50_000));
/// assert!(starved > sampled);
/// ```
pub fn ucb_bonus(events_cnt: Option<u64>, shows: Option<u64>) -> f64 {
    let population = events_cnt.unwrap_or(0).max(1) as f64;
    let observed = shows.unwrap_or(0).max(1) as f64;
    2.0 * population.ln() / observed
}
