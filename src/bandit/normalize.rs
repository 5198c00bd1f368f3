//! Score → weight normalisation with a per-variant floor.
//!
//! Two phases:
//! 1. Proportional: `w_i = s_i / Σs`, with an epsilon denominator when the
//!    sum is zero and `min_weight` substituted for any non-finite result.
//! 2. Floor and renormalise: every weight is raised to at least
//!    `min_weight`, then the distribution is rescaled to sum to 1. Variants
//!    sitting on the floor stay pinned at exactly `min_weight` and only the
//!    remaining mass is rescaled, so the floor survives the renormalisation.
//!    When nothing is on the floor this is plain division by the sum.

use std::collections::{BTreeMap, BTreeSet};

/// Conversions with magnitude below this are indistinguishable from zero.
pub const ZERO_TOLERANCE: f64 = 1e-9;

/// Score substituted for a null or zero conversion.
pub const SCORE_FLOOR: f64 = 1e-9;

/// Denominator used instead of a zero sum.
pub const DENOMINATOR_EPSILON: f64 = 1e-12;

/// Whether a resolved conversion carries measurable signal.
pub fn has_signal(value: Option<f64>) -> bool {
    value.is_some_and(|v| v.is_finite() && v.abs() >= ZERO_TOLERANCE)
}

/// Resolve a conversion to a strictly positive score component.
pub fn resolve_or_floor(value: Option<f64>) -> f64 {
    match value {
        Some(v) if has_signal(Some(v)) => v,
        _ => SCORE_FLOOR,
    }
}

/// Divide every score by the sum of finite scores.
///
/// # Panics
///
/// This function never panics.
pub fn proportional(scores: &BTreeMap<String, f64>, min_weight: f64) -> BTreeMap<String, f64> {
    let total: f64 = scores.values().copied().filter(|s| s.is_finite()).sum();
    let denominator = if total.abs() < DENOMINATOR_EPSILON {
        DENOMINATOR_EPSILON
    } else {
        total
    };

    scores
        .iter()
        .map(|(id, &score)| {
            let w = score / denominator;
            (id.clone(), if w.is_finite() { w } else { min_weight })
        })
        .collect()
}

/// Raise every weight to `min_weight` and renormalise to a distribution.
///
/// If `min_weight * len > 1` no valid floored distribution exists and the
/// uniform distribution is returned instead.
///
/// # Panics
///
/// This function never panics.
pub fn floor_and_renormalize(
    weights: &BTreeMap<String, f64>,
    min_weight: f64,
) -> BTreeMap<String, f64> {
    let n = weights.len();
    if n == 0 {
        return BTreeMap::new();
    }

    let corrected: BTreeMap<&String, f64> = weights
        .iter()
        .map(|(id, &w)| (id, if w.is_finite() { w.max(min_weight) } else { min_weight }))
        .collect();

    let mut pinned: BTreeSet<&String> = BTreeSet::new();
    loop {
        let free_mass = 1.0 - min_weight * pinned.len() as f64;
        if pinned.len() == n || free_mass <= 0.0 {
            return uniform(weights.keys());
        }

        let free_total: f64 = corrected
            .iter()
            .filter(|(id, _)| !pinned.contains(*id))
            .map(|(_, &w)| w)
            .sum();
        let denominator = if free_total < DENOMINATOR_EPSILON {
            DENOMINATOR_EPSILON
        } else {
            free_total
        };

        let mut out = BTreeMap::new();
        let mut newly_pinned = Vec::new();
        for (&id, &w) in &corrected {
            if pinned.contains(id) {
                out.insert(id.clone(), min_weight);
                continue;
            }
            let share = w / denominator * free_mass;
            if share < min_weight {
                newly_pinned.push(id);
            }
            out.insert(id.clone(), share);
        }

        if newly_pinned.is_empty() {
            return out;
        }
        pinned.extend(newly_pinned);
    }
}

/// Full two-phase allocation: [`proportional`] then [`floor_and_renormalize`].
///
/// # Example
///
/// ```rust
/// use std::collections::BTreeMap;
/// use traffic_bandit::bandit::normalize::allocate;
///
/// let mut scores = BTreeMap::new();
/// scores.insert("a".to_string(), 0.02);
/// scores.insert("b".to_string(), 0.0001);
/// let w = allocate(&scores, 0.05);
/// assert!((w["b"] - 0.05).abs() < 1e-12);
/// assert!((w.values().sum::<f64>() - 1.0).abs() < 1e-9);
/// ```
pub fn allocate(scores: &BTreeMap<String, f64>, min_weight: f64) -> BTreeMap<String, f64> {
    floor_and_renormalize(&proportional(scores, min_weight), min_weight)
}

fn uniform<'a>(ids: impl ExactSizeIterator<Item = &'a String>) -> BTreeMap<String, f64> {
    let share = 1.0 / ids.len().max(1) as f64;
    ids.map(|id| (id.clone(), share)).collect()
}
