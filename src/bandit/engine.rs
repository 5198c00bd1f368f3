//! Per-page-type bandit.
//!
//! A [`Bandit`] is built fresh every cycle from configuration, fed the full
//! batch (it filters to its own page type), and asked to recalculate weights.
//! Nothing survives between cycles except what the weight store persists.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::bandit::metric::DEFAULT_SMOOTHING;
use crate::bandit::normalize::{self, has_signal};
use crate::bandit::policy::Policy;
use crate::bandit::variant::Variant;
use crate::batch::Batch;
use crate::{BanditError, PageType};

/// Default traffic floor per variant.
pub const DEFAULT_MIN_WEIGHT: f64 = 0.05;

/// Settings shared by every bandit of one run.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq)]
pub struct BanditSettings {
    /// Raw score strategy.
    pub policy: Policy,
    /// Traffic floor per variant, in `(0, 1)`.
    pub min_weight: f64,
    /// Additive smoothing for each variant's click-through rate.
    pub smoothing: f64,
    /// Page types that proceed with a near-uniform allocation instead of
    /// failing with [`BanditError::ZeroSignal`].
    pub zero_signal_exempt: BTreeSet<PageType>,
}

impl BanditSettings {
    /// Whether `page_type` bypasses the zero-signal guard.
    pub fn is_exempt(&self, page_type: &PageType) -> bool {
        self.zero_signal_exempt.contains(page_type)
    }
}

impl Default for BanditSettings {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            min_weight: DEFAULT_MIN_WEIGHT,
            smoothing: DEFAULT_SMOOTHING,
            zero_signal_exempt: BTreeSet::new(),
        }
    }
}

/// Weight allocator for all variants of one page type.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone)]
pub struct Bandit {
    page_type: PageType,
    policy: Policy,
    min_weight: f64,
    zero_signal_exempt: bool,
    variants: BTreeMap<String, Variant>,
    events_cnt: Option<u64>,
}

impl Bandit {
    /// Build a bandit over `variants`, all of which must belong to `page_type`.
    ///
    /// Weights start uniform.
    ///
    /// # Errors
    ///
    /// Returns [`BanditError::Configuration`] if `variants` is empty, contains
    /// a duplicate id, or contains a variant from another page type.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn new(
        page_type: PageType,
        variants: Vec<Variant>,
        settings: &BanditSettings,
    ) -> Result<Self, BanditError> {
        if variants.is_empty() {
            return Err(BanditError::Configuration(format!(
                "page type '{page_type}' has no variants"
            )));
        }

        let share = 1.0 / variants.len() as f64;
        let mut by_id = BTreeMap::new();
        for mut variant in variants {
            if variant.page_type != page_type {
                return Err(BanditError::Configuration(format!(
                    "variant '{}' has page type '{}', '{}' expected",
                    variant.id, variant.page_type, page_type
                )));
            }
            variant.set_weight(share);
            let id = variant.id.clone();
            if by_id.insert(id.clone(), variant).is_some() {
                return Err(BanditError::Configuration(format!(
                    "duplicate variant '{id}' in page type '{page_type}'"
                )));
            }
        }

        Ok(Self {
            zero_signal_exempt: settings.is_exempt(&page_type),
            page_type,
            policy: settings.policy,
            min_weight: settings.min_weight,
            variants: by_id,
            events_cnt: None,
        })
    }

    /// The page type this bandit allocates.
    pub fn page_type(&self) -> &PageType {
        &self.page_type
    }

    /// The scoring policy.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// The per-variant traffic floor.
    pub fn min_weight(&self) -> f64 {
        self.min_weight
    }

    /// Whether this bandit bypasses the zero-signal guard.
    pub fn is_zero_signal_exempt(&self) -> bool {
        self.zero_signal_exempt
    }

    /// Iterate variants in id order.
    pub fn variants(&self) -> impl Iterator<Item = &Variant> {
        self.variants.values()
    }

    /// Look up a variant by id.
    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.get(id)
    }

    /// Apply this page type's rows of `batch` to the matching variants.
    ///
    /// Rows for other page types or unknown variants are ignored. Variants
    /// without a row keep whatever metric state they had.
    ///
    /// # Returns
    ///
    /// The number of variants whose metric was updated.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn evaluate_batch(&mut self, batch: &Batch) -> usize {
        if batch.events_cnt.is_some() {
            self.events_cnt = batch.events_cnt;
        }

        let mut updated = 0;
        for row in batch.rows_for(&self.page_type) {
            match self.variants.get_mut(&row.variant_id) {
                Some(variant) => {
                    variant.metric.update(row, batch.events_cnt);
                    updated += 1;
                }
                None => debug!(
                    page_type = %self.page_type,
                    variant = %row.variant_id,
                    "ignoring row for unconfigured variant"
                ),
            }
        }
        updated
    }

    /// Recompute every variant's weight from its current metric.
    ///
    /// # Errors
    ///
    /// Returns [`BanditError::ZeroSignal`] when no variant has a measurable
    /// conversion and this page type is not exempt. Weights are left
    /// untouched in that case.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn recalc_weights(&mut self) -> Result<(), BanditError> {
        let signal = self.variants.values().any(|v| has_signal(v.metric.value()));
        if !signal && !self.zero_signal_exempt {
            return Err(BanditError::ZeroSignal {
                page_type: self.page_type.to_string(),
            });
        }

        let scores: BTreeMap<String, f64> = self
            .variants
            .iter()
            .map(|(id, v)| {
                let events_cnt = self.events_cnt.or(v.metric.events_cnt());
                (id.clone(), self.policy.score(&v.metric, events_cnt))
            })
            .collect();

        let weights = normalize::allocate(&scores, self.min_weight);
        for (id, weight) in weights {
            if let Some(variant) = self.variants.get_mut(&id) {
                variant.set_weight(weight);
            }
        }
        Ok(())
    }

    /// Current `{variant_id: weight}` mapping. No recomputation.
    pub fn get_weights(&self) -> BTreeMap<String, f64> {
        self.variants
            .iter()
            .map(|(id, v)| (id.clone(), v.weight()))
            .collect()
    }

    /// Current `{variant_id: conversion}` mapping.
    pub fn conversions(&self) -> BTreeMap<String, Option<f64>> {
        self.variants
            .iter()
            .map(|(id, v)| (id.clone(), v.metric.value()))
            .collect()
    }
}
