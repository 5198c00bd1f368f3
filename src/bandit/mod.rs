//! # Stage: Bandit Weight Allocation
//!
//! ## Responsibility
//! Turn one cycle's aggregated click/show counters into normalised traffic
//! weights for every variant of a single page type. Each page type owns an
//! independent [`Bandit`]; a [`Policy`] decides the raw score per variant and
//! the shared [`normalize`] helper turns scores into a floored distribution.
//!
//! ## Guarantees
//! - Deterministic: weights are a pure function of the current metric state,
//!   so recalculating twice without new data yields identical weights.
//! - Valid distribution: when `min_weight * variant_count <= 1`, weights sum
//!   to 1 and every weight is at least `min_weight`.
//! - Replace-on-batch: each batch overwrites a metric's counters; nothing is
//!   accumulated across cycles.
//! - No numeric panics: null counters and zero totals are absorbed with
//!   epsilon substitution. Only [`crate::BanditError::ZeroSignal`] surfaces.
//!
//! ## NOT Responsible For
//! - Fetching batches (that belongs to `batch`)
//! - Persisting weights (that belongs to `storage`)
//! - Cross-page-type orchestration and failure isolation (that belongs to `updater`)

pub mod engine;
pub mod metric;
pub mod normalize;
pub mod policy;
pub mod variant;

pub use engine::{Bandit, BanditSettings};
pub use metric::ClickThroughRate;
pub use policy::{ucb_bonus, Policy};
pub use variant::Variant;
