//! One competing model/algorithm version within a page type.

use crate::bandit::metric::ClickThroughRate;
use crate::PageType;

/// A variant competing for traffic.
///
/// Owns its metric exclusively. `parameters` is opaque to the bandit and is
/// handed to the weight store on publish.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, PartialEq)]
pub struct Variant {
    /// Stable identifier, e.g. a model version.
    pub id: String,
    /// Page type this variant competes in.
    pub page_type: PageType,
    /// Smoothed conversion estimate, replaced each cycle.
    pub metric: ClickThroughRate,
    /// Variant-specific parameters from configuration.
    pub parameters: serde_json::Value,
    weight: f64,
}

impl Variant {
    /// Create a variant with an empty metric and zero weight.
    pub fn new(id: impl Into<String>, page_type: PageType, metric: ClickThroughRate) -> Self {
        Self {
            id: id.into(),
            page_type,
            metric,
            parameters: serde_json::Value::Null,
            weight: 0.0,
        }
    }

    /// Attach pass-through parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Current traffic weight in `[0, 1]`.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub(crate) fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }
}
