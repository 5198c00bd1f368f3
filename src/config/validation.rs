//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`UpdaterConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks, cross-field
//! invariants between the floor and the variant count).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::UpdaterConfig;
use crate::BanditError;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "bandit.min_weight").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for BanditError {
    fn from(err: ConfigError) -> Self {
        BanditError::Configuration(err.to_string())
    }
}

/// Validate all semantic constraints on an [`UpdaterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &UpdaterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Bandit knobs ─────────────────────────────────────────────────
    let min_weight = config.bandit.min_weight;
    if !(min_weight > 0.0 && min_weight < 1.0) {
        errors.push(ConfigError::InvalidField {
            field: "bandit.min_weight".into(),
            value: min_weight.to_string(),
            reason: "must be strictly between 0.0 and 1.0".into(),
        });
    }

    let smoothing = config.bandit.smoothing;
    if !(smoothing.is_finite() && smoothing > 0.0) {
        errors.push(ConfigError::InvalidField {
            field: "bandit.smoothing".into(),
            value: smoothing.to_string(),
            reason: "must be a positive finite number".into(),
        });
    }

    for exempt in &config.bandit.zero_signal_exempt {
        if !config.page_types.contains_key(exempt) {
            errors.push(ConfigError::InvalidField {
                field: "bandit.zero_signal_exempt".into(),
                value: exempt.clone(),
                reason: "names a page type that is not configured".into(),
            });
        }
    }

    // ── Events ───────────────────────────────────────────────────────
    if config.events.last_events_cnt == 0 {
        errors.push(ConfigError::InvalidField {
            field: "events.last_events_cnt".into(),
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }

    if let Some(pt) = &config.events.default_page_type {
        if pt.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: "events.default_page_type".into(),
                value: String::new(),
                reason: "must not be empty when set".into(),
            });
        }
    }

    // ── Storage ──────────────────────────────────────────────────────
    for (field, value) in [
        ("storage.base_url", &config.storage.base_url),
        ("storage.index", &config.storage.index),
        ("storage.doc_id", &config.storage.doc_id),
    ] {
        if value.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: field.into(),
                value: String::new(),
                reason: "must not be empty".into(),
            });
        }
    }

    if config.storage.timeout_ms == 0 {
        errors.push(ConfigError::InvalidField {
            field: "storage.timeout_ms".into(),
            value: "0".into(),
            reason: "timeout must be at least 1ms".into(),
        });
    }

    // ── Page types ───────────────────────────────────────────────────
    if config.page_types.is_empty() {
        errors.push(ConfigError::InvalidField {
            field: "page_types".into(),
            value: "{}".into(),
            reason: "at least one page type must be configured".into(),
        });
    }

    for (page_type, variants) in &config.page_types {
        if page_type.trim().is_empty() {
            errors.push(ConfigError::InvalidField {
                field: "page_types".into(),
                value: String::new(),
                reason: "page type name must not be empty".into(),
            });
        }

        if variants.keys().any(|id| id.trim().is_empty()) {
            errors.push(ConfigError::InvalidField {
                field: format!("page_types.{page_type}"),
                value: String::new(),
                reason: "variant id must not be empty".into(),
            });
        }

        // Floor must be satisfiable: n variants at min_weight cannot exceed 1.
        let floor_mass = min_weight * variants.len() as f64;
        if floor_mass > 1.0 + f64::EPSILON {
            errors.push(ConfigError::InvalidField {
                field: format!("page_types.{page_type}"),
                value: variants.len().to_string(),
                reason: format!(
                    "{} variants with min_weight {min_weight} need {floor_mass} of the traffic",
                    variants.len()
                ),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
