//! # Engine Configuration
//!
//! Limits and tolerances of one document session. Deserializable so the app
//! layer can read it from a TOML file; every field falls back to the
//! corresponding constant in [`crate::primitives`].

use crate::primitives::{
    AUTO_NAME_PREFIX, MAX_INVERSE_HOPS, MAX_REPLACEMENTS, MAX_RESOLUTION_DEPTH,
    NUMERIC_TOLERANCE,
};
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum nesting of recursive resolution.
    pub max_resolution_depth: usize,
    /// Maximum replacement count of a single composite.
    pub max_replacements: usize,
    /// Maximum number of inverse hops followed by a single action.
    pub max_inverse_hops: usize,
    /// Relative tolerance for numeric equality (idempotence checks, CAS).
    pub numeric_tolerance: f64,
    /// First character of generated component names.
    pub auto_name_prefix: char,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_resolution_depth: MAX_RESOLUTION_DEPTH,
            max_replacements: MAX_REPLACEMENTS,
            max_inverse_hops: MAX_INVERSE_HOPS,
            numeric_tolerance: NUMERIC_TOLERANCE,
            auto_name_prefix: AUTO_NAME_PREFIX,
        }
    }
}

impl EngineConfig {
    /// Clamp user-provided values to the hard limits.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.max_resolution_depth = self.max_resolution_depth.clamp(1, MAX_RESOLUTION_DEPTH);
        self.max_replacements = self.max_replacements.min(MAX_REPLACEMENTS);
        self.max_inverse_hops = self.max_inverse_hops.clamp(1, MAX_INVERSE_HOPS);
        if !self.numeric_tolerance.is_finite() || self.numeric_tolerance < 0.0 {
            self.numeric_tolerance = NUMERIC_TOLERANCE;
        }
        // generated names must stay valid reference names
        if !(self.auto_name_prefix == '_' || self.auto_name_prefix.is_alphabetic()) {
            self.auto_name_prefix = AUTO_NAME_PREFIX;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_primitives() {
        let config = EngineConfig::default();
        assert_eq!(config.max_resolution_depth, MAX_RESOLUTION_DEPTH);
        assert_eq!(config.max_replacements, MAX_REPLACEMENTS);
    }

    #[test]
    fn sanitized_clamps_out_of_range_values() {
        let config = EngineConfig {
            max_resolution_depth: 0,
            max_replacements: usize::MAX,
            max_inverse_hops: 10_000,
            numeric_tolerance: f64::NAN,
            auto_name_prefix: '$',
        }
        .sanitized();
        assert_eq!(config.max_resolution_depth, 1);
        assert_eq!(config.max_replacements, MAX_REPLACEMENTS);
        assert_eq!(config.max_inverse_hops, MAX_INVERSE_HOPS);
        assert_eq!(config.numeric_tolerance, NUMERIC_TOLERANCE);
        assert_eq!(config.auto_name_prefix, AUTO_NAME_PREFIX);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_replacements": 5}"#).expect("parse");
        assert_eq!(config.max_replacements, 5);
        assert_eq!(config.max_resolution_depth, MAX_RESOLUTION_DEPTH);
    }
}
