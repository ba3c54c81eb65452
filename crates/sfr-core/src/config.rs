use serde::{Deserialize, Serialize};

use crate::error::{Result, SfrError};

/// Outseg code some inputs use instead of 0 for segments that leave the model.
pub const DEFAULT_OUTLET_SENTINEL: u32 = 999_999;

/// Tunables shared by every stage of a processing run.
/// Defaults reproduce the behaviour of the established SFR post-processing workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocConfig {
    /// Hop ceiling when following outseg chains.
    pub max_routing_levels: usize,
    /// Alternate terminal outseg value (0 is always terminal).
    pub outlet_sentinel: u32,
    /// Fixed-point budget for confluence elevation mapping.
    pub confluence_passes: u32,
    /// Total elevation rise at or below which confluence mapping is converged.
    pub rise_tolerance: f64,
    /// Equality tolerance for profile smoothing, in model elevation units.
    pub elevation_tolerance: f64,
    pub minimum_slope: f64,
    pub maximum_slope: f64,
    /// Streambed K assigned to non-dominant collocated reaches.
    pub bed_k_min: f64,
    /// Length assigned to non-dominant collocated reaches.
    pub nominal_length: f64,
    /// Multiplier from model length units to kilometres (width estimation).
    pub to_km: f64,
    /// Minimum layer thickness enforced when resetting the model top.
    pub minimum_layer_thickness: f64,
}

impl Default for PostprocConfig {
    fn default() -> Self {
        Self {
            max_routing_levels: 1000,
            outlet_sentinel: DEFAULT_OUTLET_SENTINEL,
            confluence_passes: 10,
            rise_tolerance: 0.0,
            elevation_tolerance: 1e-5,
            minimum_slope: 1e-4,
            maximum_slope: 1.0,
            bed_k_min: 1e-8,
            nominal_length: 1.0,
            to_km: 0.0003048,
            minimum_layer_thickness: 1.0,
        }
    }
}

impl PostprocConfig {
    /// Whether `outseg` marks the end of a routing path.
    #[inline]
    pub fn is_terminal(&self, outseg: u32) -> bool {
        outseg == 0 || outseg == self.outlet_sentinel
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(name: &'static str, value: impl ToString, reason: &str) -> SfrError {
            SfrError::InvalidParameter {
                name,
                value: value.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.max_routing_levels == 0 {
            return Err(invalid("max_routing_levels", 0, "must be at least 1"));
        }
        if self.outlet_sentinel == 0 {
            return Err(invalid("outlet_sentinel", 0, "0 is already the outlet code"));
        }
        for (name, v) in [
            ("rise_tolerance", self.rise_tolerance),
            ("elevation_tolerance", self.elevation_tolerance),
            ("bed_k_min", self.bed_k_min),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(invalid(name, v, "must be finite and non-negative"));
            }
        }
        for (name, v) in [
            ("minimum_slope", self.minimum_slope),
            ("maximum_slope", self.maximum_slope),
            ("nominal_length", self.nominal_length),
            ("to_km", self.to_km),
            ("minimum_layer_thickness", self.minimum_layer_thickness),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(invalid(name, v, "must be finite and positive"));
            }
        }
        if self.minimum_slope > self.maximum_slope {
            return Err(invalid(
                "minimum_slope",
                self.minimum_slope,
                "exceeds maximum_slope",
            ));
        }
        Ok(())
    }

    /// Load a config from a JSON file; absent fields keep their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PostprocConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.max_routing_levels, 1000);
        assert_eq!(cfg.confluence_passes, 10);
    }

    #[test]
    fn sentinel_and_zero_are_terminal() {
        let cfg = PostprocConfig::default();
        assert!(cfg.is_terminal(0));
        assert!(cfg.is_terminal(DEFAULT_OUTLET_SENTINEL));
        assert!(!cfg.is_terminal(7));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = PostprocConfig::from_json_str(r#"{ "minimum_slope": 0.001 }"#).unwrap();
        assert_eq!(cfg.minimum_slope, 0.001);
        assert_eq!(cfg.maximum_slope, 1.0);
    }

    #[test]
    fn inverted_slope_bounds_rejected() {
        let err = PostprocConfig::from_json_str(r#"{ "minimum_slope": 2.0 }"#).unwrap_err();
        assert!(matches!(err, SfrError::InvalidParameter { name: "minimum_slope", .. }));
    }
}
