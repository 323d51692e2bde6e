use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, TrackError};

/// How the intersection area of two regions is turned into an edge weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapNormalization {
    /// intersection / union
    Union,
    /// intersection / area of the smaller region
    Smaller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Edges with a weight at or below this value are discarded.
    pub min_overlap: f64,
    pub normalization: OverlapNormalization,
    /// Number of candidate pairs from which intersection is evaluated on the
    /// rayon pool instead of the calling thread.
    pub parallel_min_pairs: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_overlap: 0.1,
            normalization: OverlapNormalization::Smaller,
            parallel_min_pairs: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitsConfig {
    /// Divisor applied after scaling areas, e.g. 100.0 turns mm² into cm².
    pub areal_divisor: f64,
}

impl Default for UnitsConfig {
    fn default() -> Self {
        Self {
            areal_divisor: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Re-running the automatic matcher keeps rows entered by hand.
    pub keep_manual_rows: bool,
    /// Relative area change below which a transition counts as `Same`.
    pub same_area_tolerance: f64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            keep_manual_rows: true,
            same_area_tolerance: 0.0,
        }
    }
}

/// Project-level tuning, loadable from TOML:
///
/// ```toml
/// [matching]
/// min_overlap = 0.2
/// normalization = "union"
///
/// [units]
/// areal_divisor = 100.0
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub matching: MatchConfig,
    pub units: UnitsConfig,
    pub table: TableConfig,
}

impl TrackConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TrackConfig =
            toml::from_str(text).map_err(|e| TrackError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| TrackError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.matching;
        if !(0.0..1.0).contains(&m.min_overlap) {
            return Err(TrackError::Config(format!(
                "matching.min_overlap must be in [0, 1), got {}",
                m.min_overlap
            )));
        }
        if !(self.units.areal_divisor.is_finite() && self.units.areal_divisor > 0.0) {
            return Err(TrackError::Config(format!(
                "units.areal_divisor must be positive, got {}",
                self.units.areal_divisor
            )));
        }
        if !(self.table.same_area_tolerance >= 0.0) {
            return Err(TrackError::Config(format!(
                "table.same_area_tolerance must not be negative, got {}",
                self.table.same_area_tolerance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config = TrackConfig::from_toml_str("").unwrap();
        assert_eq!(config, TrackConfig::default());
        assert_eq!(config.matching.normalization, OverlapNormalization::Smaller);
        assert_eq!(config.units.areal_divisor, 100.0);
    }

    #[test]
    fn test_partial_toml_overrides_fields() {
        let text = r#"
            [matching]
            min_overlap = 0.25
            normalization = "union"

            [table]
            keep_manual_rows = false
        "#;
        let config = TrackConfig::from_toml_str(text).unwrap();
        assert_eq!(config.matching.min_overlap, 0.25);
        assert_eq!(config.matching.normalization, OverlapNormalization::Union);
        assert_eq!(config.matching.parallel_min_pairs, 256);
        assert!(!config.table.keep_manual_rows);
        assert_eq!(config.units.areal_divisor, 100.0);
    }

    #[test]
    fn test_out_of_range_threshold_is_rejected() {
        let err = TrackConfig::from_toml_str("[matching]\nmin_overlap = 1.5\n").unwrap_err();
        assert!(matches!(err, TrackError::Config(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = TrackConfig::default();
        config.matching.min_overlap = 0.3;
        let text = config.to_toml_string().unwrap();
        assert_eq!(TrackConfig::from_toml_str(&text).unwrap(), config);
    }
}
