//! Conversion settings.
//!
//! Every field has a default matching the conventions of the MATLAB analysis
//! suite, so a settings file only needs the values that differ:
//!
//! ```toml
//! quantities = ["UPIV", "EpsilonPIV", "xywh"]
//! exclude_marker = "alltime"
//! ```

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const DEFAULT_QUANTITIES: [&str; 8] = [
    "EpsilonPIV",
    "OmegaPIV",
    "UPIV",
    "xywh",
    "Overlap",
    "Coordinates",
    "TimeArray",
    "FrameArray",
];

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Quantities extracted from every result file, in order.
    pub quantities: Vec<String>,
    /// Prefix of the single results folder inside the SAP folder.
    pub results_prefix: String,
    /// Suffix of result files.
    pub result_extension: String,
    /// Result files whose name contains this marker are skipped.
    pub exclude_marker: String,
    /// Warn about quantities missing from a result file.
    pub verbose: bool,
    pub raw_pattern: String,
    pub outlines_pattern: String,
    pub masks_pattern: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quantities: DEFAULT_QUANTITIES.iter().map(|q| q.to_string()).collect(),
            results_prefix: "AOT".to_string(),
            result_extension: ".mat".to_string(),
            exclude_marker: "alltime".to_string(),
            verbose: true,
            raw_pattern: "*.tif".to_string(),
            outlines_pattern: "seg*.png".to_string(),
            masks_pattern: "roi*.png".to_string(),
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Settings file when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    /// Replace the quantity list from a comma-separated CLI value.
    pub fn with_quantities(mut self, list: Option<&str>) -> Self {
        if let Some(list) = list {
            self.quantities = list
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_analysis_conventions() {
        let s = Settings::default();
        assert_eq!(s.quantities.len(), 8);
        assert_eq!(s.results_prefix, "AOT");
        assert_eq!(s.exclude_marker, "alltime");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let s = Settings::from_toml("quantities = [\"UPIV\"]\nverbose = false\n").unwrap();
        assert_eq!(s.quantities, vec!["UPIV"]);
        assert!(!s.verbose);
        assert_eq!(s.result_extension, ".mat");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(Settings::from_toml("quantity = 1"), Err(Error::Config(_))));
    }

    #[test]
    fn cli_quantities_override() {
        let s = Settings::default().with_quantities(Some("UPIV, xywh,"));
        assert_eq!(s.quantities, vec!["UPIV", "xywh"]);
        let s = Settings::default().with_quantities(None);
        assert_eq!(s.quantities.len(), 8);
    }
}
