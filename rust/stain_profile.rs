//! Named stain profiles and their JSON persistence.
//!
//! A profile holds up to three named stain OD vectors plus free-form metadata
//! describing how it was produced. Estimators and deconvolution only ever see
//! the flattened [`StainMatrix`].

use crate::error::{Result, StainError};
use crate::stain_math::{stain_count, StainMatrix, StainVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Ruifrok & Johnston hematoxylin.
pub const HEMATOXYLIN: StainVector = [0.650, 0.704, 0.286];
/// Ruifrok & Johnston eosin.
pub const EOSIN: StainVector = [0.072, 0.990, 0.105];
/// Ruifrok & Johnston diaminobenzidine.
pub const DAB: StainVector = [0.268, 0.570, 0.776];

pub const MAX_STAINS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stain {
    pub name: String,
    pub od: StainVector,
}

impl Stain {
    pub fn new(name: impl Into<String>, od: StainVector) -> Self {
        Self {
            name: name.into(),
            od,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StainProfile {
    pub name: String,
    pub stains: Vec<Stain>,
    pub analysis_model: String,
    pub algorithm: String,
    pub parameters: BTreeMap<String, String>,
}

impl StainProfile {
    pub fn new(name: impl Into<String>, stains: Vec<Stain>) -> Result<Self> {
        let profile = Self {
            name: name.into(),
            stains,
            ..Self::default()
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Profile from an estimated matrix. Every slot up to the last non-zero
    /// row is kept in place, so an empty slot stays a zero stain.
    pub fn from_matrix(name: impl Into<String>, matrix: &StainMatrix, algorithm: &str) -> Self {
        let count = stain_count(matrix);
        let stains = matrix
            .iter()
            .take(count)
            .enumerate()
            .map(|(i, row)| Stain::new(format!("Stain {}", i + 1), *row))
            .collect();
        Self {
            name: name.into(),
            stains,
            algorithm: algorithm.to_string(),
            ..Self::default()
        }
    }

    pub fn num_stains(&self) -> usize {
        self.stains.len()
    }

    /// Rows in stain order, zero-filled past the declared stains.
    pub fn stain_matrix(&self) -> StainMatrix {
        let mut m = [[0.0; 3]; 3];
        for (row, stain) in m.iter_mut().zip(&self.stains) {
            *row = stain.od;
        }
        m
    }

    pub fn validate(&self) -> Result<()> {
        if self.stains.len() > MAX_STAINS {
            return Err(StainError::InvalidParameter(format!(
                "profile {:?} declares {} stains, at most {MAX_STAINS} allowed",
                self.name,
                self.stains.len()
            )));
        }
        if let Some(stain) = self
            .stains
            .iter()
            .find(|s| s.od.iter().any(|v| !v.is_finite()))
        {
            return Err(StainError::InvalidParameter(format!(
                "stain {:?} has a non-finite component",
                stain.name
            )));
        }
        Ok(())
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parameters.insert(key.into(), value.to_string());
        self
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let profile: Self = serde_json::from_str(json)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn hematoxylin_eosin() -> Self {
        Self::preset("H&E", vec![
            Stain::new("Hematoxylin", HEMATOXYLIN),
            Stain::new("Eosin", EOSIN),
        ])
    }

    pub fn hematoxylin_dab() -> Self {
        Self::preset("H DAB", vec![
            Stain::new("Hematoxylin", HEMATOXYLIN),
            Stain::new("DAB", DAB),
        ])
    }

    pub fn hematoxylin_eosin_dab() -> Self {
        Self::preset("H&E DAB", vec![
            Stain::new("Hematoxylin", HEMATOXYLIN),
            Stain::new("Eosin", EOSIN),
            Stain::new("DAB", DAB),
        ])
    }

    /// All built-in presets.
    pub fn presets() -> Vec<Self> {
        vec![
            Self::hematoxylin_eosin(),
            Self::hematoxylin_dab(),
            Self::hematoxylin_eosin_dab(),
        ]
    }

    fn preset(name: &str, stains: Vec<Stain>) -> Self {
        Self {
            name: name.to_string(),
            stains,
            analysis_model: "Color Deconvolution".to_string(),
            algorithm: "Ruifrok & Johnston".to_string(),
            parameters: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for p in StainProfile::presets() {
            p.validate().expect("valid preset");
            assert!(p.num_stains() >= 2);
        }
        let m = StainProfile::hematoxylin_dab().stain_matrix();
        assert_eq!(m[1], DAB);
        assert_eq!(m[2], [0.0; 3]);
    }

    #[test]
    fn json_round_trip_keeps_parameters() {
        let profile = StainProfile::from_matrix("slide", &[HEMATOXYLIN, EOSIN, [0.0; 3]], "Macenko")
            .with_parameter("percentile", 1.0);
        assert_eq!(profile.num_stains(), 2);
        let json = profile.to_json_string().expect("serialize");
        let back = StainProfile::from_json_str(&json).expect("parse");
        assert_eq!(back, profile);
        assert_eq!(back.parameters["percentile"], "1");
    }

    #[test]
    fn more_than_three_stains_rejected() {
        let stains = vec![Stain::new("a", HEMATOXYLIN); 4];
        assert!(StainProfile::new("too many", stains).is_err());
        let json = r#"{"name": "x", "stains": [
            {"name": "a", "od": [1, 0, 0]}, {"name": "b", "od": [0, 1, 0]},
            {"name": "c", "od": [0, 0, 1]}, {"name": "d", "od": [1, 1, 1]}]}"#;
        assert!(StainProfile::from_json_str(json).is_err());
    }

    #[test]
    fn save_and_load() {
        let path = std::env::temp_dir().join(format!("stain-profile-{}.json", std::process::id()));
        let profile = StainProfile::hematoxylin_eosin_dab();
        profile.save(&path).expect("save");
        let loaded = StainProfile::load(&path).expect("load");
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, profile);
    }
}
