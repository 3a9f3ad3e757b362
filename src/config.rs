//! Evaluation configuration
//!
//! Knobs consumed by an evaluation run, loadable from TOML:
//!
//! ```toml
//! ensemble_size = 100
//! sample_size = 500
//! seed = 42
//! parallel = true
//!
//! [confidence]
//! replications = 50
//! z = 1.96
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::semantics::{BooleanSemantics, QuantitativeSemantics, ThreeValuedSemantics};
use crate::SpearError;

/// Bootstrap parameters of the three-valued semantics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Number of bootstrap replications (m).
    pub replications: usize,
    /// z-score of the interval.
    pub z: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            replications: 50,
            z: 1.96,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Replicas per step of the base evolution sequence.
    pub ensemble_size: usize,
    /// Replicas of each perturbed or resampled ensemble.
    pub sample_size: usize,
    pub seed: u64,
    pub parallel: bool,
    pub confidence: ConfidenceConfig,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 100,
            sample_size: 100,
            seed: 0,
            parallel: true,
            confidence: ConfidenceConfig::default(),
        }
    }
}

impl EvaluationConfig {
    pub fn validate(&self) -> Result<(), SpearError> {
        if self.ensemble_size == 0 {
            return Err(SpearError::InvalidConfig(
                "ensemble_size must be > 0".to_string(),
            ));
        }
        if self.sample_size == 0 {
            return Err(SpearError::InvalidConfig("sample_size must be > 0".to_string()));
        }
        if self.confidence.replications < 2 {
            return Err(SpearError::InvalidConfig(
                "confidence.replications must be >= 2".to_string(),
            ));
        }
        if !self.confidence.z.is_finite() || self.confidence.z <= 0.0 {
            return Err(SpearError::InvalidConfig(format!(
                "confidence.z must be finite and > 0, got {}",
                self.confidence.z
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, SpearError> {
        let cfg: EvaluationConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, SpearError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn boolean(&self) -> BooleanSemantics {
        BooleanSemantics::new(self.parallel)
    }

    pub fn three_valued(&self) -> ThreeValuedSemantics {
        ThreeValuedSemantics::new(self.confidence.replications, self.confidence.z, self.parallel)
    }

    pub fn quantitative(&self) -> QuantitativeSemantics {
        QuantitativeSemantics::new(self.parallel)
    }
}
