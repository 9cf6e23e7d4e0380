// This module holds the pipeline configuration: one PassConfig per named pass (enabled
// flag, application probability and a pass-specific size threshold) plus the shared seed,
// worker count and verification mode. Configurations can be built in code, decoded from a
// JSON file with serde_json, or patched from `pass.key=value` strings supplied on the
// command line. validate() rejects unknown pass names, probabilities outside [0, 1] and
// thresholds that would make a pass ill-defined; the orchestrator calls it before any IR
// is touched so configuration errors are always fatal up front.

//! Pipeline and per-pass configuration.

use super::error::{ConfigError, ConfigResult};
use crate::passes::PassKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings shared by every pass.
///
/// `threshold` is pass specific:
/// - `split`: minimum instructions in a block (terminator included);
/// - `opaque`: unused;
/// - `flattening`: minimum number of blocks in a function;
/// - `apihiding`: unused;
/// - `string`: minimum string length in bytes;
/// - `outlining`: minimum non-terminator instructions in a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_probability")]
    pub probability: f64,
    #[serde(default)]
    pub threshold: Option<usize>,
}

fn default_probability() -> f64 {
    1.0
}

impl Default for PassConfig {
    fn default() -> Self {
        Self { enabled: false, probability: 1.0, threshold: None }
    }
}

impl PassConfig {
    pub fn enabled() -> Self {
        Self { enabled: true, ..Self::default() }
    }

    pub fn with_probability(mut self, probability: f64) -> Self {
        self.probability = probability;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Threshold or the pass default.
    pub fn threshold_for(&self, kind: PassKind) -> usize {
        self.threshold.unwrap_or_else(|| kind.default_threshold())
    }
}

/// Configuration of a whole pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Seed shared by all passes.
    pub seed: u64,
    /// Worker threads; 0 picks the rayon default, 1 runs sequentially.
    pub jobs: usize,
    /// Verify after every pass instead of once at the end.
    pub verify_each: bool,
    pub split: PassConfig,
    pub opaque: PassConfig,
    pub flattening: PassConfig,
    pub apihiding: PassConfig,
    pub string: PassConfig,
    pub outlining: PassConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            jobs: 0,
            verify_each: true,
            split: PassConfig::default(),
            opaque: PassConfig::default(),
            flattening: PassConfig::default(),
            apihiding: PassConfig::default(),
            string: PassConfig::default(),
            outlining: PassConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new(seed: u64) -> Self {
        Self { seed, ..Self::default() }
    }

    /// Every pass enabled with probability 1.
    pub fn all_enabled(seed: u64) -> Self {
        let mut config = Self::new(seed);
        for kind in PassKind::ALL {
            config.pass_mut(kind).enabled = true;
        }
        config
    }

    /// Only the named passes enabled.
    pub fn with_passes(seed: u64, names: &[&str]) -> ConfigResult<Self> {
        let mut config = Self::new(seed);
        for name in names {
            config.enable(name)?;
        }
        Ok(config)
    }

    pub fn pass(&self, kind: PassKind) -> &PassConfig {
        match kind {
            PassKind::Split => &self.split,
            PassKind::Opaque => &self.opaque,
            PassKind::Flattening => &self.flattening,
            PassKind::ApiHiding => &self.apihiding,
            PassKind::String => &self.string,
            PassKind::Outlining => &self.outlining,
        }
    }

    pub fn pass_mut(&mut self, kind: PassKind) -> &mut PassConfig {
        match kind {
            PassKind::Split => &mut self.split,
            PassKind::Opaque => &mut self.opaque,
            PassKind::Flattening => &mut self.flattening,
            PassKind::ApiHiding => &mut self.apihiding,
            PassKind::String => &mut self.string,
            PassKind::Outlining => &mut self.outlining,
        }
    }

    /// Enable a pass by its registered name.
    pub fn enable(&mut self, name: &str) -> ConfigResult<()> {
        let kind = lookup(name)?;
        self.pass_mut(kind).enabled = true;
        Ok(())
    }

    /// Enabled passes in canonical execution order.
    pub fn enabled_passes(&self) -> Vec<PassKind> {
        PassKind::ALL
            .into_iter()
            .filter(|k| self.pass(*k).enabled)
            .collect()
    }

    /// Apply a `pass.key=value` override, e.g. `split.probability=0.5`.
    pub fn apply_setting(&mut self, setting: &str) -> ConfigResult<()> {
        let (path, value) = setting.split_once('=').ok_or_else(|| ConfigError::Malformed {
            reason: format!("expected pass.key=value, got '{setting}'"),
        })?;
        let (pass, key) = path.trim().split_once('.').ok_or_else(|| ConfigError::Malformed {
            reason: format!("expected pass.key=value, got '{setting}'"),
        })?;
        let kind = lookup(pass)?;
        let value = value.trim();
        let invalid = |reason: &str| ConfigError::InvalidSetting {
            pass: pass.to_string(),
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let cfg = self.pass_mut(kind);
        match key {
            "enabled" => {
                cfg.enabled = value.parse().map_err(|_| invalid("expected true or false"))?;
            }
            "probability" => {
                cfg.probability = value.parse().map_err(|_| invalid("expected a number"))?;
            }
            "threshold" => {
                cfg.threshold = Some(value.parse().map_err(|_| invalid("expected an integer"))?);
            }
            _ => return Err(invalid("unknown key")),
        }
        Ok(())
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting. Called by the orchestrator before touching IR.
    pub fn validate(&self) -> ConfigResult<()> {
        for kind in PassKind::ALL {
            let cfg = self.pass(kind);
            let p = cfg.probability;
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::InvalidProbability {
                    pass: kind.name().to_string(),
                    value: p,
                });
            }
            let threshold = cfg.threshold_for(kind);
            let minimum = kind.min_threshold();
            if threshold < minimum {
                return Err(ConfigError::InvalidSetting {
                    pass: kind.name().to_string(),
                    key: "threshold".to_string(),
                    reason: format!("must be at least {minimum}, got {threshold}"),
                });
            }
        }
        Ok(())
    }
}

fn lookup(name: &str) -> ConfigResult<PassKind> {
    PassKind::from_name(name.trim()).ok_or_else(|| ConfigError::UnknownPass {
        name: name.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_pass_rejected() {
        let err = PipelineConfig::with_passes(1, &["split", "virtualize"]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPass { ref name } if name == "virtualize"));
    }

    #[test]
    fn test_probability_range() {
        let mut config = PipelineConfig::all_enabled(1);
        config.opaque.probability = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProbability { .. })
        ));
        config.opaque.probability = f64::NAN;
        assert!(config.validate().is_err());
        config.opaque.probability = 0.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_split_threshold_minimum() {
        let mut config = PipelineConfig::new(0);
        config.split.threshold = Some(2);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSetting { .. })
        ));
    }

    #[test]
    fn test_apply_setting() {
        let mut config = PipelineConfig::new(0);
        config.apply_setting("split.probability=0.25").unwrap();
        config.apply_setting("outlining.enabled=true").unwrap();
        config.apply_setting("string.threshold=4").unwrap();
        assert_eq!(config.split.probability, 0.25);
        assert!(config.outlining.enabled);
        assert_eq!(config.string.threshold, Some(4));
        assert!(config.apply_setting("split.colour=red").is_err());
        assert!(config.apply_setting("nosuch.enabled=true").is_err());
    }

    #[test]
    fn test_json_round_trip_defaults() {
        let config = PipelineConfig::from_json(
            r#"{ "seed": 7, "flattening": { "enabled": true }, "split": { "enabled": true, "probability": 0.5 } }"#,
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.enabled_passes(), vec![PassKind::Split, PassKind::Flattening]);
        assert_eq!(config.flattening.probability, 1.0);
        assert!(config.verify_each);
    }

    #[test]
    fn test_canonical_order_ignores_request_order() {
        let config = PipelineConfig::with_passes(0, &["outlining", "flattening", "split"]).unwrap();
        assert_eq!(
            config.enabled_passes(),
            vec![PassKind::Split, PassKind::Flattening, PassKind::Outlining]
        );
    }
}
