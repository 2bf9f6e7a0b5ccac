//! Engine configuration.
//!
//! Every field carries a default, so a partial JSON file is a valid config.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest frame the band filters and the sub-window estimator can work with.
pub const MIN_FRAME_SIZE: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
    pub overlap: usize,
    /// Samples requested from the capture device per read.
    pub block_size: usize,
    pub join_timeout_ms: u64,
    pub realtime_priority: bool,
    pub noise: NoiseConfig,
    pub neural: NeuralConfig,
    pub initial: ParameterDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            frame_size: 1024,
            overlap: 512,
            block_size: 4096,
            join_timeout_ms: 1000,
            realtime_priority: true,
            noise: NoiseConfig::default(),
            neural: NeuralConfig::default(),
            initial: ParameterDefaults::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing engine config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("loading {}", path.display()))
    }

    /// Samples emitted per completed frame.
    pub fn advance(&self) -> usize {
        self.frame_size - self.overlap
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            bail!("sample_rate must be non-zero");
        }
        if self.frame_size < MIN_FRAME_SIZE {
            bail!(
                "frame_size {} is below the minimum of {}",
                self.frame_size,
                MIN_FRAME_SIZE
            );
        }
        if self.overlap == 0 || self.overlap > self.frame_size / 2 {
            bail!(
                "overlap {} must be in 1..={} for frame_size {}",
                self.overlap,
                self.frame_size / 2,
                self.frame_size
            );
        }
        if self.block_size == 0 {
            bail!("block_size must be non-zero");
        }
        if self.noise.history_len == 0 {
            bail!("noise.history_len must be non-zero");
        }
        if !(0.0..1.0).contains(&self.noise.smoothing) {
            bail!("noise.smoothing {} must be in [0, 1)", self.noise.smoothing);
        }
        if self.noise.reference_pressure <= 0.0 || self.noise.excess_db_per_unit <= 0.0 {
            bail!("noise.reference_pressure and noise.excess_db_per_unit must be positive");
        }
        if !(0.0..=1.0).contains(&self.noise.max_extra_suppression) {
            bail!(
                "noise.max_extra_suppression {} must be in [0, 1]",
                self.noise.max_extra_suppression
            );
        }
        if !(self.noise.presence_threshold > 0.0) {
            bail!(
                "noise.presence_threshold {} must be positive",
                self.noise.presence_threshold
            );
        }
        Ok(())
    }
}

/// Tunable constants of the noise floor estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// Pressure that maps to 0 dB SPL for a full-scale RMS of 1.
    pub reference_pressure: f32,
    pub ein_ceiling_db_spl: f32,
    pub smoothing: f32,
    pub presence_threshold: f32,
    pub history_len: usize,
    /// EIN excess (dB) that adds 1.0 of extra suppression.
    pub excess_db_per_unit: f32,
    pub max_extra_suppression: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            reference_pressure: 2e-5,
            ein_ceiling_db_spl: 30.0,
            smoothing: 0.95,
            presence_threshold: 2.5,
            history_len: 10,
            excess_db_per_unit: 10.0,
            max_extra_suppression: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralConfig {
    pub stage1_model: Option<PathBuf>,
    pub stage2_model: Option<PathBuf>,
    /// Consecutive inference failures before the neural path is dropped for
    /// the rest of the session.
    pub failure_limit: u32,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            stage1_model: None,
            stage2_model: None,
            failure_limit: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterDefaults {
    pub enhancement_level: f32,
    pub voice_level: f32,
    pub clarity: f32,
    pub noise_reduction: bool,
}

impl Default for ParameterDefaults {
    fn default() -> Self {
        Self {
            enhancement_level: 1.0,
            voice_level: 0.5,
            clarity: 0.5,
            noise_reduction: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.advance(), 512);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            EngineConfig::from_json_str(r#"{ "frame_size": 512, "overlap": 128, "noise": { "smoothing": 0.9 } }"#)
                .unwrap();
        assert_eq!(config.frame_size, 512);
        assert_eq!(config.overlap, 128);
        assert_eq!(config.block_size, 4096);
        assert!((config.noise.smoothing - 0.9).abs() < 1e-6);
        assert_eq!(config.noise.history_len, 10);
        assert_eq!(config.neural.failure_limit, 1);
    }

    #[test]
    fn test_default_overlap_too_large_for_small_frame() {
        assert!(EngineConfig::from_json_str(r#"{ "frame_size": 512 }"#).is_err());
    }

    #[test]
    fn test_rejects_bad_overlap() {
        let mut config = EngineConfig::default();
        config.overlap = 0;
        assert!(config.validate().is_err());
        config.overlap = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_small_frame_and_zero_block() {
        let mut config = EngineConfig {
            frame_size: 32,
            overlap: 8,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
        config.frame_size = 256;
        config.block_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_noise_constants() {
        let mut config = EngineConfig::default();
        config.noise.max_extra_suppression = 1.5;
        assert!(config.validate().is_err());
        config.noise.max_extra_suppression = -0.1;
        assert!(config.validate().is_err());
        config.noise.max_extra_suppression = 1.0;
        assert!(config.validate().is_ok());

        config.noise.presence_threshold = 0.0;
        assert!(config.validate().is_err());
        config.noise.presence_threshold = f32::NAN;
        assert!(config.validate().is_err());
        assert!(EngineConfig::from_json_str(r#"{ "noise": { "max_extra_suppression": 2.0 } }"#).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(EngineConfig::from_json_file("/nonexistent/vxhear.json").is_err());
    }
}
