//! Pipeline tunables, loaded from JSON. Every section defaults, so a
//! partial or missing file is valid.

use crate::models::{Device, ModelPaths};
use crate::persistence::PersistenceConfig;
use crate::pipeline::estimation::EstimationConfig;
use crate::pipeline::segmentation::SegmentationConfig;
use crate::pipeline::slicing::SliceConfig;
use crate::storage::breaker::BreakerConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// CPU worker threads; 0 means one per logical CPU.
    pub cpu_workers: usize,
    /// Attempts per container unit, counting the first.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Ceiling on the wait for all container units.
    pub aggregation_timeout_secs: f64,
    pub device: Device,
    pub artifact_jpeg_quality: u8,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cpu_workers: 0,
            max_attempts: 2,
            backoff_base_ms: 200,
            aggregation_timeout_secs: 120.0,
            device: Device::Cpu,
            artifact_jpeg_quality: 85,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub segmentation: SegmentationConfig,
    pub slicing: SliceConfig,
    pub estimation: EstimationConfig,
    pub coordinator: CoordinatorConfig,
    pub breaker: BreakerConfig,
    pub persistence: PersistenceConfig,
    pub models: ModelPaths,
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str::<PipelineConfig>(&text)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => PipelineConfig::default(),
        };
        config.normalized()
    }

    /// Clamp ranges and reject values the stages cannot work with.
    pub fn normalized(mut self) -> Result<Self> {
        self.slicing.overlap = self.slicing.overlap.clamp(0.0, 0.5);
        self.estimation
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid estimation config: {e}"))?;
        if self.coordinator.max_attempts == 0 {
            self.coordinator.max_attempts = 1;
        }
        let timeout = self.coordinator.aggregation_timeout_secs;
        if !(timeout.is_finite() && timeout > 0.0) {
            anyhow::bail!("aggregation_timeout_secs must be positive, got {timeout}");
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::slicing::MatchMetric;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let json = r#"{
            "slicing": {"tile_size": 512, "overlap": 0.9, "match_metric": "ios"},
            "estimation": {"bands": 6}
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        let config = config.normalized().unwrap();
        assert_eq!(config.slicing.tile_size, 512);
        assert_eq!(config.slicing.overlap, 0.5);
        assert_eq!(config.slicing.match_metric, MatchMetric::Ios);
        assert_eq!(config.slicing.min_tile_size, 640);
        assert_eq!(config.estimation.bands, 6);
        assert_eq!(config.estimation.overcount_factor, 0.9);
        assert_eq!(config.coordinator.max_attempts, 2);
        assert_eq!(config.breaker.window_size, 20);
        assert_eq!(config.persistence.max_attempts, 3);
    }

    #[test]
    fn test_invalid_overcount_factor_rejected() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"estimation": {"overcount_factor": 1.5}}"#).unwrap();
        assert!(config.normalized().is_err());

        let config: PipelineConfig =
            serde_json::from_str(r#"{"coordinator": {"aggregation_timeout_secs": -1}}"#).unwrap();
        assert!(config.normalized().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, r#"{"coordinator": {"cpu_workers": 3}}"#).unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.coordinator.cpu_workers, 3);
        assert!(PipelineConfig::load(None).is_ok());
    }
}
