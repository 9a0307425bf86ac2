//! Engine configuration
//!
//! Loaded from a TOML file; every field has a default so an absent file or a
//! partial file is fine.

use crate::error::ConfigError;
use crate::model::{Granularity, SplineThreshold};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "AQS_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
    pub detection: DetectionConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Root of the partitioned series and residual layout.
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { root: PathBuf::from("data") }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker threads; 0 means one per available core.
    pub workers: usize,
    pub queue_depth: usize,
    pub hourly_min_points: usize,
    pub daily_min_points: usize,
    /// Knots for a complete 24-reading day.
    pub hourly_full_day_knots: usize,
    /// Upper bound on knots for a partial day.
    pub hourly_partial_max_knots: usize,
    pub daily_points_per_knot: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: 1024,
            hourly_min_points: 4,
            daily_min_points: 8,
            hourly_full_day_knots: 6,
            hourly_partial_max_knots: 5,
            daily_points_per_knot: 4,
        }
    }
}

impl PipelineConfig {
    pub fn min_points(&self, granularity: Granularity) -> usize {
        match granularity {
            Granularity::Hourly => self.hourly_min_points,
            Granularity::Daily => self.daily_min_points,
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Budget for a single detection request.
    pub timeout_ms: u64,
    /// Budget for a whole overview fan-out across sites.
    pub overview_timeout_ms: u64,
    pub density: DensityDefaults,
    pub drift: DriftDefaults,
    pub autoregressive: AutoregressiveDefaults,
    pub spline: SplineDefaults,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2_000,
            overview_timeout_ms: 30_000,
            density: DensityDefaults::default(),
            drift: DriftDefaults::default(),
            autoregressive: AutoregressiveDefaults::default(),
            spline: SplineDefaults::default(),
        }
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn overview_timeout(&self) -> Duration {
        Duration::from_millis(self.overview_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DensityDefaults {
    pub eps: f64,
    pub min_samples: usize,
    pub time_weight: f64,
    pub max_gap_steps: f64,
    pub min_points: usize,
}

impl Default for DensityDefaults {
    fn default() -> Self {
        Self {
            eps: 1.5,
            min_samples: 3,
            time_weight: 0.25,
            max_gap_steps: 2.0,
            min_points: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriftDefaults {
    pub slack_sigmas: f64,
    pub threshold_sigmas: f64,
}

impl Default for DriftDefaults {
    fn default() -> Self {
        Self {
            slack_sigmas: 0.5,
            threshold_sigmas: 4.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutoregressiveDefaults {
    pub order: usize,
    pub min_points: usize,
    pub sigma_multiplier: f64,
}

impl Default for AutoregressiveDefaults {
    fn default() -> Self {
        Self {
            order: 2,
            min_points: 20,
            sigma_multiplier: 3.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplineDefaults {
    pub hourly_z_critical: f64,
    pub daily_z_critical: f64,
    pub min_points: usize,
}

impl Default for SplineDefaults {
    fn default() -> Self {
        Self {
            hourly_z_critical: 15.0,
            daily_z_critical: 6.0,
            min_points: 20,
        }
    }
}

impl SplineDefaults {
    pub fn threshold(&self, granularity: Granularity) -> SplineThreshold {
        match granularity {
            Granularity::Hourly => SplineThreshold::ZScore(self.hourly_z_critical),
            Granularity::Daily => SplineThreshold::ZScore(self.daily_z_critical),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "0.0.0.0:3000".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "info".to_string() }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => PathBuf::from(p),
                None => return Ok(Self::default()),
            },
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
            path: config_path.clone(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.queue_depth == 0 {
            return Err(ConfigError::Invalid("pipeline.queue_depth must be > 0".into()));
        }
        if p.daily_points_per_knot == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.daily_points_per_knot must be > 0".into(),
            ));
        }
        if p.hourly_full_day_knots < 2 || p.hourly_partial_max_knots < 2 {
            return Err(ConfigError::Invalid("hourly knot counts must be >= 2".into()));
        }
        // Fewer than 4 points cannot support the smallest cubic basis.
        if p.hourly_min_points < 4 || p.daily_min_points < 4 {
            return Err(ConfigError::Invalid("min points must be >= 4".into()));
        }
        let d = &self.detection;
        if d.density.eps <= 0.0 || d.density.min_samples == 0 {
            return Err(ConfigError::Invalid(
                "detection.density needs eps > 0 and min_samples > 0".into(),
            ));
        }
        if d.drift.threshold_sigmas <= 0.0 {
            return Err(ConfigError::Invalid(
                "detection.drift.threshold_sigmas must be > 0".into(),
            ));
        }
        if d.autoregressive.order == 0 {
            return Err(ConfigError::Invalid("detection.autoregressive.order must be > 0".into()));
        }
        Ok(())
    }
}
