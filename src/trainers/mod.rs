pub mod adam;
pub mod checkpoint;
pub mod encoder_trainer;
pub mod image_utils;
pub mod metrics;
pub mod step_grads;

// Re-export key types
pub use adam::Adam;
pub use encoder_trainer::EncoderTrainer;
pub use metrics::{LogSink, MetricLog, MetricPoint, MetricsSink, NullSink};
pub use step_grads::StepGradients;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Resolved training configuration. The binary loads this from YAML; the
/// trainer itself only ever sees the finished object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: Option<String>,
    pub device: Option<String>,
    pub data: DataConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub save: SaveConfig,
    pub display: Option<DisplayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub dataset_path: String,
    pub split_fraction: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Channel width of the first conv block; each later block doubles it.
    pub base_filters: usize,
    /// Number of stride-2 conv blocks.
    pub conv_layers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    /// Adam first-moment decay.
    pub beta1: f64,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    pub output_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub enabled: bool,
    /// Test-set evaluation interval in batch steps (default 20).
    pub eval_every: Option<usize>,
    /// Write image-grid previews of the current batches on eval ticks.
    pub preview: Option<bool>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config =
        serde_yaml::from_str(&config_str).with_context(|| "Failed to parse YAML config")?;

    Ok(config)
}

/// Resolve the configured device string. Unset means CPU; `cuda` requires
/// the crate to be built with the `cuda` feature.
pub fn resolve_device(config: &Config) -> Result<Device> {
    match config.device.as_deref() {
        None | Some("cpu") => Ok(Device::Cpu),
        Some("cuda") => {
            let device = Device::cuda_if_available(0)?;
            if !device.is_cuda() {
                info!("CUDA requested but unavailable, falling back to CPU");
            }
            Ok(device)
        }
        Some(other) => bail!("unknown device '{other}', expected 'cpu' or 'cuda'"),
    }
}
