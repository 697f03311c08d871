use std::{
    fs,
    path::{Path, PathBuf},
};

use model::ModelOverrides;
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Per-run configuration, loaded once at process start. The only mutation
/// after loading is the CLI override merge ([`PretrainConfig::apply_overrides`]);
/// the derived learning rate lives in a separate resolved value and is never
/// written back here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PretrainConfig {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    pub model_name: String,
    #[serde(default)]
    pub output_dir: String,
    #[serde(default = "default_exp_name")]
    pub exp_name: String,
    #[serde(default)]
    pub resume: String,
    #[serde(default)]
    pub start_epoch: usize,
    #[serde(default)]
    pub ddp: DdpConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub dataloader: DataloaderConfig,
    #[serde(default)]
    pub model: ModelOverrides,
    pub train: TrainConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DdpConfig {
    #[serde(default)]
    pub distributed: bool,
    #[serde(default)]
    pub gpu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub shards: Vec<PathBuf>,
    pub num_leads: usize,
    pub window_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataloaderConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_drop_last")]
    pub drop_last: bool,
}

impl Default for DataloaderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            drop_last: default_drop_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub epochs: usize,
    #[serde(default = "default_accum_iter")]
    pub accum_iter: usize,
    /// Explicit learning rate; overrides the linear-scaling rule when set.
    #[serde(default)]
    pub lr: Option<f64>,
    /// Base learning rate for an effective batch size of 256.
    #[serde(default = "default_blr")]
    pub blr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    /// Enables reduced-precision loss scaling.
    #[serde(default)]
    pub amp: bool,
}

/// Command-line overrides, merged with a "falsy skip" rule: an empty string
/// or a zero is indistinguishable from "not provided" and leaves the
/// config-file value in effect.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_dir: String,
    pub exp_name: String,
    pub resume: String,
    pub start_epoch: usize,
}

impl PretrainConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: PretrainConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        if !overrides.output_dir.is_empty() {
            self.output_dir = overrides.output_dir.clone();
        }
        if !overrides.exp_name.is_empty() {
            self.exp_name = overrides.exp_name.clone();
        }
        if !overrides.resume.is_empty() {
            self.resume = overrides.resume.clone();
        }
        if overrides.start_epoch != 0 {
            self.start_epoch = overrides.start_epoch;
        }
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.model_name.is_empty() {
            errors.push("model_name must not be empty".to_string());
        }
        if self.dataset.shards.is_empty() {
            errors.push("dataset.shards must not be empty".to_string());
        }
        if self.dataset.num_leads == 0 {
            errors.push("dataset.num_leads must be greater than 0".to_string());
        }
        if self.dataset.window_size == 0 {
            errors.push("dataset.window_size must be greater than 0".to_string());
        }
        if self.dataloader.batch_size == 0 {
            errors.push("dataloader.batch_size must be greater than 0".to_string());
        }
        if self.train.epochs == 0 {
            errors.push("train.epochs must be greater than 0".to_string());
        }
        if self.train.accum_iter == 0 {
            errors.push("train.accum_iter must be greater than 0".to_string());
        }
        if self.train.blr <= 0.0 {
            errors.push("train.blr must be greater than 0".to_string());
        }
        if let Some(lr) = self.train.lr {
            if lr <= 0.0 {
                errors.push("train.lr must be greater than 0 when set".to_string());
            }
        }
        if self.train.weight_decay < 0.0 {
            errors.push("train.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.train.beta1 && self.train.beta1 < 1.0) {
            errors.push("train.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.train.beta2 && self.train.beta2 < 1.0) {
            errors.push("train.beta2 must be in (0, 1)".to_string());
        }
        if self.start_epoch > self.train.epochs {
            errors.push("start_epoch cannot exceed train.epochs".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Run output directory (`output_dir/exp_name`), or `None` when no
    /// output location is configured.
    pub fn run_output_dir(&self) -> Option<PathBuf> {
        if self.output_dir.is_empty() {
            None
        } else {
            Some(Path::new(&self.output_dir).join(&self.exp_name))
        }
    }

    fn apply_base_path(&mut self, base: &Path) {
        for shard in &mut self.dataset.shards {
            if shard.is_relative() {
                *shard = base.join(&*shard);
            }
        }
    }
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_exp_name() -> String {
    "pretrain".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_drop_last() -> bool {
    true
}

fn default_accum_iter() -> usize {
    1
}

fn default_blr() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    0.05
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_adam_eps() -> f64 {
    1e-8
}
