pub mod config;
pub mod model;

pub use config::{ModelConfig, ModelOverrides};
pub use model::MaskedSignalModel;

use candle_core::Device;
use candle_nn::VarBuilder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unsupported model name: {0}")]
    UnsupportedModel(String),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Width preset attached to a registered model name.
#[derive(Debug, Clone, Copy)]
pub struct ModelPreset {
    pub name: &'static str,
    hidden_size: usize,
    embed_dim: usize,
    mask_ratio: f64,
}

const PRESETS: &[ModelPreset] = &[
    ModelPreset {
        name: "signal_mae_small",
        hidden_size: 64,
        embed_dim: 32,
        mask_ratio: 0.75,
    },
    ModelPreset {
        name: "signal_mae_base",
        hidden_size: 256,
        embed_dim: 128,
        mask_ratio: 0.75,
    },
];

/// Resolves a model name to its preset. This is the fail-fast membership
/// check: callers invoke it before allocating any device or optimizer
/// resources.
pub fn preset(name: &str) -> Result<ModelPreset, ModelError> {
    PRESETS
        .iter()
        .find(|preset| preset.name == name)
        .copied()
        .ok_or_else(|| ModelError::UnsupportedModel(name.to_string()))
}

impl ModelPreset {
    /// Merges the preset with per-run overrides into a concrete config.
    pub fn resolve(
        &self,
        overrides: &ModelOverrides,
        num_leads: usize,
        window_size: usize,
        device: Device,
    ) -> ModelConfig {
        ModelConfig {
            num_leads,
            window_size,
            hidden_size: overrides.hidden_size.unwrap_or(self.hidden_size),
            embed_dim: overrides.embed_dim.unwrap_or(self.embed_dim),
            mask_ratio: overrides.mask_ratio.unwrap_or(self.mask_ratio),
            device,
        }
    }

    pub fn build(
        &self,
        overrides: &ModelOverrides,
        num_leads: usize,
        window_size: usize,
        device: Device,
        vb: VarBuilder,
    ) -> Result<MaskedSignalModel, ModelError> {
        let config = self.resolve(overrides, num_leads, window_size, device);
        Ok(MaskedSignalModel::new(config, vb)?)
    }
}

/// Parameter-name prefix under which the extractable encoder lives.
pub const ENCODER_PREFIX: &str = "encoder.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert!(preset("signal_mae_small").is_ok());
        assert!(preset("signal_mae_base").is_ok());
    }

    #[test]
    fn unknown_name_is_an_error() {
        let err = preset("st_mem_vit").unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedModel(_)));
    }

    #[test]
    fn overrides_take_precedence_over_preset() {
        let preset = preset("signal_mae_small").unwrap();
        let overrides = ModelOverrides {
            hidden_size: Some(10),
            embed_dim: None,
            mask_ratio: Some(0.25),
        };
        let config = preset.resolve(&overrides, 2, 8, Device::Cpu);
        assert_eq!(config.hidden_size, 10);
        assert_eq!(config.embed_dim, 32);
        assert_eq!(config.mask_ratio, 0.25);
    }
}
