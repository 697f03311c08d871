use candle_core::{Device, Error, Result};
use serde::{Deserialize, Serialize};

/// Fully-resolved configuration for assembling a masked signal model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub num_leads: usize,
    pub window_size: usize,
    pub hidden_size: usize,
    pub embed_dim: usize,
    pub mask_ratio: f64,
    pub device: Device,
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_leads == 0 {
            return Err(Error::Msg("num_leads must be greater than zero".into()));
        }
        if self.window_size == 0 {
            return Err(Error::Msg("window_size must be greater than zero".into()));
        }
        if self.hidden_size == 0 {
            return Err(Error::Msg("hidden_size must be greater than zero".into()));
        }
        if self.embed_dim == 0 {
            return Err(Error::Msg("embed_dim must be greater than zero".into()));
        }
        if !(0.0 < self.mask_ratio && self.mask_ratio < 1.0) {
            return Err(Error::Msg(format!(
                "mask_ratio must be in (0, 1), got {}",
                self.mask_ratio
            )));
        }
        Ok(())
    }

    pub fn input_dim(&self) -> usize {
        self.num_leads * self.window_size
    }
}

/// Optional width/masking overrides carried inside the run configuration.
/// Unset fields fall back to the preset selected by the model name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default)]
    pub hidden_size: Option<usize>,
    #[serde(default)]
    pub embed_dim: Option<usize>,
    #[serde(default)]
    pub mask_ratio: Option<f64>,
}
