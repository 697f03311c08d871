use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{error::to_runtime_error, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    pub min_scale: f64,
    pub max_scale: f64,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f64.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f64.powi(24),
        }
    }
}

/// Dynamic loss scaler for reduced-precision training. Disabled it is a
/// passthrough; enabled it multiplies the loss before backward, divides
/// gradients before the optimizer step, backs the scale off on overflow and
/// grows it after a stable interval.
#[derive(Debug, Clone)]
pub struct LossScaler {
    enabled: bool,
    loss_scale: f64,
    stable_steps: usize,
    config: LossScaleConfig,
}

/// Serializable snapshot of the scaler, stored in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossScalerState {
    pub enabled: bool,
    pub loss_scale: f64,
    pub stable_steps: usize,
}

impl LossScaler {
    pub fn new(enabled: bool) -> Self {
        Self::with_config(LossScaleConfig::default(), enabled)
    }

    pub fn with_config(config: LossScaleConfig, enabled: bool) -> Self {
        let config = sanitize_config(config);
        Self {
            enabled,
            loss_scale: config.initial_scale,
            stable_steps: 0,
            config,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn loss_scale(&self) -> f64 {
        if self.enabled {
            self.loss_scale
        } else {
            1.0
        }
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.enabled {
            return Ok(tensor.clone());
        }
        tensor
            .affine(self.loss_scale, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        if !self.enabled {
            return Ok(tensor.clone());
        }
        tensor
            .affine(1.0 / self.loss_scale, 0.0)
            .map_err(to_runtime_error)
    }

    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.loss_scale =
                (self.loss_scale * self.config.backoff_factor).max(self.config.min_scale);
            self.stable_steps = 0;
        } else {
            self.stable_steps += 1;
            if self.stable_steps >= self.config.growth_interval {
                self.loss_scale =
                    (self.loss_scale * self.config.growth_factor).min(self.config.max_scale);
                self.stable_steps = 0;
            }
        }
    }

    pub fn state(&self) -> LossScalerState {
        LossScalerState {
            enabled: self.enabled,
            loss_scale: self.loss_scale,
            stable_steps: self.stable_steps,
        }
    }

    pub fn load_state(&mut self, state: LossScalerState) {
        self.enabled = state.enabled;
        self.loss_scale = state.loss_scale.clamp(self.config.min_scale, self.config.max_scale);
        self.stable_steps = state.stable_steps;
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn sanitize_config(mut config: LossScaleConfig) -> LossScaleConfig {
    if config.growth_factor < 1.0 {
        config.growth_factor = 1.0;
    }
    if !(0.0..1.0).contains(&config.backoff_factor) {
        config.backoff_factor = 0.5;
    }
    if config.growth_interval == 0 {
        config.growth_interval = 1;
    }
    if config.min_scale <= 0.0 {
        config.min_scale = 1.0;
    }
    if config.max_scale < config.min_scale {
        config.max_scale = config.min_scale;
    }
    config.initial_scale = config.initial_scale.clamp(config.min_scale, config.max_scale);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor_from(data: &[f32]) -> Tensor {
        Tensor::from_slice(data, (data.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn grows_after_interval() {
        let mut scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 512.0,
                growth_interval: 2,
                ..LossScaleConfig::default()
            },
            true,
        );

        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 512.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 1024.0);
    }

    #[test]
    fn backs_off_on_overflow() {
        let mut scaler = LossScaler::with_config(
            LossScaleConfig {
                initial_scale: 1024.0,
                backoff_factor: 0.25,
                ..LossScaleConfig::default()
            },
            true,
        );

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 256.0);
    }

    #[test]
    fn disabled_scaler_is_a_passthrough() {
        let scaler = LossScaler::new(false);
        assert!(!scaler.is_enabled());
        assert_eq!(scaler.loss_scale(), 1.0);

        let tensor = tensor_from(&[2.0, 4.0]);
        assert_eq!(
            scaler.scale(&tensor).unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 4.0]
        );
        assert_eq!(
            scaler.unscale(&tensor).unwrap().to_vec1::<f32>().unwrap(),
            vec![2.0, 4.0]
        );
    }

    #[test]
    fn state_round_trips() {
        let mut scaler = LossScaler::new(true);
        scaler.update(true);
        let state = scaler.state();

        let mut restored = LossScaler::new(true);
        restored.load_state(state.clone());
        assert_eq!(restored.state(), state);
    }

    #[test]
    fn detects_non_finite_values() {
        assert!(!contains_non_finite(&tensor_from(&[1.0, -3.0])).unwrap());
        assert!(contains_non_finite(&tensor_from(&[f32::INFINITY])).unwrap());
        assert!(contains_non_finite(&tensor_from(&[f32::NAN, 1.0])).unwrap());
    }
}
