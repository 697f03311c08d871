use std::collections::HashMap;

pub mod scaler;

pub use scaler::{LossScaleConfig, LossScaler, LossScalerState};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{error::to_runtime_error, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    pub max_grad_norm: Option<f64>,
}

/// AdamW over named model parameters, with a serializable state so
/// checkpoints can restore the exact moment estimates.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::config(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::config(format!(
                    "optimizer received non-floating parameter '{name}'"
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    /// Parameter tensors in optimizer order, used for gradient-store
    /// bookkeeping during accumulation.
    pub fn parameter_tensors(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .map(|slot| slot.param.as_tensor().clone())
            .collect()
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let grad = match grads.remove(tensor) {
                Some(grad) => grad,
                None => continue,
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient { index: idx, grad, norm });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.config.max_grad_norm {
            let total_norm_sq: f64 = processed.iter().map(|g| g.norm * g.norm).sum();
            let total_norm = total_norm_sq.sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for item in processed {
            let slot = &mut self.params[item.index];

            let prev_m = slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = item
                .grad
                .affine(1.0 - cfg.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - cfg.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, cfg.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?;
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;

            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    /// Drops any gradients belonging to tracked parameters, used when an
    /// overflow invalidates the accumulated step.
    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel: usize = shape.iter().product();
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
            });
        }
        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        self.step = state.step;
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::resume(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims();
            if dims != state.shape.as_slice() {
                return Err(TrainingError::resume(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected: usize = state.shape.iter().product();
            if state.first_moment.len() != expected || state.second_moment.len() != expected {
                return Err(TrainingError::resume(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            slot.first_moment = Tensor::from_vec(state.first_moment, expected, device)
                .map_err(to_runtime_error)?
                .reshape(dims)
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, expected, device)
                .map_err(to_runtime_error)?
                .reshape(dims)
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::resume(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during optimizer state serialization",
        ));
    }
    Ok(flat)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}
