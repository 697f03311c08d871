use candle_core::backprop::GradStore;
use model::MaskedSignalModel;
use rand::rngs::StdRng;

use crate::{
    data::SignalDataLoader,
    error::to_runtime_error,
    metrics::{AverageMeter, EpochStats},
    optimizer::{scaler::contains_non_finite, LossScaler, TrainerOptimizer},
    TrainingError,
};

/// Runs one full epoch over the loader's local shard. Gradients are
/// accumulated across `accum_iter` micro-batches before each optimizer
/// step; a scaler overflow invalidates the accumulated step instead of
/// applying it. A non-finite loss is fatal, training never averages over
/// a poisoned batch.
pub fn train_one_epoch(
    model: &MaskedSignalModel,
    loader: &SignalDataLoader,
    optimizer: &mut TrainerOptimizer,
    scaler: &mut LossScaler,
    accum_iter: usize,
    rng: &mut StdRng,
) -> Result<EpochStats, TrainingError> {
    let accum_iter = accum_iter.max(1);
    let params = optimizer.parameter_tensors();

    let mut loss_meter = AverageMeter::default();
    let mut accumulated: Option<GradStore> = None;
    let mut micro_step = 0usize;

    for batch in loader.epoch_batches() {
        let batch = batch?;
        let loss = model
            .forward_loss(&batch, rng)
            .map_err(to_runtime_error)?;
        let loss_value = loss
            .to_dtype(candle_core::DType::F32)
            .map_err(to_runtime_error)?
            .to_vec0::<f32>()
            .map_err(to_runtime_error)? as f64;
        if !loss_value.is_finite() {
            return Err(TrainingError::runtime(format!(
                "loss is {loss_value}, stopping training"
            )));
        }
        loss_meter.update(loss_value);

        let normalized = loss
            .affine(1.0 / accum_iter as f64, 0.0)
            .map_err(to_runtime_error)?;
        let scaled = scaler.scale(&normalized)?;
        let grads = scaled.backward().map_err(to_runtime_error)?;

        match accumulated.as_mut() {
            None => accumulated = Some(grads),
            Some(store) => merge_gradients(store, grads, &params)?,
        }
        micro_step += 1;

        if micro_step % accum_iter == 0 {
            let mut store = match accumulated.take() {
                Some(store) => store,
                None => continue,
            };
            let found_inf = unscale_gradients(&mut store, scaler, &params)?;
            scaler.update(found_inf);
            if found_inf {
                optimizer.zero_grad(&mut store);
            } else {
                optimizer.step(&mut store)?;
            }
        }
    }

    // A trailing partial accumulation carries no full step; its gradients
    // are discarded with the epoch.
    let mut stats = EpochStats::new();
    stats.insert("loss", loss_meter.average());
    stats.insert("lr", optimizer.learning_rate());
    Ok(stats)
}

fn merge_gradients(
    store: &mut GradStore,
    mut incoming: GradStore,
    params: &[candle_core::Tensor],
) -> Result<(), TrainingError> {
    for param in params {
        let Some(new_grad) = incoming.remove(param) else {
            continue;
        };
        let merged = match store.remove(param) {
            Some(existing) => existing.add(&new_grad).map_err(to_runtime_error)?,
            None => new_grad,
        };
        store.insert(param, merged);
    }
    Ok(())
}

fn unscale_gradients(
    store: &mut GradStore,
    scaler: &LossScaler,
    params: &[candle_core::Tensor],
) -> Result<bool, TrainingError> {
    let mut found_inf = false;
    for param in params {
        let Some(grad) = store.remove(param) else {
            continue;
        };
        let grad = scaler.unscale(&grad)?;
        if contains_non_finite(&grad)? {
            found_inf = true;
        }
        store.insert(param, grad);
    }
    Ok(found_inf)
}
