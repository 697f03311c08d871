use std::{collections::HashMap, sync::Arc, time::Instant};

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::{self, checkpoint_dir_name, named_parameters, ENCODER_ARTIFACT},
    config::PretrainConfig,
    data::{DistributedSampler, SignalDataLoader, SignalDataset},
    distributed::Topology,
    engine,
    logging::MetricSink,
    lr::resolve_learning_rate,
    optimizer::{AdamWConfig, LossScaler, TrainerOptimizer},
    TrainingError,
};

/// Full training snapshots are written every this many epochs, plus once
/// at the final epoch.
pub const CHECKPOINT_INTERVAL: usize = 20;

pub fn should_save_checkpoint(epoch: usize, total_epochs: usize) -> bool {
    epoch % CHECKPOINT_INTERVAL == 0 || epoch + 1 == total_epochs
}

/// Drives one pretraining run end to end: topology resolution, data and
/// model construction, the epoch loop, checkpointing and the terminal
/// encoder extraction. Every rank runs the same loop; only the main
/// process touches the filesystem.
#[derive(Debug)]
pub struct Trainer {
    config: PretrainConfig,
    topology: Topology,
}

impl Trainer {
    pub fn new(config: PretrainConfig) -> Result<Self, TrainingError> {
        // Reject unknown model names before any resources are allocated.
        model::preset(&config.model_name)?;
        let topology = Topology::initialize(&config)?;
        Ok(Self { config, topology })
    }

    pub fn run(self) -> Result<(), TrainingError> {
        let config = &self.config;
        let topology = &self.topology;
        let device = topology.device().clone();

        // Per-rank seeding keeps mask sampling decorrelated across ranks
        // while the run as a whole stays reproducible.
        let rank_seed = config.seed.wrapping_add(topology.rank() as u64);
        let mut rng = StdRng::seed_from_u64(rank_seed);
        if let Err(err) = device.set_seed(rank_seed) {
            eprintln!("warning: failed to seed device rng: {err}");
        }

        let dataset = Arc::new(SignalDataset::load(
            &config.dataset.shards,
            config.dataset.num_leads,
            config.dataset.window_size,
        )?);
        let sampler = DistributedSampler::new(
            dataset.len(),
            topology.rank(),
            topology.world_size(),
            config.seed,
        )?;
        let mut loader = SignalDataLoader::new(
            dataset.clone(),
            sampler,
            config.dataloader.batch_size,
            config.dataloader.drop_last,
            device.clone(),
        )?;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let preset = model::preset(&config.model_name)?;
        let net = preset.build(
            &config.model,
            config.dataset.num_leads,
            config.dataset.window_size,
            device.clone(),
            vb,
        )?;

        let resolved = resolve_learning_rate(
            config.dataloader.batch_size,
            config.train.accum_iter,
            topology.world_size(),
            config.train.lr,
            config.train.blr,
        );

        if topology.is_main() {
            let dump = serde_json::to_string_pretty(config).map_err(|err| {
                TrainingError::runtime(format!("failed to render configuration: {err}"))
            })?;
            println!("{dump}");
            println!(
                "windows: {} | world size: {}",
                dataset.len(),
                topology.world_size()
            );
            println!("base lr: {:.2e}", resolved.base_lr);
            println!("actual lr: {:.2e}", resolved.lr);
            println!("accumulate grad iterations: {}", resolved.accum_iter);
            println!("effective batch size: {}", resolved.effective_batch_size);
        }

        let mut optimizer = TrainerOptimizer::new(
            named_parameters(&varmap),
            AdamWConfig {
                learning_rate: resolved.lr,
                beta1: config.train.beta1,
                beta2: config.train.beta2,
                epsilon: config.train.epsilon,
                weight_decay: config.train.weight_decay,
                max_grad_norm: config.train.max_grad_norm,
            },
        )?;
        let mut scaler = LossScaler::new(config.train.amp);

        if let Some(stored_epoch) =
            checkpoint::load_for_resume(config, &mut varmap, &mut optimizer, &mut scaler)?
        {
            if topology.is_main() {
                println!(
                    "resumed from {} (saved at epoch {stored_epoch}, continuing at epoch {})",
                    config.resume, config.start_epoch
                );
            }
        }

        let run_dir = config.run_output_dir();
        let mut sink = MetricSink::new(topology.is_main(), run_dir.as_deref())?;

        let started = Instant::now();
        let mut last_epoch: Option<usize> = None;

        for epoch in config.start_epoch..config.train.epochs {
            loader.set_epoch(epoch);
            let stats = engine::train_one_epoch(
                &net,
                &loader,
                &mut optimizer,
                &mut scaler,
                config.train.accum_iter,
                &mut rng,
            )?;

            if topology.is_main() {
                let loss = stats.get("loss").unwrap_or(f64::NAN);
                println!("epoch {epoch}: loss {loss:.6}");
            }

            if topology.is_main() {
                if let Some(dir) = run_dir.as_ref() {
                    if should_save_checkpoint(epoch, config.train.epochs) {
                        checkpoint::save_training(
                            &dir.join(checkpoint_dir_name(epoch)),
                            epoch,
                            &varmap,
                            &optimizer,
                            &scaler,
                            config,
                        )?;
                    }
                }
            }

            sink.record(epoch, &stats)?;
            last_epoch = Some(epoch);
        }

        match last_epoch {
            Some(epoch) => {
                if topology.is_main() {
                    if let Some(dir) = run_dir.as_ref() {
                        let encoder = encoder_tensors(&varmap);
                        checkpoint::save_component(
                            &dir.join(ENCODER_ARTIFACT),
                            epoch,
                            &encoder,
                            config,
                        )?;
                    }
                }
            }
            None => {
                if topology.is_main() {
                    println!("no epochs to run, skipping encoder extraction");
                }
            }
        }

        if topology.is_main() {
            println!(
                "training time {}",
                format_duration(started.elapsed().as_secs())
            );
        }

        Ok(())
    }
}

fn encoder_tensors(varmap: &VarMap) -> HashMap<String, Tensor> {
    named_parameters(varmap)
        .into_iter()
        .filter(|(name, _)| name.starts_with(model::ENCODER_PREFIX))
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect()
}

fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours}:{minutes:02}:{seconds:02}")
}
