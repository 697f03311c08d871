use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::Tensor;
use candle_nn::VarMap;
use hex::encode as hex_encode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::PretrainConfig,
    optimizer::{LossScaler, LossScalerState, OptimizerState, TrainerOptimizer},
    TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
/// Terminal component-only artifact name for the extracted encoder.
pub const ENCODER_ARTIFACT: &str = "encoder_fft";

const MODEL_FILENAME: &str = "model.safetensors";
const ENCODER_FILENAME: &str = "encoder.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Snapshot directory name for a full training checkpoint at `epoch`.
pub fn checkpoint_dir_name(epoch: usize) -> String {
    format!("checkpoint-{epoch}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Manifest written last into every snapshot directory; its presence marks
/// the snapshot complete. Full training snapshots carry optimizer and
/// scaler records, component-only snapshots carry neither.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub epoch: usize,
    pub config: PretrainConfig,
    pub weights: FileRecord,
    pub optimizer: Option<FileRecord>,
    pub scaler: Option<FileRecord>,
}

/// Model parameters in deterministic name order. The ordering fixes the
/// optimizer's slot layout, so it must be identical across save and resume.
pub fn named_parameters(varmap: &VarMap) -> Vec<(String, candle_core::Var)> {
    let data = varmap.data().lock().expect("parameter map poisoned");
    let mut params: Vec<(String, candle_core::Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    params
}

/// Writes a full training snapshot into `dir`. The snapshot is assembled
/// in a sibling staging directory and renamed into place, so an existing
/// snapshot at `dir` survives a crash mid-write. Only the main process may
/// call this; concurrent writers to the same path would corrupt it.
pub fn save_training(
    dir: &Path,
    epoch: usize,
    varmap: &VarMap,
    optimizer: &TrainerOptimizer,
    scaler: &LossScaler,
    config: &PretrainConfig,
) -> Result<(), TrainingError> {
    let stage = stage_snapshot_dir(dir)?;

    let weights_path = stage.join(MODEL_FILENAME);
    varmap.save(&weights_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            weights_path.display()
        ))
    })?;
    let weights = file_record(&weights_path)?;

    let optimizer_path = stage.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &optimizer.state()?)?;
    let optimizer_record = file_record(&optimizer_path)?;

    let scaler_path = stage.join(SCALER_FILENAME);
    write_json(&scaler_path, &scaler.state())?;
    let scaler_record = file_record(&scaler_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        epoch,
        config: config.clone(),
        weights,
        optimizer: Some(optimizer_record),
        scaler: Some(scaler_record),
    };
    write_json(&stage.join(MANIFEST_FILENAME), &manifest)?;

    commit_snapshot_dir(&stage, dir)
}

/// Writes a component-only snapshot (extracted sub-component weights plus
/// configuration and epoch, no optimizer or scaler state).
pub fn save_component(
    dir: &Path,
    epoch: usize,
    tensors: &HashMap<String, Tensor>,
    config: &PretrainConfig,
) -> Result<(), TrainingError> {
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "component snapshot has no tensors to save",
        ));
    }
    let stage = stage_snapshot_dir(dir)?;

    let weights_path = stage.join(ENCODER_FILENAME);
    candle_core::safetensors::save(tensors, &weights_path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize component weights to {}: {err}",
            weights_path.display()
        ))
    })?;
    let weights = file_record(&weights_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        epoch,
        config: config.clone(),
        weights,
        optimizer: None,
        scaler: None,
    };
    write_json(&stage.join(MANIFEST_FILENAME), &manifest)?;

    commit_snapshot_dir(&stage, dir)
}

/// Restores model weights (and optimizer/scaler state when the snapshot
/// carries them) from the configured resume path. A no-op when no resume
/// path is set. Any unreadable or corrupt snapshot at a configured path is
/// fatal; training never silently restarts from scratch.
///
/// Returns the epoch stored in the snapshot. The caller keeps using
/// `config.start_epoch`; the stored epoch is surfaced for reconciliation
/// only.
pub fn load_for_resume(
    config: &PretrainConfig,
    varmap: &mut VarMap,
    optimizer: &mut TrainerOptimizer,
    scaler: &mut LossScaler,
) -> Result<Option<usize>, TrainingError> {
    if config.resume.is_empty() {
        return Ok(None);
    }

    let dir = PathBuf::from(&config.resume);
    let manifest: CheckpointManifest = read_json(&dir.join(MANIFEST_FILENAME))?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::resume(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let weights_path = dir.join(&manifest.weights.filename);
    validate_file(&weights_path, &manifest.weights.sha256)?;
    varmap.load(&weights_path).map_err(|err| {
        TrainingError::resume(format!(
            "failed to restore model weights from {}: {err}",
            weights_path.display()
        ))
    })?;

    if let Some(record) = manifest.optimizer.as_ref() {
        let path = dir.join(&record.filename);
        validate_file(&path, &record.sha256)?;
        let state: OptimizerState = read_json(&path)?;
        optimizer.load_state(state)?;
    }

    if let Some(record) = manifest.scaler.as_ref() {
        let path = dir.join(&record.filename);
        validate_file(&path, &record.sha256)?;
        let state: LossScalerState = read_json(&path)?;
        scaler.load_state(state);
    }

    Ok(Some(manifest.epoch))
}

/// Creates the sibling staging directory a snapshot is assembled in. Any
/// stale staging directory left by an interrupted save is discarded.
fn stage_snapshot_dir(dir: &Path) -> Result<PathBuf, TrainingError> {
    let name = dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "snapshot directory name is not valid UTF-8: {}",
                dir.display()
            ))
        })?;
    let stage = dir.with_file_name(format!("{name}.tmp"));
    if stage.exists() {
        fs::remove_dir_all(&stage).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to clear stale staging directory {}: {err}",
                stage.display()
            ))
        })?;
    }
    fs::create_dir_all(&stage).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create staging directory {}: {err}",
            stage.display()
        ))
    })?;
    Ok(stage)
}

fn commit_snapshot_dir(stage: &Path, dir: &Path) -> Result<(), TrainingError> {
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to replace existing snapshot {}: {err}",
                dir.display()
            ))
        })?;
    }
    fs::rename(stage, dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move snapshot into place at {}: {err}",
            dir.display()
        ))
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::resume(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::resume(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::resume(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat snapshot file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "snapshot file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::resume(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::resume(format!("failed to parse {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;
    use rand::{rngs::StdRng, SeedableRng};
    use tempfile::tempdir;

    use crate::optimizer::AdamWConfig;

    fn test_config(resume: &str) -> PretrainConfig {
        toml::from_str::<PretrainConfig>(&format!(
            r#"
            model_name = "signal_mae_small"
            resume = "{resume}"

            [dataset]
            shards = ["train.f32"]
            num_leads = 2
            window_size = 8

            [model]
            hidden_size = 8
            embed_dim = 4

            [train]
            epochs = 4
            "#
        ))
        .unwrap()
    }

    fn build_stack(
        config: &PretrainConfig,
    ) -> (VarMap, model::MaskedSignalModel, TrainerOptimizer, LossScaler) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let preset = model::preset(&config.model_name).unwrap();
        let net = preset
            .build(
                &config.model,
                config.dataset.num_leads,
                config.dataset.window_size,
                Device::Cpu,
                vb,
            )
            .unwrap();
        let optimizer = TrainerOptimizer::new(
            named_parameters(&varmap),
            AdamWConfig {
                learning_rate: 0.05,
                beta1: 0.9,
                beta2: 0.95,
                epsilon: 1e-8,
                weight_decay: 0.0,
                max_grad_norm: None,
            },
        )
        .unwrap();
        let scaler = LossScaler::new(true);
        (varmap, net, optimizer, scaler)
    }

    fn parameter_values(varmap: &VarMap) -> Vec<(String, Vec<f32>)> {
        named_parameters(varmap)
            .into_iter()
            .map(|(name, var)| {
                let values = var
                    .as_tensor()
                    .flatten_all()
                    .unwrap()
                    .to_vec1::<f32>()
                    .unwrap();
                (name, values)
            })
            .collect()
    }

    #[test]
    fn full_snapshot_round_trips() {
        let tmp = tempdir().unwrap();
        let snapshot = tmp.path().join(checkpoint_dir_name(3));

        let config = test_config("");
        let (varmap, net, mut optimizer, mut scaler) = build_stack(&config);

        // One step so moments and weights are non-trivial.
        let mut rng = StdRng::seed_from_u64(11);
        let batch = Tensor::rand(-1f32, 1f32, (2, 2, 8), &Device::Cpu).unwrap();
        let loss = net.forward_loss(&batch, &mut rng).unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        scaler.update(true);

        save_training(&snapshot, 3, &varmap, &optimizer, &scaler, &config).unwrap();

        let resume_config = test_config(snapshot.to_str().unwrap());
        let (mut varmap2, _net2, mut optimizer2, mut scaler2) = build_stack(&resume_config);
        let epoch = load_for_resume(&resume_config, &mut varmap2, &mut optimizer2, &mut scaler2)
            .unwrap()
            .unwrap();

        assert_eq!(epoch, 3);
        assert_eq!(parameter_values(&varmap), parameter_values(&varmap2));
        assert_eq!(scaler2.state(), scaler.state());
        let original = optimizer.state().unwrap();
        let restored = optimizer2.state().unwrap();
        assert_eq!(original.step, restored.step);
        for (a, b) in original.parameters.iter().zip(restored.parameters.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.first_moment, b.first_moment);
            assert_eq!(a.second_moment, b.second_moment);
        }
    }

    #[test]
    fn empty_resume_path_is_a_noop() {
        let config = test_config("");
        let (mut varmap, _net, mut optimizer, mut scaler) = build_stack(&config);
        let resumed =
            load_for_resume(&config, &mut varmap, &mut optimizer, &mut scaler).unwrap();
        assert!(resumed.is_none());
    }

    #[test]
    fn missing_snapshot_at_resume_path_is_fatal() {
        let tmp = tempdir().unwrap();
        let config = test_config(tmp.path().join("absent").to_str().unwrap());
        let (mut varmap, _net, mut optimizer, mut scaler) = build_stack(&config);
        let err = load_for_resume(&config, &mut varmap, &mut optimizer, &mut scaler).unwrap_err();
        assert!(matches!(err, TrainingError::Resume(_)));
    }

    #[test]
    fn corrupted_weights_fail_checksum_validation() {
        let tmp = tempdir().unwrap();
        let snapshot = tmp.path().join(checkpoint_dir_name(0));

        let config = test_config("");
        let (varmap, _net, optimizer, scaler) = build_stack(&config);
        save_training(&snapshot, 0, &varmap, &optimizer, &scaler, &config).unwrap();

        fs::write(snapshot.join(MODEL_FILENAME), b"garbage").unwrap();

        let resume_config = test_config(snapshot.to_str().unwrap());
        let (mut varmap2, _net2, mut optimizer2, mut scaler2) = build_stack(&resume_config);
        let err = load_for_resume(&resume_config, &mut varmap2, &mut optimizer2, &mut scaler2)
            .unwrap_err();
        assert!(matches!(err, TrainingError::Resume(_)));
    }

    #[test]
    fn resaving_replaces_the_snapshot_without_leaving_a_stage() {
        let tmp = tempdir().unwrap();
        let snapshot = tmp.path().join(checkpoint_dir_name(2));

        let config = test_config("");
        let (varmap, net, mut optimizer, scaler) = build_stack(&config);
        save_training(&snapshot, 2, &varmap, &optimizer, &scaler, &config).unwrap();

        // Advance the optimizer so the second save differs, then overwrite.
        let mut rng = StdRng::seed_from_u64(5);
        let batch = Tensor::rand(-1f32, 1f32, (2, 2, 8), &Device::Cpu).unwrap();
        let loss = net.forward_loss(&batch, &mut rng).unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        save_training(&snapshot, 2, &varmap, &optimizer, &scaler, &config).unwrap();

        let siblings: Vec<String> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(siblings, vec![checkpoint_dir_name(2)]);

        let resume_config = test_config(snapshot.to_str().unwrap());
        let (mut varmap2, _net2, mut optimizer2, mut scaler2) = build_stack(&resume_config);
        let epoch = load_for_resume(&resume_config, &mut varmap2, &mut optimizer2, &mut scaler2)
            .unwrap()
            .unwrap();
        assert_eq!(epoch, 2);
        assert_eq!(parameter_values(&varmap), parameter_values(&varmap2));
    }

    #[test]
    fn component_snapshot_records_epoch_and_no_optimizer() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join(ENCODER_ARTIFACT);

        let config = test_config("");
        let (varmap, _net, _optimizer, _scaler) = build_stack(&config);
        let tensors: HashMap<String, Tensor> = named_parameters(&varmap)
            .into_iter()
            .filter(|(name, _)| name.starts_with(model::ENCODER_PREFIX))
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();

        save_component(&dir, 7, &tensors, &config).unwrap();

        let manifest: CheckpointManifest = read_json(&dir.join(MANIFEST_FILENAME)).unwrap();
        assert_eq!(manifest.epoch, 7);
        assert!(manifest.optimizer.is_none());
        assert!(manifest.scaler.is_none());
        assert!(dir.join(ENCODER_FILENAME).is_file());
    }
}
