use std::{fs, path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// In-memory dataset of fixed-shape signal windows, loaded from raw shard
/// files of little-endian f32 samples. Each window is `num_leads *
/// window_size` contiguous values; shards that do not divide evenly into
/// windows are rejected at load time.
#[derive(Debug)]
pub struct SignalDataset {
    windows: Vec<Vec<f32>>,
    num_leads: usize,
    window_size: usize,
}

impl SignalDataset {
    pub fn load(
        shards: &[impl AsRef<Path>],
        num_leads: usize,
        window_size: usize,
    ) -> Result<Self, TrainingError> {
        if shards.is_empty() {
            return Err(TrainingError::config("dataset has no shards"));
        }
        let window_values = num_leads * window_size;
        if window_values == 0 {
            return Err(TrainingError::config(
                "num_leads and window_size must be greater than zero",
            ));
        }

        let mut windows = Vec::new();
        for shard in shards {
            let shard = shard.as_ref();
            let bytes = fs::read(shard).map_err(|err| {
                TrainingError::config(format!("failed to read shard {}: {err}", shard.display()))
            })?;
            if bytes.len() % 4 != 0 {
                return Err(TrainingError::config(format!(
                    "shard {} is {} bytes, not a whole number of f32 samples",
                    shard.display(),
                    bytes.len()
                )));
            }
            let values: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect();
            if values.len() % window_values != 0 {
                return Err(TrainingError::config(format!(
                    "shard {} holds {} samples, not divisible into {}x{} windows",
                    shard.display(),
                    values.len(),
                    num_leads,
                    window_size
                )));
            }
            for window in values.chunks_exact(window_values) {
                windows.push(window.to_vec());
            }
        }

        if windows.is_empty() {
            return Err(TrainingError::config("dataset shards contain no windows"));
        }

        Ok(Self {
            windows,
            num_leads,
            window_size,
        })
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn num_leads(&self) -> usize {
        self.num_leads
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    fn window(&self, index: usize) -> &[f32] {
        &self.windows[index]
    }
}

/// Deterministic rank-aware index sampler. Every rank shuffles the full
/// index space with the same `seed + epoch` stream, then keeps its own
/// rank-strided slice, so the ranks partition each epoch without overlap.
/// `set_epoch` must be called before iterating a new epoch or every epoch
/// reuses the same order.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(
        len: usize,
        rank: usize,
        world_size: usize,
        seed: u64,
    ) -> Result<Self, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::distributed("world size must be nonzero"));
        }
        if rank >= world_size {
            return Err(TrainingError::distributed(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        Ok(Self {
            len,
            rank,
            world_size,
            seed,
            epoch: 0,
        })
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }

    pub fn indices(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
        order.shuffle(&mut rng);
        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// Batched loader over a [`SignalDataset`]. Each batch is a `(batch,
/// num_leads, window_size)` tensor on the training device.
pub struct SignalDataLoader {
    dataset: Arc<SignalDataset>,
    sampler: DistributedSampler,
    batch_size: usize,
    drop_last: bool,
    device: Device,
}

impl SignalDataLoader {
    pub fn new(
        dataset: Arc<SignalDataset>,
        sampler: DistributedSampler,
        batch_size: usize,
        drop_last: bool,
        device: Device,
    ) -> Result<Self, TrainingError> {
        if batch_size == 0 {
            return Err(TrainingError::config("batch_size must be greater than zero"));
        }
        Ok(Self {
            dataset,
            sampler,
            batch_size,
            drop_last,
            device,
        })
    }

    pub fn set_epoch(&mut self, epoch: usize) {
        self.sampler.set_epoch(epoch);
    }

    pub fn batches_per_epoch(&self) -> usize {
        let local = self.sampler.indices().len();
        if self.drop_last {
            local / self.batch_size
        } else {
            local.div_ceil(self.batch_size)
        }
    }

    pub fn epoch_batches(&self) -> EpochBatches<'_> {
        EpochBatches {
            loader: self,
            order: self.sampler.indices(),
            cursor: 0,
        }
    }

    fn build_batch(&self, indices: &[usize]) -> Result<Tensor, TrainingError> {
        let leads = self.dataset.num_leads();
        let window = self.dataset.window_size();
        let mut values = Vec::with_capacity(indices.len() * leads * window);
        for &index in indices {
            values.extend_from_slice(self.dataset.window(index));
        }
        Tensor::from_vec(values, (indices.len(), leads, window), &self.device).map_err(|err| {
            TrainingError::runtime(format!("failed to materialize signal batch: {err}"))
        })
    }
}

pub struct EpochBatches<'a> {
    loader: &'a SignalDataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Tensor, TrainingError>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 {
            return None;
        }
        if remaining < self.loader.batch_size && self.loader.drop_last {
            return None;
        }
        let take = remaining.min(self.loader.batch_size);
        let indices = &self.order[self.cursor..self.cursor + take];
        self.cursor += take;
        Some(self.loader.build_batch(indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn write_shard(dir: &Path, name: &str, values: &[f32]) -> PathBuf {
        let path = dir.join(name);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(&path, bytes).unwrap();
        path
    }

    fn sequential_dataset(windows: usize, leads: usize, window_size: usize) -> Arc<SignalDataset> {
        let tmp = tempdir().unwrap();
        let values: Vec<f32> = (0..windows * leads * window_size).map(|v| v as f32).collect();
        let shard = write_shard(tmp.path(), "train.f32", &values);
        Arc::new(SignalDataset::load(&[shard], leads, window_size).unwrap())
    }

    #[test]
    fn loads_windows_from_shards() {
        let tmp = tempdir().unwrap();
        let shard = write_shard(tmp.path(), "a.f32", &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        let dataset = SignalDataset::load(&[shard], 2, 2).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.window(1), &[4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn rejects_shard_with_partial_window() {
        let tmp = tempdir().unwrap();
        let shard = write_shard(tmp.path(), "bad.f32", &[0.0, 1.0, 2.0]);
        let err = SignalDataset::load(&[shard], 2, 2).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
    }

    #[test]
    fn rejects_missing_shard() {
        let tmp = tempdir().unwrap();
        let err =
            SignalDataset::load(&[tmp.path().join("absent.f32")], 2, 2).unwrap_err();
        assert!(matches!(err, TrainingError::Config(_)));
    }

    #[test]
    fn sampler_is_deterministic_per_epoch() {
        let mut sampler = DistributedSampler::new(16, 0, 1, 7).unwrap();
        sampler.set_epoch(3);
        let first = sampler.indices();
        let second = sampler.indices();
        assert_eq!(first, second);

        sampler.set_epoch(4);
        assert_ne!(sampler.indices(), first);
    }

    #[test]
    fn ranks_partition_each_epoch() {
        let world_size = 3;
        let mut seen: Vec<usize> = Vec::new();
        for rank in 0..world_size {
            let mut sampler = DistributedSampler::new(10, rank, world_size, 42).unwrap();
            sampler.set_epoch(1);
            seen.extend(sampler.indices());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn batches_have_lead_major_shape() {
        let dataset = sequential_dataset(5, 2, 4);
        let sampler = DistributedSampler::new(dataset.len(), 0, 1, 0).unwrap();
        let loader =
            SignalDataLoader::new(dataset, sampler, 2, true, Device::Cpu).unwrap();

        let batches: Vec<Tensor> = loader
            .epoch_batches()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.dims(), &[2, 2, 4]);
        }
    }

    #[test]
    fn drop_last_discards_the_ragged_tail() {
        let dataset = sequential_dataset(5, 1, 2);
        let sampler = DistributedSampler::new(dataset.len(), 0, 1, 0).unwrap();

        let dropped =
            SignalDataLoader::new(dataset.clone(), sampler.clone(), 2, true, Device::Cpu)
                .unwrap();
        assert_eq!(dropped.batches_per_epoch(), 2);
        assert_eq!(dropped.epoch_batches().count(), 2);

        let kept = SignalDataLoader::new(dataset, sampler, 2, false, Device::Cpu).unwrap();
        assert_eq!(kept.batches_per_epoch(), 3);
        let sizes: Vec<usize> = kept
            .epoch_batches()
            .map(|batch| batch.unwrap().dims()[0])
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
