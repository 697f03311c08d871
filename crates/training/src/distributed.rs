use candle_core::Device;

use crate::{config::PretrainConfig, TrainingError};

/// Process identity within the distributed run, resolved once at startup.
/// Exactly one process (rank 0) performs checkpoint and log side effects;
/// every rank executes identical compute work.
#[derive(Debug, Clone)]
pub struct Topology {
    pub rank: usize,
    pub world_size: usize,
    pub device: Device,
}

impl Topology {
    /// Resolves this process's place in the run. When `ddp.distributed` is
    /// set, rank and world size come from the launcher environment and any
    /// missing or malformed value is fatal: silently falling back to a
    /// single process would change the effective batch size and gradient
    /// averaging without warning.
    pub fn initialize(config: &PretrainConfig) -> Result<Self, TrainingError> {
        if config.ddp.distributed {
            let rank = env_index("RANK")?;
            let world_size = env_index("WORLD_SIZE")?;
            if world_size == 0 {
                return Err(TrainingError::distributed("WORLD_SIZE must be at least 1"));
            }
            if rank >= world_size {
                return Err(TrainingError::distributed(format!(
                    "RANK {rank} is outside WORLD_SIZE {world_size}"
                )));
            }
            let ordinal = match std::env::var("LOCAL_RANK") {
                Ok(raw) => raw.parse::<usize>().map_err(|_| {
                    TrainingError::distributed(format!("LOCAL_RANK is not an integer: {raw}"))
                })?,
                Err(_) => config.ddp.gpu,
            };
            let device = select_device(&config.device, ordinal)?;
            Ok(Self {
                rank,
                world_size,
                device,
            })
        } else {
            let device = select_device(&config.device, config.ddp.gpu)?;
            Ok(Self {
                rank: 0,
                world_size: 1,
                device,
            })
        }
    }

    pub fn is_main(&self) -> bool {
        self.rank == 0
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

fn env_index(name: &str) -> Result<usize, TrainingError> {
    let raw = std::env::var(name).map_err(|_| {
        TrainingError::distributed(format!(
            "{name} is not set; launch distributed runs through a launcher that exports it"
        ))
    })?;
    raw.parse::<usize>()
        .map_err(|_| TrainingError::distributed(format!("{name} is not an integer: {raw}")))
}

fn select_device(name: &str, ordinal: usize) -> Result<Device, TrainingError> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal).map_err(|err| {
            TrainingError::config(format!("failed to bind cuda device {ordinal}: {err}"))
        }),
        "metal" => Device::new_metal(ordinal).map_err(|err| {
            TrainingError::config(format!("failed to bind metal device {ordinal}: {err}"))
        }),
        other => Err(TrainingError::config(format!(
            "unsupported device '{other}' (expected cpu, cuda or metal)"
        ))),
    }
}
