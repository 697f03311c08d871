pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod logging;
pub mod lr;
pub mod metrics;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{checkpoint_dir_name, CheckpointManifest, ENCODER_ARTIFACT};
pub use config::{CliOverrides, PretrainConfig};
pub use data::{DistributedSampler, SignalDataLoader, SignalDataset};
pub use distributed::Topology;
pub use error::TrainingError;
pub use logging::MetricSink;
pub use lr::{resolve_learning_rate, ResolvedLearningRate};
pub use metrics::{AverageMeter, EpochStats};
pub use optimizer::{AdamWConfig, LossScaler, OptimizerState, TrainerOptimizer};
pub use trainer::Trainer;
