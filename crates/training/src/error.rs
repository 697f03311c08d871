use thiserror::Error;

/// Failure taxonomy for the pretraining driver. `Config`, `Resume` and
/// `Distributed` are fatal before or during startup; `Runtime` covers
/// per-epoch compute failures, which abort the run rather than skip the
/// epoch.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("resume failed: {0}")]
    Resume(String),
    #[error("distributed initialization failed: {0}")]
    Distributed(String),
    #[error("training failed: {0}")]
    Runtime(String),
}

impl TrainingError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn resume(message: impl Into<String>) -> Self {
        Self::Resume(message.into())
    }

    pub fn distributed(message: impl Into<String>) -> Self {
        Self::Distributed(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<model::ModelError> for TrainingError {
    fn from(value: model::ModelError) -> Self {
        match value {
            model::ModelError::UnsupportedModel(name) => {
                TrainingError::Config(format!("unsupported model name: {name}"))
            }
            model::ModelError::Candle(err) => TrainingError::Runtime(err.to_string()),
        }
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
