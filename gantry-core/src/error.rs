//! Error types for the Gantry training core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, checkpoints, telemetry, data loading and the
//! training loop itself.

use std::path::PathBuf;

/// Top-level error type for the Gantry core library.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Fatal configuration problems. All of these surface before any training
/// state is created or mutated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to load configuration: {message}")]
    Load { message: String },

    #[error("Accelerated hardware requested (use_cuda = true) but no CUDA device is available")]
    AcceleratorUnavailable,
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        if let figment::error::Kind::MissingField(field) = &err.kind {
            return ConfigError::MissingField {
                field: field.to_string(),
            };
        }
        ConfigError::Load {
            message: err.to_string(),
        }
    }
}

/// Errors from persisting or restoring checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("Checkpoint '{id}' is unreadable: {message}")]
    Unreadable { id: String, message: String },

    #[error("Checkpoint '{id}' is missing tensor '{name}'")]
    MissingTensor { id: String, name: String },

    #[error("Tensor '{name}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Failed to write checkpoint for epoch {epoch}: {message}")]
    WriteFailed { epoch: usize, message: String },
}

/// Errors raised by the training loop controller.
#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error("Epoch {epoch} produced no batches")]
    EmptyEpoch { epoch: usize },

    #[error("Loss is not finite at global step {global_step}: {which} = {value}")]
    NonFiniteLoss {
        global_step: u64,
        which: &'static str,
        value: f32,
    },

    #[error("Unexpected tensor shape: {message}")]
    InvalidShape { message: String },

    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Errors from the telemetry sink.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to write telemetry: {message}")]
    Write { message: String },

    #[error("Failed to encode image: {message}")]
    Image { message: String },
}

/// Errors from data sources.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Data root not found: {path}")]
    RootNotFound { path: PathBuf },

    #[error("No images found under {path}")]
    Empty { path: PathBuf },

    #[error("Failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Prefetch worker stopped: {message}")]
    WorkerStopped { message: String },
}

impl From<std::io::Error> for TelemetryError {
    fn from(err: std::io::Error) -> Self {
        TelemetryError::Write {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TelemetryError {
    fn from(err: serde_json::Error) -> Self {
        TelemetryError::Write {
            message: err.to_string(),
        }
    }
}

/// A type alias for results using the top-level `GantryError`.
pub type Result<T> = std::result::Result<T, GantryError>;
