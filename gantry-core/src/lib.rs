//! # gantry-core: resumable adversarial training
//!
//! This crate trains a generator/discriminator pair in alternating steps and
//! makes every run resumable: checkpoints are namespaced by a hyperparameter
//! fingerprint, indexed by a manifest, published atomically, and only
//! accepted when the stored configuration matches the running one.

// Foundation
pub mod config;
pub mod device;
pub mod error;
pub mod fingerprint;
pub mod persistence;

// Collaborators
pub mod data;
pub mod grid;
pub mod nn;
pub mod telemetry;

// Orchestration
pub mod training;

pub use config::{ConfigDifference, TrainingConfig, load_config};
pub use data::{DataSource, ImageFolderDataset, InMemoryDataset};
pub use device::select_device;
pub use error::{
    CheckpointError, ConfigError, DataError, GantryError, Result, TelemetryError, TrainingError,
};
pub use fingerprint::RunFingerprint;
pub use grid::ImageGrid;
pub use telemetry::{
    ArtifactRecord, LocalRunSink, MemorySink, RunSettings, SinkHandle, TelemetryEvent,
    TelemetrySink,
};
pub use training::{
    Checkpoint, CheckpointStore, EpochSummary, ResumeDecision, ResumePoint, RunSummary,
    StepLosses, Trainer, TrainingCallback, TrainingSession,
};
