//! Training orchestration: checkpoints, the loop controller, evaluation and
//! the session that ties them to a data source and a telemetry run.

pub mod callbacks;
pub mod checkpoint;
pub mod evaluator;
pub mod metrics;
pub mod session;
pub mod trainer;

pub use callbacks::{NoOpCallback, RecordingCallback, TrainingCallback};
pub use checkpoint::{
    Checkpoint, CheckpointStore, RestoredState, ResumeDecision, ResumePoint, TrainingSnapshot,
};
pub use evaluator::Evaluator;
pub use metrics::{EpochAccumulator, EpochSummary, RunSummary, StepLosses};
pub use session::{TrainingSession, default_run_name};
pub use trainer::{SyntheticBatch, Trainer};
