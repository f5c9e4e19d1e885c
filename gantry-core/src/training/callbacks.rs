//! Training callbacks: progress hooks invoked by the loop controller.

use crate::training::metrics::{EpochSummary, StepLosses};

/// Observer of training progress. Callbacks cannot alter the loop.
pub trait TrainingCallback: Send {
    /// Called before the first batch of an epoch. `batches` is the expected
    /// batch count when the data source knows it.
    fn on_epoch_start(&mut self, _epoch: usize, _batches: Option<usize>) {}

    /// Called after every batch, once `global_step` has been advanced.
    fn on_batch_end(
        &mut self,
        _epoch: usize,
        _batch_index: usize,
        _global_step: u64,
        _losses: &StepLosses,
    ) {
    }

    fn on_epoch_end(&mut self, _summary: &EpochSummary) {}
}

/// Callback that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpCallback;

impl TrainingCallback for NoOpCallback {}

/// Records every invocation; handy in tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingCallback {
    pub epochs_started: Vec<usize>,
    /// `(epoch, batch_index, global_step)` per batch.
    pub batches: Vec<(usize, usize, u64)>,
    pub epochs: Vec<EpochSummary>,
}

impl TrainingCallback for RecordingCallback {
    fn on_epoch_start(&mut self, epoch: usize, _batches: Option<usize>) {
        self.epochs_started.push(epoch);
    }

    fn on_batch_end(&mut self, epoch: usize, batch_index: usize, global_step: u64, _losses: &StepLosses) {
        self.batches.push((epoch, batch_index, global_step));
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        self.epochs.push(summary.clone());
    }
}
