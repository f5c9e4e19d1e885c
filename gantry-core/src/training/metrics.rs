//! Loss bookkeeping for batches, epochs and whole runs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::training::checkpoint::Checkpoint;

/// Losses observed for a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    pub g_loss: f32,
    /// `(d_real + d_fake) / 2`.
    pub d_loss: f32,
    pub d_real: f32,
    pub d_fake: f32,
}

impl StepLosses {
    /// Per-batch scalars as emitted to telemetry.
    pub fn to_metrics(&self, epoch: usize, batch_index: usize) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("batch_g_loss".to_string(), self.g_loss as f64),
            ("batch_d_loss".to_string(), self.d_loss as f64),
            ("epoch".to_string(), epoch as f64),
            ("batch".to_string(), batch_index as f64),
        ])
    }
}

/// Running totals for the epoch in progress.
#[derive(Debug, Clone, Default)]
pub struct EpochAccumulator {
    g_total: f64,
    d_total: f64,
    batches: usize,
}

impl EpochAccumulator {
    pub fn record(&mut self, losses: &StepLosses) {
        self.g_total += losses.g_loss as f64;
        self.d_total += losses.d_loss as f64;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Averages over batches processed (not samples). `None` if no batch was
    /// recorded.
    pub fn finish(&self, epoch: usize, global_step: u64) -> Option<EpochSummary> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        Some(EpochSummary {
            epoch,
            batches: self.batches,
            avg_g_loss: self.g_total / n,
            avg_d_loss: self.d_total / n,
            global_step,
        })
    }
}

/// Outcome of one completed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub avg_g_loss: f64,
    pub avg_d_loss: f64,
    /// Global step after the last batch of the epoch.
    pub global_step: u64,
}

impl EpochSummary {
    pub fn to_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("epoch_avg_g_loss".to_string(), self.avg_g_loss),
            ("epoch_avg_d_loss".to_string(), self.avg_d_loss),
            ("epoch".to_string(), self.epoch as f64),
        ])
    }
}

/// What a call to the training loop accomplished.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// First epoch trained by this process (non-zero after a resume).
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub global_step: u64,
    /// Checkpoints successfully written, in order.
    pub checkpoints: Vec<Checkpoint>,
    pub last_epoch: Option<EpochSummary>,
    pub external_run_id: Option<String>,
    /// Id of the checkpoint training resumed from, if any.
    pub resumed_from: Option<String>,
}
