//! Terminal progress reporting for the training loop.

use gantry_core::training::{EpochSummary, StepLosses, TrainingCallback};
use indicatif::{ProgressBar, ProgressStyle};

const TEMPLATE: &str =
    "{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// Per-epoch progress bar with live generator/discriminator losses.
pub struct ProgressCallback {
    epochs: usize,
    hidden: bool,
    bar: Option<ProgressBar>,
}

impl ProgressCallback {
    pub fn new(epochs: usize, hidden: bool) -> Self {
        Self {
            epochs,
            hidden,
            bar: None,
        }
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

impl TrainingCallback for ProgressCallback {
    fn on_epoch_start(&mut self, epoch: usize, batches: Option<usize>) {
        self.finish();
        let bar = if self.hidden {
            ProgressBar::hidden()
        } else {
            match batches {
                Some(n) => ProgressBar::new(n as u64),
                None => ProgressBar::new_spinner(),
            }
        };
        bar.set_style(
            ProgressStyle::default_bar()
                .template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        bar.set_prefix(format!("Epoch {}/{}", epoch + 1, self.epochs));
        self.bar = Some(bar);
    }

    fn on_batch_end(&mut self, _epoch: usize, _batch_index: usize, _global_step: u64, losses: &StepLosses) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
            bar.set_message(format!("g_loss={:.4} d_loss={:.4}", losses.g_loss, losses.d_loss));
        }
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!(
                "avg g_loss={:.4} avg d_loss={:.4}",
                summary.avg_g_loss, summary.avg_d_loss
            ));
        }
    }
}
