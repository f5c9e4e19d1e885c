//! Qualitative evaluation: a grid of generator samples sent to telemetry.

use candle_core::Device;

use crate::error::Result;
use crate::grid::{GRID_PADDING, ImageGrid};
use crate::nn::{LatentSampler, Mode, Model};
use crate::telemetry::SinkHandle;

/// Images per grid row.
pub const GRID_NROW: usize = 4;

pub const EVAL_IMAGE_NAME: &str = "generated_images";
pub const EVAL_IMAGE_CAPTION: &str = "Generated Images";

/// Draws samples from a generator in inference mode.
pub struct Evaluator {
    sample_count: usize,
    nrow: usize,
    sampler: LatentSampler,
    device: Device,
}

impl Evaluator {
    pub fn new(sample_count: usize, sampler: LatentSampler, device: Device) -> Self {
        Self {
            sample_count,
            nrow: GRID_NROW,
            sampler,
            device,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Sample `sample_count` images, log them as a grid keyed by `step`, and
    /// leave the generator in training mode.
    pub fn evaluate(
        &mut self,
        generator: &mut dyn Model,
        step: u64,
        sink: &mut SinkHandle,
    ) -> Result<ImageGrid> {
        generator.set_mode(Mode::Eval);
        let grid = self.render(&*generator);
        generator.set_mode(Mode::Train);

        let grid = grid?;
        sink.log_image(EVAL_IMAGE_NAME, &grid, EVAL_IMAGE_CAPTION, step);
        tracing::debug!(step, samples = self.sample_count, "Logged evaluation grid");
        Ok(grid)
    }

    fn render(&mut self, generator: &dyn Model) -> Result<ImageGrid> {
        let noise = self.sampler.sample(self.sample_count, &self.device)?;
        let samples = generator.forward(&noise)?.detach();
        ImageGrid::from_batch(&samples, self.nrow, GRID_PADDING)
    }
}
