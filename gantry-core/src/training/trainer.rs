//! The alternating generator/discriminator training loop.
//!
//! Every batch runs two independent phases. The generator phase samples
//! noise, scores the synthetic batch with the discriminator and updates the
//! generator only. It hands the discriminator phase a [`SyntheticBatch`]
//! holding values without autograd history, so the discriminator update
//! cannot reach the generator's parameters.

use candle_core::{DType, Device, Tensor};
use std::path::Path;

use crate::config::TrainingConfig;
use crate::data::DataSource;
use crate::error::{Result, TrainingError};
use crate::nn::{
    Adam, AdamParams, DiscriminatorLoss, LatentSampler, Model, Optimizer, discriminator_loss,
    generator_loss,
};
use crate::telemetry::SinkHandle;
use crate::training::callbacks::TrainingCallback;
use crate::training::checkpoint::{CheckpointStore, ResumePoint, TrainingSnapshot};
use crate::training::evaluator::Evaluator;
use crate::training::metrics::{EpochAccumulator, EpochSummary, RunSummary, StepLosses};

/// Adam's second-moment decay.
const ADAM_BETA2: f64 = 0.999;

/// Offset applied to the run seed for the evaluation noise stream.
const EVAL_SEED_OFFSET: u64 = 0x5eed;

/// Generator output detached from the graph that produced it.
pub struct SyntheticBatch {
    values: Tensor,
}

impl SyntheticBatch {
    pub fn values(&self) -> &Tensor {
        &self.values
    }
}

/// Drives training of one generator/discriminator pair.
pub struct Trainer<G: Model, D: Model> {
    config: TrainingConfig,
    device: Device,
    generator: G,
    discriminator: D,
    opt_g: Adam,
    opt_d: Adam,
    sampler: LatentSampler,
    evaluator: Evaluator,
    start_epoch: usize,
    global_step: u64,
    external_run_id: Option<String>,
}

impl<G: Model, D: Model> Trainer<G, D> {
    pub fn new(config: TrainingConfig, device: Device, generator: G, discriminator: D) -> Self {
        let hp = AdamParams {
            lr: config.lr,
            beta1: config.beta1,
            beta2: ADAM_BETA2,
            weight_decay: config.weight_decay,
            ..AdamParams::default()
        };
        let opt_g = Adam::new(generator.parameters().to_vec(), hp);
        let opt_d = Adam::new(discriminator.parameters().to_vec(), hp);
        let sampler = LatentSampler::new(config.latent_dim, config.seed);
        let eval_sampler = LatentSampler::new(
            config.latent_dim,
            config.seed.map(|s| s.wrapping_add(EVAL_SEED_OFFSET)),
        );
        let evaluator = Evaluator::new(config.num_eval_samples, eval_sampler, device.clone());

        Self {
            config,
            device,
            generator,
            discriminator,
            opt_g,
            opt_d,
            sampler,
            evaluator,
            start_epoch: 0,
            global_step: 0,
            external_run_id: None,
        }
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn discriminator(&self) -> &D {
        &self.discriminator
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn external_run_id(&self) -> Option<&str> {
        self.external_run_id.as_deref()
    }

    /// Restore weights, optimizer moments and counters from a checkpoint.
    pub fn apply_resume(&mut self, point: &ResumePoint) -> Result<()> {
        point.restored.apply(
            &mut self.generator,
            &mut self.discriminator,
            &mut self.opt_g,
            &mut self.opt_d,
        )?;
        self.start_epoch = point.start_epoch;
        self.global_step = point.global_step;
        self.external_run_id = point.external_run_id.clone();
        Ok(())
    }

    /// Phase 1: update the generator against the current discriminator.
    pub fn generator_phase(&mut self, batch_size: usize) -> Result<(f32, SyntheticBatch)> {
        let noise = self.sampler.sample(batch_size, &self.device)?;
        let fake = self.generator.forward(&noise)?;
        let scores = self.discriminator.forward(&fake)?;
        let loss = generator_loss(&scores)?;
        let value = self.ensure_finite("g_loss", scalar(&loss)?)?;
        let grads = loss.backward()?;
        self.opt_g.step(&grads)?;
        Ok((
            value,
            SyntheticBatch {
                values: fake.detach(),
            },
        ))
    }

    /// Phase 2: update the discriminator on real and synthetic values.
    pub fn discriminator_phase(
        &mut self,
        real: &Tensor,
        fake: &SyntheticBatch,
    ) -> Result<DiscriminatorLoss> {
        let real_scores = self.discriminator.forward(real)?;
        let fake_scores = self.discriminator.forward(fake.values())?;
        let loss = discriminator_loss(&real_scores, &fake_scores)?;
        self.ensure_finite("d_loss", scalar(&loss.total)?)?;
        let grads = loss.total.backward()?;
        self.opt_d.step(&grads)?;
        Ok(loss)
    }

    /// Checked before the optimizer step so a bad loss never reaches the
    /// parameters.
    fn ensure_finite(&self, which: &'static str, value: f32) -> Result<f32> {
        if value.is_finite() {
            Ok(value)
        } else {
            Err(TrainingError::NonFiniteLoss {
                global_step: self.global_step,
                which,
                value,
            }
            .into())
        }
    }

    /// One full batch update. Advances `global_step` by exactly one.
    pub fn train_step(&mut self, real: &Tensor) -> Result<StepLosses> {
        let real = real.to_device(&self.device)?;
        let batch_size = real.dim(0)?;

        let (g_loss, fake) = self.generator_phase(batch_size)?;
        let d = self.discriminator_phase(&real, &fake)?;
        let losses = StepLosses {
            g_loss,
            d_loss: scalar(&d.total)?,
            d_real: scalar(&d.real)?,
            d_fake: scalar(&d.fake)?,
        };

        self.global_step += 1;
        Ok(losses)
    }

    /// One pass over the data source.
    pub fn train_epoch(
        &mut self,
        epoch: usize,
        data: &mut dyn DataSource,
        sink: &mut SinkHandle,
        callback: &mut dyn TrainingCallback,
    ) -> Result<EpochSummary> {
        data.begin_epoch(epoch)?;
        callback.on_epoch_start(epoch, data.len_hint());

        let mut acc = EpochAccumulator::default();
        let mut batch_index = 0;
        while let Some(real) = data.next_batch()? {
            let losses = self.train_step(&real)?;
            acc.record(&losses);

            if let Some(interval) = self.config.log_interval {
                if batch_index % interval == 0 {
                    sink.log_scalars(&losses.to_metrics(epoch, batch_index), self.global_step);
                    tracing::debug!(
                        epoch,
                        batch = batch_index,
                        global_step = self.global_step,
                        g_loss = losses.g_loss,
                        d_loss = losses.d_loss,
                        "Batch complete"
                    );
                }
            }
            callback.on_batch_end(epoch, batch_index, self.global_step, &losses);
            batch_index += 1;
        }

        let summary = acc
            .finish(epoch, self.global_step)
            .ok_or(TrainingError::EmptyEpoch { epoch })?;
        sink.log_scalars(&summary.to_metrics(), self.global_step);
        tracing::info!(
            epoch,
            epochs = self.config.epochs,
            batches = summary.batches,
            avg_g_loss = summary.avg_g_loss,
            avg_d_loss = summary.avg_d_loss,
            global_step = self.global_step,
            "Epoch complete"
        );
        callback.on_epoch_end(&summary);
        Ok(summary)
    }

    /// Whether the end of `epoch` triggers evaluation and a checkpoint.
    pub fn should_checkpoint(&self, epoch: usize) -> bool {
        epoch % self.config.checkpoint_interval == 0 || epoch + 1 == self.config.epochs
    }

    fn snapshot(&self, epoch: usize) -> TrainingSnapshot<'_> {
        TrainingSnapshot {
            epoch,
            global_step: self.global_step,
            external_run_id: self.external_run_id.as_deref(),
            config: &self.config,
            generator: &self.generator,
            discriminator: &self.discriminator,
            optimizer_g: &self.opt_g,
            optimizer_d: &self.opt_d,
        }
    }

    /// Train from `start_epoch` through the configured last epoch.
    ///
    /// A failed checkpoint write is logged and training carries on; the
    /// counters are never rolled back.
    pub fn run(
        &mut self,
        data: &mut dyn DataSource,
        store: &CheckpointStore,
        location: &Path,
        sink: &mut SinkHandle,
        callback: &mut dyn TrainingCallback,
    ) -> Result<RunSummary> {
        self.external_run_id = Some(sink.run_id().to_string());
        let mut summary = RunSummary {
            start_epoch: self.start_epoch,
            epochs_run: 0,
            global_step: self.global_step,
            checkpoints: Vec::new(),
            last_epoch: None,
            external_run_id: self.external_run_id.clone(),
            resumed_from: None,
        };

        if self.start_epoch >= self.config.epochs {
            tracing::info!(
                start_epoch = self.start_epoch,
                epochs = self.config.epochs,
                "All configured epochs already completed"
            );
            return Ok(summary);
        }

        tracing::info!(
            start_epoch = self.start_epoch,
            epochs = self.config.epochs,
            global_step = self.global_step,
            device = ?self.device,
            "Starting training"
        );

        for epoch in self.start_epoch..self.config.epochs {
            let epoch_summary = self.train_epoch(epoch, data, sink, callback)?;
            summary.epochs_run += 1;
            summary.global_step = self.global_step;
            summary.last_epoch = Some(epoch_summary);

            if self.should_checkpoint(epoch) {
                self.evaluator
                    .evaluate(&mut self.generator, self.global_step, sink)?;
                match store.save(location, &self.snapshot(epoch), sink) {
                    Ok(checkpoint) => summary.checkpoints.push(checkpoint),
                    Err(e) => tracing::error!(
                        epoch,
                        global_step = self.global_step,
                        location = %location.display(),
                        error = %e,
                        "Checkpoint save failed; continuing without this recovery point"
                    ),
                }
            }
        }

        tracing::info!(
            epochs_run = summary.epochs_run,
            global_step = self.global_step,
            checkpoints = summary.checkpoints.len(),
            "Training finished"
        );
        Ok(summary)
    }
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_YAML;
    use crate::nn::{Discriminator, Generator, parameter_digest};
    use crate::telemetry::{MemorySink, TelemetryEvent};
    use crate::training::callbacks::{NoOpCallback, RecordingCallback};
    use crate::data::InMemoryDataset;
    use tempfile::TempDir;

    fn small_config() -> TrainingConfig {
        let mut config = TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        config.batch_size = 4;
        config.latent_dim = 4;
        config.ngf = 2;
        config.ndf = 2;
        config.nc = 1;
        config.image_size = 4;
        config.num_eval_samples = 4;
        config.seed = Some(11);
        config
    }

    fn trainer(config: TrainingConfig) -> Trainer<Generator, Discriminator> {
        let generator = Generator::new(&config, &Device::Cpu).unwrap();
        let discriminator = Discriminator::new(&config, &Device::Cpu).unwrap();
        Trainer::new(config, Device::Cpu, generator, discriminator)
    }

    fn real_batches(count: usize) -> InMemoryDataset {
        let batches = (0..count)
            .map(|_| {
                Tensor::rand(-1f32, 1f32, (4, 1, 4, 4), &Device::Cpu).unwrap()
            })
            .collect();
        InMemoryDataset::new(batches)
    }

    fn run(
        trainer: &mut Trainer<Generator, Discriminator>,
        batches: usize,
    ) -> (TempDir, MemorySink, RunSummary) {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let location = store.resolve_location(trainer.config()).unwrap();
        let memory = MemorySink::new("test-run");
        let mut sink = SinkHandle::new(memory.clone());
        let mut data = real_batches(batches);
        let summary = trainer
            .run(&mut data, &store, &location, &mut sink, &mut NoOpCallback)
            .unwrap();
        (tmp, memory, summary)
    }

    #[test]
    fn test_global_step_counts_batches() {
        let mut config = small_config();
        config.epochs = 2;
        let mut trainer = trainer(config);
        let (_tmp, _memory, summary) = run(&mut trainer, 3);
        assert_eq!(trainer.global_step(), 6);
        assert_eq!(summary.global_step, 6);
        assert_eq!(summary.epochs_run, 2);
        assert_eq!(summary.external_run_id.as_deref(), Some("test-run"));
    }

    #[test]
    fn test_generator_phase_leaves_discriminator_untouched() {
        let mut trainer = trainer(small_config());
        let d_before = parameter_digest(trainer.discriminator()).unwrap();
        let g_before = parameter_digest(trainer.generator()).unwrap();

        let (_, fake) = trainer.generator_phase(4).unwrap();

        assert_eq!(parameter_digest(trainer.discriminator()).unwrap(), d_before);
        assert_ne!(parameter_digest(trainer.generator()).unwrap(), g_before);
        assert_eq!(fake.values().dims(), &[4, 1, 4, 4]);
    }

    #[test]
    fn test_discriminator_phase_leaves_generator_untouched() {
        let mut trainer = trainer(small_config());
        let (_, fake) = trainer.generator_phase(4).unwrap();
        let g_before = parameter_digest(trainer.generator()).unwrap();
        let d_before = parameter_digest(trainer.discriminator()).unwrap();

        let real = Tensor::rand(-1f32, 1f32, (4, 1, 4, 4), &Device::Cpu).unwrap();
        let loss = trainer.discriminator_phase(&real, &fake).unwrap();

        assert_eq!(parameter_digest(trainer.generator()).unwrap(), g_before);
        assert_ne!(parameter_digest(trainer.discriminator()).unwrap(), d_before);
        let total = scalar(&loss.total).unwrap();
        let parts = 0.5 * (scalar(&loss.real).unwrap() + scalar(&loss.fake).unwrap());
        assert!((total - parts).abs() < 1e-6);
    }

    fn all_finite(model: &dyn Model) -> bool {
        model.parameters().iter().all(|(_, var)| {
            var.as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
                .iter()
                .all(|v| v.is_finite())
        })
    }

    #[test]
    fn test_saturated_discriminator_keeps_parameters_finite() {
        let mut trainer = trainer(small_config());
        // A large output bias pushes every score to exactly 1.0 in f32.
        let (_, bias) = trainer
            .discriminator()
            .parameters()
            .iter()
            .find(|(name, _)| name == "fc3.bias")
            .unwrap();
        bias.set(&Tensor::full(30f32, bias.dims(), &Device::Cpu).unwrap())
            .unwrap();

        let real = Tensor::rand(-1f32, 1f32, (4, 1, 4, 4), &Device::Cpu).unwrap();
        let losses = trainer.train_step(&real).unwrap();
        assert!(losses.g_loss.is_finite() && losses.d_loss.is_finite());
        assert!(all_finite(trainer.generator()));
        assert!(all_finite(trainer.discriminator()));

        trainer.train_step(&real).unwrap();
        assert_eq!(trainer.global_step(), 2);
    }

    #[test]
    fn test_partial_batch_uses_its_own_size() {
        let mut trainer = trainer(small_config());
        let real = Tensor::rand(-1f32, 1f32, (3, 1, 4, 4), &Device::Cpu).unwrap();
        trainer.train_step(&real).unwrap();
        assert_eq!(trainer.global_step(), 1);
    }

    #[test]
    fn test_log_interval_emission() {
        let mut config = small_config();
        config.epochs = 1;
        config.log_interval = Some(2);
        let mut trainer = trainer(config);
        let (_tmp, memory, _) = run(&mut trainer, 5);

        let scalars = memory.scalars();
        let batch_steps: Vec<_> = scalars
            .iter()
            .filter(|(_, m)| m.contains_key("batch_g_loss"))
            .map(|(step, m)| (*step, m["batch"] as usize))
            .collect();
        assert_eq!(batch_steps, vec![(1, 0), (3, 2), (5, 4)]);

        let epoch_steps: Vec<_> = scalars
            .iter()
            .filter(|(_, m)| m.contains_key("epoch_avg_g_loss"))
            .map(|(step, _)| *step)
            .collect();
        assert_eq!(epoch_steps, vec![5]);
    }

    #[test]
    fn test_disabled_log_interval_emits_epoch_metrics_only() {
        let mut config = small_config();
        config.epochs = 1;
        let mut trainer = trainer(config);
        let (_tmp, memory, _) = run(&mut trainer, 3);
        let scalars = memory.scalars();
        assert_eq!(scalars.len(), 1);
        assert!(scalars[0].1.contains_key("epoch_avg_d_loss"));
    }

    #[test]
    fn test_checkpoint_schedule_includes_final_epoch() {
        let mut config = small_config();
        config.epochs = 5;
        config.checkpoint_interval = 3;
        let mut trainer = trainer(config);
        let (_tmp, memory, summary) = run(&mut trainer, 1);

        let epochs: Vec<_> = summary.checkpoints.iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![0, 3, 4]);

        let images = memory
            .events()
            .into_iter()
            .filter(|e| matches!(e, TelemetryEvent::Image { .. }))
            .count();
        assert_eq!(images, 3);
    }

    #[test]
    fn test_empty_epoch_is_an_error() {
        let mut trainer = trainer(small_config());
        let mut sink = SinkHandle::new(MemorySink::new("empty"));
        let mut data = InMemoryDataset::new(Vec::new());
        let err = trainer
            .train_epoch(0, &mut data, &mut sink, &mut NoOpCallback)
            .unwrap_err();
        assert!(err.to_string().contains("Epoch 0 produced no batches"));
    }

    #[test]
    fn test_failed_save_keeps_training() {
        let mut config = small_config();
        config.epochs = 2;
        let mut trainer = trainer(config);

        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        // A regular file where the checkpoint folder should be.
        let location = tmp.path().join("not-a-dir");
        std::fs::write(&location, "occupied").unwrap();

        let mut sink = SinkHandle::new(MemorySink::new("io"));
        let mut data = real_batches(2);
        let summary = trainer
            .run(&mut data, &store, &location, &mut sink, &mut NoOpCallback)
            .unwrap();
        assert!(summary.checkpoints.is_empty());
        assert_eq!(summary.global_step, 4);
        assert_eq!(summary.epochs_run, 2);
    }

    #[test]
    fn test_callback_sees_advanced_step() {
        let mut config = small_config();
        config.epochs = 1;
        let mut trainer = trainer(config);
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let location = store.resolve_location(trainer.config()).unwrap();
        let mut sink = SinkHandle::new(MemorySink::new("cb"));
        let mut data = real_batches(2);
        let mut callback = RecordingCallback::default();
        trainer
            .run(&mut data, &store, &location, &mut sink, &mut callback)
            .unwrap();
        assert_eq!(callback.epochs_started, vec![0]);
        assert_eq!(callback.batches, vec![(0, 0, 1), (0, 1, 2)]);
        assert_eq!(callback.epochs.len(), 1);
    }
}
