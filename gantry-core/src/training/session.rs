//! End-to-end orchestration of one training process.
//!
//! [`TrainingSession::prepare`] performs every fatal check (config validity,
//! device availability, checkpoint location) before any model exists.
//! [`TrainingSession::run`] then makes the resume decision, opens the
//! telemetry run and drives the trainer, closing the run on every exit path.

use candle_core::Device;
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::config::TrainingConfig;
use crate::data::DataSource;
use crate::device::select_device;
use crate::error::{Result, TelemetryError};
use crate::fingerprint::RunFingerprint;
use crate::nn::{Discriminator, Generator};
use crate::telemetry::{LocalRunSink, RunSettings, SinkHandle};
use crate::training::callbacks::TrainingCallback;
use crate::training::checkpoint::{CheckpointStore, ResumeDecision};
use crate::training::metrics::RunSummary;
use crate::training::trainer::Trainer;

/// Run name used when the config does not set one.
pub fn default_run_name(config: &TrainingConfig) -> String {
    format!(
        "DCGAN_CelebA_lr{}_bs{}_{}",
        config.lr,
        config.batch_size,
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

/// A validated configuration bound to a device and a checkpoint location.
#[derive(Debug)]
pub struct TrainingSession {
    config: TrainingConfig,
    device: Device,
    store: CheckpointStore,
    location: PathBuf,
}

impl TrainingSession {
    /// Fail fast on anything that would stop training later.
    pub fn prepare(config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.use_cuda)?;
        let store = CheckpointStore::from_config(&config);
        let location = store.resolve_location(&config)?;
        tracing::info!(
            fingerprint = %RunFingerprint::of(&config),
            location = %location.display(),
            device = ?device,
            "Training session prepared"
        );
        Ok(Self {
            config,
            device,
            store,
            location,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Checkpoint folder for this run's fingerprint.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Train with the filesystem telemetry sink under `telemetry_dir`.
    pub fn run(
        &self,
        data: &mut dyn DataSource,
        callback: &mut dyn TrainingCallback,
    ) -> Result<RunSummary> {
        let root = self.config.telemetry_dir.clone();
        self.run_with_sink(data, callback, |settings| {
            Ok(SinkHandle::new(LocalRunSink::init(&root, settings)?))
        })
    }

    /// Train with a caller-provided sink.
    pub fn run_with_sink<F>(
        &self,
        data: &mut dyn DataSource,
        callback: &mut dyn TrainingCallback,
        open_sink: F,
    ) -> Result<RunSummary>
    where
        F: FnOnce(RunSettings) -> std::result::Result<SinkHandle, TelemetryError>,
    {
        let generator = Generator::new(&self.config, &self.device)?;
        let discriminator = Discriminator::new(&self.config, &self.device)?;
        let mut trainer = Trainer::new(
            self.config.clone(),
            self.device.clone(),
            generator,
            discriminator,
        );

        let decision = if self.config.resume_training {
            self.store
                .resume(&self.location, &self.config, &self.device)?
        } else {
            tracing::info!("Resume disabled; starting fresh");
            ResumeDecision::NotFound
        };
        let resumed_from = match &decision {
            ResumeDecision::Accepted(point) => {
                trainer.apply_resume(point)?;
                Some(point.checkpoint.id.clone())
            }
            ResumeDecision::Rejected {
                checkpoint,
                differences,
            } => {
                tracing::warn!(
                    checkpoint = %checkpoint.id,
                    differing_keys = differences.len(),
                    "Not resuming: configuration changed since the checkpoint was written"
                );
                None
            }
            ResumeDecision::NotFound => None,
        };

        let settings = RunSettings {
            project: self.config.wandb_project.clone(),
            name: self
                .config
                .run_name
                .clone()
                .unwrap_or_else(|| default_run_name(&self.config)),
            tags: self.config.tags.clone(),
            config: serde_json::to_value(&self.config)?,
            resume_id: decision.external_run_id().map(str::to_string),
        };
        let mut sink = open_sink(settings)?;

        let result = trainer.run(data, &self.store, &self.location, &mut sink, callback);
        if let Err(e) = sink.close() {
            tracing::warn!(error = %e, "Failed to finish telemetry run");
        }

        let mut summary = result?;
        summary.resumed_from = resumed_from;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_YAML;
    use crate::data::InMemoryDataset;
    use crate::telemetry::MemorySink;
    use crate::training::callbacks::NoOpCallback;
    use candle_core::Tensor;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> TrainingConfig {
        let mut config = TrainingConfig::from_yaml_str(SAMPLE_YAML).unwrap();
        config.batch_size = 2;
        config.latent_dim = 3;
        config.ngf = 2;
        config.ndf = 2;
        config.nc = 1;
        config.image_size = 2;
        config.num_eval_samples = 2;
        config.seed = Some(5);
        config.checkpoint_dir = tmp.path().join("checkpoints");
        config.telemetry_dir = tmp.path().join("runs");
        config
    }

    fn data(batches: usize) -> InMemoryDataset {
        InMemoryDataset::new(
            (0..batches)
                .map(|_| Tensor::rand(-1f32, 1f32, (2, 1, 2, 2), &Device::Cpu).unwrap())
                .collect(),
        )
    }

    #[test]
    fn test_default_run_name() {
        let tmp = TempDir::new().unwrap();
        let name = default_run_name(&config(&tmp));
        assert!(name.starts_with("DCGAN_CelebA_lr0.0002_bs2_"));
    }

    #[test]
    fn test_prepare_rejects_unavailable_accelerator() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.use_cuda = true;
        if candle_core::utils::cuda_is_available() {
            return;
        }
        assert!(TrainingSession::prepare(config).is_err());
        assert!(!tmp.path().join("checkpoints").exists());
    }

    #[test]
    fn test_sink_closed_after_failure() {
        let tmp = TempDir::new().unwrap();
        let session = TrainingSession::prepare(config(&tmp)).unwrap();
        let memory = MemorySink::new("closing");
        let sink = memory.clone();
        let mut empty = InMemoryDataset::new(Vec::new());

        let result = session.run_with_sink(&mut empty, &mut NoOpCallback, move |_| {
            Ok(SinkHandle::new(sink))
        });
        assert!(result.is_err());
        assert_eq!(memory.finish_count(), 1);
    }

    #[test]
    fn test_resume_reuses_run_id_and_step() {
        let tmp = TempDir::new().unwrap();
        let mut first = config(&tmp);
        first.epochs = 1;
        let session = TrainingSession::prepare(first.clone()).unwrap();
        let summary = session.run(&mut data(3), &mut NoOpCallback).unwrap();
        assert_eq!(summary.global_step, 3);
        let run_id = summary.external_run_id.clone().unwrap();

        // Same hyperparameters, same epochs: resumes and has nothing left.
        let session = TrainingSession::prepare(first).unwrap();
        let again = session.run(&mut data(3), &mut NoOpCallback).unwrap();
        assert_eq!(again.start_epoch, 1);
        assert_eq!(again.epochs_run, 0);
        assert_eq!(again.global_step, 3);
        assert_eq!(again.external_run_id.as_deref(), Some(run_id.as_str()));
        assert!(again.resumed_from.is_some());
    }

    #[test]
    fn test_resume_disabled_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(&tmp);
        config.epochs = 1;
        TrainingSession::prepare(config.clone())
            .unwrap()
            .run(&mut data(2), &mut NoOpCallback)
            .unwrap();

        config.resume_training = false;
        let session = TrainingSession::prepare(config).unwrap();
        let summary = session.run(&mut data(2), &mut NoOpCallback).unwrap();
        assert_eq!(summary.start_epoch, 0);
        assert_eq!(summary.global_step, 2);
        assert!(summary.resumed_from.is_none());
    }
}
