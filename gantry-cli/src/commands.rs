//! CLI subcommand handlers.

use anyhow::Context;
use gantry_core::{
    CheckpointStore, ImageFolderDataset, RunFingerprint, TrainingConfig, TrainingSession,
    load_config, select_device,
};
use std::path::Path;

use crate::progress::ProgressCallback;

fn load(path: &Path) -> anyhow::Result<TrainingConfig> {
    load_config(path).with_context(|| format!("Configuration error in {}", path.display()))
}

/// `gantry train`: fail fast on config and device, then train or resume.
pub fn train(config_path: &Path, no_resume: bool, verbose: u8, quiet: bool) -> anyhow::Result<()> {
    let mut config = load(config_path)?;
    if no_resume {
        config.resume_training = false;
    }
    select_device(config.use_cuda)?;

    let location = CheckpointStore::from_config(&config).resolve_location(&config)?;
    let _guard = crate::init_tracing(verbose, quiet, Some(&location));
    tracing::info!(config = %config_path.display(), "Loaded configuration");

    let session = TrainingSession::prepare(config)?;
    let mut data = ImageFolderDataset::open(session.config(), session.device())?;
    let mut progress = ProgressCallback::new(session.config().epochs, quiet);

    let summary = session.run(&mut data, &mut progress)?;
    progress.finish();

    println!(
        "Trained epochs {}..{} (global step {}), {} checkpoint(s) in {}",
        summary.start_epoch,
        summary.start_epoch + summary.epochs_run,
        summary.global_step,
        summary.checkpoints.len(),
        session.location().display()
    );
    if let Some(id) = &summary.resumed_from {
        println!("Resumed from {id}");
    }
    Ok(())
}

/// `gantry checkpoints`: list the run folder's checkpoints, newest marked.
pub fn checkpoints(config_path: &Path) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let store = CheckpointStore::from_config(&config);
    let location = store
        .base_dir()
        .join(RunFingerprint::of(&config).folder_name());
    if !location.is_dir() {
        println!("No checkpoints at {}", location.display());
        return Ok(());
    }

    let checkpoints = store.list(&location)?;
    if checkpoints.is_empty() {
        println!("No checkpoints at {}", location.display());
        return Ok(());
    }

    println!("Checkpoints in {}:", location.display());
    let last = checkpoints.len() - 1;
    for (i, checkpoint) in checkpoints.iter().enumerate() {
        let marker = if i == last { "*" } else { " " };
        println!(
            "{marker} {:<48} epoch {:>4}  step {:>8}  {}",
            checkpoint.id,
            checkpoint.epoch,
            checkpoint.global_step,
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// `gantry fingerprint`: print the digest and folder a config maps to.
pub fn fingerprint(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load(config_path)?;
    let fingerprint = RunFingerprint::of(&config);
    let location = config.checkpoint_dir.join(fingerprint.folder_name());
    if json {
        let value = serde_json::json!({
            "digest": fingerprint.digest(),
            "folder": fingerprint.folder_name(),
            "location": location,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Fingerprint: {fingerprint}");
        println!("Location:    {}", location.display());
    }
    Ok(())
}
