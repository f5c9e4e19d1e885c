//! Checkpoint persistence and the resume decision.
//!
//! Checkpoints for one experiment live under a location derived from its
//! [`RunFingerprint`]:
//!
//! ```text
//! <base>/<fingerprint folder>/
//!     checkpoints.json                      manifest, ordered index
//!     config.yaml                           config of the latest save
//!     ckpt_epoch_000003_20250101_120000_000/
//!         state.json
//!         generator.safetensors
//!         discriminator.safetensors
//!         optimizer_g.safetensors
//!         optimizer_d.safetensors
//! ```
//!
//! A checkpoint directory is assembled under a hidden staging name and only
//! renamed into place once every file is written, so an interrupted save is
//! never listed.

use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::config::{ConfigDifference, TrainingConfig};
use crate::error::{CheckpointError, Result};
use crate::fingerprint::RunFingerprint;
use crate::nn::{Model, Optimizer};
use crate::persistence;
use crate::telemetry::{ArtifactRecord, SinkHandle};

const MANIFEST_FILE: &str = "checkpoints.json";
const CONFIG_FILE: &str = "config.yaml";
const STATE_FILE: &str = "state.json";
const GENERATOR_FILE: &str = "generator.safetensors";
const DISCRIMINATOR_FILE: &str = "discriminator.safetensors";
const OPTIMIZER_G_FILE: &str = "optimizer_g.safetensors";
const OPTIMIZER_D_FILE: &str = "optimizer_d.safetensors";

const ID_PREFIX: &str = "ckpt_epoch_";
const STAGING_PREFIX: &str = ".staging-";
const FORMAT_VERSION: u32 = 1;

/// A persisted, immutable training snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    /// Directory name, e.g. `ckpt_epoch_000003_20250101_120000_000`.
    pub id: String,
    /// Last fully completed epoch.
    pub epoch: usize,
    pub global_step: u64,
    /// Creation order within the location; breaks ties between equal epochs.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    id: String,
    epoch: usize,
    global_step: u64,
    sequence: u64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredState {
    format_version: u32,
    epoch: usize,
    global_step: u64,
    external_run_id: Option<String>,
    config: BTreeMap<String, serde_json::Value>,
    created_at: DateTime<Utc>,
}

/// Borrowed view of everything that goes into a checkpoint.
pub struct TrainingSnapshot<'a> {
    pub epoch: usize,
    pub global_step: u64,
    pub external_run_id: Option<&'a str>,
    pub config: &'a TrainingConfig,
    pub generator: &'a dyn Model,
    pub discriminator: &'a dyn Model,
    pub optimizer_g: &'a dyn Optimizer,
    pub optimizer_d: &'a dyn Optimizer,
}

/// Model and optimizer tensors read back from a checkpoint.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub generator: HashMap<String, Tensor>,
    pub discriminator: HashMap<String, Tensor>,
    pub optimizer_g: HashMap<String, Tensor>,
    pub optimizer_d: HashMap<String, Tensor>,
}

impl RestoredState {
    /// Overwrite live models and optimizers with the restored tensors.
    pub fn apply(
        &self,
        generator: &mut dyn Model,
        discriminator: &mut dyn Model,
        optimizer_g: &mut dyn Optimizer,
        optimizer_d: &mut dyn Optimizer,
    ) -> Result<()> {
        generator.load_state(&self.generator)?;
        discriminator.load_state(&self.discriminator)?;
        optimizer_g.load_state(&self.optimizer_g)?;
        optimizer_d.load_state(&self.optimizer_d)?;
        Ok(())
    }
}

/// Where training picks up after an accepted checkpoint.
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub checkpoint: Checkpoint,
    /// `checkpoint.epoch + 1`.
    pub start_epoch: usize,
    pub global_step: u64,
    pub external_run_id: Option<String>,
    pub restored: RestoredState,
}

/// Result of consulting the store at startup.
#[derive(Debug, Clone)]
pub enum ResumeDecision {
    Accepted(ResumePoint),
    /// The stored config differs from the running one; start fresh.
    Rejected {
        checkpoint: Checkpoint,
        differences: Vec<ConfigDifference>,
    },
    /// Nothing usable to resume from; start fresh.
    NotFound,
}

impl ResumeDecision {
    pub fn start_epoch(&self) -> usize {
        match self {
            ResumeDecision::Accepted(point) => point.start_epoch,
            _ => 0,
        }
    }

    pub fn global_step(&self) -> u64 {
        match self {
            ResumeDecision::Accepted(point) => point.global_step,
            _ => 0,
        }
    }

    pub fn external_run_id(&self) -> Option<&str> {
        match self {
            ResumeDecision::Accepted(point) => point.external_run_id.as_deref(),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ResumeDecision::Accepted(_))
    }
}

/// Reads and writes checkpoints under a base directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    base_dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Store rooted at `config.checkpoint_dir`.
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.checkpoint_dir.clone())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Checkpoint folder for this experiment, created if absent.
    pub fn resolve_location(&self, config: &TrainingConfig) -> Result<PathBuf> {
        let fingerprint = RunFingerprint::of(config);
        let location = self.base_dir.join(fingerprint.folder_name());
        std::fs::create_dir_all(&location)?;
        tracing::debug!(
            location = %location.display(),
            fingerprint = %fingerprint,
            "Resolved checkpoint location"
        );
        Ok(location)
    }

    /// All valid checkpoints at `location`, oldest first by `(epoch, sequence)`.
    pub fn list(&self, location: &Path) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = match read_manifest(location) {
            Some(entries) => entries,
            None => scan_directory(location)?,
        };
        checkpoints.sort_by(|a, b| (a.epoch, a.sequence).cmp(&(b.epoch, b.sequence)));
        Ok(checkpoints)
    }

    /// Checkpoint with the highest epoch, ties going to the most recent save.
    pub fn latest(&self, location: &Path) -> Result<Option<Checkpoint>> {
        Ok(self.list(location)?.pop())
    }

    /// Read a checkpoint and decide whether the running config may resume it.
    ///
    /// A config mismatch is a policy outcome ([`ResumeDecision::Rejected`]),
    /// not an error. Errors are reserved for unreadable checkpoint files.
    pub fn load(
        &self,
        checkpoint: &Checkpoint,
        current: &TrainingConfig,
        device: &Device,
    ) -> Result<ResumeDecision> {
        let state = read_state(checkpoint)?;

        let differences = current.diff_against(&state.config);
        if !differences.is_empty() {
            for difference in &differences {
                tracing::warn!(
                    checkpoint = %checkpoint.id,
                    key = %difference.key,
                    stored = ?difference.checkpoint,
                    current = ?difference.current,
                    "Config mismatch: {difference}"
                );
            }
            tracing::warn!(
                checkpoint = %checkpoint.id,
                keys = ?differences.iter().map(|d| d.key.as_str()).collect::<Vec<_>>(),
                "Checkpoint config differs from current config; starting fresh"
            );
            return Ok(ResumeDecision::Rejected {
                checkpoint: checkpoint.clone(),
                differences,
            });
        }

        let restored = RestoredState {
            generator: read_tensors(checkpoint, GENERATOR_FILE, device)?,
            discriminator: read_tensors(checkpoint, DISCRIMINATOR_FILE, device)?,
            optimizer_g: read_tensors(checkpoint, OPTIMIZER_G_FILE, device)?,
            optimizer_d: read_tensors(checkpoint, OPTIMIZER_D_FILE, device)?,
        };

        tracing::info!(
            checkpoint = %checkpoint.id,
            epoch = state.epoch,
            global_step = state.global_step,
            "Resuming from checkpoint"
        );
        Ok(ResumeDecision::Accepted(ResumePoint {
            checkpoint: checkpoint.clone(),
            start_epoch: state.epoch + 1,
            global_step: state.global_step,
            external_run_id: state.external_run_id,
            restored,
        }))
    }

    /// Load the newest readable checkpoint, falling back to older ones when
    /// files are damaged.
    pub fn resume(
        &self,
        location: &Path,
        current: &TrainingConfig,
        device: &Device,
    ) -> Result<ResumeDecision> {
        let checkpoints = self.list(location)?;
        if checkpoints.is_empty() {
            tracing::info!(location = %location.display(), "No checkpoint found; starting fresh");
            return Ok(ResumeDecision::NotFound);
        }
        for checkpoint in checkpoints.iter().rev() {
            match self.load(checkpoint, current, device) {
                Ok(decision) => return Ok(decision),
                Err(e) => tracing::warn!(
                    checkpoint = %checkpoint.id,
                    path = %checkpoint.path.display(),
                    error = %e,
                    "Skipping unreadable checkpoint"
                ),
            }
        }
        tracing::warn!(location = %location.display(), "No readable checkpoint; starting fresh");
        Ok(ResumeDecision::NotFound)
    }

    /// Persist a snapshot and register it with the telemetry sink.
    pub fn save(
        &self,
        location: &Path,
        snapshot: &TrainingSnapshot<'_>,
        sink: &mut SinkHandle,
    ) -> Result<Checkpoint> {
        let epoch = snapshot.epoch;
        let write_failed = |message: String| CheckpointError::WriteFailed { epoch, message };

        std::fs::create_dir_all(location).map_err(|e| write_failed(e.to_string()))?;
        let created_at = Utc::now();
        let timestamp = created_at.format("%Y%m%d_%H%M%S_%3f").to_string();
        let id = unique_id(location, &format!("{ID_PREFIX}{epoch:06}_{timestamp}"));

        let staging = location.join(format!(
            "{STAGING_PREFIX}{}",
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = write_staging(&staging, snapshot, created_at) {
            if let Err(cleanup) = std::fs::remove_dir_all(&staging) {
                tracing::warn!(path = %staging.display(), error = %cleanup, "Failed to remove staging directory");
            }
            return Err(write_failed(e.to_string()).into());
        }

        let path = location.join(&id);
        if let Err(e) = persistence::publish_dir(&staging, &path) {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(write_failed(e.to_string()).into());
        }

        // Human-readable copy; a failure here leaves the checkpoint intact.
        if let Err(e) = persistence::atomic_write_yaml(&location.join(CONFIG_FILE), snapshot.config) {
            tracing::warn!(location = %location.display(), error = %e, "Failed to write config.yaml");
        }

        let mut entries = match read_manifest_entries(location) {
            Some(entries) => entries,
            None => rebuild_manifest_entries(location, &id),
        };
        let sequence = entries.iter().map(|e| e.sequence + 1).max().unwrap_or(0);
        entries.push(ManifestEntry {
            id: id.clone(),
            epoch,
            global_step: snapshot.global_step,
            sequence,
            created_at,
        });
        persistence::atomic_write_json(&location.join(MANIFEST_FILE), &entries)
            .map_err(|e| write_failed(format!("manifest update: {e}")))?;

        let checkpoint = Checkpoint {
            id,
            epoch,
            global_step: snapshot.global_step,
            sequence,
            created_at,
            path,
        };
        tracing::info!(
            checkpoint = %checkpoint.id,
            epoch,
            global_step = snapshot.global_step,
            path = %checkpoint.path.display(),
            "Checkpoint saved"
        );

        sink.log_artifact(&ArtifactRecord {
            name: format!("model-checkpoint-epoch-{epoch}-{timestamp}"),
            kind: "model".to_string(),
            description: format!("Checkpoint at epoch {epoch}"),
            path: checkpoint.path.clone(),
            epoch,
        });

        Ok(checkpoint)
    }
}

/// `base`, or `base_<n>` for the first `n` not already taken.
fn unique_id(location: &Path, base: &str) -> String {
    let mut id = base.to_string();
    let mut n = 1;
    while location.join(&id).exists() {
        id = format!("{base}_{n}");
        n += 1;
    }
    id
}

fn write_staging(
    staging: &Path,
    snapshot: &TrainingSnapshot<'_>,
    created_at: DateTime<Utc>,
) -> Result<()> {
    std::fs::create_dir_all(staging)?;
    let state = StoredState {
        format_version: FORMAT_VERSION,
        epoch: snapshot.epoch,
        global_step: snapshot.global_step,
        external_run_id: snapshot.external_run_id.map(str::to_string),
        config: snapshot.config.to_map(),
        created_at,
    };
    persistence::atomic_write_json(&staging.join(STATE_FILE), &state)?;
    candle_core::safetensors::save(&snapshot.generator.state()?, staging.join(GENERATOR_FILE))?;
    candle_core::safetensors::save(
        &snapshot.discriminator.state()?,
        staging.join(DISCRIMINATOR_FILE),
    )?;
    candle_core::safetensors::save(&snapshot.optimizer_g.state()?, staging.join(OPTIMIZER_G_FILE))?;
    candle_core::safetensors::save(&snapshot.optimizer_d.state()?, staging.join(OPTIMIZER_D_FILE))?;
    Ok(())
}

fn unreadable(checkpoint: &Checkpoint, message: impl ToString) -> CheckpointError {
    CheckpointError::Unreadable {
        id: checkpoint.id.clone(),
        message: message.to_string(),
    }
}

fn read_state(checkpoint: &Checkpoint) -> Result<StoredState> {
    let path = checkpoint.path.join(STATE_FILE);
    let state: StoredState = persistence::load_json(&path)
        .map_err(|e| unreadable(checkpoint, format!("{}: {e}", path.display())))?
        .ok_or_else(|| unreadable(checkpoint, format!("{} is missing", path.display())))?;
    if state.format_version != FORMAT_VERSION {
        return Err(unreadable(
            checkpoint,
            format!("unsupported format version {}", state.format_version),
        )
        .into());
    }
    Ok(state)
}

fn read_tensors(checkpoint: &Checkpoint, file: &str, device: &Device) -> Result<HashMap<String, Tensor>> {
    let path = checkpoint.path.join(file);
    candle_core::safetensors::load(&path, device)
        .map_err(|e| unreadable(checkpoint, format!("{}: {e}", path.display())).into())
}

/// Manifest entries, skipping malformed ones. `None` if there is no readable
/// manifest at all.
fn read_manifest_entries(location: &Path) -> Option<Vec<ManifestEntry>> {
    let path = location.join(MANIFEST_FILE);
    let raw: Vec<serde_json::Value> = match persistence::load_json(&path) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Unreadable checkpoint manifest");
            return None;
        }
    };
    let entries = raw
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<ManifestEntry>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping malformed manifest entry");
                None
            }
        })
        .collect();
    Some(entries)
}

fn read_manifest(location: &Path) -> Option<Vec<Checkpoint>> {
    let entries = read_manifest_entries(location)?;
    let checkpoints = entries
        .into_iter()
        .filter_map(|entry| {
            let path = location.join(&entry.id);
            if !path.join(STATE_FILE).is_file() {
                tracing::warn!(checkpoint = %entry.id, "Manifest entry has no checkpoint on disk; skipping");
                return None;
            }
            Some(Checkpoint {
                id: entry.id,
                epoch: entry.epoch,
                global_step: entry.global_step,
                sequence: entry.sequence,
                created_at: entry.created_at,
                path,
            })
        })
        .collect();
    Some(checkpoints)
}

/// Entries for every checkpoint on disk except `skip`, used when the manifest
/// is missing or unreadable so a save never drops older checkpoints.
fn rebuild_manifest_entries(location: &Path, skip: &str) -> Vec<ManifestEntry> {
    let found = match scan_directory(location) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(location = %location.display(), error = %e, "Cannot rebuild checkpoint manifest");
            return Vec::new();
        }
    };
    if !found.is_empty() {
        tracing::info!(
            location = %location.display(),
            checkpoints = found.len(),
            "Rebuilding checkpoint manifest from directory"
        );
    }
    found
        .into_iter()
        .filter(|c| c.id != skip)
        .map(|c| ManifestEntry {
            id: c.id,
            epoch: c.epoch,
            global_step: c.global_step,
            sequence: c.sequence,
            created_at: c.created_at,
        })
        .collect()
}

/// Epoch embedded in a checkpoint directory name.
fn parse_epoch(id: &str) -> Option<usize> {
    let rest = id.strip_prefix(ID_PREFIX)?;
    let digits = rest.split('_').next()?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Rebuild the index from directory names when the manifest is unavailable.
fn scan_directory(location: &Path) -> Result<Vec<Checkpoint>> {
    if !location.is_dir() {
        return Ok(Vec::new());
    }
    let mut found: Vec<(usize, String, StoredState)> = Vec::new();
    for entry in std::fs::read_dir(location)? {
        let entry = entry?;
        let id = entry.file_name().to_string_lossy().into_owned();
        if !id.starts_with(ID_PREFIX) || !entry.path().is_dir() {
            continue;
        }
        let Some(epoch) = parse_epoch(&id) else {
            tracing::warn!(entry = %id, "Cannot parse epoch from checkpoint name; skipping");
            continue;
        };
        let state_path = entry.path().join(STATE_FILE);
        match persistence::load_json::<StoredState>(&state_path) {
            Ok(Some(state)) => found.push((epoch, id, state)),
            Ok(None) => tracing::warn!(entry = %id, "Checkpoint has no state.json; skipping"),
            Err(e) => tracing::warn!(entry = %id, error = %e, "Unreadable state.json; skipping"),
        }
    }
    // Names embed a sortable timestamp, which stands in for save order.
    found.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
    Ok(found
        .into_iter()
        .enumerate()
        .map(|(sequence, (epoch, id, state))| Checkpoint {
            path: location.join(&id),
            id,
            epoch,
            global_step: state.global_step,
            sequence: sequence as u64,
            created_at: state.created_at,
        })
        .collect())
}
