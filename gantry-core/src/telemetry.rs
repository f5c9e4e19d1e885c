//! Experiment telemetry: scalar metrics, image grids and checkpoint artifacts
//! keyed by the global step.
//!
//! A sink is opened once per process through [`SinkHandle`], every emission is
//! routed through that handle, and the handle finishes the sink when it is
//! closed or dropped, whichever comes first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::TelemetryError;
use crate::grid::ImageGrid;

/// A checkpoint (or other file) registered with the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Unique name, e.g. `model-checkpoint-epoch-3-20250101_120000_000`.
    pub name: String,
    pub kind: String,
    pub description: String,
    pub path: PathBuf,
    pub epoch: usize,
}

/// One recorded telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Scalars {
        step: u64,
        metrics: BTreeMap<String, f64>,
    },
    Image {
        step: u64,
        name: String,
        caption: String,
        width: u32,
        height: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },
    Artifact(ArtifactRecord),
}

/// Settings used when opening a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub project: String,
    pub name: String,
    pub tags: Vec<String>,
    pub config: serde_json::Value,
    /// Run id recovered from a checkpoint; reused if present.
    pub resume_id: Option<String>,
}

/// Destination for training telemetry.
pub trait TelemetrySink: Send {
    /// Identifier of the external run; persisted in checkpoints.
    fn run_id(&self) -> &str;

    fn log_scalars(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: u64,
    ) -> Result<(), TelemetryError>;

    fn log_image(
        &mut self,
        name: &str,
        grid: &ImageGrid,
        caption: &str,
        step: u64,
    ) -> Result<(), TelemetryError>;

    fn log_artifact(&mut self, artifact: &ArtifactRecord) -> Result<(), TelemetryError>;

    /// Flush and close the run. Called exactly once by [`SinkHandle`].
    fn finish(&mut self) -> Result<(), TelemetryError>;
}

/// Generate a short run id.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ---------------------------------------------------------------------------
// SinkHandle
// ---------------------------------------------------------------------------

/// Scoped owner of a telemetry sink.
///
/// Emission failures are logged and never interrupt training. The sink is
/// finished by [`SinkHandle::close`] or, failing that, on drop.
pub struct SinkHandle {
    inner: Box<dyn TelemetrySink>,
    closed: bool,
}

impl SinkHandle {
    pub fn new(sink: impl TelemetrySink + 'static) -> Self {
        Self {
            inner: Box::new(sink),
            closed: false,
        }
    }

    pub fn run_id(&self) -> &str {
        self.inner.run_id()
    }

    pub fn log_scalars(&mut self, metrics: &BTreeMap<String, f64>, step: u64) {
        if self.closed {
            tracing::warn!(step, "Dropping scalar metrics: telemetry sink already closed");
            return;
        }
        if let Err(e) = self.inner.log_scalars(metrics, step) {
            tracing::warn!(step, error = %e, "Failed to log scalar metrics");
        }
    }

    pub fn log_image(&mut self, name: &str, grid: &ImageGrid, caption: &str, step: u64) {
        if self.closed {
            tracing::warn!(step, name, "Dropping image: telemetry sink already closed");
            return;
        }
        if let Err(e) = self.inner.log_image(name, grid, caption, step) {
            tracing::warn!(step, name, error = %e, "Failed to log image");
        }
    }

    pub fn log_artifact(&mut self, artifact: &ArtifactRecord) {
        if self.closed {
            tracing::warn!(artifact = %artifact.name, "Dropping artifact: telemetry sink already closed");
            return;
        }
        if let Err(e) = self.inner.log_artifact(artifact) {
            tracing::warn!(
                artifact = %artifact.name,
                path = %artifact.path.display(),
                error = %e,
                "Failed to register artifact"
            );
        }
    }

    /// Finish the run. Later calls are no-ops.
    pub fn close(&mut self) -> Result<(), TelemetryError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.inner.finish();
        tracing::info!(run_id = %self.inner.run_id(), "Telemetry run finished");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to finish telemetry run");
        }
    }
}

// ---------------------------------------------------------------------------
// LocalRunSink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunMetadata {
    run_id: String,
    project: String,
    name: String,
    tags: Vec<String>,
    config: serde_json::Value,
    created_at: DateTime<Utc>,
    #[serde(default)]
    resumed_at: Vec<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
}

/// Filesystem-backed run log.
///
/// Layout: `<root>/<project>/<run_id>/` with `run.json`, an append-only
/// `events.jsonl` and rendered images under `media/`.
pub struct LocalRunSink {
    run_id: String,
    dir: PathBuf,
    events: std::fs::File,
}

impl LocalRunSink {
    /// Open (or reopen, when `settings.resume_id` is set) a run under `root`.
    pub fn init(root: &Path, settings: RunSettings) -> Result<Self, TelemetryError> {
        let run_id = settings.resume_id.clone().unwrap_or_else(new_run_id);
        let dir = root.join(&settings.project).join(&run_id);
        std::fs::create_dir_all(dir.join("media"))?;

        let meta_path = dir.join("run.json");
        let existing: Option<RunMetadata> = crate::persistence::load_json(&meta_path)
            .unwrap_or_else(|e| {
                tracing::warn!(path = %meta_path.display(), error = %e, "Ignoring unreadable run metadata");
                None
            });
        let meta = match existing {
            Some(mut meta) => {
                meta.resumed_at.push(Utc::now());
                meta.finished_at = None;
                tracing::info!(run_id = %run_id, "Resuming telemetry run");
                meta
            }
            None => {
                if settings.resume_id.is_some() {
                    tracing::info!(run_id = %run_id, "No local record of run; starting it under the stored id");
                }
                RunMetadata {
                    run_id: run_id.clone(),
                    project: settings.project.clone(),
                    name: settings.name.clone(),
                    tags: settings.tags.clone(),
                    config: settings.config.clone(),
                    created_at: Utc::now(),
                    resumed_at: Vec::new(),
                    finished_at: None,
                }
            }
        };
        crate::persistence::atomic_write_json(&meta_path, &meta)?;

        let events = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))?;

        tracing::info!(run_id = %run_id, dir = %dir.display(), name = %settings.name, "Telemetry run opened");
        Ok(Self {
            run_id,
            dir,
            events,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn append(&mut self, event: &TelemetryEvent) -> Result<(), TelemetryError> {
        let line = serde_json::to_string(event)?;
        writeln!(self.events, "{line}")?;
        Ok(())
    }
}

impl TelemetrySink for LocalRunSink {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn log_scalars(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: u64,
    ) -> Result<(), TelemetryError> {
        self.append(&TelemetryEvent::Scalars {
            step,
            metrics: metrics.clone(),
        })
    }

    fn log_image(
        &mut self,
        name: &str,
        grid: &ImageGrid,
        caption: &str,
        step: u64,
    ) -> Result<(), TelemetryError> {
        let path = self.dir.join("media").join(format!("{step:08}_{name}.png"));
        grid.save_png(&path)?;
        self.append(&TelemetryEvent::Image {
            step,
            name: name.to_string(),
            caption: caption.to_string(),
            width: grid.width,
            height: grid.height,
            path: Some(path),
        })
    }

    fn log_artifact(&mut self, artifact: &ArtifactRecord) -> Result<(), TelemetryError> {
        self.append(&TelemetryEvent::Artifact(artifact.clone()))
    }

    fn finish(&mut self) -> Result<(), TelemetryError> {
        self.events.flush()?;
        let meta_path = self.dir.join("run.json");
        if let Some(mut meta) = crate::persistence::load_json::<RunMetadata>(&meta_path)? {
            meta.finished_at = Some(Utc::now());
            crate::persistence::atomic_write_json(&meta_path, &meta)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// In-memory sink that records every event; clones share the same log.
#[derive(Debug, Clone)]
pub struct MemorySink {
    run_id: String,
    events: Arc<Mutex<Vec<TelemetryEvent>>>,
    finished: Arc<Mutex<u32>>,
}

impl MemorySink {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            events: Arc::new(Mutex::new(Vec::new())),
            finished: Arc::new(Mutex::new(0)),
        }
    }

    /// Snapshot of recorded events.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Scalar events only, as `(step, metrics)` pairs.
    pub fn scalars(&self) -> Vec<(u64, BTreeMap<String, f64>)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                TelemetryEvent::Scalars { step, metrics } => Some((step, metrics)),
                _ => None,
            })
            .collect()
    }

    /// How many times `finish` was called.
    pub fn finish_count(&self) -> u32 {
        self.finished.lock().map(|n| *n).unwrap_or_default()
    }

    fn push(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.events
            .lock()
            .map_err(|e| TelemetryError::Write {
                message: e.to_string(),
            })?
            .push(event);
        Ok(())
    }
}

impl TelemetrySink for MemorySink {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn log_scalars(
        &mut self,
        metrics: &BTreeMap<String, f64>,
        step: u64,
    ) -> Result<(), TelemetryError> {
        self.push(TelemetryEvent::Scalars {
            step,
            metrics: metrics.clone(),
        })
    }

    fn log_image(
        &mut self,
        name: &str,
        grid: &ImageGrid,
        caption: &str,
        step: u64,
    ) -> Result<(), TelemetryError> {
        self.push(TelemetryEvent::Image {
            step,
            name: name.to_string(),
            caption: caption.to_string(),
            width: grid.width,
            height: grid.height,
            path: None,
        })
    }

    fn log_artifact(&mut self, artifact: &ArtifactRecord) -> Result<(), TelemetryError> {
        self.push(TelemetryEvent::Artifact(artifact.clone()))
    }

    fn finish(&mut self) -> Result<(), TelemetryError> {
        let mut count = self.finished.lock().map_err(|e| TelemetryError::Write {
            message: e.to_string(),
        })?;
        *count += 1;
        Ok(())
    }
}
