//! Data sources yielding batches of real samples.
//!
//! The training loop pulls batches synchronously. [`ImageFolderDataset`]
//! decodes ahead of the loop on a worker thread, handing finished batches
//! over a bounded channel.

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use crate::config::TrainingConfig;
use crate::error::{DataError, Result};

/// Side of the centered square cut from each source image before resizing.
const CENTER_CROP: u32 = 178;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// A blocking, epoch-oriented batch producer.
pub trait DataSource {
    /// Prepare a fresh pass over the data (reshuffling if applicable).
    fn begin_epoch(&mut self, epoch: usize) -> Result<()>;

    /// Next batch of the current pass, `None` once it is exhausted.
    fn next_batch(&mut self) -> Result<Option<Tensor>>;

    /// Batches per epoch, when known up front.
    fn len_hint(&self) -> Option<usize> {
        None
    }
}

// ---------------------------------------------------------------------------
// InMemoryDataset
// ---------------------------------------------------------------------------

/// A fixed list of batches replayed identically every epoch.
pub struct InMemoryDataset {
    batches: Vec<Tensor>,
    cursor: usize,
}

impl InMemoryDataset {
    pub fn new(batches: Vec<Tensor>) -> Self {
        Self { batches, cursor: 0 }
    }
}

impl DataSource for InMemoryDataset {
    fn begin_epoch(&mut self, _epoch: usize) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.batches.len())
    }
}

// ---------------------------------------------------------------------------
// ImageFolderDataset
// ---------------------------------------------------------------------------

type DecodedBatch = std::result::Result<(usize, Vec<f32>), DataError>;

struct PrefetchWorker {
    rx: mpsc::Receiver<DecodedBatch>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy)]
struct DecodeSpec {
    image_size: u32,
    channels: usize,
}

/// Images found recursively under a directory, center-cropped, resized and
/// scaled to `[-1, 1]` in `(C, H, W)` layout.
pub struct ImageFolderDataset {
    files: Arc<Vec<PathBuf>>,
    batch_size: usize,
    prefetch: usize,
    spec: DecodeSpec,
    device: Device,
    rng: StdRng,
    worker: Option<PrefetchWorker>,
}

impl ImageFolderDataset {
    pub fn open(config: &TrainingConfig, device: &Device) -> Result<Self> {
        let root = &config.data_root;
        if !root.is_dir() {
            return Err(DataError::RootNotFound { path: root.clone() }.into());
        }

        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .follow_links(true)
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry in data root");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file() && is_image(entry.path()))
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(DataError::Empty { path: root.clone() }.into());
        }

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        if let Some(subset) = config.subset_size {
            if subset < files.len() {
                files.shuffle(&mut rng);
                files.truncate(subset);
            }
        }

        tracing::info!(
            root = %root.display(),
            images = files.len(),
            batch_size = config.batch_size,
            "Image dataset ready"
        );

        Ok(Self {
            files: Arc::new(files),
            batch_size: config.batch_size,
            prefetch: config.prefetch_batches.max(1),
            spec: DecodeSpec {
                image_size: config.image_size as u32,
                channels: config.nc,
            },
            device: device.clone(),
            rng,
            worker: None,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Closing the channel makes a blocked send return immediately.
            drop(worker.rx);
            if worker.handle.join().is_err() {
                tracing::warn!("Prefetch worker panicked");
            }
        }
    }
}

impl DataSource for ImageFolderDataset {
    fn begin_epoch(&mut self, epoch: usize) -> Result<()> {
        self.stop_worker();

        let mut order: Vec<usize> = (0..self.files.len()).collect();
        order.shuffle(&mut self.rng);

        let (tx, rx) = mpsc::channel(self.prefetch);
        let files = Arc::clone(&self.files);
        let batch_size = self.batch_size;
        let spec = self.spec;
        let handle = std::thread::Builder::new()
            .name(format!("gantry-prefetch-{epoch}"))
            .spawn(move || {
                for chunk in order.chunks(batch_size) {
                    let decoded = decode_batch(&files, chunk, spec);
                    let failed = decoded.is_err();
                    if tx.blocking_send(decoded).is_err() || failed {
                        return;
                    }
                }
            })
            .map_err(|e| DataError::WorkerStopped {
                message: e.to_string(),
            })?;

        self.worker = Some(PrefetchWorker { rx, handle });
        Ok(())
    }

    fn next_batch(&mut self) -> Result<Option<Tensor>> {
        let Some(worker) = self.worker.as_mut() else {
            return Ok(None);
        };
        match worker.rx.blocking_recv() {
            Some(Ok((count, values))) => {
                let s = self.spec.image_size as usize;
                let batch = Tensor::from_vec(values, (count, self.spec.channels, s, s), &self.device)?;
                Ok(Some(batch))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    fn len_hint(&self) -> Option<usize> {
        Some(self.files.len().div_ceil(self.batch_size))
    }
}

impl Drop for ImageFolderDataset {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn decode_batch(files: &[PathBuf], indices: &[usize], spec: DecodeSpec) -> DecodedBatch {
    let per_image = spec.channels * (spec.image_size as usize).pow(2);
    let mut values = Vec::with_capacity(indices.len() * per_image);
    for &i in indices {
        decode_image(&files[i], spec, &mut values)?;
    }
    Ok((indices.len(), values))
}

/// Append one image in CHW order, scaled to `[-1, 1]`.
fn decode_image(path: &Path, spec: DecodeSpec, out: &mut Vec<f32>) -> std::result::Result<(), DataError> {
    let decode_err = |message: String| DataError::Decode {
        path: path.to_path_buf(),
        message,
    };
    let img = image::open(path).map_err(|e| decode_err(e.to_string()))?;

    let side = img.width().min(img.height()).min(CENTER_CROP);
    let x = (img.width() - side) / 2;
    let y = (img.height() - side) / 2;
    let img = img
        .crop_imm(x, y, side, side)
        .resize_exact(spec.image_size, spec.image_size, FilterType::Triangle);

    let (raw, channels) = match spec.channels {
        1 => (img.to_luma8().into_raw(), 1),
        3 => (img.to_rgb8().into_raw(), 3),
        other => return Err(decode_err(format!("unsupported channel count {other}"))),
    };
    let pixels = raw.len() / channels;
    for c in 0..channels {
        out.extend((0..pixels).map(|p| raw[p * channels + c] as f32 / 127.5 - 1.0));
    }
    Ok(())
}
