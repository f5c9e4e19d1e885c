//! Arranging a batch of generated images into one picture.

use candle_core::{DType, Device, Tensor};
use std::path::Path;

use crate::error::{Result, TelemetryError, TrainingError};

/// Padding (in pixels) between and around grid cells.
pub const GRID_PADDING: usize = 2;

/// An 8-bit RGB image holding a grid of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGrid {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB bytes, `width * height * 3` long.
    pub pixels: Vec<u8>,
}

impl ImageGrid {
    /// Lay out an `(N, C, H, W)` batch with `nrow` images per row.
    ///
    /// Values are min-max normalized over the whole batch. Single-channel
    /// batches are expanded to grey RGB; other channel counts are rejected.
    pub fn from_batch(images: &Tensor, nrow: usize, padding: usize) -> Result<Self> {
        let (n, c, h, w) = images.dims4()?;
        if n == 0 || nrow == 0 {
            return Err(shape_error(format!("cannot build a grid of {n} images with nrow {nrow}")));
        }
        if c != 1 && c != 3 {
            return Err(shape_error(format!("grid needs 1 or 3 channels, got {c}")));
        }

        let values = images
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let (min, max) = values
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let scale = (max - min).max(1e-5);

        let xmaps = nrow.min(n);
        let ymaps = n.div_ceil(xmaps);
        let cell_h = h + padding;
        let cell_w = w + padding;
        let grid_h = ymaps * cell_h + padding;
        let grid_w = xmaps * cell_w + padding;
        let mut pixels = vec![0u8; grid_h * grid_w * 3];

        for k in 0..n {
            let top = (k / xmaps) * cell_h + padding;
            let left = (k % xmaps) * cell_w + padding;
            for i in 0..h {
                for j in 0..w {
                    let dst = ((top + i) * grid_w + left + j) * 3;
                    for ch in 0..3 {
                        let src_ch = if c == 1 { 0 } else { ch };
                        let v = values[((k * c + src_ch) * h + i) * w + j];
                        let unit = ((v - min) / scale).clamp(0.0, 1.0);
                        pixels[dst + ch] = (unit * 255.0).round() as u8;
                    }
                }
            }
        }

        Ok(Self {
            width: grid_w as u32,
            height: grid_h as u32,
            pixels,
        })
    }

    /// Encode as PNG at `path`.
    pub fn save_png(&self, path: &Path) -> std::result::Result<(), TelemetryError> {
        let img = image::RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| TelemetryError::Image {
                message: format!(
                    "pixel buffer of {} bytes does not match {}x{}",
                    self.pixels.len(),
                    self.width,
                    self.height
                ),
            })?;
        img.save_with_format(path, image::ImageFormat::Png)
            .map_err(|e| TelemetryError::Image {
                message: e.to_string(),
            })
    }
}

fn shape_error(message: String) -> crate::error::GantryError {
    TrainingError::InvalidShape { message }.into()
}
