//! Background statistics of a science image.

use crate::limits::ImageNoise;
use crate::stats::sigma_clipped_stats;

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument};

#[derive(thiserror::Error, Debug)]
pub enum SkyError {
    #[error("failed to read pixel file")]
    Io(#[from] std::io::Error),
    #[error("pixel file {path}: '{value}' is not a number")]
    InvalidPixel { path: String, value: String },
    #[error("no finite pixels in image")]
    NoFinitePixels,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkyConfig {
    pub sigma: f64,
    pub iterations: usize,
}

impl Default for SkyConfig {
    fn default() -> Self {
        SkyConfig {
            sigma: 2.8,
            iterations: 10,
        }
    }
}

/// Sigma-clipped mean and standard deviation of the image pixels. NaN
/// pixels (masked or off-chip) are ignored.
#[instrument(skip(pixels), fields(n_pixels = pixels.len()), err)]
pub fn measure_noise(
    pixels: &[f64],
    exptime: f64,
    pixel_scale: f64,
    config: &SkyConfig,
) -> Result<ImageNoise, SkyError> {
    let stats = sigma_clipped_stats(pixels, config.sigma, config.iterations).ok_or(SkyError::NoFinitePixels)?;
    info!(sky_mean = stats.mean, sky_std = stats.std, n_kept = stats.n, "sky noise");
    Ok(ImageNoise {
        sky_mean: stats.mean,
        sky_std: stats.std,
        exptime,
        pixel_scale,
    })
}

/// Read pixel values stored as whitespace-separated text.
pub fn read_pixels(path: &Path) -> Result<Vec<f64>, SkyError> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .split_whitespace()
        .map(|token| {
            token.parse::<f64>().map_err(|_| SkyError::InvalidPixel {
                path: path.display().to_string(),
                value: token.to_string(),
            })
        })
        .collect()
}
