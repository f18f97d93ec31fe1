//! Limiting magnitudes of a calibrated stack, and the per-unit result and
//! region files that record them.

use crate::calibration::CalibrationQuality;
use crate::catalog::{SourceCatalog, SourceRecord};
use crate::stats::{linspace, median, DensityHistogram, SmoothingSpline};
use crate::utils::{enums::Band, io::write_atomic, o11y::logging::as_error};

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum LimitsError {
    #[error("no usable magnitudes in catalog {0}")]
    EmptyCatalog(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ResultFileError {
    #[error("failed to access result file")]
    Io(#[from] std::io::Error),
    #[error("result file {path} has no '{key}' header line")]
    MissingHeader { path: String, key: String },
    #[error("result file {path}: invalid value '{value}' for '{key}'")]
    InvalidHeader {
        path: String,
        key: String,
        value: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Detections at or above this magnitude are treated as artifacts.
    pub max_mag: f64,
    pub bins: usize,
    pub smoothing: f64,
    pub n_eval: usize,
    pub snr: f64,
    /// Half width of the error band as a fraction of the error threshold.
    pub error_band_fraction: f64,
    pub sky_sigma: f64,
    pub pixel_scale: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_mag: 35.0,
            bins: 150,
            smoothing: 0.02,
            n_eval: 200,
            snr: 10.0,
            error_band_fraction: 1.0 / 500.0,
            sky_sigma: 5.0,
            pixel_scale: 0.27,
        }
    }
}

/// Background level and noise of the science image, per pixel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageNoise {
    pub sky_mean: f64,
    pub sky_std: f64,
    /// Seconds; recorded in the result file only.
    pub exptime: f64,
    /// Arcseconds per pixel.
    pub pixel_scale: f64,
}

/// Which estimate stands in for a band's depth downstream.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    #[default]
    Kron,
    ErrorThreshold,
    SkyNoise,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitingMagnitudes {
    /// Mode of the smoothed magnitude distribution.
    pub kron: f64,
    /// Median magnitude at the error threshold; absent when no detection
    /// falls in the error band.
    pub error_threshold: Option<f64>,
    pub sky: f64,
}

impl LimitingMagnitudes {
    /// Mean of the available estimates.
    pub fn mean(&self) -> f64 {
        match self.error_threshold {
            Some(err) => (self.kron + err + self.sky) / 3.0,
            None => (self.kron + self.sky) / 2.0,
        }
    }

    /// The estimate of the given kind; a missing error-threshold limit falls
    /// back to the Kron limit.
    pub fn select(&self, kind: LimitKind) -> f64 {
        match kind {
            LimitKind::Kron => self.kron,
            LimitKind::ErrorThreshold => self.error_threshold.unwrap_or_else(|| {
                warn!("no error-threshold limit, using the Kron limit");
                self.kron
            }),
            LimitKind::SkyNoise => self.sky,
            LimitKind::Mean => self.mean(),
        }
    }
}

/// Magnitude error corresponding to a signal-to-noise ratio.
pub fn error_threshold(snr: f64) -> f64 {
    2.5 * (1.0 + 1.0 / snr).log10()
}

/// Abscissa of the peak of the smoothed magnitude density.
pub fn kron_limit(mags: &[f64], config: &LimitsConfig) -> Option<f64> {
    let hist = DensityHistogram::new(mags, config.bins)?;
    let lo = hist.edges[0];
    let hi = hist.edges[hist.edges.len() - 1];
    let grid = linspace(lo, hi, config.n_eval);
    let peak = match SmoothingSpline::fit(hist.upper_edges(), &hist.density, config.smoothing) {
        Some(spline) => grid
            .iter()
            .map(|&x| (x, spline.eval(x)))
            .fold((f64::NAN, f64::NEG_INFINITY), |best, (x, y)| {
                if y > best.1 {
                    (x, y)
                } else {
                    best
                }
            })
            .0,
        None => {
            warn!("smoothing spline failed, using the densest histogram bin");
            let (i, _) = hist
                .density
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &d)| if d > best.1 { (i, d) } else { best });
            hist.edges[i + 1]
        }
    };
    Some(peak)
}

/// Median magnitude of detections whose error lies strictly inside the band
/// around the error threshold.
pub fn error_threshold_limit(records: &[SourceRecord], config: &LimitsConfig) -> Option<f64> {
    let threshold = error_threshold(config.snr);
    let half_width = threshold * config.error_band_fraction;
    let mags: Vec<f64> = records
        .iter()
        .filter(|r| r.auto.mag_err > threshold - half_width && r.auto.mag_err < threshold + half_width)
        .map(|r| r.auto.mag)
        .collect();
    median(&mags)
}

/// Magnitude of a `sigma`-times sky fluctuation over a PSF-sized aperture.
pub fn sky_limit(noise: &ImageNoise, psf_fwhm: f64, zero_point: f64, sigma: f64) -> f64 {
    let skyflux = noise.sky_std * (std::f64::consts::PI * (psf_fwhm / noise.pixel_scale).powi(2)).sqrt();
    zero_point - 2.5 * (sigma * skyflux).log10()
}

/// Estimate the three limiting magnitudes of a calibrated catalog.
#[instrument(skip_all, fields(catalog = %catalog.name), err)]
pub fn estimate(
    catalog: &SourceCatalog,
    noise: &ImageNoise,
    psf_fwhm: f64,
    zero_point: f64,
    config: &LimitsConfig,
) -> Result<LimitingMagnitudes, LimitsError> {
    let cleaned = catalog.without_artifacts(config.max_mag);
    let mags: Vec<f64> = cleaned.records.iter().map(|r| r.auto.mag).collect();
    let kron = kron_limit(&mags, config).ok_or_else(|| LimitsError::EmptyCatalog(catalog.name.clone()))?;
    let error_threshold = error_threshold_limit(&cleaned.records, config);
    if error_threshold.is_none() {
        debug!("no detection within the error band");
    }
    let sky = sky_limit(noise, psf_fwhm, zero_point, config.sky_sigma);
    let limits = LimitingMagnitudes {
        kron,
        error_threshold,
        sky,
    };
    info!(kron, ?error_threshold, sky, mean = limits.mean(), "limiting magnitudes");
    Ok(limits)
}

/// Identity of a processing unit as recorded in a result file header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultHeader {
    pub field: String,
    pub minus_year: String,
    pub band: Band,
    pub chip: u32,
    pub exptime: f64,
    pub zero_point: f64,
    pub zero_point_err: f64,
    pub quality: CalibrationQuality,
    pub limits: LimitingMagnitudes,
    pub snr: f64,
    pub sky_sigma: f64,
}

const HEADER_TITLE: &str = "Result file for a stack of Dark Energy Survey data taken by DECam";
const KEY_FIELD: &str = "Field";
const KEY_MY: &str = "Minus year";
const KEY_BAND: &str = "Band";
const KEY_CHIP: &str = "CCD Number";
const KEY_EXPTIME: &str = "Total exposure time";
const KEY_ZP: &str = "Zeropoint based on AUTO photometry";
const KEY_ZP_ERR: &str = "1 sigma error on the zeropoint";
const KEY_QUALITY: &str = "Zeropoint calibration quality";
const KEY_KRON: &str = "Limiting Kron magnitude based on matched objects";
const KEY_ERR_LIM: &str = "sigma limiting magnitude based on matched objects";
const KEY_SKY_LIM: &str = "sigma limiting magnitude using zeropoint";

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "nan".to_string(), |v| v.to_string())
}

fn fmt_col(value: Option<f64>) -> String {
    format!("{:4.3}", value.unwrap_or(-9999.0))
}

pub fn format_result(header: &ResultHeader, catalog: &SourceCatalog) -> String {
    let mut out = String::new();
    let l = &header.limits;
    // writes to a String cannot fail
    let _ = writeln!(out, "# {}", HEADER_TITLE);
    let _ = writeln!(out, "# {}: {}", KEY_FIELD, header.field);
    let _ = writeln!(out, "# {}: {}", KEY_MY, header.minus_year);
    let _ = writeln!(out, "# {}: {}", KEY_BAND, header.band);
    let _ = writeln!(out, "# {}: {}", KEY_CHIP, header.chip);
    let _ = writeln!(out, "# {}: {} s", KEY_EXPTIME, header.exptime);
    let _ = writeln!(out, "# {}: {}", KEY_ZP, header.zero_point);
    let _ = writeln!(out, "# {}: {}", KEY_ZP_ERR, header.zero_point_err);
    let _ = writeln!(out, "# {}: {}", KEY_QUALITY, header.quality);
    let _ = writeln!(out, "# {}: {}", KEY_KRON, l.kron);
    let _ = writeln!(out, "# {} {}: {}", header.snr, KEY_ERR_LIM, fmt_opt(l.error_threshold));
    let _ = writeln!(
        out,
        "# {} {} {:.3}: {}",
        header.sky_sigma, KEY_SKY_LIM, header.zero_point, l.sky
    );
    for line in [
        "Columns:",
        "RA (J2000)",
        "Dec (J2000)",
        "Kron Magnitude",
        "Kron Magnitude error",
        "PSF Magnitude",
        "PSF Magnitude error",
        "Aperture Magnitude",
        "Aperture Magnitude error",
        "FWHM of the source (arcsec)",
        "Elongation of source",
        "Stellarity index",
        "Flux Radius",
    ] {
        let _ = writeln!(out, "# {}", line);
    }
    let _ = writeln!(
        out,
        "X_WORLD Y_WORLD MAG_AUTO MAGERR_AUTO MAG_PSF MAGERR_PSF MAG_APER MAGERR_APER FWHM_WORLD ELONGATION CLASS_STAR FLUX_RADIUS"
    );
    for r in &catalog.records {
        let _ = writeln!(
            out,
            "{:7.5} {:7.5} {:4.3} {:4.3} {} {} {} {} {:4.3} {} {} {}",
            r.ra,
            r.dec,
            r.auto.mag,
            r.auto.mag_err,
            fmt_col(r.psf.map(|p| p.mag)),
            fmt_col(r.psf.map(|p| p.mag_err)),
            fmt_col(r.aper.map(|p| p.mag)),
            fmt_col(r.aper.map(|p| p.mag_err)),
            r.fwhm_arcsec(),
            fmt_col(r.elongation),
            r.class_star,
            r.flux_radius,
        );
    }
    out
}

/// Write the result file of a calibrated catalog. Rows are ordered by right
/// ascension with artifacts removed.
#[instrument(skip(header, catalog), err)]
pub fn write_result_file(
    path: &Path,
    header: &ResultHeader,
    catalog: &SourceCatalog,
    config: &LimitsConfig,
) -> Result<(), ResultFileError> {
    let cleaned = catalog.without_artifacts(config.max_mag);
    write_atomic(path, format_result(header, &cleaned).as_bytes())
        .inspect_err(as_error!("failed to write result file"))?;
    info!(n_rows = cleaned.len(), "saved result file");
    Ok(())
}

/// Parse the header of a result file back into its values.
pub fn parse_result_header(path: &str, contents: &str) -> Result<ResultHeader, ResultFileError> {
    let entries: Vec<(String, String)> = contents
        .lines()
        .filter_map(|line| line.strip_prefix('#'))
        .filter_map(|line| line.trim().split_once(": "))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let lookup = |key: &str, contains: bool| -> Result<(String, String), ResultFileError> {
        entries
            .iter()
            .find(|(k, _)| if contains { k.contains(key) } else { k == key })
            .cloned()
            .ok_or_else(|| ResultFileError::MissingHeader {
                path: path.to_string(),
                key: key.to_string(),
            })
    };
    let invalid = |key: &str, value: &str| ResultFileError::InvalidHeader {
        path: path.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    };
    let number = |key: &str, contains: bool| -> Result<f64, ResultFileError> {
        let (_, value) = lookup(key, contains)?;
        let token = value.split_whitespace().next().unwrap_or("");
        token.parse::<f64>().map_err(|_| invalid(key, &value))
    };
    // the estimator's parameters lead the key, e.g. "10 sigma limiting ..."
    let leading_number = |key: &str| -> Result<f64, ResultFileError> {
        let (k, _) = lookup(key, true)?;
        let token = k.split_whitespace().next().unwrap_or("");
        token.parse::<f64>().map_err(|_| invalid(key, &k))
    };

    let (_, band) = lookup(KEY_BAND, false)?;
    let (_, chip) = lookup(KEY_CHIP, false)?;
    let (_, quality) = lookup(KEY_QUALITY, false)?;
    let error_threshold = number(KEY_ERR_LIM, true)?;
    Ok(ResultHeader {
        field: lookup(KEY_FIELD, false)?.1,
        minus_year: lookup(KEY_MY, false)?.1,
        band: band.parse().map_err(|_| invalid(KEY_BAND, &band))?,
        chip: chip.parse().map_err(|_| invalid(KEY_CHIP, &chip))?,
        exptime: number(KEY_EXPTIME, false)?,
        zero_point: number(KEY_ZP, false)?,
        zero_point_err: number(KEY_ZP_ERR, false)?,
        quality: quality.parse().map_err(|_| invalid(KEY_QUALITY, &quality))?,
        limits: LimitingMagnitudes {
            kron: number(KEY_KRON, false)?,
            error_threshold: (!error_threshold.is_nan()).then_some(error_threshold),
            sky: number(KEY_SKY_LIM, true)?,
        },
        snr: leading_number(KEY_ERR_LIM)?,
        sky_sigma: leading_number(KEY_SKY_LIM)?,
    })
}

#[instrument(err)]
pub fn read_result_header(path: &Path) -> Result<ResultHeader, ResultFileError> {
    let contents = std::fs::read_to_string(path)?;
    parse_result_header(&path.display().to_string(), &contents)
}

/// DS9 region file marking every detection with its magnitude.
pub fn format_regions(catalog: &SourceCatalog) -> String {
    catalog
        .records
        .iter()
        .map(|r| {
            format!(
                "fk5; circle({},{},1\") # text={{{:.2} +/- {:.2}}}\n",
                r.ra, r.dec, r.auto.mag, r.auto.mag_err
            )
        })
        .collect()
}

#[instrument(skip(catalog), err)]
pub fn write_region_file(path: &Path, catalog: &SourceCatalog) -> std::io::Result<()> {
    write_atomic(path, format_regions(catalog).as_bytes())
}
