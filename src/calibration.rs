//! Zero-point calibration of a stack catalog against a deep reference
//! catalog.

use crate::catalog::{ReferenceCatalog, ReferenceStar, SourceCatalog};
use crate::spatial::{match_to_catalog, SkyCoord};
use crate::stats::robust_median;
use crate::utils::{io::write_atomic, o11y::logging::as_error};

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum CalibrationFileError {
    #[error("failed to access calibration file")]
    Io(#[from] std::io::Error),
    #[error("calibration file {path}: '{value}' is not a number")]
    InvalidValue { path: String, value: String },
    #[error("calibration file {path}: expected 3 or 4 values, found {found}")]
    WrongValueCount { path: String, found: usize },
}

/// Point-source selection applied to the reference catalog. All bounds are
/// strict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StarCuts {
    /// Upper bound on `SPREAD_MODEL + spread_err_factor * SPREADERR_MODEL`.
    pub max_spread: f64,
    pub spread_err_factor: f64,
    pub mag_min: f64,
    pub mag_max: f64,
}

impl Default for StarCuts {
    fn default() -> Self {
        StarCuts {
            max_spread: 0.003,
            spread_err_factor: 3.0,
            mag_min: 19.5,
            mag_max: 23.5,
        }
    }
}

impl StarCuts {
    pub fn accepts(&self, star: &ReferenceStar) -> bool {
        star.spread_model + self.spread_err_factor * star.spread_err < self.max_spread
            && star.mag_auto > self.mag_min
            && star.mag_auto < self.mag_max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub star_cuts: StarCuts,
    pub match_radius_arcsec: f64,
    pub min_matches: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            star_cuts: StarCuts::default(),
            match_radius_arcsec: 2.0,
            min_matches: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationQuality {
    Nominal,
    LowMatchCount,
    NoMatches,
}

impl CalibrationQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationQuality::Nominal => "nominal",
            CalibrationQuality::LowMatchCount => "low_match_count",
            CalibrationQuality::NoMatches => "no_matches",
        }
    }

    /// Whether the zero-point is usable but less trustworthy than nominal.
    pub fn is_degraded(&self) -> bool {
        *self == CalibrationQuality::LowMatchCount
    }
}

impl std::fmt::Display for CalibrationQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CalibrationQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "nominal" => Ok(CalibrationQuality::Nominal),
            "low_match_count" => Ok(CalibrationQuality::LowMatchCount),
            "no_matches" => Ok(CalibrationQuality::NoMatches),
            other => Err(format!("unknown calibration quality '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub zero_point: f64,
    pub zero_point_err: f64,
    /// Arcseconds.
    pub psf_fwhm: f64,
    pub psf_fwhm_err: f64,
    pub n_matches: usize,
    pub quality: CalibrationQuality,
}

impl Calibration {
    fn no_matches() -> Self {
        Calibration {
            zero_point: f64::NAN,
            zero_point_err: f64::NAN,
            psf_fwhm: f64::NAN,
            psf_fwhm_err: f64::NAN,
            n_matches: 0,
            quality: CalibrationQuality::NoMatches,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.quality != CalibrationQuality::NoMatches
    }
}

/// Reference stars passing `cuts`, in catalog order.
pub fn select_reference_stars(reference: &ReferenceCatalog, cuts: &StarCuts) -> Vec<ReferenceStar> {
    reference
        .stars
        .iter()
        .filter(|s| cuts.accepts(s))
        .copied()
        .collect()
}

/// Derive the zero-point and PSF width of `catalog` from its matches to the
/// point sources of `reference`.
///
/// Never fails: too few matches produce a flagged result, no matches a
/// NaN-valued one.
#[instrument(skip_all, fields(catalog = %catalog.name, band = %reference.band))]
pub fn calibrate(
    catalog: &SourceCatalog,
    reference: &ReferenceCatalog,
    config: &CalibrationConfig,
) -> Calibration {
    let stars = select_reference_stars(reference, &config.star_cuts);
    let star_coords: Vec<SkyCoord> = stars.iter().map(ReferenceStar::coord).collect();
    let matches = match_to_catalog(&catalog.coords(), &star_coords);

    let (diffs, fwhms): (Vec<f64>, Vec<f64>) = matches
        .iter()
        .zip(&catalog.records)
        .filter(|(m, _)| m.separation_arcsec < config.match_radius_arcsec)
        .map(|(m, record)| {
            (
                stars[m.index].mag_auto - record.auto.mag,
                record.fwhm_arcsec(),
            )
        })
        .unzip();

    let (Some(zp), Some(psf)) = (robust_median(&diffs), robust_median(&fwhms)) else {
        warn!(
            n_stars = stars.len(),
            n_sources = catalog.len(),
            "no reference star matched within {} arcsec",
            config.match_radius_arcsec
        );
        return Calibration::no_matches();
    };

    let n_matches = diffs.len();
    let quality = if n_matches < config.min_matches {
        warn!(
            n_matches,
            min_matches = config.min_matches,
            "few reference matches, zero-point is unreliable"
        );
        CalibrationQuality::LowMatchCount
    } else {
        CalibrationQuality::Nominal
    };

    info!(
        zero_point = zp.value,
        zero_point_err = zp.error,
        psf_fwhm = psf.value,
        n_matches,
        "calibrated"
    );
    Calibration {
        zero_point: zp.value,
        zero_point_err: zp.error,
        psf_fwhm: psf.value,
        psf_fwhm_err: psf.error,
        n_matches,
        quality,
    }
}

/// Write the calibration quality file: one value per line, zero-point,
/// its error, PSF FWHM and its error, then the quality flag.
#[instrument(skip(calibration), err)]
pub fn write_quality_file(path: &Path, calibration: &Calibration) -> Result<(), CalibrationFileError> {
    let mut contents = [
        calibration.zero_point,
        calibration.zero_point_err,
        calibration.psf_fwhm,
        calibration.psf_fwhm_err,
    ]
    .iter()
    .map(|v| format!("{}\n", v))
    .collect::<String>();
    contents.push_str(calibration.quality.as_str());
    contents.push('\n');
    write_atomic(path, contents.as_bytes()).inspect_err(as_error!("failed to write quality file"))?;
    Ok(())
}

/// Values read back from a quality file. Older files lack the PSF error
/// and the quality flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityValues {
    pub zero_point: f64,
    pub zero_point_err: f64,
    pub psf_fwhm: f64,
    pub psf_fwhm_err: Option<f64>,
    pub quality: Option<CalibrationQuality>,
}

pub fn parse_quality(path: &str, contents: &str) -> Result<QualityValues, CalibrationFileError> {
    let mut tokens: Vec<&str> = contents.split_whitespace().collect();
    let quality = match tokens.last().map(|t| t.parse::<CalibrationQuality>()) {
        Some(Ok(quality)) => {
            tokens.pop();
            Some(quality)
        }
        _ => None,
    };
    let values = tokens
        .iter()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| CalibrationFileError::InvalidValue {
                    path: path.to_string(),
                    value: token.to_string(),
                })
        })
        .collect::<Result<Vec<f64>, _>>()?;
    match values[..] {
        [zero_point, zero_point_err, psf_fwhm] => Ok(QualityValues {
            zero_point,
            zero_point_err,
            psf_fwhm,
            psf_fwhm_err: None,
            quality,
        }),
        [zero_point, zero_point_err, psf_fwhm, psf_fwhm_err] => Ok(QualityValues {
            zero_point,
            zero_point_err,
            psf_fwhm,
            psf_fwhm_err: Some(psf_fwhm_err),
            quality,
        }),
        _ => Err(CalibrationFileError::WrongValueCount {
            path: path.to_string(),
            found: values.len(),
        }),
    }
}

#[instrument(err)]
pub fn read_quality_file(path: &Path) -> Result<QualityValues, CalibrationFileError> {
    let contents = std::fs::read_to_string(path)?;
    parse_quality(&path.display().to_string(), &contents)
}
