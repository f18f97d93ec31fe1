//! Batch processing of (field, minus-year, band, chip) units.
//!
//! Every unit is calibrated, characterised and written on its own, so one
//! bad catalog only costs its own outputs. Chips whose four bands all
//! succeeded are then fused into a multi-band catalog.

use crate::calibration::{calibrate, write_quality_file, CalibrationFileError, CalibrationQuality};
use crate::catalog::{CatalogError, ColumnTable, ReferenceCatalog, SourceCatalog};
use crate::conf::AppConfig;
use crate::frames::{FramesError, MinusYear};
use crate::fusion::{fuse, write_fused_catalog, BandCatalog, FusedRow, FusionError, UnitMeta};
use crate::limits::{
    estimate, read_result_header, write_region_file, write_result_file, ImageNoise, LimitingMagnitudes, LimitsError,
    ResultFileError, ResultHeader,
};
use crate::redshift::{in_box, match_redshifts, RedshiftCatalog};
use crate::sky::{measure_noise, read_pixels, SkyError};
use crate::spatial::wrap_ra_difference;
use crate::utils::enums::Band;
use crate::utils::io::write_atomic;

use itertools::{Itertools, MinMaxResult};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("failed to read catalog")]
    Catalog(#[from] CatalogError),
    #[error("failed to measure sky noise")]
    Sky(#[from] SkyError),
    #[error("failed to write calibration quality file")]
    Quality(#[from] CalibrationFileError),
    #[error("failed to estimate limiting magnitudes")]
    Limits(#[from] LimitsError),
    #[error("failed to write result file")]
    ResultFile(#[from] ResultFileError),
    #[error("failed to fuse band catalogs")]
    Fusion(#[from] FusionError),
    #[error("invalid unit identity")]
    Frames(#[from] FramesError),
    #[error("failed to write output")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize batch summary")]
    Summary(#[from] serde_json::Error),
    #[error("no reference star matched unit {0}")]
    Uncalibrated(String),
    #[error("manifest {manifest}, row {row}: {reason}")]
    InvalidManifest {
        manifest: String,
        row: usize,
        reason: String,
    },
    #[error("manifest {manifest}, row {row}: no sky statistics and no pixel file")]
    MissingNoise { manifest: String, row: usize },
}

/// One processing unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UnitKey {
    pub field: String,
    pub minus_year: MinusYear,
    pub band: Band,
    pub chip: u32,
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MY{}_{}_{}_{}", self.minus_year, self.field, self.band, self.chip)
    }
}

impl UnitKey {
    pub fn chip_key(&self) -> ChipKey {
        ChipKey {
            field: self.field.clone(),
            minus_year: self.minus_year,
            chip: self.chip,
        }
    }

    pub fn output_dir(&self, root: &Path) -> PathBuf {
        root.join(format!("MY{}", self.minus_year))
            .join(&self.field)
            .join(self.band.as_str())
    }

    pub fn quality_path(&self, root: &Path) -> PathBuf {
        self.output_dir(root).join(format!("{}.qual", self))
    }

    pub fn result_path(&self, root: &Path) -> PathBuf {
        self.output_dir(root).join(format!("{}_init_wgtd.result", self))
    }

    pub fn region_path(&self, root: &Path) -> PathBuf {
        self.output_dir(root).join(format!("{}_auto.reg", self))
    }
}

/// The four bands of one chip stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChipKey {
    pub field: String,
    pub minus_year: MinusYear,
    pub chip: u32,
}

impl std::fmt::Display for ChipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MY{}_{}_{}", self.minus_year, self.field, self.chip)
    }
}

impl ChipKey {
    pub fn fused_path(&self, root: &Path) -> PathBuf {
        root.join(format!("MY{}", self.minus_year))
            .join(&self.field)
            .join("CAP")
            .join(format!("{}_obj_deep.csv", self))
    }

    fn meta(&self) -> UnitMeta {
        UnitMeta {
            field: self.field.clone(),
            minus_year: self.minus_year.to_string(),
            chip: self.chip,
        }
    }
}

/// Where the sky statistics of a unit come from.
#[derive(Debug, Clone, PartialEq)]
pub enum NoiseSource {
    Measured(ImageNoise),
    /// Pixel values as whitespace-separated text, clipped on the fly.
    Pixels { path: PathBuf, exptime: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitInputs {
    pub key: UnitKey,
    pub catalog: PathBuf,
    pub reference: PathBuf,
    pub noise: NoiseSource,
}

/// What a successful unit leaves behind for the fusion stage.
#[derive(Debug, Clone)]
pub struct UnitOutputs {
    pub key: UnitKey,
    pub zero_point: f64,
    pub zero_point_err: f64,
    pub quality: CalibrationQuality,
    pub limits: LimitingMagnitudes,
    /// Calibrated catalog.
    pub catalog: SourceCatalog,
}

/// Rebuild the outputs of a unit processed earlier from its extractor
/// catalog and the result file it left under `root`.
#[instrument(skip(root), fields(unit = %key), err)]
pub fn load_unit_outputs(key: UnitKey, catalog: &Path, root: &Path) -> Result<UnitOutputs, PipelineError> {
    let header = read_result_header(&key.result_path(root))?;
    let raw = SourceCatalog::from_csv_path(catalog)?;
    Ok(UnitOutputs {
        zero_point: header.zero_point,
        zero_point_err: header.zero_point_err,
        quality: header.quality,
        limits: header.limits,
        catalog: raw.calibrated(header.zero_point),
        key,
    })
}

const MANIFEST_COLUMNS: [&str; 6] = ["FIELD", "MY", "BAND", "CHIP", "CATALOG", "REFERENCE"];

/// Read a batch manifest. Each row names a unit, its extractor catalog and
/// reference catalog, and either its sky statistics (`SKY_MEAN`, `SKY_STD`,
/// `EXPTIME`) or a `PIXELS` file. Relative paths are taken from the
/// manifest's directory.
#[instrument(err)]
pub fn read_manifest(path: &Path, pixel_scale: f64) -> Result<Vec<UnitInputs>, PipelineError> {
    let table = ColumnTable::from_path(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    let idx = MANIFEST_COLUMNS
        .iter()
        .map(|c| table.require(c))
        .collect::<Result<Vec<_>, _>>()?;
    let sky_mean = table.optional("SKY_MEAN");
    let sky_std = table.optional("SKY_STD");
    let exptime = table.optional("EXPTIME");
    let pixels = table.optional("PIXELS");

    let mut units = Vec::with_capacity(table.rows.len());
    for (n, row) in table.rows.iter().enumerate() {
        let invalid = |reason: String| PipelineError::InvalidManifest {
            manifest: table.name.clone(),
            row: n,
            reason,
        };
        let band: Band = table.str_at(row, idx[2]).parse().map_err(invalid)?;
        let chip_raw = table.str_at(row, idx[3]);
        let chip: u32 = chip_raw
            .parse()
            .map_err(|_| invalid(format!("'{}' is not a chip number", chip_raw)))?;
        let key = UnitKey {
            field: table.str_at(row, idx[0]).to_string(),
            minus_year: table.str_at(row, idx[1]).parse()?,
            band,
            chip,
        };

        let exptime = table.opt_f64_at(n, row, exptime, "EXPTIME")?.unwrap_or(0.0);
        let measured = (
            table.opt_f64_at(n, row, sky_mean, "SKY_MEAN")?,
            table.opt_f64_at(n, row, sky_std, "SKY_STD")?,
        );
        let pixel_file = pixels.map(|i| table.str_at(row, i)).filter(|p| !p.is_empty());
        let noise = match (measured, pixel_file) {
            ((Some(sky_mean), Some(sky_std)), _) => NoiseSource::Measured(ImageNoise {
                sky_mean,
                sky_std,
                exptime,
                pixel_scale,
            }),
            (_, Some(file)) => NoiseSource::Pixels {
                path: base.join(file),
                exptime,
            },
            _ => {
                return Err(PipelineError::MissingNoise {
                    manifest: table.name.clone(),
                    row: n,
                })
            }
        };

        units.push(UnitInputs {
            key,
            catalog: base.join(table.str_at(row, idx[4])),
            reference: base.join(table.str_at(row, idx[5])),
            noise,
        });
    }
    info!(n_units = units.len(), "read manifest");
    Ok(units)
}

/// Calibrate one unit, estimate its depth and write its quality, result
/// and region files under `root`.
#[instrument(skip_all, fields(unit = %inputs.key), err)]
pub fn run_unit(inputs: &UnitInputs, config: &AppConfig, root: &Path) -> Result<UnitOutputs, PipelineError> {
    let key = &inputs.key;
    let raw = SourceCatalog::from_csv_path(&inputs.catalog)?;
    let reference = ReferenceCatalog::from_csv_path(&inputs.reference, key.band)?;
    let noise = match &inputs.noise {
        NoiseSource::Measured(noise) => *noise,
        NoiseSource::Pixels { path, exptime } => {
            measure_noise(&read_pixels(path)?, *exptime, config.limits.pixel_scale, &config.sky)?
        }
    };

    let calibration = calibrate(&raw, &reference, &config.calibration);
    std::fs::create_dir_all(key.output_dir(root))?;
    write_quality_file(&key.quality_path(root), &calibration)?;
    if calibration.quality == CalibrationQuality::NoMatches {
        return Err(PipelineError::Uncalibrated(key.to_string()));
    }

    let calibrated = raw.calibrated(calibration.zero_point);
    let limits = estimate(
        &calibrated,
        &noise,
        calibration.psf_fwhm,
        calibration.zero_point,
        &config.limits,
    )?;
    let header = ResultHeader {
        field: key.field.clone(),
        minus_year: key.minus_year.to_string(),
        band: key.band,
        chip: key.chip,
        exptime: noise.exptime,
        zero_point: calibration.zero_point,
        zero_point_err: calibration.zero_point_err,
        quality: calibration.quality,
        limits,
        snr: config.limits.snr,
        sky_sigma: config.limits.sky_sigma,
    };
    write_result_file(&key.result_path(root), &header, &calibrated, &config.limits)?;
    write_region_file(&key.region_path(root), &calibrated)?;

    Ok(UnitOutputs {
        key: key.clone(),
        zero_point: calibration.zero_point,
        zero_point_err: calibration.zero_point_err,
        quality: calibration.quality,
        limits,
        catalog: calibrated,
    })
}

/// Attach spectroscopic redshifts to fused rows, searching the whitelisted
/// entries in a box that covers the rows plus the match radius.
pub fn attach_redshifts(rows: &mut [FusedRow], catalog: &RedshiftCatalog, config: &AppConfig) {
    let Some(first) = rows.first() else {
        return;
    };
    let ra_ref = first.ra;
    let span = |values: MinMaxResult<f64>| match values {
        MinMaxResult::NoElements => (0.0, 0.0),
        MinMaxResult::OneElement(v) => (v, v),
        MinMaxResult::MinMax(lo, hi) => (lo, hi),
    };
    let (ra_lo, ra_hi) = span(rows.iter().map(|r| wrap_ra_difference(r.ra, ra_ref)).minmax());
    let (dec_lo, dec_hi) = span(rows.iter().map(|r| r.dec).minmax());
    let ra_center = (ra_ref + (ra_lo + ra_hi) / 2.0).rem_euclid(360.0);
    let dec_center = (dec_lo + dec_hi) / 2.0;
    let half_width =
        ((ra_hi - ra_lo) / 2.0).max((dec_hi - dec_lo) / 2.0) + config.redshift.tiebreak_radius_arcsec / 3600.0;

    let accepted = in_box(
        &catalog.whitelisted(&config.surveys),
        ra_center,
        dec_center,
        half_width,
    );
    let targets: Vec<_> = rows.iter().map(FusedRow::coord).collect();
    let matches = match_redshifts(&targets, &accepted, &config.surveys, &config.redshift);
    let mut n_matched = 0;
    for (row, m) in rows.iter_mut().zip(matches) {
        n_matched += usize::from(m.is_some());
        row.redshift = m;
    }
    info!(n_candidates = accepted.len(), n_matched, "attached redshifts");
}

/// Merge the four band outputs of one chip, attach redshifts and write the
/// fused catalog.
#[instrument(skip(units, redshifts, config, root), fields(chip = %chip), err)]
pub fn fuse_chip(
    chip: &ChipKey,
    units: Vec<UnitOutputs>,
    redshifts: Option<&RedshiftCatalog>,
    config: &AppConfig,
    root: &Path,
) -> Result<PathBuf, PipelineError> {
    let bands = units
        .into_iter()
        .map(|u| BandCatalog {
            band: u.key.band,
            limiting_mag: u.limits.select(config.fusion.limit_kind),
            zero_point: u.zero_point,
            zero_point_err: u.zero_point_err,
            quality: u.quality,
            catalog: u.catalog,
        })
        .collect();
    let mut rows = fuse(&chip.meta(), bands, &config.fusion)?;
    if let Some(catalog) = redshifts {
        attach_redshifts(&mut rows, catalog, config);
    }
    let path = chip.fused_path(root);
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    write_fused_catalog(&path, &rows)?;
    Ok(path)
}

/// A unit or chip that did not produce its outputs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFailure {
    pub unit: String,
    pub error: String,
}

impl UnitFailure {
    fn new(unit: String, error: &PipelineError) -> Self {
        UnitFailure {
            unit,
            error: error_chain(error),
        }
    }
}

/// Outcome of a batch, one entry per unit and per fused chip.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<UnitFailure>,
    /// Succeeded units whose zero-point rests on too few reference stars.
    pub degraded: Vec<String>,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        write_atomic(path, self.to_json()?.as_bytes())?;
        Ok(())
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Run every unit, then fuse every chip whose units all succeeded. A
/// failure is recorded in the summary and never stops the batch.
#[instrument(skip_all, fields(n_units = units.len()))]
pub fn run_batch(
    units: &[UnitInputs],
    redshifts: Option<&RedshiftCatalog>,
    config: &AppConfig,
    root: &Path,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    let mut finished = Vec::with_capacity(units.len());
    for inputs in units {
        match run_unit(inputs, config, root) {
            Ok(outputs) => {
                summary.succeeded.push(inputs.key.to_string());
                if outputs.quality.is_degraded() {
                    warn!(unit = %inputs.key, quality = %outputs.quality, "unit calibrated with degraded quality");
                    summary.degraded.push(inputs.key.to_string());
                }
                finished.push(outputs);
            }
            Err(e) => summary.failed.push(UnitFailure::new(inputs.key.to_string(), &e)),
        }
    }

    let by_chip = finished.into_iter().into_group_map_by(|u| u.key.chip_key());
    for (chip, outputs) in by_chip.into_iter().sorted_by(|a, b| a.0.cmp(&b.0)) {
        if outputs.len() < Band::ALL.len() {
            warn!(chip = %chip, n_bands = outputs.len(), "chip is missing bands, not fused");
        }
        let name = format!("{}_fused", chip);
        match fuse_chip(&chip, outputs, redshifts, config, root) {
            Ok(_) => summary.succeeded.push(name),
            Err(e) => summary.failed.push(UnitFailure::new(name, &e)),
        }
    }

    info!(
        n_succeeded = summary.succeeded.len(),
        n_failed = summary.failed.len(),
        n_degraded = summary.degraded.len(),
        "batch finished"
    );
    summary
}
