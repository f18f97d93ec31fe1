//! Merging the four single-band catalogs of a chip into one multi-band
//! catalog, with non-detections filled from each band's depth.

use crate::calibration::CalibrationQuality;
use crate::catalog::{CatalogError, ColumnTable, Photometry, SourceCatalog, SourceRecord};
use crate::limits::LimitKind;
use crate::redshift::RedshiftMatch;
use crate::spatial::{SkyCoord, SkyIndex};
use crate::utils::{enums::Band, io::write_atomic, o11y::logging::as_error};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{info, instrument};

/// Value written for errors and measured quantities of a band that did not
/// detect the object.
pub const MISSING: f64 = -9999.0;

#[derive(thiserror::Error, Debug)]
pub enum FusionError {
    #[error("no catalog for band {0}")]
    MissingBand(Band),
    #[error("more than one catalog for band {0}")]
    DuplicateBand(Band),
    #[error("band {band}: limiting magnitude {value} is not finite")]
    InvalidLimit { band: Band, value: f64 },
    #[error("failed to read fused catalog")]
    Catalog(#[from] CatalogError),
    #[error("failed to write fused catalog")]
    Csv(#[from] csv::Error),
    #[error("failed to write fused catalog")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub tolerance_arcsec: f64,
    pub limit_kind: LimitKind,
    pub max_mag: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        FusionConfig {
            tolerance_arcsec: 0.1,
            limit_kind: LimitKind::Kron,
            max_mag: 35.0,
        }
    }
}

/// A calibrated single-band catalog with the values the merge needs.
#[derive(Debug, Clone)]
pub struct BandCatalog {
    pub band: Band,
    pub catalog: SourceCatalog,
    pub zero_point: f64,
    pub zero_point_err: f64,
    pub quality: CalibrationQuality,
    pub limiting_mag: f64,
}

impl BandCatalog {
    /// Flux (in the catalog's raw units) of a source at the limiting
    /// magnitude.
    pub fn limiting_flux(&self) -> f64 {
        mag_to_flux(self.limiting_mag, self.zero_point)
    }
}

fn mag_to_flux(mag: f64, zero_point: f64) -> f64 {
    10f64.powf((mag - zero_point) / -2.5)
}

/// Identity of the chip stack a fused catalog belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitMeta {
    pub field: String,
    pub minus_year: String,
    pub chip: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedBand {
    pub detected: bool,
    pub mag_auto: f64,
    pub magerr_auto: f64,
    pub mag_aper: f64,
    pub magerr_aper: f64,
    pub flux_auto: f64,
    pub fluxerr_auto: f64,
    pub flux_aper: f64,
    pub fluxerr_aper: f64,
    pub magerr_syst_auto: f64,
    pub magerr_syst_aper: f64,
    pub magerr_statsyst_auto: f64,
    pub magerr_statsyst_aper: f64,
    pub zero_point: f64,
    pub zero_point_err: f64,
    /// Arcseconds.
    pub fwhm_world: f64,
    pub class_star: f64,
    pub flux_radius: f64,
    pub limmag: f64,
    pub limflux: f64,
    /// Quality of the band's zero-point calibration.
    pub zp_quality: CalibrationQuality,
}

impl FusedBand {
    fn non_detection(band: &BandCatalog) -> Self {
        let limflux = band.limiting_flux();
        FusedBand {
            detected: false,
            mag_auto: band.limiting_mag,
            magerr_auto: MISSING,
            mag_aper: band.limiting_mag,
            magerr_aper: MISSING,
            flux_auto: limflux,
            fluxerr_auto: MISSING,
            flux_aper: limflux,
            fluxerr_aper: MISSING,
            magerr_syst_auto: MISSING,
            magerr_syst_aper: MISSING,
            magerr_statsyst_auto: MISSING,
            magerr_statsyst_aper: MISSING,
            zero_point: band.zero_point,
            zero_point_err: band.zero_point_err,
            fwhm_world: MISSING,
            class_star: MISSING,
            flux_radius: MISSING,
            limmag: band.limiting_mag,
            limflux,
            zp_quality: band.quality,
        }
    }

    fn detection(band: &BandCatalog, record: &SourceRecord) -> Self {
        let zp_err = band.zero_point_err;
        // combined error, never below the zero-point error
        let statsyst = |err: f64| (zp_err.powi(2) + err.powi(2)).sqrt().max(zp_err);
        let flux = |p: &Photometry| -> (f64, f64) {
            match (p.flux, p.flux_err) {
                (Some(f), Some(fe)) => (f, fe),
                _ => {
                    let f = mag_to_flux(p.mag, band.zero_point);
                    (f, f * p.mag_err * std::f64::consts::LN_10 / 2.5)
                }
            }
        };
        let mut fused = FusedBand::non_detection(band);
        let (flux_auto, fluxerr_auto) = flux(&record.auto);
        fused.detected = true;
        fused.mag_auto = record.auto.mag;
        fused.magerr_auto = record.auto.mag_err;
        fused.flux_auto = flux_auto;
        fused.fluxerr_auto = fluxerr_auto;
        fused.magerr_syst_auto = zp_err;
        fused.magerr_statsyst_auto = statsyst(record.auto.mag_err);
        if let Some(aper) = &record.aper {
            let (flux_aper, fluxerr_aper) = flux(aper);
            fused.mag_aper = aper.mag;
            fused.magerr_aper = aper.mag_err;
            fused.flux_aper = flux_aper;
            fused.fluxerr_aper = fluxerr_aper;
            fused.magerr_syst_aper = zp_err;
            fused.magerr_statsyst_aper = statsyst(aper.mag_err);
        }
        fused.fwhm_world = record.fwhm_arcsec();
        fused.class_star = record.class_star;
        fused.flux_radius = record.flux_radius;
        fused
    }
}

/// One object of the merged catalog, with every band present.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedRow {
    pub ra: f64,
    pub dec: f64,
    pub x_image: f64,
    pub y_image: f64,
    pub a_image: f64,
    pub b_image: f64,
    pub theta_image: f64,
    pub kron_radius: Option<f64>,
    pub elongation: Option<f64>,
    pub meta: UnitMeta,
    /// Indexed by [`Band::index`].
    pub bands: [FusedBand; 4],
    pub redshift: Option<RedshiftMatch>,
}

impl FusedRow {
    pub fn coord(&self) -> SkyCoord {
        SkyCoord::new(self.ra, self.dec)
    }

    pub fn band(&self, band: Band) -> &FusedBand {
        &self.bands[band.index()]
    }
}

/// Put the four band catalogs in g, r, i, z order, rejecting gaps and
/// duplicates.
fn ordered(bands: Vec<BandCatalog>) -> Result<[BandCatalog; 4], FusionError> {
    let mut slots: [Option<BandCatalog>; 4] = [None, None, None, None];
    for band in bands {
        if !band.limiting_mag.is_finite() {
            return Err(FusionError::InvalidLimit {
                band: band.band,
                value: band.limiting_mag,
            });
        }
        let slot = &mut slots[band.band.index()];
        if slot.is_some() {
            return Err(FusionError::DuplicateBand(band.band));
        }
        *slot = Some(band);
    }
    let [g, r, i, z] = slots;
    Ok([
        g.ok_or(FusionError::MissingBand(Band::G))?,
        r.ok_or(FusionError::MissingBand(Band::R))?,
        i.ok_or(FusionError::MissingBand(Band::I))?,
        z.ok_or(FusionError::MissingBand(Band::Z))?,
    ])
}

/// Outer join of the four band catalogs by position.
///
/// The g band seeds the rows; each further band's detections join the
/// nearest existing row within the tolerance, at most one detection per
/// band per row (the closest wins, ties to the lower index), and the rest
/// start new rows. Shared columns come from the first band that detected
/// the row.
#[instrument(skip_all, fields(field = %meta.field, chip = meta.chip), err)]
pub fn fuse(meta: &UnitMeta, bands: Vec<BandCatalog>, config: &FusionConfig) -> Result<Vec<FusedRow>, FusionError> {
    let bands = ordered(bands)?;
    let cleaned: Vec<SourceCatalog> = bands
        .iter()
        .map(|b| {
            if !b.catalog.has_aperture_photometry() {
                info!(band = %b.band, "no aperture photometry, aperture columns filled as non-detections");
            }
            b.catalog.without_artifacts(config.max_mag)
        })
        .collect();

    // (anchor position, detection index per band)
    let mut rows: Vec<(SkyCoord, [Option<usize>; 4])> = Vec::new();
    for (b, catalog) in cleaned.iter().enumerate() {
        let index = SkyIndex::new(&rows.iter().map(|(c, _)| *c).collect::<Vec<_>>());
        // row -> (separation, detection) of the best claimant
        let mut claims: BTreeMap<usize, (f64, usize)> = BTreeMap::new();
        let mut unmatched = Vec::new();
        for (d, record) in catalog.records.iter().enumerate() {
            match index.nearest(&record.coord()) {
                Some(m) if m.separation_arcsec <= config.tolerance_arcsec => {
                    let claim = claims.entry(m.index).or_insert((m.separation_arcsec, d));
                    if m.separation_arcsec < claim.0 {
                        unmatched.push(claim.1);
                        *claim = (m.separation_arcsec, d);
                    } else if claim.1 != d {
                        unmatched.push(d);
                    }
                }
                _ => unmatched.push(d),
            }
        }
        for (row, (_, d)) in claims {
            rows[row].1[b] = Some(d);
        }
        unmatched.sort_unstable();
        for d in unmatched {
            let mut slots = [None; 4];
            slots[b] = Some(d);
            rows.push((catalog.records[d].coord(), slots));
        }
    }

    let fused: Vec<FusedRow> = rows
        .iter()
        .filter_map(|(_, slots)| {
            let (first, d) = slots.iter().enumerate().find_map(|(b, s)| s.map(|d| (b, d)))?;
            let shared = &cleaned[first].records[d];
            let per_band = |b: usize| match slots[b] {
                Some(d) => FusedBand::detection(&bands[b], &cleaned[b].records[d]),
                None => FusedBand::non_detection(&bands[b]),
            };
            Some(FusedRow {
                ra: shared.ra,
                dec: shared.dec,
                x_image: shared.x_image,
                y_image: shared.y_image,
                a_image: shared.a_image,
                b_image: shared.b_image,
                theta_image: shared.theta_image,
                kron_radius: shared.kron_radius,
                elongation: shared.elongation,
                meta: meta.clone(),
                bands: [per_band(0), per_band(1), per_band(2), per_band(3)],
                redshift: None,
            })
        })
        .collect();

    info!(n_rows = fused.len(), "fused band catalogs");
    Ok(fused)
}

const SHARED_COLUMNS: [&str; 12] = [
    "X_WORLD",
    "Y_WORLD",
    "X_IMAGE",
    "Y_IMAGE",
    "A_IMAGE",
    "B_IMAGE",
    "THETA_IMAGE",
    "KRON_RADIUS",
    "ELONGATION",
    "MY",
    "FIELD",
    "CCDNUM",
];

const BAND_COLUMNS: [&str; 19] = [
    "MAG_AUTO",
    "MAGERR_AUTO",
    "MAG_APER",
    "MAGERR_APER",
    "FLUX_AUTO",
    "FLUXERR_AUTO",
    "FLUX_APER",
    "FLUXERR_APER",
    "MAGERR_SYST_AUTO",
    "MAGERR_SYST_APER",
    "MAGERR_STATSYST_AUTO",
    "MAGERR_STATSYST_APER",
    "MAG_ZEROPOINT",
    "MAG_ZEROPOINT_ERR",
    "FWHM_WORLD",
    "CLASS_STAR",
    "FLUX_RADIUS",
    "LIMMAG",
    "LIMFLUX",
];

const QUALITY_COLUMN: &str = "MAG_ZEROPOINT_QUALITY";

const REDSHIFT_COLUMNS: [&str; 4] = ["z", "z_Err", "flag", "source"];

impl FusedBand {
    fn values(&self) -> [f64; 19] {
        [
            self.mag_auto,
            self.magerr_auto,
            self.mag_aper,
            self.magerr_aper,
            self.flux_auto,
            self.fluxerr_auto,
            self.flux_aper,
            self.fluxerr_aper,
            self.magerr_syst_auto,
            self.magerr_syst_aper,
            self.magerr_statsyst_auto,
            self.magerr_statsyst_aper,
            self.zero_point,
            self.zero_point_err,
            self.fwhm_world,
            self.class_star,
            self.flux_radius,
            self.limmag,
            self.limflux,
        ]
    }

    fn from_values(v: [f64; 19], zp_quality: CalibrationQuality) -> Self {
        FusedBand {
            // a detection always carries a measured error
            detected: v[1] != MISSING,
            mag_auto: v[0],
            magerr_auto: v[1],
            mag_aper: v[2],
            magerr_aper: v[3],
            flux_auto: v[4],
            fluxerr_auto: v[5],
            flux_aper: v[6],
            fluxerr_aper: v[7],
            magerr_syst_auto: v[8],
            magerr_syst_aper: v[9],
            magerr_statsyst_auto: v[10],
            magerr_statsyst_aper: v[11],
            zero_point: v[12],
            zero_point_err: v[13],
            fwhm_world: v[14],
            class_star: v[15],
            flux_radius: v[16],
            limmag: v[17],
            limflux: v[18],
            zp_quality,
        }
    }
}

/// Column names of the fused catalog, in file order.
pub fn fused_header() -> Vec<String> {
    let mut header: Vec<String> = SHARED_COLUMNS.iter().map(|c| c.to_string()).collect();
    for band in Band::ALL {
        header.extend(BAND_COLUMNS.iter().map(|c| format!("{}_{}", c, band)));
    }
    header.extend(Band::ALL.iter().map(|band| format!("{}_{}", QUALITY_COLUMN, band)));
    header.extend(REDSHIFT_COLUMNS.iter().map(|c| c.to_string()));
    header
}

fn opt_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub(crate) fn row_record(row: &FusedRow) -> Vec<String> {
    let mut record = vec![
        row.ra.to_string(),
        row.dec.to_string(),
        row.x_image.to_string(),
        row.y_image.to_string(),
        row.a_image.to_string(),
        row.b_image.to_string(),
        row.theta_image.to_string(),
        opt_cell(row.kron_radius),
        opt_cell(row.elongation),
        row.meta.minus_year.clone(),
        row.meta.field.clone(),
        row.meta.chip.to_string(),
    ];
    for band in &row.bands {
        record.extend(band.values().iter().map(|v| v.to_string()));
    }
    record.extend(row.bands.iter().map(|band| band.zp_quality.to_string()));
    match &row.redshift {
        Some(z) => record.extend([z.z.to_string(), z.z_err.to_string(), z.flag.clone(), z.source.clone()]),
        None => record.extend(vec![String::new(); REDSHIFT_COLUMNS.len()]),
    }
    record
}

pub fn write_fused_csv<W: std::io::Write>(writer: W, rows: &[FusedRow]) -> Result<(), FusionError> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(fused_header())?;
    for row in rows {
        csv_writer.write_record(row_record(row))?;
    }
    csv_writer.flush()?;
    Ok(())
}

#[instrument(skip(rows), fields(n_rows = rows.len()), err)]
pub fn write_fused_catalog(path: &Path, rows: &[FusedRow]) -> Result<(), FusionError> {
    let mut buffer = Vec::new();
    write_fused_csv(&mut buffer, rows)?;
    write_atomic(path, &buffer).inspect_err(as_error!("failed to write fused catalog"))?;
    Ok(())
}

pub fn read_fused_csv<R: Read>(name: &str, reader: R) -> Result<Vec<FusedRow>, FusionError> {
    fused_from_table(ColumnTable::from_reader(name, reader)?)
}

#[instrument(err)]
pub fn read_fused_catalog(path: &Path) -> Result<Vec<FusedRow>, FusionError> {
    fused_from_table(ColumnTable::from_path(path)?)
}

fn fused_from_table(table: ColumnTable) -> Result<Vec<FusedRow>, FusionError> {
    let header = fused_header();
    let idx = header
        .iter()
        .map(|c| table.require(c))
        .collect::<Result<Vec<_>, _>>()?;

    let mut rows = Vec::with_capacity(table.rows.len());
    for (n, record) in table.rows.iter().enumerate() {
        let num = |i: usize| table.f64_at(n, record, idx[i], &header[i]);
        let opt = |i: usize| table.opt_f64_at(n, record, Some(idx[i]), &header[i]);
        let text = |i: usize| table.str_at(record, idx[i]).to_string();

        let qcol = SHARED_COLUMNS.len() + 4 * BAND_COLUMNS.len();
        let read_band = |b: usize| -> Result<FusedBand, CatalogError> {
            let offset = SHARED_COLUMNS.len() + b * BAND_COLUMNS.len();
            let mut values = [0.0; 19];
            for (k, value) in values.iter_mut().enumerate() {
                *value = num(offset + k)?;
            }
            let quality = text(qcol + b);
            let zp_quality = quality.parse().map_err(|_| CatalogError::InvalidValue {
                table: table.name.clone(),
                column: header[qcol + b].clone(),
                row: n,
                value: quality.clone(),
            })?;
            Ok(FusedBand::from_values(values, zp_quality))
        };
        let bands = [read_band(0)?, read_band(1)?, read_band(2)?, read_band(3)?];

        let zcol = qcol + Band::ALL.len();
        let redshift = match opt(zcol)? {
            Some(zv) => Some(RedshiftMatch {
                z: zv,
                z_err: opt(zcol + 1)?.unwrap_or(MISSING),
                flag: text(zcol + 2),
                source: text(zcol + 3),
            }),
            None => None,
        };

        let chip = text(11);
        rows.push(FusedRow {
            ra: num(0)?,
            dec: num(1)?,
            x_image: num(2)?,
            y_image: num(3)?,
            a_image: num(4)?,
            b_image: num(5)?,
            theta_image: num(6)?,
            kron_radius: opt(7)?,
            elongation: opt(8)?,
            meta: UnitMeta {
                minus_year: text(9),
                field: text(10),
                chip: chip.parse().map_err(|_| CatalogError::InvalidValue {
                    table: table.name.clone(),
                    column: header[11].clone(),
                    row: n,
                    value: chip.clone(),
                })?,
            },
            bands,
            redshift,
        });
    }
    Ok(rows)
}
