//! Typed source and reference catalogs, read through a schema-checked
//! boundary so that a missing column fails at load time with its name.

use crate::spatial::SkyCoord;
use crate::utils::{enums::Band, o11y::logging::as_error};

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, instrument};

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("failed to open catalog {path}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse table")]
    Csv(#[from] csv::Error),
    #[error("table '{table}' is missing required column '{column}'")]
    MissingColumn { table: String, column: String },
    #[error("table '{table}', row {row}: invalid value '{value}' in column '{column}'")]
    InvalidValue {
        table: String,
        column: String,
        row: usize,
        value: String,
    },
}

/// A header-indexed CSV table. Rows stay as raw strings until a column is
/// asked for by name.
pub(crate) struct ColumnTable {
    pub name: String,
    columns: HashMap<String, usize>,
    pub rows: Vec<csv::StringRecord>,
}

impl ColumnTable {
    pub fn from_reader<R: Read>(name: &str, reader: R) -> Result<Self, CatalogError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(false)
            .from_reader(reader);
        let columns = csv_reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_string(), i))
            .collect();
        let rows = csv_reader.records().collect::<Result<Vec<_>, _>>()?;
        Ok(ColumnTable {
            name: name.to_string(),
            columns,
            rows,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let file = std::fs::File::open(path)
            .map_err(|source| CatalogError::Open {
                path: path.display().to_string(),
                source,
            })
            .inspect_err(as_error!("failed to open table"))?;
        Self::from_reader(&path.display().to_string(), file)
    }

    pub fn require(&self, column: &str) -> Result<usize, CatalogError> {
        self.columns
            .get(column)
            .copied()
            .ok_or_else(|| CatalogError::MissingColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    pub fn optional(&self, column: &str) -> Option<usize> {
        self.columns.get(column).copied()
    }

    pub fn str_at<'a>(&self, row: &'a csv::StringRecord, idx: usize) -> &'a str {
        row.get(idx).unwrap_or("")
    }

    pub fn f64_at(
        &self,
        row_number: usize,
        row: &csv::StringRecord,
        idx: usize,
        column: &str,
    ) -> Result<f64, CatalogError> {
        let raw = self.str_at(row, idx);
        raw.parse::<f64>().map_err(|_| CatalogError::InvalidValue {
            table: self.name.clone(),
            column: column.to_string(),
            row: row_number,
            value: raw.to_string(),
        })
    }

    /// Parse an optional numeric cell; an empty cell reads as `None`.
    pub fn opt_f64_at(
        &self,
        row_number: usize,
        row: &csv::StringRecord,
        idx: Option<usize>,
        column: &str,
    ) -> Result<Option<f64>, CatalogError> {
        match idx {
            None => Ok(None),
            Some(idx) if self.str_at(row, idx).is_empty() => Ok(None),
            Some(idx) => self.f64_at(row_number, row, idx, column).map(Some),
        }
    }
}

/// Magnitude, error and (optionally) flux for one photometric aperture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Photometry {
    pub mag: f64,
    pub mag_err: f64,
    pub flux: Option<f64>,
    pub flux_err: Option<f64>,
}

impl Photometry {
    pub fn new(mag: f64, mag_err: f64) -> Self {
        Photometry {
            mag,
            mag_err,
            flux: None,
            flux_err: None,
        }
    }

    pub fn with_flux(mut self, flux: f64, flux_err: f64) -> Self {
        self.flux = Some(flux);
        self.flux_err = Some(flux_err);
        self
    }

    /// The measurement with non-finite fluxes dropped, or `None` when the
    /// magnitude or its error is not finite.
    pub fn finite(self) -> Option<Self> {
        if !(self.mag.is_finite() && self.mag_err.is_finite()) {
            return None;
        }
        let finite_or_none = |v: Option<f64>| v.filter(|v| v.is_finite());
        Some(Photometry {
            flux: finite_or_none(self.flux),
            flux_err: finite_or_none(self.flux_err),
            ..self
        })
    }

    fn shifted(&self, zero_point: f64) -> Self {
        Photometry {
            mag: self.mag + zero_point,
            ..*self
        }
    }
}

/// One detection in one band, as delivered by the source extractor.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub ra: f64,
    pub dec: f64,
    pub x_image: f64,
    pub y_image: f64,
    pub a_image: f64,
    pub b_image: f64,
    /// Position angle in degrees.
    pub theta_image: f64,
    pub auto: Photometry,
    pub aper: Option<Photometry>,
    pub psf: Option<Photometry>,
    /// FWHM in degrees, as the extractor writes it.
    pub fwhm_world: f64,
    pub class_star: f64,
    pub flux_radius: f64,
    pub kron_radius: Option<f64>,
    pub elongation: Option<f64>,
}

impl SourceRecord {
    /// A round point-like detection at `(ra, dec)` with the given Kron
    /// photometry; shape and image fields take neutral values.
    pub fn new(ra: f64, dec: f64, auto: Photometry) -> Self {
        SourceRecord {
            ra,
            dec,
            x_image: 0.0,
            y_image: 0.0,
            a_image: 1.0,
            b_image: 1.0,
            theta_image: 0.0,
            auto,
            aper: None,
            psf: None,
            fwhm_world: 1.0 / 3600.0,
            class_star: 0.0,
            flux_radius: 0.0,
            kron_radius: None,
            elongation: None,
        }
    }

    pub fn coord(&self) -> SkyCoord {
        SkyCoord::new(self.ra, self.dec)
    }

    pub fn fwhm_arcsec(&self) -> f64 {
        self.fwhm_world * 3600.0
    }
}

/// A single-band source catalog, optionally carrying the zero-point that
/// has been added to its magnitudes.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceCatalog {
    pub name: String,
    pub records: Vec<SourceRecord>,
    zero_point: Option<f64>,
}

const SOURCE_REQUIRED: [&str; 12] = [
    "X_WORLD",
    "Y_WORLD",
    "X_IMAGE",
    "Y_IMAGE",
    "A_IMAGE",
    "B_IMAGE",
    "THETA_IMAGE",
    "MAG_AUTO",
    "MAGERR_AUTO",
    "FWHM_WORLD",
    "CLASS_STAR",
    "FLUX_RADIUS",
];

impl SourceCatalog {
    pub fn new(name: &str, records: Vec<SourceRecord>) -> Self {
        SourceCatalog {
            name: name.to_string(),
            records,
            zero_point: None,
        }
    }

    #[instrument(err)]
    pub fn from_csv_path(path: &Path) -> Result<Self, CatalogError> {
        let table = ColumnTable::from_path(path)?;
        Self::from_table(table)
    }

    pub fn from_csv_reader<R: Read>(name: &str, reader: R) -> Result<Self, CatalogError> {
        Self::from_table(ColumnTable::from_reader(name, reader)?)
    }

    fn from_table(table: ColumnTable) -> Result<Self, CatalogError> {
        let required = SOURCE_REQUIRED
            .iter()
            .map(|c| table.require(c))
            .collect::<Result<Vec<_>, _>>()?;

        let pair = |mag: &str, err: &str| match (table.optional(mag), table.optional(err)) {
            (Some(m), Some(e)) => Some((m, e)),
            (None, None) => None,
            _ => {
                info!(table = %table.name, "only one of {} / {} present, ignoring both", mag, err);
                None
            }
        };
        let auto_flux = pair("FLUX_AUTO", "FLUXERR_AUTO");
        let aper = pair("MAG_APER", "MAGERR_APER");
        let aper_flux = pair("FLUX_APER", "FLUXERR_APER");
        let psf = pair("MAG_PSF", "MAGERR_PSF");
        let kron_radius = table.optional("KRON_RADIUS");
        let elongation = table.optional("ELONGATION");

        if aper.is_none() {
            info!(table = %table.name, "aperture photometry not present, continuing with automatic photometry only");
        }

        let mut records = Vec::with_capacity(table.rows.len());
        for (n, row) in table.rows.iter().enumerate() {
            let value = |i: usize| table.f64_at(n, row, required[i], SOURCE_REQUIRED[i]);
            let photometry = |(m, e): (usize, usize),
                              flux: Option<(usize, usize)>,
                              mag_name: &str,
                              err_name: &str|
             -> Result<Photometry, CatalogError> {
                let mut phot = Photometry::new(
                    table.f64_at(n, row, m, mag_name)?,
                    table.f64_at(n, row, e, err_name)?,
                );
                if let Some((f, fe)) = flux {
                    phot.flux = table.opt_f64_at(n, row, Some(f), "FLUX")?;
                    phot.flux_err = table.opt_f64_at(n, row, Some(fe), "FLUXERR")?;
                }
                Ok(phot)
            };

            let auto = photometry((required[7], required[8]), auto_flux, "MAG_AUTO", "MAGERR_AUTO")?;
            // unmeasured apertures come out of the extractor as NaN or inf
            let aper = aper
                .map(|cols| photometry(cols, aper_flux, "MAG_APER", "MAGERR_APER"))
                .transpose()?
                .and_then(Photometry::finite);
            let psf = psf
                .map(|cols| photometry(cols, None, "MAG_PSF", "MAGERR_PSF"))
                .transpose()?
                .and_then(Photometry::finite);

            records.push(SourceRecord {
                ra: value(0)?,
                dec: value(1)?,
                x_image: value(2)?,
                y_image: value(3)?,
                a_image: value(4)?,
                b_image: value(5)?,
                theta_image: value(6)?,
                auto,
                aper,
                psf,
                fwhm_world: value(9)?,
                class_star: value(10)?,
                flux_radius: value(11)?,
                kron_radius: table.opt_f64_at(n, row, kron_radius, "KRON_RADIUS")?,
                elongation: table.opt_f64_at(n, row, elongation, "ELONGATION")?,
            });
        }
        debug!(table = %table.name, n_rows = records.len(), "loaded source catalog");
        Ok(SourceCatalog::new(&table.name, records))
    }

    /// Whether any record carries fixed-aperture photometry.
    pub fn has_aperture_photometry(&self) -> bool {
        self.records.iter().any(|r| r.aper.is_some())
    }

    pub fn has_psf_photometry(&self) -> bool {
        self.records.iter().any(|r| r.psf.is_some())
    }

    /// The zero-point already added to the magnitudes, if any.
    pub fn zero_point(&self) -> Option<f64> {
        self.zero_point
    }

    pub fn coords(&self) -> Vec<SkyCoord> {
        self.records.iter().map(SourceRecord::coord).collect()
    }

    /// A copy of the catalog with `zero_point` added to every magnitude.
    pub fn calibrated(&self, zero_point: f64) -> SourceCatalog {
        let records = self
            .records
            .iter()
            .map(|r| SourceRecord {
                auto: r.auto.shifted(zero_point),
                aper: r.aper.map(|p| p.shifted(zero_point)),
                psf: r.psf.map(|p| p.shifted(zero_point)),
                ..r.clone()
            })
            .collect();
        SourceCatalog {
            name: self.name.clone(),
            records,
            zero_point: Some(self.zero_point.unwrap_or(0.0) + zero_point),
        }
    }

    /// A copy without detections whose automatic magnitude is not finite or
    /// not below `max_mag` (extraction artifacts), sorted by right
    /// ascension. Non-finite aperture and PSF measurements are dropped from
    /// the records that remain.
    pub fn without_artifacts(&self, max_mag: f64) -> SourceCatalog {
        let mut records: Vec<SourceRecord> = self
            .records
            .iter()
            .filter_map(|r| {
                let auto = r.auto.finite().filter(|p| p.mag < max_mag)?;
                Some(SourceRecord {
                    auto,
                    aper: r.aper.and_then(Photometry::finite),
                    psf: r.psf.and_then(Photometry::finite),
                    ..r.clone()
                })
            })
            .collect();
        records.sort_by(|a, b| a.ra.total_cmp(&b.ra));
        SourceCatalog {
            name: self.name.clone(),
            records,
            zero_point: self.zero_point,
        }
    }

    /// Write the catalog in the extractor's column layout. Aperture and PSF
    /// columns are written when any record carries them; records without a
    /// measurement get `NaN` magnitudes there, which read back as missing.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), CatalogError> {
        let with_aper = self.has_aperture_photometry();
        let with_psf = self.has_psf_photometry();
        let mut header: Vec<&str> = SOURCE_REQUIRED.to_vec();
        header.extend(["FLUX_AUTO", "FLUXERR_AUTO", "KRON_RADIUS", "ELONGATION"]);
        if with_aper {
            header.extend(["MAG_APER", "MAGERR_APER", "FLUX_APER", "FLUXERR_APER"]);
        }
        if with_psf {
            header.extend(["MAG_PSF", "MAGERR_PSF"]);
        }

        let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&header)?;
        for r in &self.records {
            let mut record: Vec<String> = [
                r.ra,
                r.dec,
                r.x_image,
                r.y_image,
                r.a_image,
                r.b_image,
                r.theta_image,
                r.auto.mag,
                r.auto.mag_err,
                r.fwhm_world,
                r.class_star,
                r.flux_radius,
            ]
            .iter()
            .map(f64::to_string)
            .collect();
            record.extend([
                opt(r.auto.flux),
                opt(r.auto.flux_err),
                opt(r.kron_radius),
                opt(r.elongation),
            ]);
            if with_aper {
                let aper = r.aper.unwrap_or(Photometry::new(f64::NAN, f64::NAN));
                record.extend([
                    aper.mag.to_string(),
                    aper.mag_err.to_string(),
                    opt(aper.flux),
                    opt(aper.flux_err),
                ]);
            }
            if with_psf {
                let psf = r.psf.unwrap_or(Photometry::new(f64::NAN, f64::NAN));
                record.extend([psf.mag.to_string(), psf.mag_err.to_string()]);
            }
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One entry of the deep reference catalog used for zero-pointing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceStar {
    pub ra: f64,
    pub dec: f64,
    pub spread_model: f64,
    pub spread_err: f64,
    pub mag_auto: f64,
    pub magerr_auto: f64,
}

impl ReferenceStar {
    pub fn coord(&self) -> SkyCoord {
        SkyCoord::new(self.ra, self.dec)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceCatalog {
    pub band: Band,
    pub stars: Vec<ReferenceStar>,
}

impl ReferenceCatalog {
    #[instrument(err)]
    pub fn from_csv_path(path: &Path, band: Band) -> Result<Self, CatalogError> {
        Self::from_table(ColumnTable::from_path(path)?, band)
    }

    pub fn from_csv_reader<R: Read>(name: &str, reader: R, band: Band) -> Result<Self, CatalogError> {
        Self::from_table(ColumnTable::from_reader(name, reader)?, band)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), CatalogError> {
        let b = self.band.upper();
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record([
            "RA".to_string(),
            "DEC".to_string(),
            format!("SPREAD_MODEL_{}", b),
            format!("SPREADERR_MODEL_{}", b),
            format!("MAG_AUTO_{}", b),
            format!("MAGERR_AUTO_{}", b),
        ])?;
        for s in &self.stars {
            csv_writer.write_record(
                [s.ra, s.dec, s.spread_model, s.spread_err, s.mag_auto, s.magerr_auto]
                    .iter()
                    .map(f64::to_string),
            )?;
        }
        csv_writer.flush().map_err(csv::Error::from)?;
        Ok(())
    }

    fn from_table(table: ColumnTable, band: Band) -> Result<Self, CatalogError> {
        let b = band.upper();
        let names = [
            "RA".to_string(),
            "DEC".to_string(),
            format!("SPREAD_MODEL_{}", b),
            format!("SPREADERR_MODEL_{}", b),
            format!("MAG_AUTO_{}", b),
            format!("MAGERR_AUTO_{}", b),
        ];
        let idx = names
            .iter()
            .map(|c| table.require(c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stars = Vec::with_capacity(table.rows.len());
        for (n, row) in table.rows.iter().enumerate() {
            let v = |i: usize| table.f64_at(n, row, idx[i], &names[i]);
            stars.push(ReferenceStar {
                ra: v(0)?,
                dec: v(1)?,
                spread_model: v(2)?,
                spread_err: v(3)?,
                mag_auto: v(4)?,
                magerr_auto: v(5)?,
            });
        }
        Ok(ReferenceCatalog { band, stars })
    }
}
