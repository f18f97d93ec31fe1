//! Host-galaxy association by directional light radius (DLR).

use crate::fusion::{fused_header, row_record, FusedRow, MISSING};
use crate::redshift::RedshiftMatch;
use crate::spatial::{wrap_ra_difference, SkyCoord, SkyIndex};
use crate::utils::{enums::Band, io::write_atomic, o11y::logging::as_error};

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument};

const DEGRA: f64 = std::f64::consts::PI / 180.0;

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("failed to write host file")]
    Csv(#[from] csv::Error),
    #[error("failed to write host file")]
    Io(#[from] std::io::Error),
    #[error("candidate row {row} is not in the fused catalog ({n_rows} rows)")]
    MissingRow { row: usize, n_rows: usize },
}

/// Pixel geometry of one detector chip.
///
/// Positions within `margin` pixels of any edge are flagged, on both axes.
/// With the defaults the upper y cut is `height - margin` = 2060; older DES
/// host tables flagged only y > 2080, so their flags differ for
/// 2060 < y <= 2080.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorGeometry {
    pub width: f64,
    pub height: f64,
    pub margin: f64,
}

impl Default for DetectorGeometry {
    fn default() -> Self {
        DetectorGeometry {
            width: 4096.0,
            height: 2080.0,
            margin: 20.0,
        }
    }
}

impl DetectorGeometry {
    /// Whether an image position lies within the margin of any chip edge.
    pub fn near_edge(&self, x: f64, y: f64) -> bool {
        x < self.margin || x > self.width - self.margin || y < self.margin || y > self.height - self.margin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Arcseconds per pixel of the detection image.
    pub pixel_scale: f64,
    pub search_radius_arcsec: f64,
    /// Candidates at or beyond this DLR get a negative rank.
    pub max_dlr: f64,
    /// Above this many candidates, those at or beyond `crowded_max_dlr` are
    /// dropped.
    pub crowded_count: usize,
    pub crowded_max_dlr: f64,
    pub detector: DetectorGeometry,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            pixel_scale: 0.264,
            search_radius_arcsec: 5.0,
            max_dlr: 4.0,
            crowded_count: 5,
            crowded_max_dlr: 30.0,
            detector: DetectorGeometry::default(),
        }
    }
}

/// Directional light radius of a candidate host as seen from the target.
///
/// `a_image`, `b_image` are the host's semi-axes in pixels and `theta_image`
/// its position angle in degrees; `angsep_arcsec` is the target-host
/// separation.
pub fn dlr(
    target: &SkyCoord,
    host: &SkyCoord,
    a_image: f64,
    b_image: f64,
    theta_image: f64,
    angsep_arcsec: f64,
    pixel_scale: f64,
) -> f64 {
    let a = a_image * pixel_scale;
    let b = b_image * pixel_scale;
    let gamma = (target.dec - host.dec).atan2((target.dec * DEGRA).cos() * wrap_ra_difference(target.ra, host.ra));
    let phi = theta_image * DEGRA + gamma;
    let r_phi = a * b / ((a * phi.sin()).powi(2) + (b * phi.cos()).powi(2)).sqrt();
    angsep_arcsec / r_phi
}

/// Ordinal ranks by ascending DLR (stable, NaN last). Candidates with
/// DLR at or above `max_dlr` keep their position but get a negative rank.
pub fn rank_by_dlr(dlrs: &[f64], max_dlr: f64) -> Vec<i32> {
    let mut order: Vec<usize> = (0..dlrs.len()).collect();
    order.sort_by(|&i, &j| match (dlrs[i].is_nan(), dlrs[j].is_nan()) {
        (false, false) => dlrs[i].total_cmp(&dlrs[j]),
        (a, b) => a.cmp(&b),
    });
    let mut ranks = vec![0; dlrs.len()];
    for (position, &i) in order.iter().enumerate() {
        let rank = position as i32 + 1;
        ranks[i] = if dlrs[i] >= max_dlr { -rank } else { rank };
    }
    ranks
}

/// A transient to find a host for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transient {
    pub name: String,
    pub ra: f64,
    pub dec: f64,
    /// Host redshift measured from the transient's own spectrum, if any.
    pub spectrum_z: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostCandidate {
    /// Row of the fused catalog.
    pub row: usize,
    pub separation_arcsec: f64,
    pub dlr: f64,
    pub rank: i32,
    pub edge_flag: bool,
    pub redshift: Option<RedshiftMatch>,
}

/// Depth of one band, reported when no candidate host is found.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandLimit {
    pub band: Band,
    pub limmag: f64,
    pub limflux: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostAssociation {
    pub transient: Transient,
    /// In fused-catalog order; empty when nothing lies within the search
    /// radius.
    pub candidates: Vec<HostCandidate>,
    pub limits: Vec<BandLimit>,
}

impl HostAssociation {
    pub fn best(&self) -> Option<&HostCandidate> {
        self.candidates.iter().find(|c| c.rank == 1)
    }
}

/// Source label for redshifts taken from the transient spectrum.
pub const SPECTRUM_SOURCE: &str = "SNSPECT";

/// Find, score and rank the candidate hosts of `transient` in a fused
/// catalog.
#[instrument(skip(rows, config), fields(transient = %transient.name, n_rows = rows.len()))]
pub fn associate(transient: &Transient, rows: &[FusedRow], config: &HostConfig) -> HostAssociation {
    let target = SkyCoord::new(transient.ra, transient.dec);
    let limits = rows
        .first()
        .map(|row| {
            Band::ALL
                .iter()
                .map(|&band| BandLimit {
                    band,
                    limmag: row.band(band).limmag,
                    limflux: row.band(band).limflux,
                })
                .collect()
        })
        .unwrap_or_default();

    let index = SkyIndex::new(&rows.iter().map(FusedRow::coord).collect::<Vec<_>>());
    let mut neighbors = index.search_around(&target, config.search_radius_arcsec);
    // strict radius, then back to catalog order
    neighbors.retain(|n| n.separation_arcsec < config.search_radius_arcsec);
    neighbors.sort_by_key(|n| n.index);

    if neighbors.is_empty() {
        info!("no galaxy within {} arcsec, reporting limits only", config.search_radius_arcsec);
        return HostAssociation {
            transient: transient.clone(),
            candidates: Vec::new(),
            limits,
        };
    }

    let dlrs: Vec<f64> = neighbors
        .iter()
        .map(|n| {
            let row = &rows[n.index];
            dlr(
                &target,
                &row.coord(),
                row.a_image,
                row.b_image,
                row.theta_image,
                n.separation_arcsec,
                config.pixel_scale,
            )
        })
        .collect();
    let ranks = rank_by_dlr(&dlrs, config.max_dlr);

    let crowded = neighbors.len() > config.crowded_count;
    let mut candidates: Vec<HostCandidate> = neighbors
        .iter()
        .zip(dlrs.iter().zip(&ranks))
        .filter(|(_, (&d, _))| !crowded || d < config.crowded_max_dlr)
        .map(|(n, (&dlr, &rank))| {
            let row = &rows[n.index];
            HostCandidate {
                row: n.index,
                separation_arcsec: n.separation_arcsec,
                dlr,
                rank,
                edge_flag: config.detector.near_edge(row.x_image, row.y_image),
                redshift: row.redshift.clone(),
            }
        })
        .collect();

    apply_spectrum_fallback(transient, &mut candidates);
    info!(
        n_candidates = candidates.len(),
        best_dlr = candidates.iter().find(|c| c.rank == 1).map(|c| c.dlr),
        "associated host candidates"
    );
    HostAssociation {
        transient: transient.clone(),
        candidates,
        limits,
    }
}

/// Give the rank-1 host the spectrum redshift when it has no positive
/// redshift of its own.
pub fn apply_spectrum_fallback(transient: &Transient, candidates: &mut [HostCandidate]) {
    let Some(z) = transient.spectrum_z.filter(|z| *z > 0.0) else {
        return;
    };
    if let Some(best) = candidates.iter_mut().find(|c| c.rank == 1) {
        if !best.redshift.as_ref().is_some_and(|m| m.z > 0.0) {
            best.redshift = Some(RedshiftMatch {
                z,
                z_err: MISSING,
                flag: String::new(),
                source: SPECTRUM_SOURCE.to_string(),
            });
        }
    }
}

const HOST_COLUMNS: [&str; 5] = ["SNID", "ANGSEP", "DLR", "DLR_RANK", "EDGE_FLAG"];

/// Host association table: one line per candidate, or a single limits-only
/// line when there is none.
pub fn write_host_csv<W: std::io::Write>(
    writer: W,
    association: &HostAssociation,
    rows: &[FusedRow],
) -> Result<(), HostError> {
    let mut header: Vec<String> = HOST_COLUMNS.iter().map(|c| c.to_string()).collect();
    let fused = fused_header();
    header.extend(fused.iter().cloned());

    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer.write_record(&header)?;
    let name = association.transient.name.clone();
    if association.candidates.is_empty() {
        let mut record = vec![name.clone(), String::new(), String::new(), String::new(), String::new()];
        record.extend(fused.iter().map(|column| {
            association
                .limits
                .iter()
                .find_map(|l| {
                    if *column == format!("LIMMAG_{}", l.band) {
                        Some(l.limmag.to_string())
                    } else if *column == format!("LIMFLUX_{}", l.band) {
                        Some(l.limflux.to_string())
                    } else {
                        None
                    }
                })
                .unwrap_or_default()
        }));
        csv_writer.write_record(&record)?;
    }
    for c in &association.candidates {
        let mut row = rows
            .get(c.row)
            .ok_or(HostError::MissingRow {
                row: c.row,
                n_rows: rows.len(),
            })?
            .clone();
        row.redshift = c.redshift.clone();
        let mut record = vec![
            name.clone(),
            c.separation_arcsec.to_string(),
            c.dlr.to_string(),
            c.rank.to_string(),
            u8::from(c.edge_flag).to_string(),
        ];
        record.extend(row_record(&row));
        csv_writer.write_record(&record)?;
    }
    csv_writer.flush()?;
    Ok(())
}

#[instrument(skip(association, rows), fields(transient = %association.transient.name), err)]
pub fn write_host_file(path: &Path, association: &HostAssociation, rows: &[FusedRow]) -> Result<(), HostError> {
    let mut buffer = Vec::new();
    write_host_csv(&mut buffer, association, rows)?;
    write_atomic(path, &buffer).inspect_err(as_error!("failed to write host file"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_flag() {
        let geometry = DetectorGeometry::default();
        assert!(geometry.near_edge(10.0, 1000.0));
        assert!(geometry.near_edge(4080.0, 1000.0));
        assert!(geometry.near_edge(2000.0, 2070.0));
        assert!(!geometry.near_edge(2000.0, 1000.0));
        assert!(!geometry.near_edge(20.0, 20.0));
        assert!(!geometry.near_edge(2000.0, 2060.0));
        assert!(geometry.near_edge(2000.0, 2060.5));
        assert!(geometry.near_edge(2000.0, 2080.0));
    }

    #[test]
    fn test_rank_nan_last_and_negative() {
        let ranks = rank_by_dlr(&[5.0, f64::NAN, 0.5, 2.0, 0.5], 4.0);
        assert_eq!(ranks, vec![-4, 5, 1, 3, 2]);
    }

    #[test]
    fn test_dlr_along_axes() {
        let target = SkyCoord::new(10.0, 0.0);
        // host due east of the target: offset along RA, theta 0 puts the
        // major axis on the offset
        let host = SkyCoord::new(10.0 - 1.0 / 3600.0, 0.0);
        let d = dlr(&target, &host, 10.0, 5.0, 0.0, 1.0, 0.2);
        assert!((d - 0.5).abs() < 1e-9);
        let d = dlr(&target, &host, 10.0, 5.0, 90.0, 1.0, 0.2);
        assert!((d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_spectrum_fallback_only_without_positive_z() {
        let transient = Transient {
            name: "SN1".to_string(),
            ra: 0.0,
            dec: 0.0,
            spectrum_z: Some(0.12),
        };
        let candidate = |rank: i32, z: Option<f64>| HostCandidate {
            row: 0,
            separation_arcsec: 0.5,
            dlr: 0.5,
            rank,
            edge_flag: false,
            redshift: z.map(|z| RedshiftMatch {
                z,
                z_err: 0.001,
                flag: "4".to_string(),
                source: "DES_AAOmega".to_string(),
            }),
        };
        let mut candidates = vec![candidate(2, None), candidate(1, Some(-9.99))];
        apply_spectrum_fallback(&transient, &mut candidates);
        assert_eq!(candidates[0].redshift, None);
        let z = candidates[1].redshift.as_ref().unwrap();
        assert_eq!(z.z, 0.12);
        assert_eq!(z.z_err, -9999.0);
        assert_eq!(z.source, SPECTRUM_SOURCE);

        let mut candidates = vec![candidate(1, Some(0.3))];
        apply_spectrum_fallback(&transient, &mut candidates);
        assert_eq!(candidates[0].redshift.as_ref().unwrap().z, 0.3);
    }
}
