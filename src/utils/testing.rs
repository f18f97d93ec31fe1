// Utility for unit and integration tests

use crate::catalog::{Photometry, ReferenceCatalog, ReferenceStar, SourceCatalog, SourceRecord};
use crate::spatial::SkyCoord;
use crate::utils::enums::Band;

pub const TEST_CONFIG_FILE: &str = "tests/data/config.test.yaml";

const GOLDEN: f64 = 0.618_033_988_749_894_9;

/// The k-th point of the golden-ratio sequence, evenly covering [0, 1).
pub fn quasi_uniform(k: usize) -> f64 {
    (k as f64 * GOLDEN).fract()
}

/// Triangular distribution rising from `peak - 6` to `peak` and falling to
/// `peak + 1`, evaluated at quantile `u`.
fn triangular_mag(u: f64, peak: f64) -> f64 {
    let (a, b, c) = (peak - 6.0, peak + 1.0, peak);
    if u < (c - a) / (b - a) {
        a + (u * (b - a) * (c - a)).sqrt()
    } else {
        b - ((1.0 - u) * (b - a) * (b - c)).sqrt()
    }
}

/// A raw extractor catalog with its reference catalog, built so the true
/// zero-point and magnitude-distribution peak are known.
pub struct SyntheticField {
    pub raw: SourceCatalog,
    pub reference: ReferenceCatalog,
    pub zero_point: f64,
    pub peak_mag: f64,
}

/// Stars on a 10" grid starting at `center`, detected 0.3" north of their
/// reference position, and galaxies on a 3" grid well south of them whose
/// calibrated magnitudes peak at `peak_mag`.
pub fn synthetic_field(
    band: Band,
    center: SkyCoord,
    zero_point: f64,
    n_stars: usize,
    n_galaxies: usize,
    peak_mag: f64,
) -> SyntheticField {
    let cos_dec = center.dec.to_radians().cos();
    let mut records = Vec::with_capacity(n_stars + n_galaxies);
    let mut stars = Vec::with_capacity(n_stars);

    let per_row = ((n_stars as f64).sqrt().ceil() as usize).max(1);
    let step = 10.0 / 3600.0;
    for k in 0..n_stars {
        let (i, j) = (k % per_row, k / per_row);
        let ra = center.ra + i as f64 * step / cos_dec;
        let dec = center.dec + j as f64 * step;
        let mag = 20.0 + 3.0 * quasi_uniform(k);
        stars.push(ReferenceStar {
            ra,
            dec,
            spread_model: 0.0,
            spread_err: 0.0005,
            mag_auto: mag,
            magerr_auto: 0.01,
        });
        let mut r = SourceRecord::new(ra, dec + 0.3 / 3600.0, Photometry::new(mag - zero_point, 0.01));
        r.fwhm_world = 1.1 / 3600.0;
        r.class_star = 0.98;
        r.x_image = 50.0 + i as f64 * 37.0;
        r.y_image = 50.0 + j as f64 * 37.0;
        records.push(r);
    }

    let per_row = ((n_galaxies as f64).sqrt().ceil() as usize).max(1);
    let step = 3.0 / 3600.0;
    let dec0 = center.dec - 0.05 - per_row as f64 * step;
    for k in 0..n_galaxies {
        let (i, j) = (k % per_row, k / per_row);
        let mag = triangular_mag(quasi_uniform(n_stars + k), peak_mag);
        let err = 0.1 * 10f64.powf(0.4 * (mag - peak_mag));
        let mut r = SourceRecord::new(
            center.ra + i as f64 * step / cos_dec,
            dec0 + j as f64 * step,
            Photometry::new(mag - zero_point, err),
        );
        r.a_image = 3.0;
        r.b_image = 2.0;
        r.theta_image = 45.0;
        r.fwhm_world = 1.6 / 3600.0;
        r.class_star = 0.05;
        r.x_image = 100.0 + i as f64 * 11.0;
        r.y_image = 100.0 + j as f64 * 11.0;
        records.push(r);
    }

    SyntheticField {
        raw: SourceCatalog::new(&format!("synthetic_{}", band), records),
        reference: ReferenceCatalog { band, stars },
        zero_point,
        peak_mag,
    }
}
