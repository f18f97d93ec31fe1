//! Positional matching on the celestial sphere.
//!
//! Coordinates are embedded as unit vectors, so matching is done on chord
//! lengths in 3-D and RA wraparound or proximity to the poles needs no
//! special handling. Reported separations use the great-circle distance.

pub mod kdtree;

use kdtree::KdTree;

const DEGRA: f64 = std::f64::consts::PI / 180.0;
const ARCSEC_PER_DEG: f64 = 3600.0;

/// Great-circle distance in degrees, in the Vincenty form which stays
/// accurate at both tiny and antipodal separations.
pub fn great_circle_distance(ra1_deg: f64, dec1_deg: f64, ra2_deg: f64, dec2_deg: f64) -> f64 {
    let ra1 = ra1_deg * DEGRA;
    let dec1 = dec1_deg * DEGRA;
    let ra2 = ra2_deg * DEGRA;
    let dec2 = dec2_deg * DEGRA;
    let delta_ra = (ra2 - ra1).abs();
    let distance = ((dec2.cos() * delta_ra.sin()).powi(2)
        + (dec1.cos() * dec2.sin() - dec1.sin() * dec2.cos() * delta_ra.cos()).powi(2))
    .sqrt()
    .atan2(dec1.sin() * dec2.sin() + dec1.cos() * dec2.cos() * delta_ra.cos());
    distance / DEGRA
}

/// Signed RA difference `ra1 - ra2` wrapped into `(-180, 180]` degrees.
pub fn wrap_ra_difference(ra1_deg: f64, ra2_deg: f64) -> f64 {
    let d = (ra1_deg - ra2_deg).rem_euclid(360.0);
    if d > 180.0 {
        d - 360.0
    } else {
        d
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyCoord {
    pub ra: f64,
    pub dec: f64,
}

impl SkyCoord {
    pub fn new(ra: f64, dec: f64) -> Self {
        SkyCoord { ra, dec }
    }

    pub fn unit_vector(&self) -> [f64; 3] {
        let (ra, dec) = (self.ra * DEGRA, self.dec * DEGRA);
        [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
    }

    pub fn separation_arcsec(&self, other: &SkyCoord) -> f64 {
        great_circle_distance(self.ra, self.dec, other.ra, other.dec) * ARCSEC_PER_DEG
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestMatch {
    pub index: usize,
    pub separation_arcsec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub separation_arcsec: f64,
}

/// Squared chord length subtending `radius_arcsec`.
fn chord_sq(radius_arcsec: f64) -> f64 {
    let theta = (radius_arcsec / ARCSEC_PER_DEG * DEGRA).min(std::f64::consts::PI);
    (2.0 * (theta / 2.0).sin()).powi(2)
}

/// A searchable set of sky positions.
#[derive(Debug, Clone)]
pub struct SkyIndex {
    coords: Vec<SkyCoord>,
    tree: KdTree,
}

impl SkyIndex {
    pub fn new(coords: &[SkyCoord]) -> Self {
        let vectors: Vec<[f64; 3]> = coords.iter().map(SkyCoord::unit_vector).collect();
        SkyIndex {
            coords: coords.to_vec(),
            tree: KdTree::build(&vectors),
        }
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coords(&self) -> &[SkyCoord] {
        &self.coords
    }

    /// Closest indexed position to `point`; ties go to the lowest index.
    pub fn nearest(&self, point: &SkyCoord) -> Option<NearestMatch> {
        self.tree.nearest(&point.unit_vector()).map(|hit| NearestMatch {
            index: hit.index,
            separation_arcsec: point.separation_arcsec(&self.coords[hit.index]),
        })
    }

    /// Every indexed position within `radius_arcsec` of `point`, ordered by
    /// separation then index.
    pub fn search_around(&self, point: &SkyCoord, radius_arcsec: f64) -> Vec<Neighbor> {
        if radius_arcsec < 0.0 || radius_arcsec.is_nan() {
            return Vec::new();
        }
        // pad the chord so boundary members survive rounding, then cut exactly
        let radius_sq = chord_sq(radius_arcsec) * (1.0 + 1e-9) + 1e-24;
        let mut neighbors: Vec<Neighbor> = self
            .tree
            .within(&point.unit_vector(), radius_sq)
            .into_iter()
            .map(|hit| Neighbor {
                index: hit.index,
                separation_arcsec: point.separation_arcsec(&self.coords[hit.index]),
            })
            .filter(|n| n.separation_arcsec <= radius_arcsec)
            .collect();
        neighbors.sort_by(|a, b| {
            a.separation_arcsec
                .total_cmp(&b.separation_arcsec)
                .then(a.index.cmp(&b.index))
        });
        neighbors
    }
}

/// Nearest neighbour in `catalog` for every position of `points`.
///
/// Returns one entry per element of `points`, or nothing if either side is
/// empty.
pub fn match_to_catalog(points: &[SkyCoord], catalog: &[SkyCoord]) -> Vec<NearestMatch> {
    if points.is_empty() || catalog.is_empty() {
        return Vec::new();
    }
    let index = SkyIndex::new(catalog);
    points.iter().filter_map(|p| index.nearest(p)).collect()
}

/// All members of `catalog` within `radius_arcsec` of `point`.
pub fn search_around(point: &SkyCoord, catalog: &[SkyCoord], radius_arcsec: f64) -> Vec<Neighbor> {
    SkyIndex::new(catalog).search_around(point, radius_arcsec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_great_circle_distance() {
        assert!((great_circle_distance(0.0, 0.0, 90.0, 0.0) - 90.0).abs() < 1e-12);
        assert!((great_circle_distance(0.0, 0.0, 180.0, 0.0) - 180.0).abs() < 1e-12);
        assert!((great_circle_distance(10.0, 89.0, 190.0, 89.0) - 2.0).abs() < 1e-10);
        let tiny = great_circle_distance(150.0, 2.0, 150.0, 2.0 + 1e-3 / 3600.0) * 3600.0;
        assert!((tiny - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn test_wrap_ra_difference() {
        assert!((wrap_ra_difference(359.9, 0.1) + 0.2).abs() < 1e-12);
        assert!((wrap_ra_difference(0.1, 359.9) - 0.2).abs() < 1e-12);
        assert_eq!(wrap_ra_difference(10.0, 10.0), 0.0);
    }

    #[test]
    fn test_match_across_ra_zero() {
        let a = [SkyCoord::new(359.9999, 0.0)];
        let b = [SkyCoord::new(50.0, 0.0), SkyCoord::new(0.0001, 0.0)];
        let m = match_to_catalog(&a, &b);
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].index, 1);
        assert!((m[0].separation_arcsec - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_match_near_pole() {
        let a = [SkyCoord::new(0.0, 89.9999)];
        let b = [SkyCoord::new(180.0, 89.9999), SkyCoord::new(0.0, 80.0)];
        let m = match_to_catalog(&a, &b);
        assert_eq!(m[0].index, 0);
        assert!((m[0].separation_arcsec - 0.72).abs() < 1e-6);
    }

    #[test]
    fn test_empty_inputs() {
        let a = [SkyCoord::new(1.0, 1.0)];
        assert!(match_to_catalog(&a, &[]).is_empty());
        assert!(match_to_catalog(&[], &a).is_empty());
        assert!(search_around(&a[0], &[], 10.0).is_empty());
    }

    #[test]
    fn test_search_around_sorted() {
        let centre = SkyCoord::new(30.0, -20.0);
        let catalog: Vec<SkyCoord> = (0..10)
            .map(|i| SkyCoord::new(30.0, -20.0 + (10 - i) as f64 / 3600.0))
            .collect();
        let found = search_around(&centre, &catalog, 5.5);
        let idx: Vec<usize> = found.iter().map(|n| n.index).collect();
        assert_eq!(idx, vec![9, 8, 7, 6, 5]);
        assert!(found.iter().all(|n| n.separation_arcsec <= 5.5));
    }
}
