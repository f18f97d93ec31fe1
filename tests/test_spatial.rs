use rand::Rng;
use stackphot::spatial::{great_circle_distance, match_to_catalog, search_around, SkyCoord, SkyIndex};

fn random_coords(rng: &mut impl Rng, n: usize, ra: (f64, f64), dec: (f64, f64)) -> Vec<SkyCoord> {
    (0..n)
        .map(|_| SkyCoord::new(rng.random_range(ra.0..ra.1), rng.random_range(dec.0..dec.1)))
        .collect()
}

#[test]
fn test_match_across_ra_wrap() {
    let catalog = vec![SkyCoord::new(0.0001, 0.0), SkyCoord::new(180.0, 0.0)];
    let points = vec![SkyCoord::new(359.9999, 0.0)];
    let matches = match_to_catalog(&points, &catalog);
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].index, 0);
    assert!((matches[0].separation_arcsec - 0.72).abs() < 1e-6);

    // same separation seen from the other side
    let reverse = match_to_catalog(&[catalog[0]], &points);
    assert!((reverse[0].separation_arcsec - matches[0].separation_arcsec).abs() < 1e-9);
}

#[test]
fn test_match_near_pole() {
    // 1" from the pole on opposite meridians
    let a = SkyCoord::new(10.0, 90.0 - 1.0 / 3600.0);
    let b = SkyCoord::new(190.0, 90.0 - 1.0 / 3600.0);
    let far = SkyCoord::new(10.0, 89.99);
    let matches = match_to_catalog(&[a], &[far, b]);
    assert_eq!(matches[0].index, 1);
    assert!((matches[0].separation_arcsec - 2.0).abs() < 1e-6);
}

#[test]
fn test_empty_inputs() {
    let some = vec![SkyCoord::new(1.0, 1.0)];
    assert!(match_to_catalog(&[], &some).is_empty());
    assert!(match_to_catalog(&some, &[]).is_empty());
    assert!(search_around(&some[0], &[], 10.0).is_empty());
}

#[test]
fn test_search_around_ordering() {
    let center = SkyCoord::new(150.0, 2.0);
    let near = SkyCoord::new(150.0, 2.0 - 1.0 / 3600.0);
    let catalog = vec![
        SkyCoord::new(150.0, 2.0 + 2.0 / 3600.0),
        near,
        near,
        SkyCoord::new(150.0, 2.0 + 10.0 / 3600.0),
    ];
    let found = search_around(&center, &catalog, 2.5);
    let indices: Vec<usize> = found.iter().map(|n| n.index).collect();
    // equal separations keep catalog order
    assert_eq!(indices, vec![1, 2, 0]);
    assert!(found.windows(2).all(|w| w[0].separation_arcsec <= w[1].separation_arcsec));
}

#[test]
fn test_nearest_matches_brute_force() {
    let mut rng = rand::rng();
    // straddle RA = 0 so the wrap is exercised
    let mut catalog = random_coords(&mut rng, 2000, (0.0, 0.5), (-30.5, -29.5));
    catalog.extend(random_coords(&mut rng, 2000, (359.5, 360.0), (-30.5, -29.5)));
    let points = random_coords(&mut rng, 300, (0.0, 360.0), (-31.0, -29.0));

    let index = SkyIndex::new(&catalog);
    for p in &points {
        let found = index.nearest(p).unwrap();
        let best = catalog
            .iter()
            .map(|c| p.separation_arcsec(c))
            .fold(f64::INFINITY, f64::min);
        assert!((found.separation_arcsec - best).abs() < 1e-6);
    }
}

#[test]
fn test_search_around_matches_brute_force() {
    let mut rng = rand::rng();
    let catalog = random_coords(&mut rng, 3000, (149.9, 150.1), (1.9, 2.1));
    let index = SkyIndex::new(&catalog);
    for _ in 0..50 {
        let p = SkyCoord::new(rng.random_range(149.9..150.1), rng.random_range(1.9..2.1));
        let radius = rng.random_range(1.0..30.0);
        let found: Vec<usize> = index.search_around(&p, radius).iter().map(|n| n.index).collect();
        let mut expected: Vec<usize> = (0..catalog.len())
            .filter(|&i| great_circle_distance(p.ra, p.dec, catalog[i].ra, catalog[i].dec) * 3600.0 <= radius)
            .collect();
        let mut sorted_found = found.clone();
        sorted_found.sort_unstable();
        expected.sort_unstable();
        assert_eq!(sorted_found, expected);
    }
}
