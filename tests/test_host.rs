use rand::seq::SliceRandom;
use rand::Rng;
use stackphot::calibration::CalibrationQuality;
use stackphot::catalog::{Photometry, SourceCatalog, SourceRecord};
use stackphot::fusion::{fuse, BandCatalog, FusedRow, FusionConfig, UnitMeta};
use stackphot::host::{
    associate, dlr, rank_by_dlr, write_host_csv, HostCandidate, HostConfig, HostError, Transient, SPECTRUM_SOURCE,
};
use stackphot::spatial::SkyCoord;
use stackphot::utils::enums::Band;

const DLR_FIXTURE: f64 = 0.867912063438606;

#[test]
fn test_dlr_regression_fixture() {
    let target = SkyCoord::new(150.0, 2.0);
    let host = SkyCoord::new(150.0, 2.0 - 1.5 / 3600.0);
    let value = dlr(&target, &host, 10.0, 6.0, 30.0, 1.5, 0.264);
    assert!((value - DLR_FIXTURE).abs() < 1e-9, "dlr = {}", value);
}

#[test]
fn test_ranks_are_a_bijection() {
    let mut rng = rand::rng();
    for _ in 0..20 {
        let n = rng.random_range(1..40);
        // distinct values straddling the cut
        let mut dlrs: Vec<f64> = (0..n).map(|k| 0.25 * k as f64 + 0.1).collect();
        dlrs.shuffle(&mut rng);
        let ranks = rank_by_dlr(&dlrs, 4.0);

        let mut absolute: Vec<i32> = ranks.iter().map(|r| r.abs()).collect();
        absolute.sort_unstable();
        assert_eq!(absolute, (1..=n as i32).collect::<Vec<_>>());
        for (d, r) in dlrs.iter().zip(&ranks) {
            assert_eq!(*r < 0, *d >= 4.0, "dlr {} rank {}", d, r);
        }
        // smaller DLR never ranks behind a larger one
        for i in 0..n {
            for j in 0..n {
                if dlrs[i] < dlrs[j] {
                    assert!(ranks[i].abs() < ranks[j].abs());
                }
            }
        }
    }
}

fn galaxy(ra: f64, dec: f64, a: f64, b: f64, theta: f64, x: f64) -> SourceRecord {
    let mut r = SourceRecord::new(ra, dec, Photometry::new(22.0, 0.05));
    r.a_image = a;
    r.b_image = b;
    r.theta_image = theta;
    r.x_image = x;
    r.y_image = 1000.0;
    r
}

fn fused_rows(records: Vec<SourceRecord>) -> Vec<FusedRow> {
    let bands = Band::ALL
        .iter()
        .map(|&band| BandCatalog {
            band,
            catalog: SourceCatalog::new(band.as_str(), records.clone()),
            zero_point: 31.0,
            zero_point_err: 0.01,
            quality: CalibrationQuality::Nominal,
            limiting_mag: 24.0,
        })
        .collect();
    let meta = UnitMeta {
        field: "SN-X1".to_string(),
        minus_year: "1".to_string(),
        chip: 12,
    };
    fuse(&meta, bands, &FusionConfig::default()).unwrap()
}

#[test]
fn test_associate_ranks_and_flags_candidates() {
    let rows = fused_rows(vec![
        galaxy(150.0, 2.0 - 1.5 / 3600.0, 10.0, 6.0, 30.0, 2000.0),
        galaxy(150.0 + 3.0 / 3600.0, 2.0, 2.0, 2.0, 0.0, 10.0),
        galaxy(150.0, 2.0 + 8.0 / 3600.0, 20.0, 20.0, 0.0, 2000.0),
    ]);
    let transient = Transient {
        name: "DES15X1abc".to_string(),
        ra: 150.0,
        dec: 2.0,
        spectrum_z: Some(0.25),
    };
    let association = associate(&transient, &rows, &HostConfig::default());
    assert_eq!(association.candidates.len(), 2);

    let best = association.best().unwrap();
    assert!((best.dlr - DLR_FIXTURE).abs() < 1e-6);
    assert!((best.separation_arcsec - 1.5).abs() < 1e-6);
    assert!(!best.edge_flag);
    // no catalog redshift, so the spectrum one is used
    let z = best.redshift.as_ref().unwrap();
    assert_eq!(z.z, 0.25);
    assert_eq!(z.source, SPECTRUM_SOURCE);

    let other = association.candidates.iter().find(|c| c.rank != 1).unwrap();
    assert_eq!(other.rank, -2);
    assert!(other.dlr >= 4.0);
    assert!(other.edge_flag);
    assert!(other.redshift.is_none());

    let mut out = Vec::new();
    write_host_csv(&mut out, &association, &rows).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("SNID,ANGSEP,DLR,DLR_RANK,EDGE_FLAG,X_WORLD"));
    assert!(lines.iter().skip(1).all(|l| l.starts_with("DES15X1abc,")));
}

#[test]
fn test_no_candidates_reports_limits() {
    let rows = fused_rows(vec![galaxy(150.0, 2.0 + 8.0 / 3600.0, 5.0, 5.0, 0.0, 2000.0)]);
    let transient = Transient {
        name: "DES15X1xyz".to_string(),
        ra: 150.0,
        dec: 2.0,
        spectrum_z: None,
    };
    let association = associate(&transient, &rows, &HostConfig::default());
    assert!(association.candidates.is_empty());
    assert!(association.best().is_none());
    assert_eq!(association.limits.len(), 4);
    assert!(association.limits.iter().all(|l| l.limmag == 24.0));

    let mut out = Vec::new();
    write_host_csv(&mut out, &association, &rows).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[1].starts_with("DES15X1xyz,,,,,"));
    assert!(lines[1].contains(",24,"));
}

/// Five round galaxies within 2 DLR of the target plus one compact source
/// far beyond the crowded cut.
fn crowded_field() -> (Transient, Vec<FusedRow>) {
    let arcsec = 1.0 / 3600.0;
    let mut records: Vec<SourceRecord> = [1.0, -1.5, 2.5, -3.0, 4.0]
        .iter()
        .map(|&offset| galaxy(150.0, 2.0 + offset * arcsec, 10.0, 10.0, 0.0, 2000.0))
        .collect();
    records.push(galaxy(150.0, 2.0 - 4.5 * arcsec, 0.1, 0.1, 0.0, 2000.0));
    let transient = Transient {
        name: "DES16C3crowd".to_string(),
        ra: 150.0,
        dec: 2.0,
        spectrum_z: None,
    };
    (transient, fused_rows(records))
}

#[test]
fn test_crowded_field_drops_distant_candidates() {
    let (transient, rows) = crowded_field();
    let config = HostConfig::default();

    let uncrowded = associate(
        &transient,
        &rows,
        &HostConfig {
            crowded_count: 6,
            ..config
        },
    );
    assert_eq!(uncrowded.candidates.len(), 6);
    let compact = uncrowded.candidates.iter().find(|c| c.dlr >= 30.0).unwrap();
    assert_eq!(compact.rank, -6);

    let crowded = associate(&transient, &rows, &config);
    assert_eq!(crowded.candidates.len(), 5);
    assert!(crowded.candidates.iter().all(|c| c.dlr < config.crowded_max_dlr));
    assert!(crowded.candidates.iter().all(|c| c.row != compact.row));
    // survivors keep the ranks they had among all six
    for c in &crowded.candidates {
        let full = uncrowded.candidates.iter().find(|u| u.row == c.row).unwrap();
        assert_eq!(c.rank, full.rank);
    }
    let mut ranks: Vec<i32> = crowded.candidates.iter().map(|c| c.rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_host_file_rejects_unknown_row() {
    let (transient, rows) = crowded_field();
    let mut association = associate(&transient, &rows, &HostConfig::default());
    association.candidates.push(HostCandidate {
        row: rows.len(),
        separation_arcsec: 1.0,
        dlr: 1.0,
        rank: 7,
        edge_flag: false,
        redshift: None,
    });
    let mut out = Vec::new();
    let err = write_host_csv(&mut out, &association, &rows).unwrap_err();
    assert!(matches!(err, HostError::MissingRow { row, n_rows } if row == rows.len() && n_rows == 6));
}
