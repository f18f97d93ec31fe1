use stackphot::calibration::{read_quality_file, CalibrationQuality};
use stackphot::conf::AppConfig;
use stackphot::fusion::read_fused_catalog;
use stackphot::limits::read_result_header;
use stackphot::pipeline::{read_manifest, run_batch, ChipKey, UnitKey};
use stackphot::frames::MinusYear;
use stackphot::spatial::SkyCoord;
use stackphot::utils::enums::Band;
use stackphot::utils::testing::synthetic_field;

use std::fs::File;
use std::io::Write;
use std::path::Path;

const N_STARS: usize = 36;
const N_GALAXIES: usize = 900;

fn zero_point(band: Band) -> f64 {
    match band {
        Band::G => 31.2,
        Band::R => 31.5,
        Band::I => 31.4,
        Band::Z => 31.0,
    }
}

/// Write the catalogs of one chip and return the manifest lines for them.
fn write_chip(dir: &Path, chip: u32) -> Vec<String> {
    Band::ALL
        .iter()
        .map(|&band| {
            let field = synthetic_field(band, SkyCoord::new(52.6, -27.9), zero_point(band), N_STARS, N_GALAXIES, 24.0);
            let catalog = format!("{}_{}.csv", band, chip);
            let reference = format!("{}_{}_ref.csv", band, chip);
            field.raw.write_csv(File::create(dir.join(&catalog)).unwrap()).unwrap();
            field
                .reference
                .write_csv(File::create(dir.join(&reference)).unwrap())
                .unwrap();
            format!("SN-C3,1,{},{},{},{},0.0,3.5,600", band, chip, catalog, reference)
        })
        .collect()
}

#[test]
fn test_batch_processes_and_fuses_chip() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    std::fs::create_dir_all(&inputs).unwrap();

    let mut lines = vec!["FIELD,MY,BAND,CHIP,CATALOG,REFERENCE,SKY_MEAN,SKY_STD,EXPTIME".to_string()];
    lines.extend(write_chip(&inputs, 7));
    // a unit of another chip whose catalog is missing
    lines.push("SN-C3,1,g,8,absent.csv,absent_ref.csv,0.0,3.5,600".to_string());
    let manifest = inputs.join("manifest.csv");
    let mut f = File::create(&manifest).unwrap();
    writeln!(f, "{}", lines.join("\n")).unwrap();

    let config = AppConfig::default();
    let units = read_manifest(&manifest, config.limits.pixel_scale).unwrap();
    assert_eq!(units.len(), 5);
    assert_eq!(units[0].catalog, inputs.join("g_7.csv"));

    let root = dir.path().join("out");
    let summary = run_batch(&units, None, &config, &root);

    assert_eq!(summary.failed.len(), 1, "{:?}", summary.failed);
    assert_eq!(summary.failed[0].unit, "MY1_SN-C3_g_8");
    assert_eq!(summary.succeeded.len(), 5);
    assert_eq!(summary.succeeded[4], "MY1_SN-C3_7_fused");
    assert!(summary.degraded.is_empty());

    for band in Band::ALL {
        let key = UnitKey {
            field: "SN-C3".to_string(),
            minus_year: MinusYear::Season(1),
            band,
            chip: 7,
        };
        assert!(key.quality_path(&root).exists());
        assert!(key.region_path(&root).exists());
        let header = read_result_header(&key.result_path(&root)).unwrap();
        assert!((header.zero_point - zero_point(band)).abs() < 1e-6);
        assert_eq!(header.band, band);
        assert_eq!(header.quality, CalibrationQuality::Nominal);
    }

    let chip = ChipKey {
        field: "SN-C3".to_string(),
        minus_year: MinusYear::Season(1),
        chip: 7,
    };
    let rows = read_fused_catalog(&chip.fused_path(&root)).unwrap();
    assert_eq!(rows.len(), N_STARS + N_GALAXIES);
    for row in &rows {
        assert_eq!(row.meta.chip, 7);
        assert!(Band::ALL.iter().all(|&b| row.band(b).detected));
        assert!(row.redshift.is_none());
    }
}

#[test]
fn test_manifest_requires_noise() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("manifest.csv");
    std::fs::write(&manifest, "FIELD,MY,BAND,CHIP,CATALOG,REFERENCE\nSN-C3,1,g,7,g.csv,g_ref.csv\n").unwrap();
    assert!(read_manifest(&manifest, 0.27).is_err());

    std::fs::write(&manifest, "FIELD,MY,BAND,CHIP,CATALOG,REFERENCE,PIXELS\nSN-C3,none,y,7,g.csv,g_ref.csv,px.txt\n")
        .unwrap();
    assert!(read_manifest(&manifest, 0.27).is_err());
}

#[test]
fn test_sparse_reference_marks_units_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = dir.path().join("inputs");
    std::fs::create_dir_all(&inputs).unwrap();
    let mut lines = vec!["FIELD,MY,BAND,CHIP,CATALOG,REFERENCE,SKY_MEAN,SKY_STD,EXPTIME".to_string()];
    lines.extend(write_chip(&inputs, 3));
    let manifest = inputs.join("manifest.csv");
    std::fs::write(&manifest, lines.join("\n")).unwrap();

    let mut config = AppConfig::default();
    config.calibration.min_matches = N_STARS + 1;
    let units = read_manifest(&manifest, config.limits.pixel_scale).unwrap();
    let root = dir.path().join("out");
    let summary = run_batch(&units, None, &config, &root);

    assert!(summary.failed.is_empty(), "{:?}", summary.failed);
    assert_eq!(summary.degraded.len(), 4);
    assert!(summary.degraded.iter().all(|unit| unit.starts_with("MY1_SN-C3_")));

    for band in Band::ALL {
        let key = UnitKey {
            field: "SN-C3".to_string(),
            minus_year: MinusYear::Season(1),
            band,
            chip: 3,
        };
        let values = read_quality_file(&key.quality_path(&root)).unwrap();
        assert_eq!(values.quality, Some(CalibrationQuality::LowMatchCount));
        let header = read_result_header(&key.result_path(&root)).unwrap();
        assert_eq!(header.quality, CalibrationQuality::LowMatchCount);
    }

    let chip = ChipKey {
        field: "SN-C3".to_string(),
        minus_year: MinusYear::Season(1),
        chip: 3,
    };
    let rows = read_fused_catalog(&chip.fused_path(&root)).unwrap();
    assert!(rows
        .iter()
        .all(|r| Band::ALL.iter().all(|&b| r.band(b).zp_quality == CalibrationQuality::LowMatchCount)));
}
