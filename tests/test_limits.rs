use stackphot::calibration::{calibrate, CalibrationConfig};
use stackphot::catalog::{Photometry, SourceRecord};
use stackphot::limits::{
    error_threshold, estimate, read_result_header, sky_limit, write_region_file, write_result_file, ImageNoise,
    LimitKind, LimitsConfig, ResultHeader,
};
use stackphot::spatial::SkyCoord;
use stackphot::utils::enums::Band;
use stackphot::utils::testing::synthetic_field;

const PIXEL_SCALE: f64 = 0.27;

/// Sky noise whose 5-sigma limit lands on `target` for the given PSF and
/// zero-point.
fn noise_for_limit(target: f64, psf_fwhm: f64, zero_point: f64) -> ImageNoise {
    let skyflux = 10f64.powf((zero_point - target) / 2.5) / 5.0;
    let area = std::f64::consts::PI * (psf_fwhm / PIXEL_SCALE).powi(2);
    ImageNoise {
        sky_mean: 0.0,
        sky_std: skyflux / area.sqrt(),
        exptime: 900.0,
        pixel_scale: PIXEL_SCALE,
    }
}

#[test]
fn test_limits_lie_within_observed_range() {
    let mut field = synthetic_field(Band::R, SkyCoord::new(9.5, -43.9), 31.5, 100, 3000, 24.2);
    // a few detections sitting exactly at the 10-sigma error
    let threshold = error_threshold(10.0);
    for k in 0..5 {
        let ra = 9.5 + k as f64 * 0.001;
        field.raw.records.push(SourceRecord::new(
            ra,
            -44.2,
            Photometry::new(24.3 + 0.01 * k as f64 - 31.5, threshold),
        ));
    }

    let calibration = calibrate(&field.raw, &field.reference, &CalibrationConfig::default());
    let calibrated = field.raw.calibrated(calibration.zero_point);
    let noise = noise_for_limit(24.0, calibration.psf_fwhm, calibration.zero_point);
    let config = LimitsConfig::default();
    let limits = estimate(
        &calibrated,
        &noise,
        calibration.psf_fwhm,
        calibration.zero_point,
        &config,
    )
    .unwrap();

    let mags: Vec<f64> = calibrated.records.iter().map(|r| r.auto.mag).collect();
    let brightest = mags.iter().copied().fold(f64::INFINITY, f64::min);
    let faintest = mags.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let error_limit = limits.error_threshold.expect("detections at the error threshold");
    for value in [limits.kron, error_limit, limits.sky, limits.mean()] {
        assert!(value >= brightest && value <= faintest, "{} outside [{}, {}]", value, brightest, faintest);
        assert!(value <= faintest + 2.0);
    }
    assert!((limits.kron - field.peak_mag).abs() < 0.5, "kron limit {}", limits.kron);
    assert!((error_limit - 24.3).abs() < 0.1, "error-threshold limit {}", error_limit);
    assert!((limits.sky - 24.0).abs() < 1e-9);
    assert_eq!(limits.select(LimitKind::SkyNoise), limits.sky);
    assert_eq!(
        limits.sky,
        sky_limit(&noise, calibration.psf_fwhm, calibration.zero_point, config.sky_sigma)
    );
}

#[test]
fn test_result_file_header_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let field = synthetic_field(Band::I, SkyCoord::new(35.0, -5.0), 30.9, 49, 800, 23.9);
    let calibration = calibrate(&field.raw, &field.reference, &CalibrationConfig::default());
    let calibrated = field.raw.calibrated(calibration.zero_point);
    let noise = noise_for_limit(23.6, calibration.psf_fwhm, calibration.zero_point);
    let config = LimitsConfig::default();
    let limits = estimate(&calibrated, &noise, calibration.psf_fwhm, calibration.zero_point, &config).unwrap();

    let header = ResultHeader {
        field: "SN-C3".to_string(),
        minus_year: "2".to_string(),
        band: Band::I,
        chip: 28,
        exptime: noise.exptime,
        zero_point: calibration.zero_point,
        zero_point_err: calibration.zero_point_err,
        quality: calibration.quality,
        limits,
        snr: config.snr,
        sky_sigma: config.sky_sigma,
    };
    let path = dir.path().join("MY2_SN-C3_i_28_init_wgtd.result");
    write_result_file(&path, &header, &calibrated, &config).unwrap();

    let parsed = read_result_header(&path).unwrap();
    assert_eq!(parsed.field, "SN-C3");
    assert_eq!(parsed.minus_year, "2");
    assert_eq!(parsed.band, Band::I);
    assert_eq!(parsed.chip, 28);
    assert_eq!(parsed.zero_point, header.zero_point);
    assert_eq!(parsed.quality, calibration.quality);
    // limits are written at full precision
    assert_eq!(parsed.limits, limits);
    assert_eq!(parsed.snr, 10.0);
    assert_eq!(parsed.sky_sigma, 5.0);

    // one data row per detection below the artifact cut
    let contents = std::fs::read_to_string(&path).unwrap();
    let data_rows = contents
        .lines()
        .filter(|l| !l.starts_with('#') && !l.starts_with("X_WORLD"))
        .count();
    assert_eq!(data_rows, calibrated.len());

    let region = dir.path().join("unit_auto.reg");
    write_region_file(&region, &calibrated).unwrap();
    let regions = std::fs::read_to_string(&region).unwrap();
    assert_eq!(regions.lines().count(), calibrated.len());
    assert!(regions.lines().all(|l| l.starts_with("fk5; circle(")));
}
