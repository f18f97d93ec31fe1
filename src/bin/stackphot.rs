use stackphot::{
    calibration::{calibrate, read_quality_file, write_quality_file, CalibrationFileError, CalibrationQuality},
    catalog::{CatalogError, ReferenceCatalog, SourceCatalog},
    conf::{load_dotenv, AppConfig, StackphotConfigError},
    frames::{exposures_for_stack, read_exposure_table, select_good_exposures, FramesError, MinusYear},
    fusion::{read_fused_catalog, FusionError},
    host::{associate, write_host_file, HostError, Transient},
    limits::{estimate, write_region_file, write_result_file, ImageNoise, LimitsError, ResultFileError, ResultHeader},
    pipeline::{fuse_chip, load_unit_outputs, read_manifest, run_batch, ChipKey, PipelineError, UnitKey},
    redshift::{RedshiftCatalog, RedshiftError},
    sky::{measure_noise, read_pixels, SkyError},
    utils::{enums::Band, o11y::logging::build_subscriber},
};

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(about = "Photometric calibration and cross-matching of deep stacks")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Derive the zero-point of one extractor catalog
    Calibrate {
        #[arg(long)]
        catalog: PathBuf,
        #[arg(long)]
        reference: PathBuf,
        #[arg(long, value_enum)]
        band: Band,
        /// Calibration quality file to write
        #[arg(long)]
        output: PathBuf,
    },
    /// Estimate limiting magnitudes and write the result and region files
    Limits {
        #[command(flatten)]
        unit: UnitArgs,
        #[arg(long)]
        catalog: PathBuf,
        /// Calibration quality file from `calibrate`
        #[arg(long)]
        quality: PathBuf,
        #[command(flatten)]
        noise: NoiseArgs,
        #[arg(long)]
        result: PathBuf,
        #[arg(long)]
        region: Option<PathBuf>,
    },
    /// Merge the g, r, i and z catalogs of one chip
    Fuse {
        #[arg(long)]
        field: String,
        #[arg(long)]
        minus_year: MinusYear,
        #[arg(long)]
        chip: u32,
        /// Extractor catalogs in g, r, i, z order
        #[arg(long, num_args = 4, value_names = ["G", "R", "I", "Z"])]
        catalogs: Vec<PathBuf>,
        /// Output root holding the per-band result files
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Find the host galaxy of a transient in a fused catalog
    Host {
        #[arg(long)]
        fused: PathBuf,
        #[arg(long)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        ra: f64,
        #[arg(long, allow_hyphen_values = true)]
        dec: f64,
        /// Host redshift from the transient's spectrum
        #[arg(long)]
        spectrum_z: Option<f64>,
        #[arg(long)]
        output: PathBuf,
    },
    /// List the good exposures that go into a minus-year stack
    Frames {
        #[arg(long)]
        exposures: PathBuf,
        #[arg(long, default_value = "none")]
        minus_year: MinusYear,
    },
    /// Process every unit of a manifest
    Batch {
        #[arg(long)]
        manifest: PathBuf,
        /// Where to write the JSON batch summary
        #[arg(long)]
        summary: Option<PathBuf>,
    },
}

#[derive(Args)]
struct UnitArgs {
    #[arg(long)]
    field: String,
    #[arg(long)]
    minus_year: MinusYear,
    #[arg(long, value_enum)]
    band: Band,
    #[arg(long)]
    chip: u32,
}

#[derive(Args)]
struct NoiseArgs {
    #[arg(long, requires = "sky_std", conflicts_with = "pixels", allow_hyphen_values = true)]
    sky_mean: Option<f64>,
    #[arg(long, requires = "sky_mean")]
    sky_std: Option<f64>,
    /// Science image pixels as whitespace-separated text
    #[arg(long)]
    pixels: Option<PathBuf>,
    #[arg(long, default_value_t = 0.0)]
    exptime: f64,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] StackphotConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    CalibrationFile(#[from] CalibrationFileError),
    #[error(transparent)]
    Limits(#[from] LimitsError),
    #[error(transparent)]
    ResultFile(#[from] ResultFileError),
    #[error(transparent)]
    Sky(#[from] SkyError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error(transparent)]
    Frames(#[from] FramesError),
    #[error(transparent)]
    Redshift(#[from] RedshiftError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("either --sky-mean/--sky-std or --pixels is required")]
    MissingNoise,
    #[error("{0} unit(s) failed")]
    BatchFailed(usize),
}

fn load_app_config(path: Option<&str>) -> Result<AppConfig, CliError> {
    match path {
        Some(path) => Ok(AppConfig::from_path(path)?),
        None => {
            warn!("no config file provided, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn load_noise(args: &NoiseArgs, config: &AppConfig) -> Result<ImageNoise, CliError> {
    match (args.sky_mean, args.sky_std, &args.pixels) {
        (Some(sky_mean), Some(sky_std), _) => Ok(ImageNoise {
            sky_mean,
            sky_std,
            exptime: args.exptime,
            pixel_scale: config.limits.pixel_scale,
        }),
        (_, _, Some(pixels)) => Ok(measure_noise(
            &read_pixels(pixels)?,
            args.exptime,
            config.limits.pixel_scale,
            &config.sky,
        )?),
        _ => Err(CliError::MissingNoise),
    }
}

fn load_redshifts(config: &AppConfig) -> Result<Option<RedshiftCatalog>, CliError> {
    match &config.paths.redshift_catalog {
        Some(path) => Ok(Some(RedshiftCatalog::from_csv_path(path)?)),
        None => Ok(None),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_app_config(cli.config.as_deref())?;
    match cli.command {
        Command::Calibrate {
            catalog,
            reference,
            band,
            output,
        } => {
            let raw = SourceCatalog::from_csv_path(&catalog)?;
            let reference = ReferenceCatalog::from_csv_path(&reference, band)?;
            let calibration = calibrate(&raw, &reference, &config.calibration);
            write_quality_file(&output, &calibration)?;
            println!(
                "{:.3} +/- {:.3} (psf {:.2}\", {} matches, {:?})",
                calibration.zero_point,
                calibration.zero_point_err,
                calibration.psf_fwhm,
                calibration.n_matches,
                calibration.quality
            );
        }
        Command::Limits {
            unit,
            catalog,
            quality,
            noise,
            result,
            region,
        } => {
            let quality = read_quality_file(&quality)?;
            let calibration_quality = quality.quality.unwrap_or_else(|| {
                warn!("quality file carries no calibration flag, taking it as nominal");
                CalibrationQuality::Nominal
            });
            if calibration_quality == CalibrationQuality::NoMatches {
                let key = UnitKey {
                    field: unit.field,
                    minus_year: unit.minus_year,
                    band: unit.band,
                    chip: unit.chip,
                };
                return Err(PipelineError::Uncalibrated(key.to_string()).into());
            }
            let noise = load_noise(&noise, &config)?;
            let calibrated = SourceCatalog::from_csv_path(&catalog)?.calibrated(quality.zero_point);
            let limits = estimate(
                &calibrated,
                &noise,
                quality.psf_fwhm,
                quality.zero_point,
                &config.limits,
            )?;
            let header = ResultHeader {
                field: unit.field,
                minus_year: unit.minus_year.to_string(),
                band: unit.band,
                chip: unit.chip,
                exptime: noise.exptime,
                zero_point: quality.zero_point,
                zero_point_err: quality.zero_point_err,
                quality: calibration_quality,
                limits,
                snr: config.limits.snr,
                sky_sigma: config.limits.sky_sigma,
            };
            write_result_file(&result, &header, &calibrated, &config.limits)?;
            if let Some(region) = region {
                write_region_file(&region, &calibrated)?;
            }
        }
        Command::Fuse {
            field,
            minus_year,
            chip,
            catalogs,
            root,
        } => {
            let root = root.unwrap_or_else(|| config.paths.output_dir.clone());
            let chip = ChipKey {
                field,
                minus_year,
                chip,
            };
            let units = Band::ALL
                .iter()
                .zip(&catalogs)
                .map(|(&band, catalog)| {
                    let key = UnitKey {
                        field: chip.field.clone(),
                        minus_year,
                        band,
                        chip: chip.chip,
                    };
                    load_unit_outputs(key, catalog, &root)
                })
                .collect::<Result<Vec<_>, _>>()?;
            let redshifts = load_redshifts(&config)?;
            let path = fuse_chip(&chip, units, redshifts.as_ref(), &config, &root)?;
            info!(path = %path.display(), "wrote fused catalog");
        }
        Command::Host {
            fused,
            name,
            ra,
            dec,
            spectrum_z,
            output,
        } => {
            let rows = read_fused_catalog(&fused)?;
            let transient = Transient {
                name,
                ra,
                dec,
                spectrum_z,
            };
            let association = associate(&transient, &rows, &config.host);
            write_host_file(&output, &association, &rows)?;
        }
        Command::Frames {
            exposures,
            minus_year,
        } => {
            let exposures = read_exposure_table(&exposures)?;
            let good = select_good_exposures(&exposures, &config.frames);
            for expnum in exposures_for_stack(&exposures, &good, minus_year, &config.frames.seasons) {
                println!("{}", expnum);
            }
        }
        Command::Batch { manifest, summary } => {
            let units = read_manifest(&manifest, config.limits.pixel_scale)?;
            let redshifts = load_redshifts(&config)?;
            let outcome = run_batch(&units, redshifts.as_ref(), &config, &config.paths.output_dir);
            match summary {
                Some(path) => outcome.write(&path)?,
                None => println!("{}", outcome.to_json()?),
            }
            if !outcome.is_success() {
                return Err(CliError::BatchFailed(outcome.failed.len()));
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    // Load environment variables from .env file before anything else
    load_dotenv();

    let cli = Cli::parse();

    let subscriber = build_subscriber().expect("failed to build subscriber");
    tracing::subscriber::set_global_default(subscriber).expect("failed to install subscriber");

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "stackphot failed");
            ExitCode::FAILURE
        }
    }
}
