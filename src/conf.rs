use crate::calibration::CalibrationConfig;
use crate::frames::FrameConfig;
use crate::fusion::FusionConfig;
use crate::host::HostConfig;
use crate::limits::LimitsConfig;
use crate::redshift::{RedshiftConfig, SurveyPolicy};
use crate::sky::SkyConfig;

use config::{Config, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum StackphotConfigError {
    #[error("failed to load config")]
    InvalidConfigError(#[from] config::ConfigError),
    #[error("could not find config file {0}")]
    ConfigFileNotFound(String),
    #[error("failed to read config file")]
    ReadError(#[from] std::io::Error),
    #[error("environment variable expansion error")]
    EnvExpansionError(#[from] ExpandError),
    #[error("invalid configuration: {0}")]
    InvalidValue(String),
}

#[derive(thiserror::Error, Debug)]
pub enum ExpandError {
    #[error("Missing environment variable '{var_name}' for placeholder '{placeholder}'")]
    MissingVariable {
        var_name: String,
        placeholder: String,
    },
    #[error("invalid placeholder pattern")]
    Pattern(#[from] regex::Error),
}

/// Loads environment variables from a .env file if it exists.
///
/// Looks in the current directory first, then its parent. A missing file is
/// not an error: the variables may be set by the system.
pub fn load_dotenv() {
    for candidate in [".env", "../.env"] {
        if Path::new(candidate).exists() {
            match dotenvy::from_path(candidate) {
                Ok(_) => info!("Loaded environment variables from {} file", candidate),
                Err(e) => warn!("Found {} file but failed to load it: {}", candidate, e),
            }
            return;
        }
    }
    debug!("No .env file found, using system environment variables only");
}

/// Expands environment variable placeholders in a string.
/// Supports both ${VAR_NAME} and ${VAR_NAME:-default_value} syntax.
///
/// Examples:
/// - "${STACKPHOT_DATA}" -> reads from STACKPHOT_DATA env var
/// - "${STACKPHOT_DATA:-/data}" -> reads from STACKPHOT_DATA, falls back to "/data"
pub fn expand_env_vars(input: &str) -> Result<String, ExpandError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-(.*?))?\}")?;
    let mut result = input.to_string();
    let mut replacements: HashMap<String, String> = HashMap::new();

    for capture in re.captures_iter(input) {
        let (Some(full_match), Some(var_name)) = (capture.get(0), capture.get(1)) else {
            continue;
        };
        let (full_match, var_name) = (full_match.as_str(), var_name.as_str());
        if replacements.contains_key(full_match) {
            continue;
        }

        let env_value = match env::var(var_name) {
            Ok(value) => {
                debug!("Expanded environment variable: {}", var_name);
                value
            }
            Err(_) => match capture.get(2) {
                Some(default) => {
                    warn!("Environment variable {} not found, using default value", var_name);
                    default.as_str().to_string()
                }
                None => {
                    return Err(ExpandError::MissingVariable {
                        var_name: var_name.to_string(),
                        placeholder: full_match.to_string(),
                    })
                }
            },
        };

        result = result.replace(full_match, &env_value);
        replacements.insert(full_match.to_string(), env_value);
    }

    Ok(result)
}

/// Read a YAML config file, expanding `${VAR}` placeholders, with
/// `STACKPHOT_`-prefixed environment variables layered on top
/// (`STACKPHOT_HOST__SEARCH_RADIUS_ARCSEC=3` sets `host.search_radius_arcsec`).
#[instrument(err)]
pub fn load_config(filepath: &str) -> Result<Config, StackphotConfigError> {
    let path = Path::new(filepath);
    if !path.exists() {
        return Err(StackphotConfigError::ConfigFileNotFound(filepath.to_string()));
    }
    let file_content = std::fs::read_to_string(path)?;
    let expanded_content = expand_env_vars(&file_content)?;

    let conf = Config::builder()
        .add_source(File::from_str(&expanded_content, FileFormat::Yaml))
        .add_source(Environment::with_prefix("STACKPHOT").separator("__"))
        .build()?;
    Ok(conf)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root under which per-unit outputs are written.
    pub output_dir: PathBuf,
    /// Compiled spectroscopic redshift catalog, if any.
    pub redshift_catalog: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        PathsConfig {
            output_dir: PathBuf::from("stackphot-out"),
            redshift_catalog: None,
        }
    }
}

/// Main application configuration. Every section falls back to the pipeline
/// defaults when absent from the file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub calibration: CalibrationConfig,
    pub limits: LimitsConfig,
    pub sky: SkyConfig,
    pub fusion: FusionConfig,
    pub redshift: RedshiftConfig,
    pub surveys: SurveyPolicy,
    pub host: HostConfig,
    pub frames: FrameConfig,
}

impl AppConfig {
    pub fn from_default_path() -> Result<Self, StackphotConfigError> {
        Self::from_path("config.yaml")
    }

    pub fn from_path(config_path: &str) -> Result<Self, StackphotConfigError> {
        load_dotenv();
        let app_config: AppConfig = load_config(config_path)?.try_deserialize()?;
        app_config.validate()?;
        info!(config = config_path, surveys = %app_config.surveys.version, "configuration loaded");
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), StackphotConfigError> {
        let invalid = |msg: &str| Err(StackphotConfigError::InvalidValue(msg.to_string()));
        if self.calibration.match_radius_arcsec <= 0.0 {
            return invalid("calibration.match_radius_arcsec must be positive");
        }
        if self.limits.bins == 0 || self.limits.n_eval < 2 {
            return invalid("limits.bins must be positive and limits.n_eval at least 2");
        }
        if self.limits.snr <= 0.0 || self.limits.pixel_scale <= 0.0 {
            return invalid("limits.snr and limits.pixel_scale must be positive");
        }
        if self.fusion.tolerance_arcsec <= 0.0 {
            return invalid("fusion.tolerance_arcsec must be positive");
        }
        if self.redshift.match_radius_arcsec <= 0.0 {
            return invalid("redshift.match_radius_arcsec must be positive");
        }
        if self.host.pixel_scale <= 0.0 || self.host.search_radius_arcsec <= 0.0 {
            return invalid("host.pixel_scale and host.search_radius_arcsec must be positive");
        }
        if self.surveys.whitelist.is_empty() {
            warn!("survey whitelist is empty, no redshift will be attached");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_default() {
        let expanded = expand_env_vars("dir: ${STACKPHOT_SURELY_UNSET_VAR:-/tmp/out}").unwrap();
        assert_eq!(expanded, "dir: /tmp/out");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let err = expand_env_vars("dir: ${STACKPHOT_SURELY_UNSET_VAR}").unwrap_err();
        assert!(matches!(err, ExpandError::MissingVariable { .. }));
    }

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }
}
