//! Choosing which single-epoch exposures go into a deep stack.

use crate::catalog::{CatalogError, ColumnTable};
use crate::stats::median;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, instrument};

#[derive(thiserror::Error, Debug)]
pub enum FramesError {
    #[error("failed to read exposure table")]
    Catalog(#[from] CatalogError),
    #[error("invalid minus-year '{0}', expected 'none' or a season number")]
    InvalidMinusYear(String),
}

/// The observing season left out of a stack, or none for an all-season
/// stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MinusYear {
    None,
    Season(u8),
}

impl std::str::FromStr for MinusYear {
    type Err = FramesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("MY").unwrap_or(s);
        if s.eq_ignore_ascii_case("none") {
            return Ok(MinusYear::None);
        }
        s.parse::<u8>()
            .map(MinusYear::Season)
            .map_err(|_| FramesError::InvalidMinusYear(s.to_string()))
    }
}

impl TryFrom<String> for MinusYear {
    type Error = FramesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MinusYear> for String {
    fn from(value: MinusYear) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for MinusYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MinusYear::None => write!(f, "none"),
            MinusYear::Season(n) => write!(f, "{}", n),
        }
    }
}

impl MinusYear {
    /// Whether exposures from `season` (e.g. "Y3") are kept.
    pub fn keeps(&self, season: Option<&str>) -> bool {
        match self {
            MinusYear::None => true,
            MinusYear::Season(n) => season != Some(format!("Y{}", n).as_str()),
        }
    }
}

/// Nights strictly between `start` and `end` belong to the season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonRange {
    pub name: String,
    pub start: u32,
    pub end: u32,
}

pub fn default_seasons() -> Vec<SeasonRange> {
    [
        ("Y1", 20130801, 20140301),
        ("Y2", 20140801, 20150301),
        ("Y3", 20150801, 20160301),
        ("Y4", 20160801, 20170301),
        ("Y5", 20170801, 20180301),
    ]
    .iter()
    .map(|(name, start, end)| SeasonRange {
        name: name.to_string(),
        start: *start,
        end: *end,
    })
    .collect()
}

pub fn season_of(night: u32, seasons: &[SeasonRange]) -> Option<&str> {
    seasons
        .iter()
        .find(|s| night > s.start && night < s.end)
        .map(|s| s.name.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Final zero-point residuals below this count as bad.
    pub zp_cut: f64,
    /// PSF sizes above this count as bad.
    pub seeing_cut: f64,
    /// An exposure is good with fewer bad chips than this.
    pub n_bad: usize,
    pub seasons: Vec<SeasonRange>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            zp_cut: -0.15,
            seeing_cut: 2.5,
            n_bad: 15,
            seasons: default_seasons(),
        }
    }
}

/// One chip of one exposure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureChip {
    pub expnum: u64,
    pub chip: u32,
    pub night: u32,
    pub zero_point: f64,
    pub psf: f64,
}

const EXPOSURE_COLUMNS: [&str; 5] = ["EXPNUM", "CCDNUM", "NITE", "CHIP_ZERO_POINT", "PSF_NEA"];

pub fn read_exposures<R: Read>(name: &str, reader: R) -> Result<Vec<ExposureChip>, FramesError> {
    exposures_from_table(ColumnTable::from_reader(name, reader)?)
}

#[instrument(err)]
pub fn read_exposure_table(path: &Path) -> Result<Vec<ExposureChip>, FramesError> {
    exposures_from_table(ColumnTable::from_path(path)?)
}

fn exposures_from_table(table: ColumnTable) -> Result<Vec<ExposureChip>, FramesError> {
    let idx = EXPOSURE_COLUMNS
        .iter()
        .map(|c| table.require(c))
        .collect::<Result<Vec<_>, _>>()?;
    let mut exposures = Vec::with_capacity(table.rows.len());
    for (n, row) in table.rows.iter().enumerate() {
        let invalid = |i: usize| CatalogError::InvalidValue {
            table: table.name.clone(),
            column: EXPOSURE_COLUMNS[i].to_string(),
            row: n,
            value: table.str_at(row, idx[i]).to_string(),
        };
        let integer = |i: usize| -> Result<u64, CatalogError> {
            table.str_at(row, idx[i]).parse::<u64>().map_err(|_| invalid(i))
        };
        let small = |i: usize| -> Result<u32, CatalogError> { u32::try_from(integer(i)?).map_err(|_| invalid(i)) };
        exposures.push(ExposureChip {
            expnum: integer(0)?,
            chip: small(1)?,
            night: small(2)?,
            zero_point: table.f64_at(n, row, idx[3], EXPOSURE_COLUMNS[3])?,
            psf: table.f64_at(n, row, idx[4], EXPOSURE_COLUMNS[4])?,
        });
    }
    Ok(exposures)
}

fn group_medians<K: Ord + Clone>(keys: &[K], values: &[f64]) -> BTreeMap<K, f64> {
    let mut groups: BTreeMap<K, Vec<f64>> = BTreeMap::new();
    for (k, v) in keys.iter().zip(values) {
        groups.entry(k.clone()).or_default().push(*v);
    }
    groups
        .into_iter()
        .map(|(k, vs)| (k, median(&vs).unwrap_or(f64::NAN)))
        .collect()
}

/// Zero-point residual of every chip after removing the exposure median,
/// the chip's typical offset and the season median, in input order.
pub fn zero_point_residuals(exposures: &[ExposureChip], seasons: &[SeasonRange]) -> Vec<f64> {
    let zps: Vec<f64> = exposures.iter().map(|e| e.zero_point).collect();

    let expnums: Vec<u64> = exposures.iter().map(|e| e.expnum).collect();
    let exposure_median = group_medians(&expnums, &zps);
    let per_exposure: Vec<f64> = exposures
        .iter()
        .map(|e| e.zero_point - exposure_median[&e.expnum])
        .collect();

    let chips: Vec<u32> = exposures.iter().map(|e| e.chip).collect();
    let chip_offset = group_medians(&chips, &per_exposure);
    let adjusted: Vec<f64> = exposures
        .iter()
        .map(|e| e.zero_point - chip_offset[&e.chip])
        .collect();

    let season_keys: Vec<Option<String>> = exposures
        .iter()
        .map(|e| season_of(e.night, seasons).map(str::to_string))
        .collect();
    let season_median = group_medians(&season_keys, &adjusted);
    adjusted
        .iter()
        .zip(&season_keys)
        .map(|(adj, key)| adj - season_median[key])
        .collect()
}

/// Exposure numbers passing the zero-point and seeing cuts, ascending.
#[instrument(skip_all, fields(n_rows = exposures.len()))]
pub fn select_good_exposures(exposures: &[ExposureChip], config: &FrameConfig) -> Vec<u64> {
    let residuals = zero_point_residuals(exposures, &config.seasons);
    let mut bad: BTreeMap<u64, usize> = BTreeMap::new();
    for (e, res) in exposures.iter().zip(&residuals) {
        let count = bad.entry(e.expnum).or_insert(0);
        if *res < config.zp_cut {
            *count += 1;
        }
        if e.psf > config.seeing_cut {
            *count += 1;
        }
    }
    let good: Vec<u64> = bad
        .iter()
        .filter(|(expnum, n)| {
            debug!(expnum = **expnum, n_bad = **n, "exposure quality");
            **n < config.n_bad
        })
        .map(|(expnum, _)| *expnum)
        .collect();
    info!(n_exposures = bad.len(), n_good = good.len(), "selected good exposures");
    good
}

/// Good exposures that belong in the stack for `minus_year`, ascending.
pub fn exposures_for_stack(
    exposures: &[ExposureChip],
    good: &[u64],
    minus_year: MinusYear,
    seasons: &[SeasonRange],
) -> Vec<u64> {
    let good: BTreeSet<u64> = good.iter().copied().collect();
    exposures
        .iter()
        .filter(|e| good.contains(&e.expnum) && minus_year.keeps(season_of(e.night, seasons)))
        .map(|e| e.expnum)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
