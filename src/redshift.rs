//! Attaching spectroscopic redshifts from a compiled multi-survey catalog.
//!
//! Which (survey, flag) pairs are trusted, which survey wins when several
//! measure the same galaxy, and which measurements are downgraded are all
//! data in [`SurveyPolicy`], so the tables can be versioned and overridden
//! from configuration.

use crate::catalog::{CatalogError, ColumnTable};
use crate::spatial::{wrap_ra_difference, SkyCoord, SkyIndex};

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, instrument};

#[derive(thiserror::Error, Debug)]
pub enum RedshiftError {
    #[error("failed to read redshift catalog")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedshiftEntry {
    pub id: String,
    pub ra: f64,
    pub dec: f64,
    pub z: f64,
    pub z_err: f64,
    pub flag: String,
    pub source: String,
    pub comments: String,
}

impl RedshiftEntry {
    pub fn coord(&self) -> SkyCoord {
        SkyCoord::new(self.ra, self.dec)
    }

    /// Survey name with fixed-width padding removed.
    pub fn survey(&self) -> &str {
        self.source.trim()
    }
}

/// Redshift attached to a catalog object. Objects without one serialise as
/// empty strings in all four columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedshiftMatch {
    pub z: f64,
    pub z_err: f64,
    pub flag: String,
    pub source: String,
}

impl From<&RedshiftEntry> for RedshiftMatch {
    fn from(entry: &RedshiftEntry) -> Self {
        RedshiftMatch {
            z: entry.z,
            z_err: entry.z_err,
            flag: entry.flag.clone(),
            source: entry.survey().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagRule {
    Any,
    Only(Vec<String>),
}

impl FlagRule {
    pub fn accepts(&self, flag: &str) -> bool {
        match self {
            FlagRule::Any => true,
            FlagRule::Only(flags) => flags.iter().any(|f| f == flag.trim()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurveyRule {
    pub survey: String,
    pub flags: FlagRule,
}

/// Measurements that are kept but marked unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downgrade {
    pub survey: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyPolicy {
    pub version: String,
    pub whitelist: Vec<SurveyRule>,
    /// Survey names, most trusted first.
    pub priority: Vec<String>,
    pub downgrade: Downgrade,
    /// Entries whose ID starts with this prefix win ties within a survey.
    pub preferred_id_prefix: String,
}

const WHITELIST: [(&str, &[&str]); 30] = [
    ("DES_AAOmega", &["1", "2", "3", "4", "6"]),
    ("ZFIRE_UDS", &["3"]),
    ("NOAO_0522", &["4", "6"]),
    ("NOAO_0334", &["4", "6"]),
    ("N17B331", &["4", "6"]),
    ("MOSDEF", &[]),
    ("SpARCS", &["1", "2"]),
    ("PanSTARRS_AAOmega", &["3", "4", "6"]),
    ("PanSTARRS_MMT", &["3", "4", "6"]),
    ("PRIMUS", &["3", "4"]),
    ("NED", &[]),
    ("UDS_FORS2", &["A", "B"]),
    ("UDS_VIMOS", &["3", "4"]),
    ("ACES", &["3", "4"]),
    ("SDSS", &["0"]),
    ("6dF", &["4"]),
    ("ATLAS", &[]),
    ("2dFGRS", &["3", "4"]),
    ("GAMA", &["4"]),
    ("SNLS_FORS", &["1", "2"]),
    ("CDB", &[]),
    ("VVDS_DEEP", &["3", "4", "13", "14", "23", "24", "213", "214"]),
    ("VVDS_CDFS", &["3", "4", "13", "14", "23", "24"]),
    ("MUSE", &["3", "2"]),
    ("SAGA", &["4"]),
    ("SNLS_AAOmega", &["3", "4", "6"]),
    (
        "VIPERS",
        &[
            "2", "3", "4", "9", "22", "23", "24", "29", "12", "13", "14", "19", "212", "213", "214", "219",
        ],
    ),
    ("DEEP2_DR4", &["-1", "3", "4"]),
    ("VUDS_COSMOS", &["3", "4", "13", "14", "23", "24", "43", "44"]),
    ("VUDS_ECDFS", &["3", "4", "13", "14", "23", "24", "43", "44"]),
];

const PRIORITY: [&str; 30] = [
    "DES_AAOmega",
    "SNLS_AAOmega",
    "PanSTARRS_MMT",
    "PanSTARRS_AAOmega",
    "VIPERS",
    "SpARCS",
    "MOSDEF",
    "N17B331",
    "NOAO_0334",
    "NOAO_0522",
    "VUDS_ECDFS",
    "VUDS_COSMOS",
    "DEEP2_DR4",
    "SAGA",
    "MUSE",
    "VVDS_CDFS",
    "VVDS_DEEP",
    "CDB",
    "SNLS_FORS",
    "GAMA",
    "2dFGRS",
    "ATLAS",
    "6dF",
    "SDSS",
    "ACES",
    "ZFIRE_UDS",
    "UDS_VIMOS",
    "UDS_FORS2",
    "NED",
    "PRIMUS",
];

impl Default for SurveyPolicy {
    fn default() -> Self {
        SurveyPolicy {
            version: "grc-2018".to_string(),
            whitelist: WHITELIST
                .iter()
                .map(|(survey, flags)| SurveyRule {
                    survey: survey.to_string(),
                    // an empty flag list in the table means any flag
                    flags: if flags.is_empty() {
                        FlagRule::Any
                    } else {
                        FlagRule::Only(flags.iter().map(|f| f.to_string()).collect())
                    },
                })
                .collect(),
            priority: PRIORITY.iter().map(|s| s.to_string()).collect(),
            downgrade: Downgrade {
                survey: "DES_AAOmega".to_string(),
                flags: vec!["1".to_string(), "2".to_string()],
            },
            preferred_id_prefix: "SVA1_COADD".to_string(),
        }
    }
}

impl SurveyPolicy {
    pub fn accepts(&self, entry: &RedshiftEntry) -> bool {
        self.whitelist
            .iter()
            .any(|rule| rule.survey.trim() == entry.survey() && rule.flags.accepts(&entry.flag))
    }

    /// Position in the priority list; unlisted surveys rank last.
    pub fn rank(&self, survey: &str) -> usize {
        self.priority
            .iter()
            .position(|s| s.trim() == survey.trim())
            .unwrap_or(self.priority.len())
    }

    /// Mark low-confidence measurements: z = -9.99, z_err = -9999.
    pub fn downgrade(&self, m: &mut RedshiftMatch) {
        if m.source.trim() == self.downgrade.survey
            && self.downgrade.flags.iter().any(|f| f == m.flag.trim())
        {
            m.z = -9.99;
            m.z_err = -9999.0;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedshiftConfig {
    pub match_radius_arcsec: f64,
    /// Radius around a matched object within which competing entries are
    /// ranked.
    pub tiebreak_radius_arcsec: f64,
}

impl Default for RedshiftConfig {
    fn default() -> Self {
        RedshiftConfig {
            match_radius_arcsec: 0.5,
            tiebreak_radius_arcsec: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RedshiftCatalog {
    pub entries: Vec<RedshiftEntry>,
}

const REDSHIFT_COLUMNS: [&str; 7] = ["ID", "RA", "DEC", "z", "z_Err", "flag", "source"];

impl RedshiftCatalog {
    #[instrument(err)]
    pub fn from_csv_path(path: &Path) -> Result<Self, RedshiftError> {
        Self::from_table(ColumnTable::from_path(path)?)
    }

    pub fn from_csv_reader<R: Read>(name: &str, reader: R) -> Result<Self, RedshiftError> {
        Self::from_table(ColumnTable::from_reader(name, reader)?)
    }

    fn from_table(table: ColumnTable) -> Result<Self, RedshiftError> {
        let idx = REDSHIFT_COLUMNS
            .iter()
            .map(|c| table.require(c))
            .collect::<Result<Vec<_>, _>>()?;
        let comments = table.optional("comments");
        let mut entries = Vec::with_capacity(table.rows.len());
        for (n, row) in table.rows.iter().enumerate() {
            let number = |i: usize| table.f64_at(n, row, idx[i], REDSHIFT_COLUMNS[i]);
            entries.push(RedshiftEntry {
                id: table.str_at(row, idx[0]).to_string(),
                ra: number(1)?,
                dec: number(2)?,
                z: number(3)?,
                z_err: number(4)?,
                flag: table.str_at(row, idx[5]).to_string(),
                source: table.str_at(row, idx[6]).to_string(),
                comments: comments.map(|c| table.str_at(row, c).to_string()).unwrap_or_default(),
            });
        }
        debug!(n_entries = entries.len(), "loaded redshift catalog");
        Ok(RedshiftCatalog { entries })
    }

    /// Entries passing the survey whitelist, in catalog order.
    pub fn whitelisted(&self, policy: &SurveyPolicy) -> Vec<RedshiftEntry> {
        self.entries.iter().filter(|e| policy.accepts(e)).cloned().collect()
    }
}

/// Entries inside the square box of half width `half_width` degrees.
pub fn in_box(entries: &[RedshiftEntry], ra: f64, dec: f64, half_width: f64) -> Vec<RedshiftEntry> {
    entries
        .iter()
        .filter(|e| wrap_ra_difference(e.ra, ra).abs() < half_width && (e.dec - dec).abs() < half_width)
        .cloned()
        .collect()
}

/// Attach a redshift to every target that has an accepted entry within the
/// match radius. Among all entries near a matched target the winner is
/// chosen by survey priority, preferred ID prefix, separation and catalog
/// order, in that order; low-confidence winners are downgraded.
#[instrument(skip_all, fields(n_targets = targets.len(), n_entries = accepted.len()))]
pub fn match_redshifts(
    targets: &[SkyCoord],
    accepted: &[RedshiftEntry],
    policy: &SurveyPolicy,
    config: &RedshiftConfig,
) -> Vec<Option<RedshiftMatch>> {
    if accepted.is_empty() {
        return vec![None; targets.len()];
    }
    let index = SkyIndex::new(&accepted.iter().map(RedshiftEntry::coord).collect::<Vec<_>>());

    let matches: Vec<Option<RedshiftMatch>> = targets
        .iter()
        .map(|target| {
            let nearest = index.nearest(target)?;
            if nearest.separation_arcsec >= config.match_radius_arcsec {
                return None;
            }
            let candidates = index.search_around(target, config.tiebreak_radius_arcsec.max(nearest.separation_arcsec));
            let key = |i: usize| {
                let e = &accepted[i];
                (
                    policy.rank(e.survey()),
                    !e.id.starts_with(&policy.preferred_id_prefix),
                )
            };
            let best = candidates.iter().min_by(|a, b| {
                key(a.index)
                    .cmp(&key(b.index))
                    .then(a.separation_arcsec.total_cmp(&b.separation_arcsec))
                    .then(a.index.cmp(&b.index))
            })?;
            let mut m = RedshiftMatch::from(&accepted[best.index]);
            policy.downgrade(&mut m);
            Some(m)
        })
        .collect();

    info!(
        n_matched = matches.iter().filter(|m| m.is_some()).count(),
        policy = %policy.version,
        "matched redshifts"
    );
    matches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, ra: f64, dec: f64, z: f64, flag: &str, source: &str) -> RedshiftEntry {
        RedshiftEntry {
            id: id.to_string(),
            ra,
            dec,
            z,
            z_err: 0.001,
            flag: flag.to_string(),
            source: source.to_string(),
            comments: String::new(),
        }
    }

    #[test]
    fn test_default_tables() {
        let policy = SurveyPolicy::default();
        assert_eq!(policy.whitelist.len(), 30);
        assert_eq!(policy.priority.len(), 30);
        assert_eq!(policy.rank("DES_AAOmega"), 0);
        assert_eq!(policy.rank("PRIMUS"), 29);
        assert_eq!(policy.rank("UNKNOWN"), 30);
    }

    #[test]
    fn test_whitelist() {
        let policy = SurveyPolicy::default();
        assert!(policy.accepts(&entry("a", 0.0, 0.0, 0.1, "4", "DES_AAOmega")));
        assert!(!policy.accepts(&entry("a", 0.0, 0.0, 0.1, "5", "DES_AAOmega")));
        assert!(policy.accepts(&entry("a", 0.0, 0.0, 0.1, "whatever", "NED")));
        assert!(policy.accepts(&entry("a", 0.0, 0.0, 0.1, "3", "PanSTARRS_AAOmega   ")));
        assert!(!policy.accepts(&entry("a", 0.0, 0.0, 0.1, "4", "SDSS")));
        assert!(!policy.accepts(&entry("a", 0.0, 0.0, 0.1, "4", "NOT_A_SURVEY")));
    }

    #[test]
    fn test_box_wraps_ra() {
        let entries = vec![
            entry("a", 359.95, 0.0, 0.1, "4", "DES_AAOmega"),
            entry("b", 0.05, 0.0, 0.1, "4", "DES_AAOmega"),
            entry("c", 0.5, 0.0, 0.1, "4", "DES_AAOmega"),
        ];
        let kept = in_box(&entries, 0.0, 0.0, 0.1);
        assert_eq!(kept.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_preferred_prefix_within_survey() {
        let policy = SurveyPolicy::default();
        let target = SkyCoord::new(10.0, -10.0);
        let accepted = vec![
            entry("OTHER_1", 10.0, -10.0, 0.30, "4", "DES_AAOmega"),
            entry("SVA1_COADD_7", 10.0, -10.0 + 0.5 / 3600.0, 0.31, "4", "DES_AAOmega"),
        ];
        let m = match_redshifts(&[target], &accepted, &policy, &RedshiftConfig::default());
        assert_eq!(m[0].as_ref().unwrap().z, 0.31);
    }

    #[test]
    fn test_unmatched_is_none() {
        let policy = SurveyPolicy::default();
        let accepted = vec![entry("a", 10.0, 10.0, 0.2, "4", "DES_AAOmega")];
        let m = match_redshifts(
            &[SkyCoord::new(10.0, 10.0 + 0.6 / 3600.0)],
            &accepted,
            &policy,
            &RedshiftConfig::default(),
        );
        assert_eq!(m, vec![None]);
    }
}
