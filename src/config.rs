//! Configuration management and validation.
//!
//! Three JSON-backed layers: the run configuration (directories, output
//! period, overwrite), the deployment parameter table (per-period site
//! geometry and threshold overrides) and the quality-check configuration
//! (instrument check set plus per-variable statistical tests).

use crate::error::{AdcpError, Result};
use crate::models::{DeploymentContext, Orientation};
use crate::qc::statistical::StatisticalChecks;
use crate::qc::InstrumentChecks;
use crate::reader::RawDeployment;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Output period policy
// =============================================================================

/// How the continuous series is partitioned into output files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodPolicy {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    /// Fixed-length buckets of N days, week-aligned like `Daily`/`Weekly`
    Days(u32),
    /// One file spanning the whole input range
    File,
}

impl std::str::FromStr for PeriodPolicy {
    type Err = AdcpError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "daily" => Ok(PeriodPolicy::Daily),
            "weekly" => Ok(PeriodPolicy::Weekly),
            "monthly" => Ok(PeriodPolicy::Monthly),
            "yearly" => Ok(PeriodPolicy::Yearly),
            "file" | "profile" => Ok(PeriodPolicy::File),
            other => other
                .parse::<u32>()
                .ok()
                .filter(|&d| d > 0)
                .map(PeriodPolicy::Days)
                .ok_or_else(|| AdcpError::UnknownPeriod {
                    policy: other.to_string(),
                }),
        }
    }
}

impl std::fmt::Display for PeriodPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeriodPolicy::Daily => write!(f, "daily"),
            PeriodPolicy::Weekly => write!(f, "weekly"),
            PeriodPolicy::Monthly => write!(f, "monthly"),
            PeriodPolicy::Yearly => write!(f, "yearly"),
            PeriodPolicy::Days(d) => write!(f, "{d}"),
            PeriodPolicy::File => write!(f, "file"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PeriodRepr {
    Days(u32),
    Name(String),
}

impl TryFrom<PeriodRepr> for PeriodPolicy {
    type Error = AdcpError;

    fn try_from(repr: PeriodRepr) -> Result<Self> {
        match repr {
            PeriodRepr::Days(d) if d > 0 => Ok(PeriodPolicy::Days(d)),
            PeriodRepr::Days(d) => Err(AdcpError::UnknownPeriod {
                policy: d.to_string(),
            }),
            PeriodRepr::Name(name) => name.parse(),
        }
    }
}

impl<'de> Deserialize<'de> for PeriodPolicy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let repr = PeriodRepr::deserialize(deserializer)?;
        PeriodPolicy::try_from(repr).map_err(serde::de::Error::custom)
    }
}

impl Serialize for PeriodPolicy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

// =============================================================================
// Run configuration
// =============================================================================

/// Global attributes stamped on every output file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteMetadata {
    pub institution: String,
    pub source: String,
    pub title: String,
    pub comment: String,
    pub conventions: String,
    pub references: String,
}

impl Default for SiteMetadata {
    fn default() -> Self {
        Self {
            institution: "Lake observatory".to_string(),
            source: "ADCP".to_string(),
            title: "ADCP velocity time series".to_string(),
            comment: "Moored current-profiler data, quality controlled".to_string(),
            conventions: "CF 1.7".to_string(),
            references: String::new(),
        }
    }
}

/// Top-level run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raw instrument files, one subdirectory per band
    pub level0_dir: PathBuf,
    /// Flagged output files
    pub level1_dir: PathBuf,
    /// Masked and derived output files
    pub level2_dir: PathBuf,
    /// Instrument bands to process (subdirectory names)
    pub bands: Vec<String>,
    pub output_period: PeriodPolicy,
    /// Force full bucket replacement instead of merge
    pub overwrite: bool,
    pub site: SiteMetadata,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level0_dir: PathBuf::from("data/Level0"),
            level1_dir: PathBuf::from("data/Level1"),
            level2_dir: PathBuf::from("data/Level2"),
            bands: crate::constants::DEFAULT_BANDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            output_period: PeriodPolicy::File,
            overwrite: false,
            site: SiteMetadata::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| AdcpError::Configuration {
            message: format!("failed to parse {}: {e}", path.display()),
        })
    }
}

// =============================================================================
// Deployment parameters
// =============================================================================

/// Site geometry and threshold overrides for one deployment period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentParams {
    /// Depth of the transducer head [m]
    pub transducer_depth: f64,
    /// Bottom depth at the mooring [m]
    pub bottom_depth: f64,
    /// Upward-looking deployment
    pub up: bool,
    /// Cabled to shore power
    pub cabled: bool,
    /// Fixed rotation applied to (u, v) [deg], 0 disables
    pub rotate_velocity: f64,
    /// Optional `YYYYMMDD HH:MM` bounds narrowing the deployment window
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    /// Per-check threshold overrides, same keys as the quality configuration
    #[serde(flatten)]
    pub overrides: InstrumentChecks,
}

impl Default for DeploymentParams {
    fn default() -> Self {
        Self {
            transducer_depth: 0.65,
            bottom_depth: 110.0,
            up: false,
            cabled: false,
            rotate_velocity: 0.0,
            start_date: None,
            end_date: None,
            overrides: InstrumentChecks::default(),
        }
    }
}

fn parse_window_bound(text: &str) -> Result<f64> {
    NaiveDateTime::parse_from_str(text, "%Y%m%d %H:%M")
        .map(|dt| dt.and_utc().timestamp() as f64)
        .map_err(|e| AdcpError::Configuration {
            message: format!("invalid deployment date '{text}': {e}"),
        })
}

impl DeploymentParams {
    /// Configured deployment window as epoch seconds, if both bounds parse
    pub fn window_epoch(&self) -> Result<Option<(f64, f64)>> {
        match (&self.start_date, &self.end_date) {
            (Some(s), Some(e)) => Ok(Some((parse_window_bound(s)?, parse_window_bound(e)?))),
            (Some(s), None) => Ok(Some((parse_window_bound(s)?, f64::INFINITY))),
            (None, Some(e)) => Ok(Some((f64::NEG_INFINITY, parse_window_bound(e)?))),
            (None, None) => Ok(None),
        }
    }

    /// Build the immutable deployment context from these parameters and the
    /// metadata decoded from the raw file.
    pub fn context(&self, raw: &RawDeployment) -> Result<DeploymentContext> {
        let window = self.window_epoch()?.map(|(s, e)| {
            (
                DateTime::<Utc>::from_timestamp(s.max(0.0) as i64, 0).unwrap_or_default(),
                DateTime::<Utc>::from_timestamp(e as i64, 0).unwrap_or(DateTime::<Utc>::MAX_UTC),
            )
        });
        let ctx = DeploymentContext {
            orientation: if self.up {
                Orientation::Up
            } else {
                Orientation::Down
            },
            cabled: self.cabled,
            transducer_depth: self.transducer_depth,
            bottom_depth: self.bottom_depth,
            beam_angle_deg: raw.beam_angle_deg,
            beam_freq_khz: raw.beam_freq_khz,
            xmit_length: raw.xmit_length,
            noise_floor: raw.noise_floor(),
            window,
        };
        ctx.validate()?;
        Ok(ctx)
    }
}

/// One row of the deployment parameter table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentEntry {
    /// `YYYYMMDD HH:MM` of deployment and recovery; open-ended when absent
    pub deployed: Option<String>,
    pub recovered: Option<String>,
    #[serde(flatten)]
    pub params: DeploymentParams,
}

/// Deployment periods in chronological order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentTable {
    pub deployments: Vec<DeploymentEntry>,
}

impl DeploymentTable {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| AdcpError::Configuration {
            message: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Select the deployment period covering the timestamp encoded in the
    /// raw file name. Files without a parseable timestamp get the most
    /// recent period.
    pub fn select(&self, file: &Path) -> Result<&DeploymentParams> {
        let last = self
            .deployments
            .last()
            .ok_or_else(|| AdcpError::Configuration {
                message: "deployment parameter table is empty".to_string(),
            })?;

        let Some(ts) = filename_timestamp(file) else {
            debug!(
                file = %file.display(),
                "no timestamp in file name, using most recent deployment"
            );
            return Ok(&last.params);
        };

        for entry in &self.deployments {
            let after_start = match &entry.deployed {
                Some(s) => ts >= parse_window_bound(s)?,
                None => true,
            };
            let before_end = match &entry.recovered {
                Some(e) => ts < parse_window_bound(e)?,
                None => true,
            };
            if after_start && before_end {
                return Ok(&entry.params);
            }
        }
        Ok(&last.params)
    }
}

/// Extract an epoch timestamp from `*_YYYYMMDD[_HHMMSS]*` file names
pub fn filename_timestamp(file: &Path) -> Option<f64> {
    let stem = file.file_stem()?.to_str()?;
    let tokens: Vec<&str> = stem.split(['_', '-']).collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.len() == 8 && token.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(date) = NaiveDate::parse_from_str(token, "%Y%m%d") {
                let time = tokens
                    .get(i + 1)
                    .filter(|t| t.len() == 6 && t.chars().all(|c| c.is_ascii_digit()))
                    .and_then(|t| chrono::NaiveTime::parse_from_str(t, "%H%M%S").ok())
                    .unwrap_or_else(|| chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap());
                return Some(date.and_time(time).and_utc().timestamp() as f64);
            }
        }
    }
    None
}

// =============================================================================
// Quality configuration
// =============================================================================

/// Statistical checks for one variable, split into the simple suite run on
/// every file and the advanced suite run over combined period files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariableChecks {
    pub simple: StatisticalChecks,
    pub advanced: StatisticalChecks,
}

/// Quality-check configuration: which instrument checks run, with what
/// defaults, and which statistical checks each variable gets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub instrument: InstrumentChecks,
    pub variables: HashMap<String, VariableChecks>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        use crate::qc::statistical::{Bound, Sentinel, SpikeCheck};

        let velocity = VariableChecks {
            simple: StatisticalChecks {
                bounds: Some([Bound::Number(-3.0), Bound::Number(3.0)]),
                spike: Some(SpikeCheck { threshold: 1.0 }),
                ..Default::default()
            },
            advanced: StatisticalChecks::default(),
        };
        let mut variables = HashMap::new();
        variables.insert("u".to_string(), velocity.clone());
        variables.insert("v".to_string(), velocity.clone());
        variables.insert("w".to_string(), velocity);
        variables.insert(
            "temp".to_string(),
            VariableChecks {
                simple: StatisticalChecks {
                    bounds: Some([Bound::Number(0.0), Bound::Number(40.0)]),
                    ..Default::default()
                },
                advanced: StatisticalChecks::default(),
            },
        );
        variables.insert(
            "time".to_string(),
            VariableChecks {
                simple: StatisticalChecks {
                    bounds: Some([Bound::Number(0.0), Bound::Sentinel(Sentinel::Now)]),
                    ..Default::default()
                },
                advanced: StatisticalChecks::default(),
            },
        );

        Self {
            instrument: InstrumentChecks::standard(),
            variables,
        }
    }
}

impl QualityConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| AdcpError::Configuration {
            message: format!("failed to parse {}: {e}", path.display()),
        })
    }
}
