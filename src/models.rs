//! Data models for ADCP processing
//!
//! Core structures representing one deployment's metadata, its physical
//! variables and the shared time/depth axes that every output file carries.

use crate::error::{AdcpError, Result};
use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

// =============================================================================
// Deployment Metadata
// =============================================================================

/// Mounting orientation of the transducer head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// Looking toward the surface; the sidelobe interface is the surface
    Up,
    /// Looking toward the sediment; the interface is the bottom
    Down,
}

/// Immutable per-deployment metadata, supplied once per raw file.
///
/// Combines instrument configuration read from the raw file (beam geometry)
/// with site parameters from the deployment table (depths, cabling).
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentContext {
    /// Transducer orientation
    pub orientation: Orientation,

    /// Whether the mooring is cabled to shore power
    pub cabled: bool,

    /// Depth of the transducer head below the surface [m]
    pub transducer_depth: f64,

    /// Lake or sea bottom depth at the mooring [m]
    pub bottom_depth: f64,

    /// Beam angle from the vertical [deg]
    pub beam_angle_deg: f64,

    /// Carrier frequency [kHz]
    pub beam_freq_khz: f64,

    /// Transmit pulse length [m]
    pub xmit_length: f64,

    /// Reference noise floor: minimum echo count over the deployment
    pub noise_floor: f64,

    /// Configured deployment time window, if any
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl DeploymentContext {
    /// Beam angle in radians
    pub fn beam_angle_rad(&self) -> f64 {
        self.beam_angle_deg.to_radians()
    }

    /// Validate geometry for internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.transducer_depth < 0.0 {
            return Err(AdcpError::Configuration {
                message: format!(
                    "transducer depth {} must be non-negative",
                    self.transducer_depth
                ),
            });
        }
        if self.bottom_depth <= self.transducer_depth {
            return Err(AdcpError::Configuration {
                message: format!(
                    "bottom depth {} must exceed transducer depth {}",
                    self.bottom_depth, self.transducer_depth
                ),
            });
        }
        if !(0.0..90.0).contains(&self.beam_angle_deg) {
            return Err(AdcpError::Configuration {
                message: format!("beam angle {} out of range [0, 90)", self.beam_angle_deg),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Variables
// =============================================================================

/// Semantic shape of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarAxes {
    /// One value per time step
    Time,
    /// Depth-resolved profile per time step, stored as (depth, time)
    DepthTime,
}

/// Dense payload of a variable
#[derive(Debug, Clone, PartialEq)]
pub enum VarData {
    Series(Array1<f64>),
    Profile(Array2<f64>),
}

impl VarData {
    /// Length along the time axis
    pub fn time_len(&self) -> usize {
        match self {
            VarData::Series(a) => a.len(),
            VarData::Profile(a) => a.ncols(),
        }
    }

    pub fn axes(&self) -> VarAxes {
        match self {
            VarData::Series(_) => VarAxes::Time,
            VarData::Profile(_) => VarAxes::DepthTime,
        }
    }
}

/// One named physical quantity with its unit, label and dense array
#[derive(Debug, Clone, PartialEq)]
pub struct VariableRecord {
    pub name: String,
    pub unit: String,
    pub long_name: String,
    pub data: VarData,
}

impl VariableRecord {
    pub fn series(
        name: impl Into<String>,
        unit: impl Into<String>,
        long_name: impl Into<String>,
        data: Array1<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            long_name: long_name.into(),
            data: VarData::Series(data),
        }
    }

    pub fn profile(
        name: impl Into<String>,
        unit: impl Into<String>,
        long_name: impl Into<String>,
        data: Array2<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            long_name: long_name.into(),
            data: VarData::Profile(data),
        }
    }

    pub fn axes(&self) -> VarAxes {
        self.data.axes()
    }

    /// Name of this variable's companion flag variable
    pub fn qual_name(&self) -> String {
        qual_name(&self.name)
    }

    /// Whether this record is itself a flag variable
    pub fn is_qual(&self) -> bool {
        self.name.ends_with("_qual")
    }
}

/// Companion flag-variable name for a data variable
pub fn qual_name(name: &str) -> String {
    format!("{name}_qual")
}

// =============================================================================
// Dataset
// =============================================================================

/// One deployment's variables sharing a time axis and a depth axis.
///
/// Created fresh per processing run and folded into period files by the
/// writer; period files are the only long-lived state.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub context: DeploymentContext,
    /// Epoch seconds, monotonically increasing
    pub time: Array1<f64>,
    /// Nominal depth of each bin [m], corrected for the transducer location
    pub depth: Array1<f64>,
    pub variables: Vec<VariableRecord>,
}

impl Dataset {
    pub fn new(context: DeploymentContext, time: Array1<f64>, depth: Array1<f64>) -> Self {
        Self {
            context,
            time,
            depth,
            variables: Vec::new(),
        }
    }

    pub fn variable(&self, name: &str) -> Option<&VariableRecord> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn variable_mut(&mut self, name: &str) -> Option<&mut VariableRecord> {
        self.variables.iter_mut().find(|v| v.name == name)
    }

    /// Add a variable after checking its axes against the dataset's
    pub fn push_variable(&mut self, record: VariableRecord) -> Result<()> {
        let expected = match record.axes() {
            VarAxes::Time => vec![self.time.len()],
            VarAxes::DepthTime => vec![self.depth.len(), self.time.len()],
        };
        let found = match &record.data {
            VarData::Series(a) => vec![a.len()],
            VarData::Profile(a) => vec![a.nrows(), a.ncols()],
        };
        if expected != found {
            return Err(AdcpError::ShapeMismatch {
                variable: record.name,
                expected,
                found,
            });
        }
        // Replace in place so reruns stay idempotent
        if let Some(existing) = self.variable_mut(&record.name) {
            *existing = record;
        } else {
            self.variables.push(record);
        }
        Ok(())
    }

    /// Replace an existing variable's payload, keeping unit and label
    pub fn set_data(&mut self, name: &str, data: VarData) -> Result<()> {
        let record = self
            .variable_mut(name)
            .ok_or_else(|| AdcpError::UnknownVariable {
                name: name.to_string(),
            })?;
        if record.data.axes() != data.axes() {
            return Err(AdcpError::ShapeMismatch {
                variable: name.to_string(),
                expected: vec![record.data.time_len()],
                found: vec![data.time_len()],
            });
        }
        record.data = data;
        Ok(())
    }
}
