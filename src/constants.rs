//! Application constants for the ADCP processor
//!
//! Default quality-check thresholds, physical constants and file naming
//! conventions used throughout the pipeline.

// =============================================================================
// File Patterns and Naming
// =============================================================================

/// Instrument bands processed by default (one directory per band under Level 0)
pub const DEFAULT_BANDS: &[&str] = &["RDI300", "RDI600"];

/// Raw instrument file pattern within a band directory
pub const RAW_FILE_PATTERN: &str = "*.000";

/// Level 1 / Level 2 output file pattern
pub const NC_FILE_PATTERN: &str = "*.nc";

/// Number of most recent raw files considered in live mode
pub const LIVE_FILE_COUNT: usize = 2;

// =============================================================================
// Quality Control Defaults
// =============================================================================

/// Canonical thresholds for the instrument-specific checks.
///
/// These mirror the deployment-independent defaults shipped with the
/// quality-check configuration; a deployment parameter table may override
/// any of them per period.
pub mod default_thresholds {
    /// Minimum per-beam correlation [counts, 0-255 scale]
    pub const CORRELATION_FLOOR: f64 = 64.0;

    /// Minimum PG1 + PG4 [%]
    pub const PERCENT_GOOD_14: f64 = 25.0;

    /// Maximum PG3 [%]
    pub const PERCENT_GOOD_3: f64 = 25.0;

    /// Maximum |error velocity| [m/s]
    pub const VELOCITY_ERROR: f64 = 0.05;

    /// Maximum |roll| or |pitch| [deg]
    pub const TILT: f64 = 15.0;

    /// Maximum std-dev of the 4 beam correlations [0-1]
    pub const CORRELATION_STD: f64 = 0.01;

    /// Maximum along-depth echo increase [counts]
    pub const ECHO_STEP: f64 = 30.0;
}

/// Full-scale correlation count reported by the instrument
pub const CORRELATION_FULL_SCALE: f64 = 255.0;

/// Beam-and-depth-averaged correlation [%] below which an ensemble is
/// considered outside the deployment window
pub const VALID_WINDOW_MIN_CORRELATION: f64 = 20.0;

/// Missing-value sentinel written to output files
pub const FILL_VALUE: f64 = f64::NAN;

/// Depth-axis drift [m] between an existing period file and new data beyond
/// which a warning is raised (the existing axis stays authoritative)
pub const DEPTH_DRIFT_TOLERANCE: f64 = 1.0;

/// Number of acoustic beams
pub const BEAM_COUNT: usize = 4;

/// Default window length for the centered moving-average velocity filter
pub const SMOOTHING_WINDOW: usize = 5;

/// Flag variable unit, shared by every `<name>_qual` variable
pub const QUAL_UNIT: &str = "0 = nothing to report, 1 = more investigation";

/// Time coordinate unit
pub const TIME_UNIT: &str = "seconds since 1970-01-01 00:00:00";
