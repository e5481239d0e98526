//! Error handling for ADCP processing operations.
//!
//! Distinguishes unprocessable input (decode failures, empty deployment
//! windows) from configuration errors and writer inconsistencies so callers
//! can decide between skip, abort and warn.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdcpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NetCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),

    #[error("Failed to decode instrument file {path}: {reason}")]
    DecodeFailed { path: PathBuf, reason: String },

    #[error("No valid data window in file {path}")]
    EmptyWindow { path: PathBuf },

    #[error(
        "Missing threshold for enabled check '{check}' (no deployment override, no configured default)"
    )]
    MissingThreshold { check: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Variable '{variable}' has shape {found:?}, expected {expected:?}")]
    ShapeMismatch {
        variable: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Unknown output period policy '{policy}'")]
    UnknownPeriod { policy: String },

    #[error("Variable not found in dataset: {name}")]
    UnknownVariable { name: String },

    #[error("Flag bit registry is inconsistent: {reason}")]
    FlagRegistry { reason: String },
}

pub type Result<T> = std::result::Result<T, AdcpError>;
