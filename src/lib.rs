//! ADCP Processor Library
//!
//! A Rust library for converting raw acoustic Doppler current-profiler
//! deployments into quality-controlled NetCDF time series at two levels.
//!
//! This library provides tools for:
//! - Composing per-sample quality flags from instrument-specific physical
//!   checks (bit flags) and generic statistical checks (binary layer)
//! - Masking flagged samples and deriving depth-averaged speed, direction,
//!   smoothed velocity and backscatter
//! - Writing period-bucketed NetCDF files incrementally, merging reruns
//!   without duplicating or reordering previously written time steps
//! - Re-assessing persisted Level 1 files with an advanced check suite and
//!   rebuilding Level 2 from them

pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod models;
pub mod processor;
pub mod qc;
pub mod reader;

pub use config::{Config, DeploymentParams, DeploymentTable, PeriodPolicy, QualityConfig};
pub use error::{AdcpError, Result};
pub use models::{Dataset, DeploymentContext, Orientation, VariableRecord};
pub use processor::{Pipeline, ProcessingStats};
pub use reader::{InstrumentReader, RawDeployment};
