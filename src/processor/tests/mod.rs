//! Integration tests for the processor module
//!
//! Exercises the complete pipeline and the incremental writer against real
//! NetCDF files in temporary directories.

pub mod support;
