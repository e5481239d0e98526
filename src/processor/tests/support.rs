//! Shared fixtures for processor tests

use crate::config::DeploymentParams;
use crate::error::Result;
use crate::models::{Dataset, DeploymentContext, Orientation, VariableRecord};
use crate::reader::{InstrumentReader, RawDeployment};
use chrono::{TimeZone, Utc};
use ndarray::{Array1, Array2, Array3};
use std::path::Path;

/// Monday 2021-03-01 00:00 UTC, a convenient week-aligned origin
pub fn t0() -> f64 {
    Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap().timestamp() as f64
}

pub fn context() -> DeploymentContext {
    DeploymentContext {
        orientation: Orientation::Up,
        cabled: true,
        transducer_depth: 8.0,
        bottom_depth: 110.0,
        beam_angle_deg: 20.0,
        beam_freq_khz: 600.0,
        xmit_length: 0.6,
        noise_floor: 40.0,
        window: None,
    }
}

/// Small two-bin dataset with a profile and a series variable; `u` values
/// encode the day offset so merges can be traced back to their batch.
pub fn dataset(day_offsets: &[u32]) -> Dataset {
    let times = Array1::from_iter(day_offsets.iter().map(|&d| t0() + d as f64 * 86400.0));
    let n = times.len();
    let mut ds = Dataset::new(context(), times, ndarray::arr1(&[6.0, 5.0]));

    let u = Array2::from_shape_fn((2, n), |(i, j)| {
        day_offsets[j] as f64 + i as f64 / 10.0
    });
    ds.push_variable(VariableRecord::profile("u", "m s-1", "eastern velocity", u))
        .unwrap();
    let v = Array2::from_elem((2, n), 0.1);
    ds.push_variable(VariableRecord::profile("v", "m s-1", "northern velocity", v))
        .unwrap();
    let temp = Array1::from_iter(day_offsets.iter().map(|&d| 4.0 + d as f64 / 100.0));
    ds.push_variable(VariableRecord::series("temp", "degC", "temperature", temp))
        .unwrap();
    ds
}

/// Reader producing a deterministic synthetic deployment regardless of the
/// file contents: 3 depth bins, 4 samples at 10-minute spacing, with a
/// correlation drop on beam 2 at the first sample and one out-of-bounds
/// `u` value.
#[derive(Debug)]
pub struct SyntheticReader;

impl InstrumentReader for SyntheticReader {
    fn read(&self, _path: &Path, _params: &DeploymentParams) -> Result<RawDeployment> {
        let n_depth = 3;
        let n_time = 4;
        let mut corr = Array3::from_elem((4, n_depth, n_time), 0.8);
        for i in 0..n_depth {
            corr[[1, i, 0]] = 50.0 / 255.0;
        }
        let mut u = Array2::from_elem((n_depth, n_time), 0.2);
        u[[0, 0]] = 5.0;

        Ok(RawDeployment {
            time: Array1::from_iter((0..n_time).map(|i| t0() + i as f64 * 600.0)),
            depth: ndarray::arr1(&[7.0, 6.0, 5.0]),
            u,
            v: Array2::from_elem((n_depth, n_time), 0.1),
            w: Array2::zeros((n_depth, n_time)),
            error_velocity: Array2::zeros((n_depth, n_time)),
            corr,
            prcnt_gd: {
                let mut pg = Array3::zeros((4, n_depth, n_time));
                pg.index_axis_mut(ndarray::Axis(0), 3).fill(90.0);
                pg
            },
            echo: Array3::from_elem((4, n_depth, n_time), 100.0),
            heading: Array1::zeros(n_time),
            roll: Array1::zeros(n_time),
            pitch: Array1::zeros(n_time),
            temperature: Array1::from_elem(n_time, 6.0),
            battery: Array1::from_elem(n_time, 12.0),
            beam_angle_deg: 20.0,
            beam_freq_khz: 600.0,
            xmit_length: 0.6,
        })
    }
}
