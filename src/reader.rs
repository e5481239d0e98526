//! Instrument reader seam
//!
//! Decoding the proprietary binary instrument format is delegated to an
//! external collaborator behind the [`InstrumentReader`] trait; the core
//! only sees raw per-beam arrays plus instrument metadata. A reader failure
//! marks the file unprocessable and the pipeline skips it.

use crate::config::DeploymentParams;
use crate::constants::VALID_WINDOW_MIN_CORRELATION;
use crate::error::{AdcpError, Result};
use ndarray::{Array1, Array2, Array3, Axis};
use std::path::Path;

/// Raw per-beam arrays and instrument metadata for one deployment file.
///
/// Profile arrays are `(depth, time)`; beam-resolved arrays are
/// `(beam, depth, time)` with 4 beams. Correlation is normalized to 0-1.
#[derive(Debug, Clone)]
pub struct RawDeployment {
    /// Epoch seconds
    pub time: Array1<f64>,
    /// Bin depths corrected for the transducer location [m]
    pub depth: Array1<f64>,
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    pub w: Array2<f64>,
    /// Error velocity [m/s]
    pub error_velocity: Array2<f64>,
    /// Beam correlation, 0-1
    pub corr: Array3<f64>,
    /// Percentage good per beam solution class [%]
    pub prcnt_gd: Array3<f64>,
    /// Echo amplitude [counts]
    pub echo: Array3<f64>,
    pub heading: Array1<f64>,
    pub roll: Array1<f64>,
    pub pitch: Array1<f64>,
    pub temperature: Array1<f64>,
    pub battery: Array1<f64>,
    /// Beam angle from vertical [deg]
    pub beam_angle_deg: f64,
    /// Carrier frequency [kHz]
    pub beam_freq_khz: f64,
    /// Transmit pulse length [m]
    pub xmit_length: f64,
}

impl RawDeployment {
    pub fn n_time(&self) -> usize {
        self.time.len()
    }

    pub fn n_depth(&self) -> usize {
        self.depth.len()
    }

    /// Minimum echo count over the deployment, used as the reference noise
    /// floor for backscatter
    pub fn noise_floor(&self) -> f64 {
        self.echo
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::INFINITY, f64::min)
    }

    /// Restrict the deployment to its valid window: the span where the
    /// beam-and-depth-averaged correlation exceeds 20 %, intersected with
    /// the configured deployment window.
    ///
    /// Returns [`AdcpError::EmptyWindow`] when nothing survives.
    pub fn trim_to_valid_window(
        mut self,
        path: &Path,
        window: Option<(f64, f64)>,
    ) -> Result<RawDeployment> {
        let mean_corr = self.corr.mean_axis(Axis(0)).and_then(|m| m.mean_axis(Axis(0)));
        let mean_corr = match mean_corr {
            Some(m) => m,
            None => return Err(AdcpError::EmptyWindow { path: path.into() }),
        };

        let good: Vec<usize> = mean_corr
            .iter()
            .enumerate()
            .filter(|(_, &c)| c * 100.0 > VALID_WINDOW_MIN_CORRELATION)
            .map(|(i, _)| i)
            .collect();
        let (first, last) = match (good.first(), good.last()) {
            (Some(&f), Some(&l)) => (self.time[f], self.time[l]),
            _ => return Err(AdcpError::EmptyWindow { path: path.into() }),
        };

        let (start, end) = match window {
            Some((s, e)) => (s.max(first), e.min(last)),
            None => (first, last),
        };

        let keep: Vec<usize> = self
            .time
            .iter()
            .enumerate()
            .filter(|(_, &t)| t >= start && t <= end)
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(AdcpError::EmptyWindow { path: path.into() });
        }
        if keep.len() == self.n_time() {
            return Ok(self);
        }

        self.time = self.time.select(Axis(0), &keep);
        self.u = self.u.select(Axis(1), &keep);
        self.v = self.v.select(Axis(1), &keep);
        self.w = self.w.select(Axis(1), &keep);
        self.error_velocity = self.error_velocity.select(Axis(1), &keep);
        self.corr = self.corr.select(Axis(2), &keep);
        self.prcnt_gd = self.prcnt_gd.select(Axis(2), &keep);
        self.echo = self.echo.select(Axis(2), &keep);
        self.heading = self.heading.select(Axis(0), &keep);
        self.roll = self.roll.select(Axis(0), &keep);
        self.pitch = self.pitch.select(Axis(0), &keep);
        self.temperature = self.temperature.select(Axis(0), &keep);
        self.battery = self.battery.select(Axis(0), &keep);
        Ok(self)
    }
}

/// External decoder for raw instrument files.
///
/// Implementations turn one raw file plus deployment geometry into a
/// [`RawDeployment`]. The shipped binary registers the platform decoder;
/// tests use synthetic readers.
pub trait InstrumentReader {
    fn read(&self, path: &Path, params: &DeploymentParams) -> Result<RawDeployment>;
}

/// Placeholder reader for builds without a linked instrument decoder.
/// Every file is reported unprocessable and therefore skipped.
#[derive(Debug, Default)]
pub struct NoDecoder;

impl InstrumentReader for NoDecoder {
    fn read(&self, path: &Path, _params: &DeploymentParams) -> Result<RawDeployment> {
        Err(AdcpError::DecodeFailed {
            path: path.into(),
            reason: "no instrument decoder linked into this build".to_string(),
        })
    }
}
