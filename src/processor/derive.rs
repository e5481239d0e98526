//! Masking and derived variables
//!
//! Applies composed flags to the raw arrays (flagged samples become NaN)
//! and computes the Level 2 quantities from the masked data: depth-averaged
//! speed and direction, optionally rotated and smoothed velocity, and a
//! backscatter proxy.

use crate::constants::{BEAM_COUNT, SMOOTHING_WINDOW};
use crate::error::{AdcpError, Result};
use crate::models::{qual_name, Dataset, VarData, VariableRecord};
use ndarray::{Array1, Array2};
use tracing::{debug, warn};

// Working-beam sonar equation constants (Deines 1999)
/// Instrument constant [dB]
const SONAR_CONSTANT_DB: f64 = -139.3;
/// Count-to-dB conversion numerator; Kc = 127.3 / (Te + 273.16)
const KC_NUMERATOR: f64 = 127.3;
/// Nominal battery level used to scale transmit power on battery deployments
const NOMINAL_BATTERY: f64 = 32.0;

/// Replace every element whose flag is nonzero with NaN. Pure; shapes must
/// already agree.
pub fn mask(data: &VarData, flags: &VarData) -> VarData {
    match (data, flags) {
        (VarData::Series(values), VarData::Series(qual)) => {
            let mut out = values.clone();
            for (v, &q) in out.iter_mut().zip(qual.iter()) {
                if q > 0.0 {
                    *v = f64::NAN;
                }
            }
            VarData::Series(out)
        }
        (VarData::Profile(values), VarData::Profile(qual)) => {
            let mut out = values.clone();
            for (v, &q) in out.iter_mut().zip(qual.iter()) {
                if q > 0.0 {
                    *v = f64::NAN;
                }
            }
            VarData::Profile(out)
        }
        _ => data.clone(),
    }
}

/// Mask every variable that has a companion `<name>_qual` variable
pub fn mask_dataset(ds: &mut Dataset) {
    let names: Vec<String> = ds
        .variables
        .iter()
        .filter(|v| !v.is_qual())
        .map(|v| v.name.clone())
        .collect();
    for name in names {
        let Some(qual) = ds.variable(&qual_name(&name)).map(|q| q.data.clone()) else {
            continue;
        };
        if let Some(record) = ds.variable_mut(&name) {
            record.data = mask(&record.data, &qual);
        }
    }
}

/// Mean over the depth axis ignoring NaN; all-NaN columns stay NaN
fn depth_mean(profile: &Array2<f64>) -> Array1<f64> {
    Array1::from_iter(profile.columns().into_iter().map(|col| {
        let mut sum = 0.0;
        let mut n = 0usize;
        for &v in col.iter() {
            if v.is_finite() {
                sum += v;
                n += 1;
            }
        }
        if n > 0 {
            sum / n as f64
        } else {
            f64::NAN
        }
    }))
}

/// Rotate the horizontal velocity by a fixed angle [deg], per sample
pub fn rotate_velocity(u: &Array2<f64>, v: &Array2<f64>, angle_deg: f64) -> (Array2<f64>, Array2<f64>) {
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let ru = u * cos - v * sin;
    let rv = u * sin + v * cos;
    (ru, rv)
}

/// Centered moving average along the time axis of each depth row.
///
/// NaN samples are excluded from the window average instead of propagating;
/// a window with no finite samples stays NaN. Edge windows are truncated.
pub fn moving_average_filter(profile: &Array2<f64>, window: usize) -> Array2<f64> {
    let half = window.max(1) / 2;
    let (n_depth, n_time) = profile.dim();
    Array2::from_shape_fn((n_depth, n_time), |(i, j)| {
        let lo = j.saturating_sub(half);
        let hi = (j + half).min(n_time - 1);
        let mut sum = 0.0;
        let mut n = 0usize;
        for k in lo..=hi {
            let v = profile[[i, k]];
            if v.is_finite() {
                sum += v;
                n += 1;
            }
        }
        if n > 0 {
            sum / n as f64
        } else {
            f64::NAN
        }
    })
}

fn profile_data<'a>(ds: &'a Dataset, name: &str) -> Result<&'a Array2<f64>> {
    match ds.variable(name).map(|v| &v.data) {
        Some(VarData::Profile(a)) => Ok(a),
        _ => Err(AdcpError::UnknownVariable {
            name: name.to_string(),
        }),
    }
}

/// Compute the Level 2 derived variables from the masked dataset, in
/// dependency order: depth means, speed, direction, rotation, smoothing,
/// backscatter.
pub fn derive_variables(ds: &mut Dataset, rotate_deg: f64) -> Result<()> {
    let u = profile_data(ds, "u")?.clone();
    let v = profile_data(ds, "v")?.clone();

    debug!("computing depth-averaged velocity");
    let mu = depth_mean(&u);
    let mv = depth_mean(&v);

    let speed = Array1::from_iter(
        mu.iter()
            .zip(mv.iter())
            .map(|(&a, &b)| (a * a + b * b).sqrt()),
    );
    let direction = Array1::from_iter(mu.iter().zip(mv.iter()).map(|(&a, &b)| {
        let deg = b.atan2(a).to_degrees();
        if deg < 0.0 {
            deg + 360.0
        } else {
            deg
        }
    }));
    ds.push_variable(VariableRecord::series(
        "mU",
        "m s-1",
        "modulus of depth-averaged velocity",
        speed,
    ))?;
    ds.push_variable(VariableRecord::series(
        "mdir",
        "deg",
        "direction (anticlockwise from east) of depth-averaged velocity",
        direction,
    ))?;

    let (mut u, mut v) = if rotate_deg != 0.0 {
        debug!(angle = rotate_deg, "rotating horizontal velocity");
        rotate_velocity(&u, &v, rotate_deg)
    } else {
        (u, v)
    };

    debug!("smoothing velocity with a centered moving average");
    u = moving_average_filter(&u, SMOOTHING_WINDOW);
    v = moving_average_filter(&v, SMOOTHING_WINDOW);
    ds.set_data("u", VarData::Profile(u))?;
    ds.set_data("v", VarData::Profile(v))?;
    let w = match ds.variable("w").map(|rec| &rec.data) {
        Some(VarData::Profile(a)) => Some(a.clone()),
        _ => None,
    };
    if let Some(w) = w {
        ds.set_data(
            "w",
            VarData::Profile(moving_average_filter(&w, SMOOTHING_WINDOW)),
        )?;
    }

    derive_backscatter(ds)?;
    Ok(())
}

/// Absolute backscatter from the working-beam sonar equation, averaged
/// across beams. Falls back to the plain across-beam echo mean (unit
/// `counts` instead of `dB`) when temperature or power inputs are missing;
/// the substitution is logged.
fn derive_backscatter(ds: &mut Dataset) -> Result<()> {
    let echoes: Vec<Array2<f64>> = match (1..=BEAM_COUNT)
        .map(|k| profile_data(ds, &format!("echo{k}")).cloned())
        .collect::<Result<Vec<_>>>()
    {
        Ok(e) => e,
        // No echo data at all: nothing to derive
        Err(_) => return Ok(()),
    };
    let (n_depth, n_time) = echoes[0].dim();

    let temp = match ds.variable("temp").map(|v| &v.data) {
        Some(VarData::Series(a)) => Some(a.clone()),
        _ => None,
    };
    let battery = match ds.variable("battery").map(|v| &v.data) {
        Some(VarData::Series(a)) => Some(a.clone()),
        _ => None,
    };

    let ctx = ds.context.clone();
    let physics_ready = ctx.noise_floor.is_finite()
        && temp.as_ref().is_some_and(|t| t.iter().any(|v| v.is_finite()))
        && (ctx.cabled
            || battery
                .as_ref()
                .is_some_and(|b| b.iter().any(|v| v.is_finite())));

    let (sv, unit) = if physics_ready {
        let temp = temp.unwrap();
        let alpha = water_absorption_db_per_m(ctx.beam_freq_khz);
        let pulse_db = 10.0 * ctx.xmit_length.log10();
        let nominal_power = nominal_transmit_power_w(ctx.beam_freq_khz);
        let cos_angle = ctx.beam_angle_rad().cos();

        let sv = Array2::from_shape_fn((n_depth, n_time), |(i, j)| {
            let range = ds.depth[i].abs() / cos_angle;
            if range <= 0.0 {
                return f64::NAN;
            }
            let t = temp[j];
            let power = if ctx.cabled {
                nominal_power
            } else {
                let b = battery.as_ref().map(|b| b[j]).unwrap_or(f64::NAN);
                nominal_power * (b / NOMINAL_BATTERY).powi(2)
            };
            let power_db = 10.0 * power.log10();
            let kc = KC_NUMERATOR / (t + 273.16);
            let mut sum = 0.0;
            let mut n = 0usize;
            for echo in &echoes {
                let e = echo[[i, j]];
                if e.is_finite() {
                    sum += SONAR_CONSTANT_DB
                        + 10.0 * ((t + 273.16) * range * range).log10()
                        - pulse_db
                        - power_db
                        + 2.0 * alpha * range
                        + kc * (e - ctx.noise_floor);
                    n += 1;
                }
            }
            if n > 0 {
                sum / n as f64
            } else {
                f64::NAN
            }
        });
        (sv, "dB")
    } else {
        warn!(
            "backscatter inputs unavailable, falling back to across-beam echo mean \
             (units become counts)"
        );
        let sv = Array2::from_shape_fn((n_depth, n_time), |(i, j)| {
            let mut sum = 0.0;
            let mut n = 0usize;
            for echo in &echoes {
                let e = echo[[i, j]];
                if e.is_finite() {
                    sum += e;
                    n += 1;
                }
            }
            if n > 0 {
                sum / n as f64
            } else {
                f64::NAN
            }
        });
        (sv, "counts")
    };

    ds.push_variable(VariableRecord::profile(
        "Sv",
        unit,
        "absolute backscatter",
        sv,
    ))
}

/// Freshwater sound absorption [dB/m], linearized over the working bands
fn water_absorption_db_per_m(freq_khz: f64) -> f64 {
    if freq_khz >= 900.0 {
        0.44
    } else if freq_khz >= 450.0 {
        0.14
    } else {
        0.068
    }
}

/// Nominal transmit power [W] per frequency band
fn nominal_transmit_power_w(freq_khz: f64) -> f64 {
    if freq_khz >= 900.0 {
        4.8
    } else if freq_khz >= 450.0 {
        9.0
    } else {
        14.0
    }
}
