//! Instrument-specific quality checks
//!
//! Each check is a pure function comparing one or more raw arrays against a
//! threshold and producing a boolean array of matching shape. Profile checks
//! return `(depth, time)` masks; the tilt check returns one value per time
//! step and is broadcast over the depth column by the engine.
//!
//! Comparisons against NaN are false, so a check fed all-missing data
//! produces an all-clear mask rather than an error.

use crate::constants::CORRELATION_FULL_SCALE;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView3, Axis};

/// Sidelobe interference near the surface (upward-looking deployment).
///
/// The critical range is `transducer_depth * (1 - cos(beam_angle))`. Bin
/// depths decrease with bin index for an upward instrument; the first bin
/// shallower than the critical range and every farther bin are flagged,
/// plus one extra bin of margin toward the instrument.
pub fn interface_top(
    depth: ArrayView1<f64>,
    n_time: usize,
    transducer_depth: f64,
    beam_angle_deg: f64,
) -> Array2<bool> {
    let critical = transducer_depth * (1.0 - beam_angle_deg.to_radians().cos());
    let first = depth.iter().position(|&d| d < critical);
    flag_from_bin(depth.len(), n_time, first)
}

/// Sidelobe interference near the sediment (downward-looking deployment).
///
/// The critical range is `(bottom_depth - transducer_depth) * (1 -
/// cos(beam_angle))`; bins deeper than `bottom_depth - critical` are
/// contaminated, with the same one-bin margin toward the instrument.
pub fn interface_bottom(
    depth: ArrayView1<f64>,
    n_time: usize,
    transducer_depth: f64,
    bottom_depth: f64,
    beam_angle_deg: f64,
) -> Array2<bool> {
    let critical = (bottom_depth - transducer_depth) * (1.0 - beam_angle_deg.to_radians().cos());
    let first = depth.iter().position(|&d| d > bottom_depth - critical);
    flag_from_bin(depth.len(), n_time, first)
}

/// Flag the bin before `first` (conservative margin) and all later bins.
/// No crossing bin means nothing is contaminated.
fn flag_from_bin(n_depth: usize, n_time: usize, first: Option<usize>) -> Array2<bool> {
    let mut flags = Array2::from_elem((n_depth, n_time), false);
    if let Some(idx) = first {
        let start = idx.saturating_sub(1);
        flags.slice_mut(ndarray::s![start.., ..]).fill(true);
    }
    flags
}

/// Low beam coherence: any of the 4 beams' correlation (normalized 0-1)
/// below `threshold_counts / 255`.
pub fn correlation_floor(corr: ArrayView3<f64>, threshold_counts: f64) -> Array2<bool> {
    let threshold = threshold_counts / CORRELATION_FULL_SCALE;
    let (_, n_depth, n_time) = corr.dim();
    Array2::from_shape_fn((n_depth, n_time), |(i, j)| {
        corr.index_axis(Axis(1), i)
            .index_axis(Axis(1), j)
            .iter()
            .any(|&c| c < threshold)
    })
}

/// Too few 3- or 4-beam solutions: `PG1 + PG4 < min_percent`.
pub fn percent_good_14(
    pg1: ArrayView2<f64>,
    pg4: ArrayView2<f64>,
    min_percent: f64,
) -> Array2<bool> {
    let mut flags = Array2::from_elem(pg1.dim(), false);
    ndarray::Zip::from(&mut flags)
        .and(&pg1)
        .and(&pg4)
        .for_each(|f, &a, &b| *f = a + b < min_percent);
    flags
}

/// Too many pings rejected by onboard processing: `PG3 > max_percent`.
pub fn percent_good_3(pg3: ArrayView2<f64>, max_percent: f64) -> Array2<bool> {
    pg3.mapv(|v| v > max_percent)
}

/// Excessive error velocity: `|eu| > max_error`.
pub fn velocity_error(eu: ArrayView2<f64>, max_error: f64) -> Array2<bool> {
    eu.mapv(|v| v.abs() > max_error)
}

/// Excessive tilt: `|roll| > max_tilt OR |pitch| > max_tilt`.
///
/// Tilt corrupts the whole profile, so the result is one flag per time step
/// covering every depth bin at that time.
pub fn tilt(roll: ArrayView1<f64>, pitch: ArrayView1<f64>, max_tilt: f64) -> Array1<bool> {
    let mut flags = Array1::from_elem(roll.len(), false);
    ndarray::Zip::from(&mut flags)
        .and(&roll)
        .and(&pitch)
        .for_each(|f, &r, &p| *f = r.abs() > max_tilt || p.abs() > max_tilt);
    flags
}

/// Beams disagreeing: population std-dev across the 4 beams' correlation
/// above `max_std` (scale 0-1).
pub fn correlation_spread(corr: ArrayView3<f64>, max_std: f64) -> Array2<bool> {
    let (n_beam, n_depth, n_time) = corr.dim();
    Array2::from_shape_fn((n_depth, n_time), |(i, j)| {
        let mut sum = 0.0;
        for k in 0..n_beam {
            sum += corr[[k, i, j]];
        }
        let mean = sum / n_beam as f64;
        let mut var = 0.0;
        for k in 0..n_beam {
            let d = corr[[k, i, j]] - mean;
            var += d * d;
        }
        (var / n_beam as f64).sqrt() > max_std
    })
}

/// Obstacle detection: first difference of echo amplitude along depth, for
/// any beam, exceeding `max_step`. The first bin has no predecessor and is
/// never flagged.
pub fn echo_step(echo: ArrayView3<f64>, max_step: f64) -> Array2<bool> {
    let (n_beam, n_depth, n_time) = echo.dim();
    Array2::from_shape_fn((n_depth, n_time), |(i, j)| {
        if i == 0 {
            return false;
        }
        (0..n_beam).any(|k| echo[[k, i, j]] - echo[[k, i - 1, j]] > max_step)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array3};

    #[test]
    fn interface_top_flags_toward_surface() {
        // Upward instrument at 8 m, 20 deg beams: critical range ~0.48 m.
        // Depths decrease with bin index; bin 3 is the first inside it.
        let depth = arr1(&[6.0, 4.0, 2.0, 0.3, 0.1]);
        let flags = interface_top(depth.view(), 2, 8.0, 20.0);
        for j in 0..2 {
            assert!(!flags[[0, j]]);
            assert!(!flags[[1, j]]);
            // One-bin conservative margin
            assert!(flags[[2, j]]);
            assert!(flags[[3, j]]);
            assert!(flags[[4, j]]);
        }
    }

    #[test]
    fn interface_flags_are_monotonic_in_depth() {
        let depth = arr1(&[6.0, 4.0, 2.0, 0.3, 0.1]);
        let flags = interface_top(depth.view(), 3, 8.0, 20.0);
        for j in 0..3 {
            let mut seen = false;
            for i in 0..depth.len() {
                if flags[[i, j]] {
                    seen = true;
                } else {
                    assert!(!seen, "flagged bin followed by an unflagged farther bin");
                }
            }
        }
    }

    #[test]
    fn interface_without_crossing_is_all_clear() {
        let depth = arr1(&[6.0, 4.0, 2.0]);
        let flags = interface_top(depth.view(), 2, 8.0, 20.0);
        assert!(!flags.iter().any(|&f| f));
    }

    #[test]
    fn interface_bottom_flags_toward_sediment() {
        // Downward instrument at 8 m over 110 m bottom: critical ~6.15 m,
        // so bins deeper than ~103.8 m are contaminated.
        let depth = arr1(&[50.0, 90.0, 104.0, 108.0]);
        let flags = interface_bottom(depth.view(), 1, 8.0, 110.0, 20.0);
        assert!(!flags[[0, 0]]);
        assert!(flags[[1, 0]]); // margin bin
        assert!(flags[[2, 0]]);
        assert!(flags[[3, 0]]);
    }

    #[test]
    fn correlation_floor_flags_whole_column_on_one_bad_beam() {
        // (4 beams, 3 depths, 2 times), beam 2 at 50 counts at time 0,
        // threshold 64 counts: all depths flagged at time 0 only.
        let mut corr = Array3::from_elem((4, 3, 2), 200.0 / 255.0);
        for i in 0..3 {
            corr[[1, i, 0]] = 50.0 / 255.0;
        }
        let flags = correlation_floor(corr.view(), 64.0);
        for i in 0..3 {
            assert!(flags[[i, 0]]);
            assert!(!flags[[i, 1]]);
        }
    }

    #[test]
    fn tilt_flags_only_the_tilted_ensemble() {
        let roll = arr1(&[0.0, 20.0, 0.0]);
        let pitch = arr1(&[0.0, 0.0, 0.0]);
        let flags = tilt(roll.view(), pitch.view(), 15.0);
        assert_eq!(flags.to_vec(), vec![false, true, false]);
    }

    #[test]
    fn percent_good_checks() {
        let pg1 = ndarray::arr2(&[[10.0, 20.0]]);
        let pg4 = ndarray::arr2(&[[10.0, 20.0]]);
        let flags = percent_good_14(pg1.view(), pg4.view(), 25.0);
        assert!(flags[[0, 0]]);
        assert!(!flags[[0, 1]]);

        let pg3 = ndarray::arr2(&[[30.0, 10.0]]);
        let flags = percent_good_3(pg3.view(), 25.0);
        assert!(flags[[0, 0]]);
        assert!(!flags[[0, 1]]);
    }

    #[test]
    fn velocity_error_is_two_sided() {
        let eu = ndarray::arr2(&[[-0.2, 0.01, 0.2]]);
        let flags = velocity_error(eu.view(), 0.05);
        assert_eq!(
            flags.row(0).to_vec(),
            vec![true, false, true]
        );
    }

    #[test]
    fn correlation_spread_flags_disagreeing_beams() {
        let mut corr = Array3::from_elem((4, 1, 2), 0.5);
        corr[[0, 0, 0]] = 0.9;
        let flags = correlation_spread(corr.view(), 0.01);
        assert!(flags[[0, 0]]);
        assert!(!flags[[0, 1]]);
    }

    #[test]
    fn echo_step_skips_first_bin() {
        let mut echo = Array3::from_elem((4, 3, 1), 100.0);
        echo[[2, 1, 0]] = 160.0; // +60 counts from bin 0 to bin 1 on beam 3
        let flags = echo_step(echo.view(), 30.0);
        assert!(!flags[[0, 0]]);
        assert!(flags[[1, 0]]);
        // Bin 2 drops back by 60; only increases beyond the threshold flag
        assert!(!flags[[2, 0]]);
    }

    #[test]
    fn nan_input_is_all_clear() {
        let corr = Array3::from_elem((4, 2, 2), f64::NAN);
        assert!(!correlation_floor(corr.view(), 64.0).iter().any(|&f| f));
        assert!(!correlation_spread(corr.view(), 0.01).iter().any(|&f| f));
        let eu = Array2::from_elem((2, 2), f64::NAN);
        assert!(!velocity_error(eu.view(), 0.05).iter().any(|&f| f));
    }
}
