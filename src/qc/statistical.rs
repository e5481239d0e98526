//! Generic statistical quality checks
//!
//! Variable-agnostic tests parameterized from the quality configuration:
//! range bounds (with open-ended and "now" sentinels), spike, flatline and
//! gradient. Each operates on a `(value, time)` series and produces a
//! boolean mask; profile variables are checked row by row along the time
//! axis, bounds elementwise.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

/// One end of a range bound: a number or a sentinel resolved at evaluation
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Number(f64),
    Sentinel(Sentinel),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentinel {
    #[serde(rename = "-inf")]
    NegInf,
    #[serde(rename = "inf")]
    Inf,
    #[serde(rename = "now")]
    Now,
}

impl Bound {
    /// Resolve to a concrete number; `now` is the current epoch time in
    /// seconds, fixed once per evaluation.
    pub fn resolve(self, now: f64) -> f64 {
        match self {
            Bound::Number(v) => v,
            Bound::Sentinel(Sentinel::NegInf) => f64::NEG_INFINITY,
            Bound::Sentinel(Sentinel::Inf) => f64::INFINITY,
            Bound::Sentinel(Sentinel::Now) => now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeCheck {
    /// Maximum deviation from the mean of the two neighbors
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatlineCheck {
    /// Minimum run length considered stuck
    pub count: usize,
    /// Two samples closer than this are considered equal
    #[serde(default = "default_eps")]
    pub eps: f64,
}

fn default_eps() -> f64 {
    1e-9
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientCheck {
    /// Maximum |dx/dt| in units per second
    pub max_rate: f64,
}

/// Statistical checks enabled for one variable
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticalChecks {
    pub bounds: Option<[Bound; 2]>,
    pub spike: Option<SpikeCheck>,
    pub flatline: Option<FlatlineCheck>,
    pub gradient: Option<GradientCheck>,
}

impl StatisticalChecks {
    pub fn is_empty(&self) -> bool {
        self.bounds.is_none()
            && self.spike.is_none()
            && self.flatline.is_none()
            && self.gradient.is_none()
    }

    /// Combine two check sets; checks present in `other` take precedence.
    /// Used to layer the advanced suite on top of the simple one.
    pub fn merged(&self, other: &StatisticalChecks) -> StatisticalChecks {
        StatisticalChecks {
            bounds: other.bounds.or(self.bounds),
            spike: other.spike.or(self.spike),
            flatline: other.flatline.or(self.flatline),
            gradient: other.gradient.or(self.gradient),
        }
    }
}

/// Run every enabled check over one series. A sample is flagged if any
/// check fires; NaN samples never fire.
pub fn check_series(
    values: ArrayView1<f64>,
    time: ArrayView1<f64>,
    checks: &StatisticalChecks,
    now: f64,
) -> Array1<bool> {
    let n = values.len();
    let mut flags = Array1::from_elem(n, false);

    if let Some([lower, upper]) = checks.bounds {
        let lo = lower.resolve(now);
        let hi = upper.resolve(now);
        for (f, &v) in flags.iter_mut().zip(values.iter()) {
            if v < lo || v > hi {
                *f = true;
            }
        }
    }

    if let Some(spike) = checks.spike {
        for i in 1..n.saturating_sub(1) {
            let neighbors = (values[i - 1] + values[i + 1]) / 2.0;
            if (values[i] - neighbors).abs() > spike.threshold {
                flags[i] = true;
            }
        }
    }

    if let Some(flat) = checks.flatline {
        let mut run_start = 0;
        for i in 1..=n {
            let continues = i < n && (values[i] - values[i - 1]).abs() <= flat.eps;
            if !continues {
                if i - run_start >= flat.count {
                    for f in flags.slice_mut(ndarray::s![run_start..i]) {
                        *f = true;
                    }
                }
                run_start = i;
            }
        }
    }

    if let Some(grad) = checks.gradient {
        for i in 1..n {
            let dt = time[i] - time[i - 1];
            if dt > 0.0 && ((values[i] - values[i - 1]) / dt).abs() > grad.max_rate {
                flags[i] = true;
            }
        }
    }

    flags
}

/// Profile variant: bounds elementwise, series checks per depth row.
pub fn check_profile(
    values: ArrayView2<f64>,
    time: ArrayView1<f64>,
    checks: &StatisticalChecks,
    now: f64,
) -> Array2<bool> {
    let mut flags = Array2::from_elem(values.dim(), false);
    for (row, mut out) in values.outer_iter().zip(flags.outer_iter_mut()) {
        let row_flags = check_series(row, time, checks, now);
        out.assign(&row_flags);
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn times(n: usize) -> Array1<f64> {
        Array1::from_iter((0..n).map(|i| i as f64 * 600.0))
    }

    #[test]
    fn bounds_with_sentinels() {
        let checks = StatisticalChecks {
            bounds: Some([Bound::Sentinel(Sentinel::NegInf), Bound::Number(10.0)]),
            ..Default::default()
        };
        let values = arr1(&[-1e6, 5.0, 11.0, f64::NAN]);
        let flags = check_series(values.view(), times(4).view(), &checks, 0.0);
        assert_eq!(flags.to_vec(), vec![false, false, true, false]);
    }

    #[test]
    fn now_sentinel_resolves_at_evaluation() {
        let checks = StatisticalChecks {
            bounds: Some([Bound::Number(0.0), Bound::Sentinel(Sentinel::Now)]),
            ..Default::default()
        };
        let values = arr1(&[100.0, 2000.0]);
        let flags = check_series(values.view(), times(2).view(), &checks, 1000.0);
        assert_eq!(flags.to_vec(), vec![false, true]);
    }

    #[test]
    fn bounds_deserialize_from_json() {
        let checks: StatisticalChecks =
            serde_json::from_str(r#"{"bounds": ["-inf", 25.5]}"#).unwrap();
        assert_eq!(
            checks.bounds,
            Some([Bound::Sentinel(Sentinel::NegInf), Bound::Number(25.5)])
        );

        let checks: StatisticalChecks =
            serde_json::from_str(r#"{"bounds": [0, "now"], "spike": {"threshold": 2}}"#).unwrap();
        assert_eq!(
            checks.bounds,
            Some([Bound::Number(0.0), Bound::Sentinel(Sentinel::Now)])
        );
        assert_eq!(checks.spike, Some(SpikeCheck { threshold: 2.0 }));
    }

    #[test]
    fn spike_flags_center_sample_only() {
        let checks = StatisticalChecks {
            spike: Some(SpikeCheck { threshold: 3.0 }),
            ..Default::default()
        };
        let values = arr1(&[1.0, 1.0, 9.0, 1.0, 1.0]);
        let flags = check_series(values.view(), times(5).view(), &checks, 0.0);
        assert_eq!(flags.to_vec(), vec![false, false, true, false, false]);
    }

    #[test]
    fn flatline_flags_whole_run() {
        let checks = StatisticalChecks {
            flatline: Some(FlatlineCheck {
                count: 3,
                eps: 1e-9,
            }),
            ..Default::default()
        };
        let values = arr1(&[1.0, 2.0, 2.0, 2.0, 3.0]);
        let flags = check_series(values.view(), times(5).view(), &checks, 0.0);
        assert_eq!(flags.to_vec(), vec![false, true, true, true, false]);
    }

    #[test]
    fn flatline_ignores_nan_runs() {
        let checks = StatisticalChecks {
            flatline: Some(FlatlineCheck {
                count: 2,
                eps: 1e-9,
            }),
            ..Default::default()
        };
        let values = arr1(&[f64::NAN, f64::NAN, f64::NAN, 1.0]);
        let flags = check_series(values.view(), times(4).view(), &checks, 0.0);
        assert!(!flags.iter().any(|&f| f));
    }

    #[test]
    fn gradient_flags_later_sample() {
        let checks = StatisticalChecks {
            gradient: Some(GradientCheck { max_rate: 0.001 }),
            ..Default::default()
        };
        // 600 s spacing: a jump of 6.0 is 0.01/s
        let values = arr1(&[0.0, 0.1, 6.1, 6.2]);
        let flags = check_series(values.view(), times(4).view(), &checks, 0.0);
        assert_eq!(flags.to_vec(), vec![false, false, true, false]);
    }

    #[test]
    fn merged_prefers_advanced_layer() {
        let simple = StatisticalChecks {
            bounds: Some([Bound::Number(0.0), Bound::Number(1.0)]),
            spike: Some(SpikeCheck { threshold: 5.0 }),
            ..Default::default()
        };
        let advanced = StatisticalChecks {
            spike: Some(SpikeCheck { threshold: 2.0 }),
            gradient: Some(GradientCheck { max_rate: 0.1 }),
            ..Default::default()
        };
        let merged = simple.merged(&advanced);
        assert_eq!(merged.spike, Some(SpikeCheck { threshold: 2.0 }));
        assert_eq!(merged.gradient, Some(GradientCheck { max_rate: 0.1 }));
        assert!(merged.bounds.is_some());
        assert!(merged.flatline.is_none());
    }

    #[test]
    fn profile_checks_run_per_row() {
        let checks = StatisticalChecks {
            spike: Some(SpikeCheck { threshold: 3.0 }),
            ..Default::default()
        };
        let values = ndarray::arr2(&[[1.0, 9.0, 1.0], [1.0, 1.0, 1.0]]);
        let flags = check_profile(values.view(), times(3).view(), &checks, 0.0);
        assert!(flags[[0, 1]]);
        assert!(!flags[[1, 1]]);
    }
}
