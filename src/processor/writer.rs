//! Time-windowed incremental NetCDF writer
//!
//! Partitions a continuous series into period buckets and, per bucket,
//! either creates a new output file or merges the new samples into the
//! existing one. The merge computes everything in memory from a read-only
//! handle first and opens the file for write only as the last step, so an
//! aborted run never leaves a half-written bucket. After every write the
//! file's time axis is strictly increasing with no duplicates and every
//! variable matches its length.

use crate::config::{PeriodPolicy, SiteMetadata};
use crate::constants::{DEPTH_DRIFT_TOLERANCE, FILL_VALUE, TIME_UNIT};
use crate::error::{AdcpError, Result};
use crate::models::{
    Dataset, DeploymentContext, Orientation, VarAxes, VarData, VariableRecord,
};
use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use ndarray::{Array1, Array2, Axis};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Writes one dataset into period-bucketed NetCDF files
#[derive(Debug)]
pub struct PeriodWriter {
    folder: PathBuf,
    /// File name prefix, e.g. `L1`
    title: String,
    policy: PeriodPolicy,
    overwrite: bool,
    site: SiteMetadata,
}

impl PeriodWriter {
    pub fn new(
        folder: impl Into<PathBuf>,
        title: impl Into<String>,
        policy: PeriodPolicy,
        site: SiteMetadata,
    ) -> Self {
        Self {
            folder: folder.into(),
            title: title.into(),
            policy,
            overwrite: false,
            site,
        }
    }

    /// Force full bucket replacement instead of merging
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Write the dataset into every bucket its time range overlaps.
    /// Returns the files actually created or modified; an exact duplicate
    /// rerun touches nothing.
    pub fn write(&self, ds: &Dataset) -> Result<Vec<PathBuf>> {
        if ds.time.is_empty() {
            return Ok(Vec::new());
        }
        std::fs::create_dir_all(&self.folder)?;

        let t_min = ds.time.iter().copied().fold(f64::INFINITY, f64::min);
        let t_max = ds.time.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut touched = Vec::new();

        for (start, end) in bucket_bounds(self.policy, t_min, t_max)? {
            let s = start.timestamp() as f64;
            let e = end.timestamp() as f64;
            let filename = format!("{}_{}.nc", self.title, start.format("%Y%m%d_%H%M%S"));
            let path = self.folder.join(filename);

            let clipped = clip_indices(&ds.time, s, e);
            if clipped.is_empty() {
                debug!(bucket = %start, "no samples in bucket, skipping");
                continue;
            }

            let written = if path.exists() && !self.overwrite {
                self.merge_bucket(&path, ds, &clipped)?
            } else {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                info!(
                    file = %path.display(),
                    from = %start, to = %end,
                    "creating period file"
                );
                self.create_bucket(&path, ds, &clipped)?;
                true
            };
            if written {
                touched.push(path);
            }
        }
        Ok(touched)
    }

    fn create_bucket(&self, path: &Path, ds: &Dataset, clipped: &[usize]) -> Result<()> {
        let mut file = netcdf::create(path)?;

        write_global_attributes(&mut file, &self.site, &ds.context)?;
        file.add_unlimited_dimension("time")?;
        file.add_dimension("depth", ds.depth.len())?;

        let times: Vec<f64> = clipped.iter().map(|&i| ds.time[i]).collect();
        {
            let mut var = file.add_variable::<f64>("time", &["time"])?;
            var.put_attribute("units", TIME_UNIT)?;
            var.put_attribute("long_name", "time")?;
            var.put_values(&times, (&[0usize], &[times.len()]))?;
        }
        {
            let depth: Vec<f64> = ds.depth.to_vec();
            let mut var = file.add_variable::<f64>("depth", &["depth"])?;
            var.put_attribute("units", "m")?;
            var.put_attribute("long_name", "nominal depth")?;
            var.put_values(&depth, (&[0usize], &[depth.len()]))?;
        }

        for record in &ds.variables {
            match &record.data {
                VarData::Series(values) => {
                    let clipped_values: Vec<f64> = clipped.iter().map(|&i| values[i]).collect();
                    let mut var = file.add_variable::<f64>(&record.name, &["time"])?;
                    var.set_fill_value(FILL_VALUE)?;
                    var.put_attribute("units", record.unit.as_str())?;
                    var.put_attribute("long_name", record.long_name.as_str())?;
                    var.put_values(&clipped_values, (&[0usize], &[clipped_values.len()]))?;
                }
                VarData::Profile(values) => {
                    let selected = values.select(Axis(1), clipped);
                    let mut var = file.add_variable::<f64>(&record.name, &["depth", "time"])?;
                    var.set_fill_value(FILL_VALUE)?;
                    var.put_attribute("units", record.unit.as_str())?;
                    var.put_attribute("long_name", record.long_name.as_str())?;
                    var.put_values(
                        selected.as_slice().expect("selected array is contiguous"),
                        (&[0usize, 0], &[selected.nrows(), selected.ncols()]),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Merge new samples into an existing bucket. Returns false for the
    /// idempotent no-op case where every time step is already present.
    fn merge_bucket(&self, path: &Path, ds: &Dataset, clipped: &[usize]) -> Result<bool> {
        // Read phase: everything needed is collected from a read-only handle
        // before any mutation.
        let existing = ExistingBucket::read(path)?;

        if existing.depth.len() != ds.depth.len() {
            return Err(AdcpError::ShapeMismatch {
                variable: "depth".to_string(),
                expected: vec![existing.depth.len()],
                found: vec![ds.depth.len()],
            });
        }
        let drift = existing
            .depth
            .iter()
            .zip(ds.depth.iter())
            .map(|(&a, &b)| (a - b).abs())
            .fold(0.0, f64::max);
        if drift > DEPTH_DRIFT_TOLERANCE {
            warn!(
                file = %path.display(),
                drift,
                "depth axis moved beyond tolerance, keeping the existing grid"
            );
        }

        let known: HashSet<u64> = existing.time.iter().map(|t| t.to_bits()).collect();
        let new_idx: Vec<usize> = clipped
            .iter()
            .copied()
            .filter(|&i| !known.contains(&ds.time[i].to_bits()))
            .collect();
        if new_idx.is_empty() {
            info!(file = %path.display(), "duplicated run, no data added");
            return Ok(false);
        }

        let old_n = existing.time.len();
        let mut combined_time = existing.time.clone();
        combined_time.extend(new_idx.iter().map(|&i| ds.time[i]));
        let order = argsort(&combined_time);
        let sorted_time: Vec<f64> = order.iter().map(|&k| combined_time[k]).collect();

        // Every variable present in the file or the dataset gets rebuilt on
        // the combined ordering; one side missing contributes fill values.
        let mut names: Vec<String> = existing.variables.iter().map(|v| v.name.clone()).collect();
        for record in &ds.variables {
            if !names.iter().any(|n| n == &record.name) {
                names.push(record.name.clone());
            }
        }

        let mut rebuilt: Vec<VariableRecord> = Vec::with_capacity(names.len());
        for name in &names {
            let file_var = existing.variables.iter().find(|v| v.name == *name);
            let ds_var = ds.variable(name);
            let axes = file_var
                .map(|v| v.axes())
                .or_else(|| ds_var.map(|v| v.axes()))
                .expect("variable listed but present nowhere");
            let template = ds_var.or(file_var).expect("variable listed but present nowhere");

            let data = match axes {
                VarAxes::Time => {
                    let mut combined: Vec<f64> = match file_var.map(|v| &v.data) {
                        Some(VarData::Series(a)) => a.to_vec(),
                        _ => vec![FILL_VALUE; old_n],
                    };
                    match ds_var.map(|v| &v.data) {
                        Some(VarData::Series(a)) => {
                            combined.extend(new_idx.iter().map(|&i| a[i]))
                        }
                        _ => combined.extend(std::iter::repeat(FILL_VALUE).take(new_idx.len())),
                    }
                    let sorted: Vec<f64> = order.iter().map(|&k| combined[k]).collect();
                    VarData::Series(Array1::from_vec(sorted))
                }
                VarAxes::DepthTime => {
                    let n_depth = existing.depth.len();
                    let total = old_n + new_idx.len();
                    let mut combined = Array2::from_elem((n_depth, total), FILL_VALUE);
                    if let Some(VarData::Profile(a)) = file_var.map(|v| &v.data) {
                        combined.slice_mut(ndarray::s![.., ..old_n]).assign(a);
                    }
                    if let Some(VarData::Profile(a)) = ds_var.map(|v| &v.data) {
                        for (col, &i) in new_idx.iter().enumerate() {
                            combined
                                .column_mut(old_n + col)
                                .assign(&a.column(i));
                        }
                    }
                    let reordered = combined.select(Axis(1), &order);
                    VarData::Profile(reordered)
                }
            };
            rebuilt.push(VariableRecord {
                name: name.clone(),
                unit: template.unit.clone(),
                long_name: template.long_name.clone(),
                data,
            });
        }

        // Write phase: the file is opened for mutation only now.
        info!(
            file = %path.display(),
            added = new_idx.len(),
            total = sorted_time.len(),
            "merging new samples into period file"
        );
        let mut file = netcdf::append(path)?;
        file.variable_mut("time")
            .ok_or_else(|| AdcpError::UnknownVariable {
                name: "time".to_string(),
            })?
            .put_values(&sorted_time, (&[0usize], &[sorted_time.len()]))?;

        for record in &rebuilt {
            if file.variable(&record.name).is_none() {
                let dims: &[&str] = match record.axes() {
                    VarAxes::Time => &["time"],
                    VarAxes::DepthTime => &["depth", "time"],
                };
                let mut var = file.add_variable::<f64>(&record.name, dims)?;
                var.set_fill_value(FILL_VALUE)?;
                var.put_attribute("units", record.unit.as_str())?;
                var.put_attribute("long_name", record.long_name.as_str())?;
            }
            let mut var = file
                .variable_mut(&record.name)
                .expect("variable added above");
            match &record.data {
                VarData::Series(a) => {
                    let values = a.to_vec();
                    var.put_values(&values, (&[0usize], &[values.len()]))?;
                }
                VarData::Profile(a) => {
                    var.put_values(
                        a.as_slice().expect("rebuilt array is contiguous"),
                        (&[0usize, 0], &[a.nrows(), a.ncols()]),
                    )?;
                }
            }
        }
        Ok(true)
    }
}

/// Snapshot of an existing period file taken through a read-only handle
struct ExistingBucket {
    time: Vec<f64>,
    depth: Vec<f64>,
    variables: Vec<VariableRecord>,
}

impl ExistingBucket {
    fn read(path: &Path) -> Result<Self> {
        let file = netcdf::open(path)?;
        let time = read_f64_values(&file, "time")?;
        let depth = read_f64_values(&file, "depth")?;

        let mut variables = Vec::new();
        for var in file.variables() {
            let name = var.name();
            if name == "time" || name == "depth" {
                continue;
            }
            let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
            let values = var.get_values::<f64, _>(..)?;
            let data = if dims.len() == 2 {
                let arr = Array2::from_shape_vec((depth.len(), time.len()), values).map_err(
                    |_| AdcpError::ShapeMismatch {
                        variable: name.clone(),
                        expected: vec![depth.len(), time.len()],
                        found: vec![],
                    },
                )?;
                VarData::Profile(arr)
            } else {
                VarData::Series(Array1::from_vec(values))
            };
            variables.push(VariableRecord {
                name,
                unit: var_attr_string(&var, "units"),
                long_name: var_attr_string(&var, "long_name"),
                data,
            });
        }
        Ok(Self {
            time,
            depth,
            variables,
        })
    }
}

fn read_f64_values(file: &netcdf::File, name: &str) -> Result<Vec<f64>> {
    Ok(file
        .variable(name)
        .ok_or_else(|| AdcpError::UnknownVariable {
            name: name.to_string(),
        })?
        .get_values::<f64, _>(..)?)
}

fn var_attr_string(var: &netcdf::Variable, name: &str) -> String {
    match var.attribute(name).and_then(|a| a.value().ok()) {
        Some(netcdf::AttributeValue::Str(s)) => s,
        _ => String::new(),
    }
}

fn write_global_attributes(
    file: &mut netcdf::FileMut,
    site: &SiteMetadata,
    ctx: &DeploymentContext,
) -> Result<()> {
    file.add_attribute("institution", site.institution.as_str())?;
    file.add_attribute("source", site.source.as_str())?;
    file.add_attribute("title", site.title.as_str())?;
    file.add_attribute("comment", site.comment.as_str())?;
    file.add_attribute("conventions", site.conventions.as_str())?;
    file.add_attribute("references", site.references.as_str())?;
    file.add_attribute(
        "up",
        if ctx.orientation == Orientation::Up {
            "true"
        } else {
            "false"
        },
    )?;
    file.add_attribute("cabled", if ctx.cabled { "true" } else { "false" })?;
    file.add_attribute("transducer_depth", ctx.transducer_depth)?;
    file.add_attribute("bottom_depth", ctx.bottom_depth)?;
    file.add_attribute("beam_angle", ctx.beam_angle_deg)?;
    file.add_attribute("beam_freq", ctx.beam_freq_khz)?;
    file.add_attribute("xmit_length", ctx.xmit_length)?;
    file.add_attribute("Er", ctx.noise_floor)?;
    Ok(())
}

/// Read a period file back into a dataset, reconstructing the deployment
/// context from the global attributes. Used by the advanced QA pass.
pub fn read_period_file(path: &Path) -> Result<Dataset> {
    let file = netcdf::open(path)?;
    let time = read_f64_values(&file, "time")?;
    let depth = read_f64_values(&file, "depth")?;

    let ctx = DeploymentContext {
        orientation: if attr_string(&file, "up") == "true" {
            Orientation::Up
        } else {
            Orientation::Down
        },
        cabled: attr_string(&file, "cabled") == "true",
        transducer_depth: attr_f64(&file, "transducer_depth").unwrap_or(0.0),
        bottom_depth: attr_f64(&file, "bottom_depth").unwrap_or(f64::MAX),
        beam_angle_deg: attr_f64(&file, "beam_angle").unwrap_or(20.0),
        beam_freq_khz: attr_f64(&file, "beam_freq").unwrap_or(0.0),
        xmit_length: attr_f64(&file, "xmit_length").unwrap_or(0.0),
        noise_floor: attr_f64(&file, "Er").unwrap_or(f64::NAN),
        window: None,
    };

    let mut ds = Dataset::new(ctx, Array1::from_vec(time.clone()), Array1::from_vec(depth.clone()));
    for var in file.variables() {
        let name = var.name();
        if name == "time" || name == "depth" {
            continue;
        }
        let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
        let values = var.get_values::<f64, _>(..)?;
        let data = if dims.len() == 2 {
            VarData::Profile(
                Array2::from_shape_vec((depth.len(), time.len()), values).map_err(|_| {
                    AdcpError::ShapeMismatch {
                        variable: name.clone(),
                        expected: vec![depth.len(), time.len()],
                        found: vec![],
                    }
                })?,
            )
        } else {
            VarData::Series(Array1::from_vec(values))
        };
        ds.push_variable(VariableRecord {
            name: name.clone(),
            unit: var_attr_string(&var, "units"),
            long_name: var_attr_string(&var, "long_name"),
            data,
        })?;
    }
    Ok(ds)
}

fn attr_string(file: &netcdf::File, name: &str) -> String {
    match file.attribute(name).and_then(|a| a.value().ok()) {
        Some(netcdf::AttributeValue::Str(s)) => s,
        _ => String::new(),
    }
}

fn attr_f64(file: &netcdf::File, name: &str) -> Option<f64> {
    match file.attribute(name).and_then(|a| a.value().ok()) {
        Some(netcdf::AttributeValue::Double(v)) => Some(v),
        Some(netcdf::AttributeValue::Float(v)) => Some(v as f64),
        Some(netcdf::AttributeValue::Int(v)) => Some(v as f64),
        _ => None,
    }
}

/// Input indices falling in `[start, end)`, time-sorted with exact
/// duplicates dropped (first occurrence wins)
fn clip_indices(time: &Array1<f64>, start: f64, end: f64) -> Vec<usize> {
    let mut idx: Vec<usize> = time
        .iter()
        .enumerate()
        .filter(|(_, &t)| t >= start && t < end)
        .map(|(i, _)| i)
        .collect();
    idx.sort_by(|&a, &b| {
        time[a]
            .partial_cmp(&time[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut seen = HashSet::new();
    idx.retain(|&i| seen.insert(time[i].to_bits()));
    idx
}

/// Stable ascending argsort of a time axis
fn argsort(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[a]
            .partial_cmp(&values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order
}

/// Bucket `[start, end)` bounds covering `[t_min, t_max]` under the policy.
///
/// Day-based policies align to the Monday of the first sample's week,
/// monthly to the first of the month, yearly to January 1st; `File` spans
/// the whole input in a single bucket.
pub fn bucket_bounds(
    policy: PeriodPolicy,
    t_min: f64,
    t_max: f64,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let dt_min =
        DateTime::<Utc>::from_timestamp(t_min.floor() as i64, 0).ok_or_else(|| {
            AdcpError::Configuration {
                message: format!("time {t_min} is not a valid timestamp"),
            }
        })?;
    let dt_max =
        DateTime::<Utc>::from_timestamp(t_max.floor() as i64, 0).ok_or_else(|| {
            AdcpError::Configuration {
                message: format!("time {t_max} is not a valid timestamp"),
            }
        })? + Duration::seconds(1);

    if policy == PeriodPolicy::File {
        return Ok(vec![(dt_min, dt_max)]);
    }

    let week_start = |dt: DateTime<Utc>| {
        let date = dt.date_naive() - Duration::days(dt.weekday().num_days_from_monday() as i64);
        Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap())
    };
    let mut start = match policy {
        PeriodPolicy::Daily | PeriodPolicy::Weekly | PeriodPolicy::Days(_) => week_start(dt_min),
        PeriodPolicy::Monthly => Utc
            .with_ymd_and_hms(dt_min.year(), dt_min.month(), 1, 0, 0, 0)
            .unwrap(),
        PeriodPolicy::Yearly => Utc.with_ymd_and_hms(dt_min.year(), 1, 1, 0, 0, 0).unwrap(),
        PeriodPolicy::File => unreachable!(),
    };

    let mut buckets = Vec::new();
    while start < dt_max {
        let end = match policy {
            PeriodPolicy::Daily => start + Duration::days(1),
            PeriodPolicy::Weekly => start + Duration::weeks(1),
            PeriodPolicy::Days(n) => start + Duration::days(n as i64),
            PeriodPolicy::Monthly => start
                .checked_add_months(Months::new(1))
                .expect("month arithmetic in range"),
            PeriodPolicy::Yearly => start
                .checked_add_months(Months::new(12))
                .expect("year arithmetic in range"),
            PeriodPolicy::File => unreachable!(),
        };
        buckets.push((start, end));
        start = end;
    }
    Ok(buckets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn weekly_buckets_are_monday_aligned() {
        // 2021-03-03 is a Wednesday
        let t0 = Utc.with_ymd_and_hms(2021, 3, 3, 12, 0, 0).unwrap().timestamp() as f64;
        let t1 = Utc.with_ymd_and_hms(2021, 3, 10, 12, 0, 0).unwrap().timestamp() as f64;
        let buckets = bucket_bounds(PeriodPolicy::Weekly, t0, t1).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(
            buckets[0].0,
            Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(buckets[0].1, buckets[1].0);
    }

    #[test]
    fn monthly_buckets_are_month_aligned() {
        let t0 = Utc.with_ymd_and_hms(2021, 1, 20, 0, 0, 0).unwrap().timestamp() as f64;
        let t1 = Utc.with_ymd_and_hms(2021, 3, 2, 0, 0, 0).unwrap().timestamp() as f64;
        let buckets = bucket_bounds(PeriodPolicy::Monthly, t0, t1).unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(
            buckets[1].0,
            Utc.with_ymd_and_hms(2021, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            buckets[2].1,
            Utc.with_ymd_and_hms(2021, 4, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn file_policy_is_one_bucket_covering_everything() {
        let buckets = bucket_bounds(PeriodPolicy::File, 1000.0, 5000.0).unwrap();
        assert_eq!(buckets.len(), 1);
        assert!(buckets[0].0.timestamp() as f64 <= 1000.0);
        assert!(buckets[0].1.timestamp() as f64 > 5000.0);
    }

    #[test]
    fn clip_indices_sorts_and_dedups() {
        let time = arr1(&[30.0, 10.0, 20.0, 10.0, 99.0]);
        let idx = clip_indices(&time, 0.0, 50.0);
        assert_eq!(idx, vec![1, 2, 0]);
    }

    #[test]
    fn argsort_is_stable() {
        let order = argsort(&[2.0, 1.0, 2.0, 0.5]);
        assert_eq!(order, vec![3, 1, 0, 2]);
    }
}
