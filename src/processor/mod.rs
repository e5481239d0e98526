//! Main processing engine
//!
//! Orchestrates the per-file workflow: decode raw data, compose quality
//! flags, write Level 1, mask and derive, write Level 2. A second entry
//! point runs the advanced QA pass over persisted Level 1 files and
//! re-derives Level 2 from them.

pub mod derive;
pub mod writer;

#[cfg(test)]
pub mod tests;

use crate::config::{Config, DeploymentParams, DeploymentTable, PeriodPolicy, QualityConfig};
use crate::constants::{BEAM_COUNT, LIVE_FILE_COUNT, NC_FILE_PATTERN, QUAL_UNIT, RAW_FILE_PATTERN};
use crate::error::{AdcpError, Result};
use crate::models::{qual_name, Dataset, VarData, VariableRecord};
use crate::qc::{self, validate_bit_registry, FlagEngine, STATISTICAL_BIT};
use crate::reader::{InstrumentReader, RawDeployment};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Axis;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use writer::{read_period_file, PeriodWriter};

/// Outcome counters for one processing run
#[derive(Debug, Default, Clone)]
pub struct ProcessingStats {
    pub files_processed: usize,
    pub files_skipped: usize,
    pub files_failed: usize,
    pub buckets_written: usize,
}

impl ProcessingStats {
    fn absorb(&mut self, other: &ProcessingStats) {
        self.files_processed += other.files_processed;
        self.files_skipped += other.files_skipped;
        self.files_failed += other.files_failed;
        self.buckets_written += other.buckets_written;
    }
}

/// Sequential batch pipeline: one raw file is fully read, flagged, masked,
/// derived and written before the next begins.
pub struct Pipeline {
    config: Config,
    deployments: DeploymentTable,
    quality: QualityConfig,
    reader: Box<dyn InstrumentReader>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        deployments: DeploymentTable,
        quality: QualityConfig,
        reader: Box<dyn InstrumentReader>,
    ) -> Result<Self> {
        validate_bit_registry()?;
        Ok(Self {
            config,
            deployments,
            quality,
            reader,
        })
    }

    /// Process every configured band. `live` restricts each band to its
    /// most recent raw files.
    pub fn process(&self, live: bool) -> Result<ProcessingStats> {
        let mut stats = ProcessingStats::default();
        for band in self.config.bands.clone() {
            let band_stats = self.process_band(&band, live)?;
            stats.absorb(&band_stats);
        }
        self.report(&stats);
        Ok(stats)
    }

    /// Process one instrument band's raw files in chronological order
    pub fn process_band(&self, band: &str, live: bool) -> Result<ProcessingStats> {
        let mut files = discover(&self.config.level0_dir.join(band), RAW_FILE_PATTERN)?;
        if live {
            let keep = files.len().saturating_sub(LIVE_FILE_COUNT);
            files.drain(..keep);
        }
        info!(band, files = files.len(), "processing instrument band");

        let progress = ProgressBar::new(files.len() as u64);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut stats = ProcessingStats::default();
        for file in &files {
            progress.set_message(
                file.file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            );
            match self.process_file(file, band) {
                Ok(buckets) => {
                    stats.files_processed += 1;
                    stats.buckets_written += buckets;
                }
                Err(AdcpError::DecodeFailed { .. }) | Err(AdcpError::EmptyWindow { .. }) => {
                    warn!(file = %file.display(), "unprocessable raw file, skipping");
                    stats.files_skipped += 1;
                }
                Err(err) => {
                    warn!(file = %file.display(), error = %err, "processing failed");
                    stats.files_failed += 1;
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();
        Ok(stats)
    }

    /// Full workflow for one raw file; returns the number of period files
    /// touched across both levels.
    fn process_file(&self, path: &Path, band: &str) -> Result<usize> {
        let params = self.deployments.select(path)?.clone();
        let raw = self.reader.read(path, &params)?;
        let raw = raw.trim_to_valid_window(path, params.window_epoch()?)?;
        let ctx = params.context(&raw)?;

        let mut ds = build_dataset(&raw, ctx)?;
        self.compose_flags(&mut ds, &raw, &params)?;

        let l1 = PeriodWriter::new(
            self.config.level1_dir.join(band),
            "L1",
            self.config.output_period,
            self.config.site.clone(),
        )
        .with_overwrite(self.config.overwrite);
        let touched_l1 = l1.write(&ds)?;

        let mut level2 = ds;
        derive::mask_dataset(&mut level2);
        derive::derive_variables(&mut level2, params.rotate_velocity)?;
        let l2 = PeriodWriter::new(
            self.config.level2_dir.join(band),
            "L2",
            self.config.output_period,
            self.config.site.clone(),
        )
        .with_overwrite(self.config.overwrite);
        let touched_l2 = l2.write(&level2)?;

        debug!(
            file = %path.display(),
            l1 = touched_l1.len(),
            l2 = touched_l2.len(),
            "file processed"
        );
        Ok(touched_l1.len() + touched_l2.len())
    }

    /// Compose the simple statistical suite plus the instrument composite
    /// into a `<name>_qual` variable per configured variable.
    fn compose_flags(
        &self,
        ds: &mut Dataset,
        raw: &RawDeployment,
        params: &DeploymentParams,
    ) -> Result<()> {
        let engine = FlagEngine::new(&self.quality.instrument, &params.overrides);
        let composite = engine.instrument_composite(raw, &ds.context)?;
        let now = chrono::Utc::now().timestamp() as f64;

        let mut names: Vec<&String> = self.quality.variables.keys().collect();
        names.sort();
        for name in names {
            let checks = &self.quality.variables[name].simple;
            let data = if name == "time" {
                VarData::Series(ds.time.clone())
            } else {
                match ds.variable(name) {
                    Some(record) => record.data.clone(),
                    None => continue,
                }
            };
            let flags = qc::variable_flags(&data, ds.time.view(), checks, Some(&composite), now);
            ds.push_variable(VariableRecord {
                name: qual_name(name),
                unit: QUAL_UNIT.to_string(),
                long_name: qual_name(name),
                data: flags.to_var_data(),
            })?;
        }
        Ok(())
    }

    /// Advanced QA pass: combine a band's persisted Level 1 files, run the
    /// advanced statistical suite over the full series, fold the results
    /// back into the files' flag variables and re-derive Level 2.
    pub fn advanced_pass(&self, band: &str) -> Result<ProcessingStats> {
        let files = discover(&self.config.level1_dir.join(band), NC_FILE_PATTERN)?;
        if files.is_empty() {
            info!(band, "no Level 1 files, nothing to re-assess");
            return Ok(ProcessingStats::default());
        }
        info!(band, files = files.len(), "running advanced quality assurance");

        let datasets: Vec<Dataset> = files
            .iter()
            .map(|f| read_period_file(f))
            .collect::<Result<Vec<_>>>()?;
        let combined = combine_datasets(&datasets)?;
        let index_of: HashMap<u64, usize> = combined
            .time
            .iter()
            .enumerate()
            .map(|(i, &t)| (t.to_bits(), i))
            .collect();

        // Advanced flags over the combined series, per configured variable
        let now = chrono::Utc::now().timestamp() as f64;
        let mut advanced_flags: HashMap<String, VarData> = HashMap::new();
        let mut names: Vec<&String> = self.quality.variables.keys().collect();
        names.sort();
        for name in names {
            let var_checks = &self.quality.variables[name];
            let checks = var_checks.simple.merged(&var_checks.advanced);
            let data = if name == "time" {
                VarData::Series(combined.time.clone())
            } else {
                match combined.variable(name) {
                    Some(record) => record.data.clone(),
                    None => continue,
                }
            };
            let flags = qc::variable_flags(&data, combined.time.view(), &checks, None, now);
            advanced_flags.insert(name.clone(), flags.to_var_data());
        }

        // Fold the advanced layer back into each file's flag variables
        for (file, ds) in files.iter().zip(&datasets) {
            update_qual_variables(file, ds, &advanced_flags, &index_of)?;
        }

        // Re-derive Level 2 deterministically from the updated Level 1 files
        let mut stats = ProcessingStats::default();
        for file in &files {
            let mut ds = read_period_file(file)?;
            let params = self.deployments.select(file)?;
            derive::mask_dataset(&mut ds);
            derive::derive_variables(&mut ds, params.rotate_velocity)?;
            let l2 = PeriodWriter::new(
                self.config.level2_dir.join(band),
                "L2",
                PeriodPolicy::File,
                self.config.site.clone(),
            )
            .with_overwrite(true);
            stats.buckets_written += l2.write(&ds)?.len();
            stats.files_processed += 1;
        }
        self.report(&stats);
        Ok(stats)
    }

    fn report(&self, stats: &ProcessingStats) {
        println!("\n{}", "Processing summary".bright_green().bold());
        println!(
            "  {} {}",
            "Files processed:".bright_cyan(),
            stats.files_processed.to_string().bright_white()
        );
        if stats.files_skipped > 0 {
            println!(
                "  {} {}",
                "Files skipped:".bright_yellow(),
                stats.files_skipped.to_string().bright_white()
            );
        }
        if stats.files_failed > 0 {
            println!(
                "  {} {}",
                "Files failed:".bright_red(),
                stats.files_failed.to_string().bright_red().bold()
            );
        }
        println!(
            "  {} {}",
            "Period files touched:".bright_cyan(),
            stats.buckets_written.to_string().bright_white().bold()
        );
    }
}

/// Sorted file listing for one pattern under a directory; a missing
/// directory is an empty band, not an error.
fn discover(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let expr = format!("{}/{}", dir.display(), pattern);
    let mut files: Vec<PathBuf> = glob::glob(&expr)
        .map_err(|e| AdcpError::Configuration {
            message: format!("bad file pattern '{expr}': {e}"),
        })?
        .filter_map(std::result::Result::ok)
        .collect();
    files.sort();
    Ok(files)
}

/// Fold the decoded raw arrays into the Level 1 variable set
pub fn build_dataset(raw: &RawDeployment, ctx: crate::models::DeploymentContext) -> Result<Dataset> {
    let mut ds = Dataset::new(ctx, raw.time.clone(), raw.depth.clone());
    ds.push_variable(VariableRecord::profile(
        "u",
        "m s-1",
        "eastern velocity",
        raw.u.clone(),
    ))?;
    ds.push_variable(VariableRecord::profile(
        "v",
        "m s-1",
        "northern velocity",
        raw.v.clone(),
    ))?;
    ds.push_variable(VariableRecord::profile(
        "w",
        "m s-1",
        "vertical velocity",
        raw.w.clone(),
    ))?;
    ds.push_variable(VariableRecord::series(
        "temp",
        "degC",
        "temperature",
        raw.temperature.clone(),
    ))?;
    for k in 0..BEAM_COUNT {
        ds.push_variable(VariableRecord::profile(
            format!("echo{}", k + 1),
            "-",
            format!("Beam {} echo", k + 1),
            raw.echo.index_axis(Axis(0), k).to_owned(),
        ))?;
    }
    ds.push_variable(VariableRecord::series(
        "battery",
        "-",
        "Battery level",
        raw.battery.clone(),
    ))?;
    ds.push_variable(VariableRecord::series(
        "heading",
        "deg",
        "Heading",
        raw.heading.clone(),
    ))?;
    ds.push_variable(VariableRecord::series(
        "roll",
        "deg",
        "Roll",
        raw.roll.clone(),
    ))?;
    ds.push_variable(VariableRecord::series(
        "pitch",
        "deg",
        "Pitch",
        raw.pitch.clone(),
    ))?;
    Ok(ds)
}

/// Concatenate per-period datasets along time into one series.
///
/// The first file's depth grid is authoritative; later grids drifting
/// beyond tolerance only warn. Variables missing from a file contribute
/// fill values over its span.
pub fn combine_datasets(datasets: &[Dataset]) -> Result<Dataset> {
    let first = datasets.first().ok_or_else(|| AdcpError::Configuration {
        message: "cannot combine an empty dataset list".to_string(),
    })?;
    let depth = first.depth.clone();
    for ds in &datasets[1..] {
        if ds.depth.len() != depth.len() {
            return Err(AdcpError::ShapeMismatch {
                variable: "depth".to_string(),
                expected: vec![depth.len()],
                found: vec![ds.depth.len()],
            });
        }
        let drift = ds
            .depth
            .iter()
            .zip(depth.iter())
            .map(|(&a, &b)| (a - b).abs())
            .fold(0.0, f64::max);
        if drift > crate::constants::DEPTH_DRIFT_TOLERANCE {
            warn!(drift, "instrument moved, depth grid can no longer be trusted");
        }
    }

    let total: usize = datasets.iter().map(|d| d.time.len()).sum();
    let mut time = Vec::with_capacity(total);
    for ds in datasets {
        time.extend(ds.time.iter().copied());
    }

    let mut names: Vec<String> = Vec::new();
    for ds in datasets {
        for var in &ds.variables {
            if !names.contains(&var.name) {
                names.push(var.name.clone());
            }
        }
    }

    let mut combined = Dataset::new(
        first.context.clone(),
        ndarray::Array1::from_vec(time),
        depth.clone(),
    );
    for name in names {
        let template = datasets
            .iter()
            .find_map(|d| d.variable(&name))
            .expect("name collected from the datasets");
        let data = match template.axes() {
            crate::models::VarAxes::Time => {
                let mut values = Vec::with_capacity(total);
                for ds in datasets {
                    match ds.variable(&name).map(|v| &v.data) {
                        Some(VarData::Series(a)) => values.extend(a.iter().copied()),
                        _ => values.extend(std::iter::repeat(f64::NAN).take(ds.time.len())),
                    }
                }
                VarData::Series(ndarray::Array1::from_vec(values))
            }
            crate::models::VarAxes::DepthTime => {
                let mut values = ndarray::Array2::from_elem((depth.len(), total), f64::NAN);
                let mut offset = 0;
                for ds in datasets {
                    let n = ds.time.len();
                    if let Some(VarData::Profile(a)) = ds.variable(&name).map(|v| &v.data) {
                        values
                            .slice_mut(ndarray::s![.., offset..offset + n])
                            .assign(a);
                    }
                    offset += n;
                }
                VarData::Profile(values)
            }
        };
        combined.push_variable(VariableRecord {
            name: name.clone(),
            unit: template.unit.clone(),
            long_name: template.long_name.clone(),
            data,
        })?;
    }
    Ok(combined)
}

/// OR the advanced statistical results into one file's `<name>_qual`
/// variables; the existing composite keeps its instrument bits.
fn update_qual_variables(
    path: &Path,
    ds: &Dataset,
    advanced_flags: &HashMap<String, VarData>,
    index_of: &HashMap<u64, usize>,
) -> Result<()> {
    let columns: Vec<usize> = ds
        .time
        .iter()
        .map(|t| *index_of.get(&t.to_bits()).expect("combined covers all files"))
        .collect();

    let mut updates: Vec<(String, VarData)> = Vec::new();
    for record in &ds.variables {
        if !record.is_qual() {
            continue;
        }
        let parent = record.name.trim_end_matches("_qual");
        let Some(advanced) = advanced_flags.get(parent) else {
            continue;
        };

        let updated = match (&record.data, advanced) {
            (VarData::Series(current), VarData::Series(adv)) => {
                let mut out = current.clone();
                for (j, v) in out.iter_mut().enumerate() {
                    if adv[columns[j]] > 0.0 && (*v as u64) & (STATISTICAL_BIT as u64) == 0 {
                        *v += f64::from(STATISTICAL_BIT);
                    }
                }
                VarData::Series(out)
            }
            (VarData::Profile(current), VarData::Profile(adv)) => {
                let mut out = current.clone();
                for ((i, j), v) in out.indexed_iter_mut() {
                    if adv[[i, columns[j]]] > 0.0 && (*v as u64) & (STATISTICAL_BIT as u64) == 0 {
                        *v += f64::from(STATISTICAL_BIT);
                    }
                }
                VarData::Profile(out)
            }
            _ => continue,
        };
        updates.push((record.name.clone(), updated));
    }

    if updates.is_empty() {
        return Ok(());
    }
    debug!(file = %path.display(), variables = updates.len(), "updating flag variables");
    let mut file = netcdf::append(path)?;
    for (name, data) in updates {
        let mut var = file
            .variable_mut(&name)
            .ok_or_else(|| AdcpError::UnknownVariable { name: name.clone() })?;
        match data {
            VarData::Series(a) => {
                let values = a.to_vec();
                var.put_values(&values, (&[0usize], &[values.len()]))?;
            }
            VarData::Profile(a) => {
                let owned = a.as_standard_layout().to_owned();
                var.put_values(
                    owned.as_slice().expect("standard layout is contiguous"),
                    (&[0usize, 0], &[owned.nrows(), owned.ncols()]),
                )?;
            }
        }
    }
    Ok(())
}
