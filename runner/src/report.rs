use crate::{
    executors::{JobStatus, STATUS_FILE_NAME},
    experiment::ExperimentKind,
};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs::{self, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// name of the file the rendered results are persisted to
pub const RESULTS_FILE_NAME: &str = "openhpca_results.txt";
pub const RESULTS_FILE_PERMISSION: u32 = 0o644;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Run directory {} not found", .0.display())]
    MissingRunDir(PathBuf),
    #[error("Failed to read results: {0}")]
    Io(#[from] io::Error),
    #[error("Failed to read job status: {0}")]
    Status(#[from] serde_yaml::Error),
    #[error("Unable to parse the results of {0}")]
    Unparseable(String),
}

/// Renders the results of a run directory and persists them
pub trait Reporter {
    fn render_and_persist(&self, run_dir: &Path) -> Result<String, ReportError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    // message size in bytes, when the output is tabulated by size
    pub size: Option<u64>,
    pub value: f64,
}

#[derive(Debug, Clone)]
pub struct ResultReporter {
    results_file: PathBuf,
}

impl ResultReporter {
    /// the results file lands in the parent of `basedir`
    pub fn new(basedir: &Path) -> Self {
        Self {
            results_file: basedir.join("..").join(RESULTS_FILE_NAME),
        }
    }
}

impl Reporter for ResultReporter {
    fn render_and_persist(&self, run_dir: &Path) -> Result<String, ReportError> {
        let results = render(run_dir)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(RESULTS_FILE_PERMISSION)
            .open(&self.results_file)?;
        file.write_all(results.as_bytes())?;
        // mode only applies on creation
        fs::set_permissions(
            &self.results_file,
            Permissions::from_mode(RESULTS_FILE_PERMISSION),
        )?;

        info!("Results written to {}", self.results_file.display());

        Ok(results)
    }
}

/// numeric rows of a benchmark output, comment lines start with `#`
fn data_rows(output: &str) -> Vec<Vec<f64>> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            line.split_whitespace()
                .map(|column| column.parse::<f64>().ok())
                .collect::<Option<Vec<_>>>()
        })
        .collect()
}

fn measurement(row: &[f64]) -> Option<Measurement> {
    match row {
        [size, value, ..] => Some(Measurement {
            size: Some(*size as u64),
            value: *value,
        }),
        [value] => Some(Measurement {
            size: None,
            value: *value,
        }),
        [] => None,
    }
}

/// headline measurement of an experiment output
///
/// Latencies are taken at the smallest message size, everything else at the last row.
pub fn parse_output(kind: ExperimentKind, output: &str) -> Option<Measurement> {
    let rows = data_rows(output);

    match kind {
        ExperimentKind::Latency | ExperimentKind::NoncontigLatency => {
            rows.first().and_then(|row| measurement(row))
        }
        _ => rows.last().and_then(|row| measurement(row)),
    }
}

fn unit(kind: ExperimentKind) -> &'static str {
    match kind {
        ExperimentKind::Latency | ExperimentKind::NoncontigLatency | ExperimentKind::MpiOverhead => {
            " us"
        }
        ExperimentKind::Bandwidth | ExperimentKind::NoncontigBandwidth => " MB/s",
        ExperimentKind::Other => "",
    }
}

fn read_statuses(run_dir: &Path) -> Result<BTreeMap<String, JobStatus>, ReportError> {
    let path = run_dir.join(STATUS_FILE_NAME);

    if !path.is_file() {
        debug!("No job status found at {}", path.display());
        return Ok(BTreeMap::new());
    }

    Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?)
}

/// experiment name -> output file, for every `.out` file of the run directory
fn outputs(run_dir: &Path) -> Result<BTreeMap<String, PathBuf>, ReportError> {
    fs::read_dir(run_dir)?
        .map(|entry| entry.map(|entry| entry.path()))
        .filter_map_ok(|path| {
            let is_output = path.extension().map_or(false, |extension| extension == "out");
            let name = path.file_stem()?.to_string_lossy().into_owned();

            is_output.then_some((name, path))
        })
        .map(|result| result.map_err(ReportError::from))
        .collect()
}

/// render the results of all experiments of a run directory
pub fn render(run_dir: &Path) -> Result<String, ReportError> {
    if !run_dir.is_dir() {
        return Err(ReportError::MissingRunDir(run_dir.to_path_buf()));
    }

    let statuses = read_statuses(run_dir)?;
    let outputs = outputs(run_dir)?;
    let mut report = String::new();
    let (mut completed, mut failed) = (0, 0);

    // the run directory is shared between invocations, outputs of experiments this run did not
    // schedule are left out when the job status is known
    let names = if statuses.is_empty() {
        outputs.keys().collect_vec()
    } else {
        statuses.keys().collect_vec()
    };

    for name in names {
        let kind = ExperimentKind::from_experiment_name(name);
        let status = statuses.get(name).copied();

        if status == Some(JobStatus::Failed) {
            failed += 1;
            let _ = writeln!(report, "  {name}: failed");
            continue;
        }

        let Some(path) = outputs.get(name) else {
            failed += 1;
            let _ = writeln!(report, "  {name}: no output");
            continue;
        };

        let measurement = parse_output(kind, &fs::read_to_string(path)?)
            .ok_or_else(|| ReportError::Unparseable(name.clone()))?;
        completed += 1;

        match measurement.size {
            Some(size) => {
                let _ = writeln!(
                    report,
                    "  {name}: {:.2}{} ({size} bytes)",
                    measurement.value,
                    unit(kind)
                );
            }
            None => {
                let _ = writeln!(report, "  {name}: {:.2}{}", measurement.value, unit(kind));
            }
        }
    }

    let _ = writeln!(
        report,
        "{} experiments, {completed} completed, {failed} failed",
        completed + failed
    );

    Ok(report)
}
