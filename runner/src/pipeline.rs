use crate::{
    catalog::{detect_installed, Catalog},
    config::{RunnerConfig, WorkspaceConfig},
    executors::{Executor, ExecutorError, STATUS_FILE_NAME},
    experiment::{ExperimentSet, Platform, Runtime},
    report::{ReportError, Reporter},
    selection::select,
};
use std::{fs, io, num::NonZeroUsize, path::PathBuf};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Fatal conditions of an invocation, each one terminates the process with exit code 1
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("undefined workspace")]
    UndefinedWorkspace,
    #[error("MPI installation directory '{}' is not valid", .0.display())]
    InvalidMpiDir(PathBuf),
    #[error("the maximum number of active jobs must be superior to 0 ({0})")]
    InvalidMaxRunningJobs(i64),
    #[error("unable to create the run directory: {0}")]
    RunDir(#[source] io::Error),
    #[error("unable to execute experiment: {0}")]
    Submit(#[from] ExecutorError),
    #[error("unable to display results: {0}")]
    Report(#[from] ReportError),
}

/// Options of a single invocation, as given on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub partition: String,
    pub device: String,
    pub max_running_jobs: i64,
    pub ppn: u32,
    pub num_nodes: u32,
    pub long_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            partition: String::new(),
            device: String::new(),
            max_running_jobs: 5,
            ppn: 1,
            num_nodes: 1,
            long_run: false,
        }
    }
}

impl RunOptions {
    pub fn platform(&self) -> Platform {
        Platform {
            name: self.partition.clone(),
            device: self.device.clone(),
            ppn: self.ppn,
            nodes: self.num_nodes,
        }
    }
}

/// sanity checks performed before any experiment is built
pub fn preflight_checks<'a>(
    config: &'a RunnerConfig,
    options: &RunOptions,
) -> Result<(&'a WorkspaceConfig, NonZeroUsize), PipelineError> {
    let workspace = config
        .workspace
        .as_ref()
        .ok_or(PipelineError::UndefinedWorkspace)?;

    if !workspace.mpi_dir.exists() {
        return Err(PipelineError::InvalidMpiDir(workspace.mpi_dir.clone()));
    }

    let max_running_jobs = usize::try_from(options.max_running_jobs)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or(PipelineError::InvalidMaxRunningJobs(options.max_running_jobs))?;

    Ok((workspace, max_running_jobs))
}

/// select the benchmarks to run and turn them into an experiment set
pub fn plan(
    catalog: Catalog,
    config: &RunnerConfig,
    workspace: &WorkspaceConfig,
    options: &RunOptions,
) -> ExperimentSet {
    let selected = select(catalog, &config.required, options.long_run);
    let mut experiments = ExperimentSet::new(
        options.platform(),
        &workspace.mpi_dir,
        &workspace.run_dir(),
        &config.max_exec_time,
    );
    experiments.extend_from_catalog(&selected);

    debug!(experiments = ?experiments.names(), "Built experiment set");

    experiments
}

/// create the run directory shared by all experiments
pub fn prepare_run_dir(experiments: &ExperimentSet) -> Result<(), PipelineError> {
    if !experiments.run_dir.exists() {
        fs::create_dir_all(&experiments.run_dir).map_err(PipelineError::RunDir)?;
    }

    Ok(())
}

/// submit, wait on and finalize an experiment set, then report on it
#[instrument(skip_all, fields(experiments = experiments.len()))]
pub fn execute<E: Executor, R: Reporter>(
    experiments: &ExperimentSet,
    runtime: &Runtime,
    executor: &mut E,
    reporter: &R,
) -> Result<String, PipelineError> {
    if let Err(error) = executor.run(experiments, runtime) {
        executor.fini();
        return Err(error.into());
    }

    executor.wait(runtime);

    let status_file = experiments.run_dir.join(STATUS_FILE_NAME);
    if let Err(error) = executor.accounting().persist(&status_file) {
        warn!("Failed to write {}: {error}", status_file.display());
    }
    let counts = executor.accounting().counts();

    info!(
        completed = counts.completed,
        failed = counts.failed,
        peak_running = executor.accounting().peak_running(),
        "-> Job successfully executed"
    );
    executor.fini();

    Ok(reporter.render_and_persist(&experiments.run_dir)?)
}

/// run the whole pipeline on an already discovered catalog
pub fn run_with_catalog<E: Executor, R: Reporter>(
    catalog: Catalog,
    config: &RunnerConfig,
    options: &RunOptions,
    executor: &mut E,
    reporter: &R,
) -> Result<String, PipelineError> {
    let (workspace, max_running_jobs) = preflight_checks(config, options)?;
    let experiments = plan(catalog, config, workspace, options);
    prepare_run_dir(&experiments)?;

    let runtime = Runtime {
        max_running_jobs,
        progress_frequency: config.progress_frequency(),
        resubmit_backoff: config.resubmit_backoff(),
    };

    execute(&experiments, &runtime, executor, reporter)
}

/// run the whole pipeline, discovering the installed benchmarks first
pub fn run<E: Executor, R: Reporter>(
    config: &RunnerConfig,
    options: &RunOptions,
    executor: &mut E,
    reporter: &R,
) -> Result<String, PipelineError> {
    preflight_checks(config, options)?;

    run_with_catalog(
        detect_installed(&config.benchmarks),
        config,
        options,
        executor,
        reporter,
    )
}
