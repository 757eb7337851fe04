mod local;
mod slurm;

#[cfg(test)]
mod slurm_test;

pub use local::LocalExecutor;
pub use slurm::SlurmExecutor;

use crate::{
    config::{ConfigErrors, ExecutorConfig},
    experiment::{ExperimentSet, Runtime},
};
use parking_lot::Mutex;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{collections::BTreeMap, fs, io, path::Path, sync::Arc, thread, time::Duration};
use thiserror::Error;
use tracing::info;

/// file in the run directory holding the final status of every experiment
pub const STATUS_FILE_NAME: &str = "status.yaml";

// lower bound for the polling interval, a zero interval would spin
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Launcher {} is not an executable", .0.display())]
    LauncherNotFound(std::path::PathBuf),
    #[error("Failed to submit {name}: {source}")]
    Submit { name: String, source: io::Error },
    #[error("Submission of {name} was rejected: {reason}")]
    Rejected { name: String, reason: String },
    #[error("Failed to write {name}: {source}")]
    Prepare { name: String, source: io::Error },
    #[error("Failed to start the job queue poller: {0}")]
    Poller(#[source] io::Error),
    #[error("Failed to persist job status: {0}")]
    Persist(#[from] io::Error),
    #[error("Failed to serialize job status: {0}")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Executor was already finalized")]
    Finalized,
}

#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(i8)]
pub enum JobStatus {
    Failed = -1,
    Pending = 0,
    Running = 1,
    Completed = 2,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct AccountingState {
    statuses: BTreeMap<String, JobStatus>,
    running: usize,
    peak_running: usize,
}

/// Thread safe status table of all experiments handed to an executor
#[derive(Debug, Clone, Default)]
pub struct JobAccounting(Arc<Mutex<AccountingState>>);

impl JobAccounting {
    pub fn enqueue(&self, name: &str) {
        self.0.lock().statuses.insert(name.to_owned(), JobStatus::Pending);
    }

    pub fn start(&self, name: &str) {
        let mut state = self.0.lock();

        if state.statuses.insert(name.to_owned(), JobStatus::Running) != Some(JobStatus::Running) {
            state.running += 1;
            state.peak_running = state.peak_running.max(state.running);
        }
    }

    pub fn finish(&self, name: &str, success: bool) {
        let mut state = self.0.lock();
        let status = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        if state.statuses.insert(name.to_owned(), status) == Some(JobStatus::Running) {
            state.running -= 1;
        }
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.0.lock().statuses.get(name).copied()
    }

    pub fn counts(&self) -> StatusCounts {
        self.0
            .lock()
            .statuses
            .values()
            .fold(StatusCounts::default(), |mut counts, status| {
                match status {
                    JobStatus::Pending => counts.pending += 1,
                    JobStatus::Running => counts.running += 1,
                    JobStatus::Completed => counts.completed += 1,
                    JobStatus::Failed => counts.failed += 1,
                }
                counts
            })
    }

    pub fn all_terminal(&self) -> bool {
        self.0.lock().statuses.values().all(|status| status.is_terminal())
    }

    /// highest number of simultaneously running experiments seen so far
    pub fn peak_running(&self) -> usize {
        self.0.lock().peak_running
    }

    pub fn snapshot(&self) -> BTreeMap<String, JobStatus> {
        self.0.lock().statuses.clone()
    }

    pub fn persist(&self, path: &Path) -> Result<(), ExecutorError> {
        let content = serde_yaml::to_string(&self.snapshot())?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// block until every experiment of `accounting` is terminal
pub(crate) fn poll_until_terminal(accounting: &JobAccounting, runtime: &Runtime) {
    let interval = runtime.progress_frequency.max(MIN_POLL_INTERVAL);

    while !accounting.all_terminal() {
        let counts = accounting.counts();
        info!(
            pending = counts.pending,
            running = counts.running,
            "Done with {}/{}",
            counts.completed + counts.failed,
            counts.pending + counts.running + counts.completed + counts.failed
        );

        thread::sleep(interval);
    }
}

/// A backend executing an experiment set under a concurrency bound
pub trait Executor {
    /// create a new executor from its configuration
    fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors>
    where
        Self: Sized;

    /// submit or queue every experiment, returns before they complete
    fn run(&mut self, experiments: &ExperimentSet, runtime: &Runtime) -> Result<(), ExecutorError>;

    /// block until every experiment completed or failed
    fn wait(&mut self, runtime: &Runtime);

    /// release all resources, can be called multiple times
    fn fini(&mut self);

    fn accounting(&self) -> &JobAccounting;
}

#[derive(Debug)]
pub enum Executors {
    Local(LocalExecutor),
    Slurm(SlurmExecutor),
}

impl Executor for Executors {
    fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        match config.name.to_lowercase().as_str() {
            "local" => Ok(Self::Local(LocalExecutor::load(config)?)),
            "slurm" => Ok(Self::Slurm(SlurmExecutor::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedExecutor(config.name.clone())),
        }
    }

    fn run(&mut self, experiments: &ExperimentSet, runtime: &Runtime) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.run(experiments, runtime),
            Self::Slurm(executor) => executor.run(experiments, runtime),
        }
    }

    fn wait(&mut self, runtime: &Runtime) {
        match self {
            Self::Local(executor) => executor.wait(runtime),
            Self::Slurm(executor) => executor.wait(runtime),
        }
    }

    fn fini(&mut self) {
        match self {
            Self::Local(executor) => executor.fini(),
            Self::Slurm(executor) => executor.fini(),
        }
    }

    fn accounting(&self) -> &JobAccounting {
        match self {
            Self::Local(executor) => executor.accounting(),
            Self::Slurm(executor) => executor.accounting(),
        }
    }
}
