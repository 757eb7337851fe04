use super::{poll_until_terminal, Executor, ExecutorError, JobAccounting};
use crate::{
    config::{check_executable, ConfigErrors, ExecutorConfig},
    experiment::{ExperimentDescriptor, ExperimentSet, Runtime},
};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    fs::File,
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};
use wait_timeout::ChildExt;

/// launcher arguments placed before the executable, `{ranks}`, `{ppn}` and `{nodes}` are
/// replaced by the topology of the experiment
pub const DEFAULT_LAUNCHER_ARGS: [&str; 4] = ["-np", "{ranks}", "--map-by", "ppr:{ppn}:node"];

/// Fully resolved invocation of a single experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug)]
struct LocalJob {
    name: String,
    command: LaunchCommand,
    output: PathBuf,
    cwd: PathBuf,
    timeout: Option<Duration>,
}

/// Executor that works on a local thread pool sized to the concurrency bound
#[derive(Debug)]
pub struct LocalExecutor {
    // defaults to `<mpi_dir>/bin/mpirun`
    launcher: Option<PathBuf>,
    launcher_args: Vec<String>,
    pool: Option<ThreadPool>,
    accounting: JobAccounting,
    finalized: bool,
}

impl LocalExecutor {
    pub fn new(launcher: Option<PathBuf>, launcher_args: Vec<String>) -> Self {
        Self {
            launcher,
            launcher_args,
            pool: None,
            accounting: JobAccounting::default(),
            finalized: false,
        }
    }

    fn launcher(&self, experiments: &ExperimentSet) -> PathBuf {
        self.launcher
            .clone()
            .unwrap_or_else(|| experiments.mpi_dir.join("bin").join("mpirun"))
    }

    /// build the command line of an experiment
    pub fn command_for(
        &self,
        experiments: &ExperimentSet,
        experiment: &ExperimentDescriptor,
    ) -> LaunchCommand {
        let topology = experiments.topology(experiment);
        let mut args: Vec<String> = self
            .launcher_args
            .iter()
            .map(|arg| {
                arg.replace("{ranks}", &topology.ranks().to_string())
                    .replace("{ppn}", &topology.ppn.to_string())
                    .replace("{nodes}", &topology.nodes.to_string())
            })
            .collect();
        args.push(experiment.executable().to_string_lossy().into_owned());
        args.extend(experiment.bin_args.iter().cloned());

        let mut env = Vec::new();
        if !topology.device.is_empty() {
            env.push(("UCX_NET_DEVICES".to_owned(), topology.device.clone()));
        }

        LaunchCommand {
            program: self.launcher(experiments),
            args,
            env,
        }
    }
}

impl LocalJob {
    #[instrument(skip(self, accounting), fields(name = %self.name), level = "debug")]
    fn execute(self, accounting: &JobAccounting) {
        accounting.start(&self.name);
        let start = Instant::now();

        let success = match self.spawn_and_wait() {
            Ok(Some(status)) => {
                debug!(
                    "Finished in {} ms | status: {}",
                    start.elapsed().as_millis(),
                    status
                );
                status.success()
            }
            Ok(None) => {
                warn!("Experiment {} ran into the maximum execution time", self.name);
                false
            }
            Err(e) => {
                warn!("Experiment {} failed with {e}", self.name);
                false
            }
        };

        accounting.finish(&self.name, success);
    }

    /// returns `None` when the experiment was killed on timeout
    fn spawn_and_wait(&self) -> std::io::Result<Option<ExitStatus>> {
        let stdout = File::create(&self.output)?;
        let stderr = stdout.try_clone()?;

        trace!(command = ?self.command, "Spawning experiment");
        let mut child = Command::new(&self.command.program)
            .args(self.command.args.iter())
            .envs(self.command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;

        match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout)? {
                Some(status) => Ok(Some(status)),
                None => {
                    // child hasn't exited yet
                    child.kill()?;
                    child.wait()?;
                    Ok(None)
                }
            },
            None => child.wait().map(Some),
        }
    }
}

impl Executor for LocalExecutor {
    fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        let launcher = config.string("launcher")?.map(PathBuf::from);
        let launcher_args = config.strings("launcher_args")?.unwrap_or_else(|| {
            DEFAULT_LAUNCHER_ARGS
                .iter()
                .map(|arg| arg.to_string())
                .collect()
        });

        Ok(Self::new(launcher, launcher_args))
    }

    /// queue all experiments on the thread pool
    #[instrument(skip_all, level = "info")]
    fn run(&mut self, experiments: &ExperimentSet, runtime: &Runtime) -> Result<(), ExecutorError> {
        if self.finalized {
            return Err(ExecutorError::Finalized);
        }

        let launcher = self.launcher(experiments);
        if !check_executable(&launcher).unwrap_or(false) {
            return Err(ExecutorError::LauncherNotFound(launcher));
        }

        let thread_number = runtime.max_running_jobs.get();
        debug!("Starting thread pool with {thread_number} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(thread_number)
            .thread_name(|index| format!("openhpca-job-{index}"))
            .build()?;
        let timeout = experiments.max_exec_duration();
        if timeout.is_none() {
            warn!(
                "Unable to parse maximum execution time '{}', experiments won't be killed",
                experiments.max_exec_time
            );
        }

        for experiment in experiments.iter() {
            self.accounting.enqueue(&experiment.name);

            let job = LocalJob {
                name: experiment.name.clone(),
                command: self.command_for(experiments, experiment),
                output: experiments
                    .results_dir
                    .join(format!("{}.out", experiment.name)),
                cwd: experiments.run_dir.clone(),
                timeout,
            };
            let accounting = self.accounting.clone();

            pool.spawn(move || job.execute(&accounting));
        }

        info!("Queued {} experiments", experiments.len());
        self.pool = Some(pool);

        Ok(())
    }

    fn wait(&mut self, runtime: &Runtime) {
        poll_until_terminal(&self.accounting, runtime);
        info!("Done with processing");
    }

    fn fini(&mut self) {
        // dropping the pool lets the workers exit once the queue is drained
        self.pool.take();
        self.finalized = true;
    }

    fn accounting(&self) -> &JobAccounting {
        &self.accounting
    }
}
