/*
 * Slurm executor:
 * 1. Write one batch script per experiment into the run directory
 * 2. Submit as many scripts as the concurrency bound allows with `sbatch --parsable`
 * 3. A poller thread watches the active jobs with `squeue` and submits queued experiments once
 *    slots free up, the exit code of every job is read back from a file the script writes
 */

use super::{poll_until_terminal, Executor, ExecutorError, JobAccounting, MIN_POLL_INTERVAL};
use crate::{
    config::{ConfigErrors, ExecutorConfig},
    experiment::{ExperimentDescriptor, ExperimentSet, Runtime},
};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
    process::Command,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
struct SlurmJob {
    name: String,
    script: PathBuf,
    exit_file: PathBuf,
}

#[derive(Debug)]
pub struct SlurmExecutor {
    sbatch: PathBuf,
    squeue: PathBuf,
    accounting: JobAccounting,
    stop: Arc<AtomicBool>,
    poller: Option<JoinHandle<()>>,
    finalized: bool,
}

/// Submission side, owned by the poller thread once the initial batch is out
#[derive(Debug)]
struct JobQueue {
    sbatch: PathBuf,
    squeue: PathBuf,
    pending: VecDeque<SlurmJob>,
    // slurm job id -> job
    active: BTreeMap<String, SlurmJob>,
    limit: usize,
    accounting: JobAccounting,
    stop: Arc<AtomicBool>,
    interval: Duration,
    backoff: Duration,
}

/// extract the job id from the output of `sbatch --parsable` (`<id>[;<cluster>]`)
pub fn parse_job_id(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split(';').next())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

pub fn exit_file(experiments: &ExperimentSet, experiment: &ExperimentDescriptor) -> PathBuf {
    experiments
        .run_dir
        .join(format!("{}.exit", experiment.name))
}

/// batch script running a single experiment
pub fn batch_script(experiments: &ExperimentSet, experiment: &ExperimentDescriptor) -> String {
    let topology = experiments.topology(experiment);
    let mpirun = experiments.mpi_dir.join("bin").join("mpirun");
    let mut script = String::from("#!/bin/bash\n");

    // writing into a String can't fail
    let _ = writeln!(script, "#SBATCH --job-name={}", experiment.name);
    let _ = writeln!(script, "#SBATCH --nodes={}", topology.nodes);
    let _ = writeln!(script, "#SBATCH --ntasks-per-node={}", topology.ppn);
    let _ = writeln!(script, "#SBATCH --time={}", experiments.max_exec_time);
    if !topology.name.is_empty() {
        let _ = writeln!(script, "#SBATCH --partition={}", topology.name);
    }
    let _ = writeln!(
        script,
        "#SBATCH --output={}",
        experiments
            .results_dir
            .join(format!("{}.out", experiment.name))
            .display()
    );
    let _ = writeln!(script, "#SBATCH --chdir={}", experiments.run_dir.display());
    script.push('\n');

    let _ = writeln!(
        script,
        "export PATH={}:$PATH",
        experiments.mpi_dir.join("bin").display()
    );
    let _ = writeln!(
        script,
        "export LD_LIBRARY_PATH={}:$LD_LIBRARY_PATH",
        experiments.mpi_dir.join("lib").display()
    );
    if !topology.device.is_empty() {
        let _ = writeln!(script, "export UCX_NET_DEVICES={}", topology.device);
    }
    script.push('\n');

    let command = [
        mpirun.display().to_string(),
        "-np".to_owned(),
        topology.ranks().to_string(),
        "--map-by".to_owned(),
        format!("ppr:{}:node", topology.ppn),
        experiment.executable().display().to_string(),
    ]
    .into_iter()
    .chain(experiment.bin_args.iter().cloned())
    .map(|arg| shell_quote(&arg))
    .join(" ");
    let _ = writeln!(script, "{command}");
    let _ = writeln!(
        script,
        "echo $? > {}",
        shell_quote(&exit_file(experiments, experiment).display().to_string())
    );

    script
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,+@%".contains(c))
    {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// whether the job left an exit code of 0 behind
fn read_exit_status(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => content.trim().parse::<i32>().map_or(false, |code| code == 0),
        Err(e) => {
            warn!("No exit code found at {}: {e}", path.display());
            false
        }
    }
}

impl JobQueue {
    fn submit(&self, job: &SlurmJob) -> Result<String, ExecutorError> {
        let output = Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(&job.script)
            .output()
            .map_err(|source| ExecutorError::Submit {
                name: job.name.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExecutorError::Rejected {
                name: job.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ExecutorError::Rejected {
                name: job.name.clone(),
                reason: "sbatch returned no job id".to_owned(),
            }
        })
    }

    fn submit_next(&mut self) -> Option<Result<(), ExecutorError>> {
        let job = self.pending.pop_front()?;

        Some(self.submit(&job).map(|id| {
            debug!(job_id = %id, "Submitted {}", job.name);
            self.accounting.start(&job.name);
            self.active.insert(id, job);
        }))
    }

    /// submit the first batch, any failure here is a failure of the whole set
    fn submit_initial(&mut self) -> Result<(), ExecutorError> {
        while self.active.len() < self.limit {
            match self.submit_next() {
                Some(result) => result?,
                None => break,
            }
        }

        Ok(())
    }

    /// ids of the active jobs still known to slurm
    fn queued_ids(&self) -> Result<BTreeSet<String>, std::io::Error> {
        let output = Command::new(&self.squeue)
            .arg("--noheader")
            .arg("--format=%i")
            .arg(format!("--jobs={}", self.active.keys().join(",")))
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);

            // squeue refuses ids of jobs that already left the queue
            if stderr.contains("Invalid job id") {
                return Ok(BTreeSet::new());
            }

            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                stderr.trim().to_owned(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn reap(&mut self) {
        if self.active.is_empty() {
            return;
        }

        let queued = match self.queued_ids() {
            Ok(queued) => queued,
            Err(e) => {
                // without the queue, a job is done once its script wrote the exit code
                warn!("Failed to query the job queue, falling back to exit files: {e}");
                self.active
                    .iter()
                    .filter(|(_, job)| !job.exit_file.exists())
                    .map(|(id, _)| id.clone())
                    .collect()
            }
        };

        let finished = self
            .active
            .keys()
            .filter(|id| !queued.contains(*id))
            .cloned()
            .collect_vec();

        for id in finished {
            if let Some(job) = self.active.remove(&id) {
                let success = read_exit_status(&job.exit_file);
                debug!(job_id = %id, success, "Job {} left the queue", job.name);
                self.accounting.finish(&job.name, success);
            }
        }
    }

    fn refill(&mut self) {
        while self.active.len() < self.limit && !self.pending.is_empty() {
            thread::sleep(self.backoff);

            if let Some(Err(e)) = self.submit_next() {
                error!("{e}");

                if let ExecutorError::Submit { name, .. } | ExecutorError::Rejected { name, .. } = e
                {
                    self.accounting.finish(&name, false);
                }
            }
        }
    }

    fn poll(mut self) {
        while !self.stop.load(Ordering::SeqCst)
            && !(self.pending.is_empty() && self.active.is_empty())
        {
            thread::sleep(self.interval);
            self.reap();
            self.refill();
        }

        debug!("Job queue poller exiting");
    }
}

impl SlurmExecutor {
    pub fn new(sbatch: PathBuf, squeue: PathBuf) -> Self {
        Self {
            sbatch,
            squeue,
            accounting: JobAccounting::default(),
            stop: Arc::new(AtomicBool::new(false)),
            poller: None,
            finalized: false,
        }
    }

    fn prepare(&self, experiments: &ExperimentSet) -> Result<VecDeque<SlurmJob>, ExecutorError> {
        experiments
            .iter()
            .map(|experiment| {
                let script = experiments.run_dir.join(format!("{}.sh", experiment.name));
                let exit_file = exit_file(experiments, experiment);

                fs::write(&script, batch_script(experiments, experiment)).map_err(|source| {
                    ExecutorError::Prepare {
                        name: experiment.name.clone(),
                        source,
                    }
                })?;
                // stale exit codes from a previous invocation would be read as this run's
                if exit_file.exists() {
                    fs::remove_file(&exit_file).map_err(|source| ExecutorError::Prepare {
                        name: experiment.name.clone(),
                        source,
                    })?;
                }
                self.accounting.enqueue(&experiment.name);

                Ok(SlurmJob {
                    name: experiment.name.clone(),
                    script,
                    exit_file,
                })
            })
            .collect()
    }
}

impl Executor for SlurmExecutor {
    fn load(config: &ExecutorConfig) -> Result<Self, ConfigErrors> {
        let sbatch = config.string("sbatch")?.unwrap_or_else(|| "sbatch".to_owned());
        let squeue = config.string("squeue")?.unwrap_or_else(|| "squeue".to_owned());

        Ok(Self::new(PathBuf::from(sbatch), PathBuf::from(squeue)))
    }

    fn run(&mut self, experiments: &ExperimentSet, runtime: &Runtime) -> Result<(), ExecutorError> {
        if self.finalized {
            return Err(ExecutorError::Finalized);
        }

        let mut queue = JobQueue {
            sbatch: self.sbatch.clone(),
            squeue: self.squeue.clone(),
            pending: self.prepare(experiments)?,
            active: BTreeMap::new(),
            limit: runtime.max_running_jobs.get(),
            accounting: self.accounting.clone(),
            stop: self.stop.clone(),
            interval: runtime.progress_frequency.max(MIN_POLL_INTERVAL),
            backoff: runtime.resubmit_backoff,
        };

        queue.submit_initial()?;
        info!(
            "Submitted {} experiments, {} queued",
            queue.active.len(),
            queue.pending.len()
        );

        self.poller = Some(
            thread::Builder::new()
                .name("openhpca-slurm-poller".to_owned())
                .spawn(move || queue.poll())
                .map_err(ExecutorError::Poller)?,
        );

        Ok(())
    }

    fn wait(&mut self, runtime: &Runtime) {
        poll_until_terminal(&self.accounting, runtime);

        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                error!("Job queue poller panicked");
            }
        }
    }

    fn fini(&mut self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                error!("Job queue poller panicked");
            }
        }

        self.finalized = true;
    }

    fn accounting(&self) -> &JobAccounting {
        &self.accounting
    }
}
