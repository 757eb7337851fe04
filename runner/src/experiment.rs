use crate::catalog::{Catalog, SubBenchmarkInfo};
use itertools::Itertools;
use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

/// ranks per node of a strictly point-to-point experiment
pub const POINT_TO_POINT_PPN: u32 = 1;
/// node count of a strictly point-to-point experiment
pub const POINT_TO_POINT_NODES: u32 = 2;

/// Known experiment kinds, everything not listed is `Other`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentKind {
    Latency,
    Bandwidth,
    NoncontigLatency,
    NoncontigBandwidth,
    MpiOverhead,
    Other,
}

/// How an experiment is placed on the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyPolicy {
    /// global topology of the run
    Default,
    /// two ranks on two separate nodes
    PointToPoint,
}

impl ExperimentKind {
    /// kind of a canonical experiment name, matching is exact
    pub fn from_name(name: &str) -> Self {
        match name {
            "osu_latency" => Self::Latency,
            "osu_bw" => Self::Bandwidth,
            "osu_noncontig_mem_latency" => Self::NoncontigLatency,
            "osu_noncontig_mem_bw" => Self::NoncontigBandwidth,
            "smb_mpi_overhead" => Self::MpiOverhead,
            _ => Self::Other,
        }
    }

    /// kind of a sub-benchmark of a suite
    ///
    /// Installed binaries usually carry the canonical name themselves (`osu_latency` in `osu`),
    /// otherwise the joined experiment name is canonical (`mpi_overhead` in `smb`).
    pub fn classify(suite: &str, sub_benchmark: &str) -> Self {
        match Self::from_name(sub_benchmark) {
            Self::Other => Self::from_name(&experiment_name(suite, sub_benchmark)),
            kind => kind,
        }
    }

    /// recover the kind from an experiment name produced by `experiment_name`
    pub fn from_experiment_name(name: &str) -> Self {
        match Self::from_name(name) {
            Self::Other => name
                .split_once('_')
                .map_or(Self::Other, |(_, sub_benchmark)| Self::from_name(sub_benchmark)),
            kind => kind,
        }
    }

    pub fn policy(self) -> TopologyPolicy {
        match self {
            Self::Latency
            | Self::Bandwidth
            | Self::NoncontigLatency
            | Self::NoncontigBandwidth
            | Self::MpiOverhead => TopologyPolicy::PointToPoint,
            Self::Other => TopologyPolicy::Default,
        }
    }
}

/// Whether the experiment requires an isolated 2 nodes/ 1 rank per node topology
pub fn is_strictly_point_to_point(name: &str) -> bool {
    ExperimentKind::from_name(name).policy() == TopologyPolicy::PointToPoint
}

pub fn experiment_name(suite: &str, sub_benchmark: &str) -> String {
    format!("{suite}_{sub_benchmark}")
}

/// Placement of an experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    // partition, empty when unset
    pub name: String,
    pub device: String,
    pub ppn: u32,
    pub nodes: u32,
}

impl Platform {
    /// point-to-point variant of this platform, device and partition are kept
    pub fn point_to_point(&self) -> Self {
        Self {
            name: self.name.clone(),
            device: self.device.clone(),
            ppn: POINT_TO_POINT_PPN,
            nodes: POINT_TO_POINT_NODES,
        }
    }

    /// total number of MPI ranks, wide enough for any ppn and node count
    pub fn ranks(&self) -> u64 {
        u64::from(self.ppn) * u64::from(self.nodes)
    }
}

/// A single schedulable experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentDescriptor {
    pub name: String,
    pub kind: ExperimentKind,
    pub bin_path: PathBuf,
    pub bin_name: String,
    pub bin_args: Vec<String>,
    // only allocated when the experiment overrides the global topology
    pub platform: Option<Platform>,
}

impl ExperimentDescriptor {
    pub fn new(suite: &str, sub_benchmark: &SubBenchmarkInfo, global: &Platform) -> Self {
        let kind = ExperimentKind::classify(suite, &sub_benchmark.name);
        let platform = match kind.policy() {
            TopologyPolicy::PointToPoint => Some(global.point_to_point()),
            TopologyPolicy::Default => None,
        };

        Self {
            name: experiment_name(suite, &sub_benchmark.name),
            kind,
            bin_path: sub_benchmark.bin_path.clone(),
            bin_name: sub_benchmark.bin_name.clone(),
            bin_args: sub_benchmark.bin_args.clone(),
            platform,
        }
    }

    pub fn executable(&self) -> PathBuf {
        self.bin_path.join(&self.bin_name)
    }
}

/// Parameters of the runner for a single invocation
#[derive(Debug, Clone)]
pub struct Runtime {
    pub max_running_jobs: NonZeroUsize,
    pub progress_frequency: Duration,
    pub resubmit_backoff: Duration,
}

/// All experiments of an invocation and their shared parameters
#[derive(Debug, Clone)]
pub struct ExperimentSet {
    pub list: Vec<ExperimentDescriptor>,
    pub platform: Platform,
    pub mpi_dir: PathBuf,
    pub run_dir: PathBuf,
    pub results_dir: PathBuf,
    // slurm style walltime, [[hours:]minutes:]seconds
    pub max_exec_time: String,
}

impl ExperimentSet {
    pub fn new(platform: Platform, mpi_dir: &Path, run_dir: &Path, max_exec_time: &str) -> Self {
        Self {
            list: Vec::new(),
            platform,
            mpi_dir: mpi_dir.to_path_buf(),
            run_dir: run_dir.to_path_buf(),
            results_dir: run_dir.to_path_buf(),
            max_exec_time: max_exec_time.to_owned(),
        }
    }

    pub fn push(&mut self, experiment: ExperimentDescriptor) {
        self.list.push(experiment);
    }

    /// append one experiment per sub-benchmark, in suite then sub-benchmark order
    pub fn extend_from_catalog(&mut self, catalog: &Catalog) {
        for (suite, install) in catalog.iter() {
            for sub_benchmark in install.sub_benchmarks.iter() {
                let experiment = ExperimentDescriptor::new(suite, sub_benchmark, &self.platform);
                self.push(experiment);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExperimentDescriptor> {
        self.list.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.list.iter().map(|e| e.name.as_str()).collect_vec()
    }

    /// effective topology of an experiment of this set
    pub fn topology<'a>(&'a self, experiment: &'a ExperimentDescriptor) -> &'a Platform {
        experiment.platform.as_ref().unwrap_or(&self.platform)
    }

    /// `max_exec_time` as a duration, `None` when it can't be parsed
    pub fn max_exec_duration(&self) -> Option<Duration> {
        parse_walltime(&self.max_exec_time)
    }
}

/// parse a `[[hours:]minutes:]seconds` walltime
pub fn parse_walltime(walltime: &str) -> Option<Duration> {
    let parts: Vec<u64> = walltime
        .trim()
        .split(':')
        .map(|part| part.parse::<u64>().ok())
        .collect::<Option<_>>()?;

    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let seconds = parts.iter().fold(0, |acc, part| acc * 60 + part);
    Some(Duration::from_secs(seconds))
}
