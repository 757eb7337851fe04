use crate::selection::RequiredLists;
use globset::Glob;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

/// name of the run directory inside the workspace
pub const RUN_DIR_NAME: &str = "run";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read {}: {source}", .path.display())]
    ReadConfig { path: PathBuf, source: Error },
    #[error("Failed to parse configuration: {0}")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("executor.parameter.{0} is invalid, expected {1}")]
    InvalidExecutorParameter(String, &'static str),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // the results file is written next to this directory, defaults to the directory of the
    // configuration file
    #[serde(default)]
    pub basedir: Option<PathBuf>,
    // workspace holding the MPI installation and the run directory
    pub workspace: Option<WorkspaceConfig>,
    // installed suites, keyed by suite name
    #[serde(default)]
    pub benchmarks: BTreeMap<String, SuiteConfig>,
    // sub-benchmarks required to compute the final metrics
    #[serde(default)]
    pub required: RequiredLists,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default = "default_max_exec_time")]
    pub max_exec_time: String,
    // seconds between two progress checks
    #[serde(default = "default_progress_frequency")]
    pub progress_frequency: u64,
    // seconds to sleep before submitting again once a slot frees up
    #[serde(default = "default_resubmit_backoff")]
    pub resubmit_backoff: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    pub basedir: PathBuf,
    #[serde(alias = "mpi")]
    pub mpi_dir: PathBuf,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    // install directory, searched recursively for executables
    pub path: PathBuf,
    // restricts discovery to the executables whose file name matches
    pub glob: Option<Glob>,
    // arguments passed to every sub-benchmark of the suite
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    #[serde(default = "default_executor")]
    pub name: String,
    // parameters for the executor that apply over all experiments
    #[serde(default)]
    pub parameter: BTreeMap<String, serde_yaml::Value>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor(),
            parameter: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    /// optional string parameter
    pub fn string(&self, key: &str) -> Result<Option<String>, ConfigErrors> {
        match self.parameter.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_str()
                .map(|value| Some(value.to_owned()))
                .ok_or_else(|| ConfigErrors::InvalidExecutorParameter(key.to_owned(), "a string")),
        }
    }

    /// optional list of strings parameter
    pub fn strings(&self, key: &str) -> Result<Option<Vec<String>>, ConfigErrors> {
        let invalid =
            || ConfigErrors::InvalidExecutorParameter(key.to_owned(), "a list of strings");

        match self.parameter.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_sequence()
                .ok_or_else(invalid)?
                .iter()
                .map(|item| item.as_str().map(str::to_owned).ok_or_else(invalid))
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            basedir: None,
            workspace: None,
            benchmarks: BTreeMap::new(),
            required: RequiredLists::default(),
            executor: ExecutorConfig::default(),
            max_exec_time: default_max_exec_time(),
            progress_frequency: default_progress_frequency(),
            resubmit_backoff: default_resubmit_backoff(),
        }
    }
}

impl RunnerConfig {
    /// load the configuration from a yaml file
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
            path: path.to_owned(),
            source,
        })?;
        let mut config: Self = serde_yaml::from_str(&content)?;

        if config.basedir.is_none() {
            let parent = path
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            config.basedir = Some(parent.to_path_buf());
        }

        debug!(
            suites = config.benchmarks.len(),
            executor = %config.executor.name,
            "Loaded configuration from {}",
            path.display()
        );

        Ok(config)
    }

    pub fn basedir(&self) -> PathBuf {
        self.basedir.clone().unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn progress_frequency(&self) -> Duration {
        Duration::from_secs(self.progress_frequency)
    }

    pub fn resubmit_backoff(&self) -> Duration {
        Duration::from_secs(self.resubmit_backoff)
    }
}

impl WorkspaceConfig {
    pub fn run_dir(&self) -> PathBuf {
        self.basedir.join(RUN_DIR_NAME)
    }
}

fn default_executor() -> String {
    "local".to_owned()
}

fn default_max_exec_time() -> String {
    "1:00:00".to_owned()
}

fn default_progress_frequency() -> u64 {
    5
}

fn default_resubmit_backoff() -> u64 {
    1
}
