use crate::config::{check_executable, SuiteConfig};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// map of suite name -> installed suite
pub type Catalog = BTreeMap<String, BenchmarkInstall>;

/// One runnable variant within a suite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBenchmarkInfo {
    pub name: String,
    // directory containing the executable
    pub bin_path: PathBuf,
    pub bin_name: String,
    pub bin_args: Vec<String>,
}

impl SubBenchmarkInfo {
    pub fn new(name: impl Into<String>, executable: &Path, bin_args: Vec<String>) -> Self {
        let bin_name = executable
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            name: name.into(),
            bin_path: executable
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            bin_name,
            bin_args,
        }
    }

    pub fn executable(&self) -> PathBuf {
        self.bin_path.join(&self.bin_name)
    }
}

/// Installation state of a single suite
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BenchmarkInstall {
    pub sub_benchmarks: Vec<SubBenchmarkInfo>,
}

impl BenchmarkInstall {
    pub fn new(sub_benchmarks: Vec<SubBenchmarkInfo>) -> Self {
        Self { sub_benchmarks }
    }

    pub fn get(&self, name: &str) -> Option<&SubBenchmarkInfo> {
        self.sub_benchmarks.iter().find(|sub| sub.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.sub_benchmarks.is_empty()
    }
}

fn is_executable_file(entry: &DirEntry) -> bool {
    entry.file_type().map_or(false, |kind| kind.is_file())
        && check_executable(entry.path()).unwrap_or(false)
}

/// Walk the install directory of a suite and collect the executables matching its glob
pub fn detect_suite(name: &str, config: &SuiteConfig) -> Option<BenchmarkInstall> {
    if !config.path.is_dir() {
        warn!(
            suite = name,
            "Install directory {} not found, skipping suite",
            config.path.display()
        );

        return None;
    }

    let matcher = config.glob.as_ref().map(|glob| glob.compile_matcher());
    let mut builder = WalkBuilder::new(&config.path);
    builder.standard_filters(false).hidden(true);

    let sub_benchmarks = builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(suite = name, "Failed to search for benchmarks: {e}");
                None
            }
        })
        .filter(is_executable_file)
        .filter(|entry| {
            matcher
                .as_ref()
                .map_or(true, |matcher| matcher.is_match(entry.file_name()))
        })
        .map(|entry| {
            let file_name = entry.file_name().to_string_lossy().into_owned();
            SubBenchmarkInfo::new(file_name, entry.path(), config.params.clone())
        })
        .sorted_by(|a, b| a.name.cmp(&b.name))
        .dedup_by(|a, b| a.name == b.name)
        .collect_vec();

    debug!(
        suite = name,
        "Found {} sub-benchmarks in {}",
        sub_benchmarks.len(),
        config.path.display()
    );

    Some(BenchmarkInstall::new(sub_benchmarks))
}

/// Detect all installed suites, suites without install directory are left out of the catalog
pub fn detect_installed(benchmarks: &BTreeMap<String, SuiteConfig>) -> Catalog {
    let catalog: Catalog = benchmarks
        .iter()
        .filter_map(|(name, config)| {
            detect_suite(name, config).map(|install| (name.clone(), install))
        })
        .collect();

    info!("{} benchmark suites installed", catalog.len());

    catalog
}
