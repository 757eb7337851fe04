use crate::catalog::{BenchmarkInstall, Catalog};
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// OSU sub-benchmarks required to compute the final metrics
pub const OSU_REQUIRED_BENCHMARKS: [&str; 10] = [
    "osu_latency",
    "osu_bw",
    "osu_noncontig_mem_latency",
    "osu_noncontig_mem_bw",
    "osu_ialltoall",
    "osu_iallgather",
    "osu_ibcast",
    "osu_igather",
    "osu_ireduce",
    "osu_iscatter",
];

/// SMB sub-benchmarks required to compute the final metrics
pub const SMB_REQUIRED_BENCHMARKS: [&str; 1] = ["mpi_overhead"];

/// Overlap sub-benchmarks required to compute the final metrics
pub const OVERLAP_REQUIRED_BENCHMARKS: [&str; 6] = [
    "overlap_iallgather",
    "overlap_ialltoall",
    "overlap_ibcast",
    "overlap_igather",
    "overlap_ireduce",
    "overlap_iscatter",
];

static DEFAULT_REQUIRED: Lazy<RequiredLists> = Lazy::new(|| {
    RequiredLists::from_iter([
        ("osu", OSU_REQUIRED_BENCHMARKS.to_vec()),
        ("smb", SMB_REQUIRED_BENCHMARKS.to_vec()),
        ("overlap", OVERLAP_REQUIRED_BENCHMARKS.to_vec()),
    ])
});

/// suite name -> ordered names of the sub-benchmarks to run in short mode
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct RequiredLists(BTreeMap<String, Vec<String>>);

impl Default for RequiredLists {
    fn default() -> Self {
        DEFAULT_REQUIRED.clone()
    }
}

impl<K, V, N> FromIterator<(K, V)> for RequiredLists
where
    K: Into<String>,
    V: IntoIterator<Item = N>,
    N: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(suite, names)| (suite.into(), names.into_iter().map(Into::into).collect()))
                .collect(),
        )
    }
}

impl RequiredLists {
    pub fn get(&self, suite: &str) -> &[String] {
        self.0.get(suite).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

/// Keep the installed sub-benchmarks named in `required`, in the order of `required`
pub fn filter_required(installed: Option<&BenchmarkInstall>, required: &[String]) -> BenchmarkInstall {
    let Some(installed) = installed else {
        return BenchmarkInstall::default();
    };

    let sub_benchmarks = required
        .iter()
        .unique()
        .filter_map(|name| {
            let found = installed.get(name);

            if found.is_none() {
                debug!("Required benchmark {name} is not installed, skipping");
            }

            found.cloned()
        })
        .collect_vec();

    BenchmarkInstall::new(sub_benchmarks)
}

/// Reduce the catalog to the sub-benchmarks required by each suite of `required`
pub fn required_catalog(catalog: &Catalog, required: &RequiredLists) -> Catalog {
    required
        .iter()
        .map(|(suite, names)| (suite.clone(), filter_required(catalog.get(suite), names)))
        .collect()
}

/// Select the benchmarks to run: everything installed for long runs, the required subset otherwise
pub fn select(catalog: Catalog, required: &RequiredLists, long_run: bool) -> Catalog {
    let selected = if long_run {
        catalog
    } else {
        required_catalog(&catalog, required)
    };

    info!(
        "{} benchmarks being executed:",
        selected.values().map(|install| install.sub_benchmarks.len()).sum::<usize>()
    );
    for (suite, install) in selected.iter() {
        for sub_benchmark in install.sub_benchmarks.iter() {
            info!(" - {suite}: {}", sub_benchmark.name);
        }
    }

    selected
}
