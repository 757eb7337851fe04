use super::{
    slurm::{batch_script, parse_job_id},
    Executor, ExecutorError, JobStatus, SlurmExecutor,
};
use crate::{
    catalog::SubBenchmarkInfo,
    config::ExecutorConfig,
    experiment::{ExperimentDescriptor, ExperimentSet, Platform, Runtime},
};
use std::{fs, num::NonZeroUsize, os::unix::fs::PermissionsExt, path::Path, time::Duration};

fn platform() -> Platform {
    Platform {
        name: "batch".to_owned(),
        device: "mlx5_0:1".to_owned(),
        ppn: 4,
        nodes: 8,
    }
}

fn experiment_set(mpi_dir: &Path, run_dir: &Path, names: &[&str]) -> ExperimentSet {
    let mut set = ExperimentSet::new(platform(), mpi_dir, run_dir, "1:00:00");

    for name in names {
        let sub = SubBenchmarkInfo::new(
            *name,
            &Path::new("/opt/osu/libexec").join(name),
            vec!["-m".to_owned(), "1:4096".to_owned()],
        );
        let experiment = ExperimentDescriptor::new("osu", &sub, &set.platform);
        set.push(experiment);
    }

    set
}

fn runtime(max_running_jobs: usize) -> Runtime {
    Runtime {
        max_running_jobs: NonZeroUsize::new(max_running_jobs).unwrap(),
        progress_frequency: Duration::from_millis(20),
        resubmit_backoff: Duration::ZERO,
    }
}

fn write_script(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// fake slurm: `sbatch` runs the batch script synchronously, `squeue` reports an empty queue
/// and `mpirun` fails for executables named `*broken*`
fn fake_slurm(root: &Path) -> SlurmExecutor {
    let counter = root.join("counter");
    write_script(
        &root.join("sbatch"),
        &format!(
            "#!/bin/sh\nshift\nsh \"$1\" > /dev/null 2>&1\nn=$(cat {0} 2>/dev/null || echo 0)\nn=$((n + 1))\necho $n > {0}\necho \"$n;cluster\"\n",
            counter.display()
        ),
    );
    write_script(&root.join("squeue"), "#!/bin/sh\nexit 0\n");
    write_script(
        &root.join("mpi/bin/mpirun"),
        "#!/bin/sh\ncase \"$*\" in\n  *broken*) exit 3 ;;\nesac\nexit 0\n",
    );

    SlurmExecutor::load(&ExecutorConfig {
        name: "slurm".to_owned(),
        parameter: [
            ("sbatch", root.join("sbatch")),
            ("squeue", root.join("squeue")),
        ]
        .into_iter()
        .map(|(key, path)| {
            (
                key.to_owned(),
                serde_yaml::Value::String(path.display().to_string()),
            )
        })
        .collect(),
    })
    .unwrap()
}

#[test]
pub fn job_id_parsing() {
    assert_eq!(parse_job_id("12345\n"), Some("12345".to_owned()));
    assert_eq!(parse_job_id("12345;cluster\n"), Some("12345".to_owned()));
    assert_eq!(parse_job_id("\n  \n"), None);
    assert_eq!(parse_job_id(";cluster"), None);
}

#[test]
pub fn point_to_point_batch_script() {
    let set = experiment_set(
        Path::new("/opt/mpi"),
        Path::new("/scratch/run"),
        &["osu_latency"],
    );
    let script = batch_script(&set, &set.list[0]);

    assert!(script.starts_with("#!/bin/bash\n"));
    assert!(script.contains("#SBATCH --job-name=osu_osu_latency\n"));
    assert!(script.contains("#SBATCH --nodes=2\n"));
    assert!(script.contains("#SBATCH --ntasks-per-node=1\n"));
    assert!(script.contains("#SBATCH --partition=batch\n"));
    assert!(script.contains("#SBATCH --time=1:00:00\n"));
    assert!(script.contains("#SBATCH --output=/scratch/run/osu_osu_latency.out\n"));
    assert!(script.contains("export UCX_NET_DEVICES=mlx5_0:1\n"));
    assert!(script.contains(
        "/opt/mpi/bin/mpirun -np 2 --map-by ppr:1:node /opt/osu/libexec/osu_latency -m 1:4096\n"
    ));
    assert!(script.ends_with("echo $? > /scratch/run/osu_osu_latency.exit\n"));
}

#[test]
pub fn default_topology_batch_script() {
    let mut set = experiment_set(
        Path::new("/opt/mpi"),
        Path::new("/scratch/run"),
        &["osu_ibcast"],
    );
    set.platform.name = String::new();
    set.platform.device = String::new();
    let script = batch_script(&set, &set.list[0]);

    assert!(script.contains("#SBATCH --nodes=8\n"));
    assert!(script.contains("#SBATCH --ntasks-per-node=4\n"));
    assert!(script.contains("-np 32 --map-by ppr:4:node"));
    assert!(!script.contains("--partition"));
    assert!(!script.contains("UCX_NET_DEVICES"));
}

#[test]
pub fn submits_within_bound_and_collects_status() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    fs::create_dir_all(&run_dir).unwrap();
    let mut executor = fake_slurm(dir.path());
    let set = experiment_set(
        &dir.path().join("mpi"),
        &run_dir,
        &["a", "b", "broken", "c", "d"],
    );

    executor.run(&set, &runtime(2)).unwrap();
    executor.wait(&runtime(2));
    executor.fini();
    executor.fini();

    let accounting = executor.accounting();
    assert!(accounting.peak_running() <= 2);
    assert_eq!(accounting.status("osu_a"), Some(JobStatus::Completed));
    assert_eq!(accounting.status("osu_d"), Some(JobStatus::Completed));
    assert_eq!(accounting.status("osu_broken"), Some(JobStatus::Failed));
    assert_eq!(accounting.counts().completed, 4);
    assert!(run_dir.join("osu_c.sh").is_file());
}

#[test]
pub fn failing_sbatch_fails_submission() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    fs::create_dir_all(&run_dir).unwrap();
    let mut executor = fake_slurm(dir.path());
    write_script(
        &dir.path().join("sbatch"),
        "#!/bin/sh\necho 'sbatch: error: invalid partition' >&2\nexit 1\n",
    );
    let set = experiment_set(&dir.path().join("mpi"), &run_dir, &["a"]);

    let result = executor.run(&set, &runtime(1));
    executor.fini();

    assert!(matches!(
        result,
        Err(ExecutorError::Rejected { name, reason })
            if name == "osu_a" && reason == "sbatch: error: invalid partition"
    ));
}

#[test]
pub fn zero_interval_does_not_spin_on_squeue() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    fs::create_dir_all(&run_dir).unwrap();
    let mut executor = fake_slurm(dir.path());
    let calls = dir.path().join("squeue_calls");
    let release = dir.path().join("release");
    // the job stays queued until `release` exists
    write_script(
        &dir.path().join("squeue"),
        &format!(
            "#!/bin/sh\necho x >> {}\n[ -e {} ] || echo 1\nexit 0\n",
            calls.display(),
            release.display()
        ),
    );
    let set = experiment_set(&dir.path().join("mpi"), &run_dir, &["a"]);
    let runtime = Runtime {
        progress_frequency: Duration::ZERO,
        ..runtime(1)
    };

    executor.run(&set, &runtime).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    fs::write(&release, "").unwrap();
    executor.wait(&runtime);
    executor.fini();

    let invocations = fs::read_to_string(&calls).unwrap().lines().count();
    assert_eq!(executor.accounting().status("osu_a"), Some(JobStatus::Completed));
    assert!(invocations >= 1);
    assert!(invocations < 60, "squeue ran {invocations} times");
}

#[test]
pub fn unusable_squeue_falls_back_to_exit_files() {
    let dir = tempfile::tempdir().unwrap();
    let run_dir = dir.path().join("run");
    fs::create_dir_all(&run_dir).unwrap();
    fake_slurm(dir.path());
    let mut executor = SlurmExecutor::new(
        dir.path().join("sbatch"),
        dir.path().join("nonexistent").join("squeue"),
    );
    let set = experiment_set(&dir.path().join("mpi"), &run_dir, &["a", "broken", "c"]);

    executor.run(&set, &runtime(2)).unwrap();

    let (sender, receiver) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        executor.wait(&runtime(2));
        executor.fini();
        let _ = sender.send(executor);
    });
    let executor = receiver
        .recv_timeout(Duration::from_secs(10))
        .expect("wait did not return");

    let accounting = executor.accounting();
    assert!(run_dir.join("osu_a.exit").is_file());
    assert_eq!(accounting.status("osu_a"), Some(JobStatus::Completed));
    assert_eq!(accounting.status("osu_broken"), Some(JobStatus::Failed));
    assert_eq!(accounting.status("osu_c"), Some(JobStatus::Completed));
}
