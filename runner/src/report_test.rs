use crate::{
    executors::{JobAccounting, STATUS_FILE_NAME},
    experiment::ExperimentKind,
    report::{
        parse_output, render, Measurement, ReportError, Reporter, ResultReporter,
        RESULTS_FILE_NAME, RESULTS_FILE_PERMISSION,
    },
};
use std::{fs, os::unix::fs::PermissionsExt};

const LATENCY_OUTPUT: &str = "# OSU MPI Latency Test v5.8
# Size          Latency (us)
1                       1.52
2                       1.55
4096                    4.90
";

const BANDWIDTH_OUTPUT: &str = "# OSU MPI Bandwidth Test v5.8
# Size      Bandwidth (MB/s)
1                       3.21
1048576             12040.11
";

#[test]
pub fn latency_uses_smallest_message() {
    assert_eq!(
        parse_output(ExperimentKind::Latency, LATENCY_OUTPUT),
        Some(Measurement {
            size: Some(1),
            value: 1.52
        })
    );
}

#[test]
pub fn bandwidth_uses_largest_message() {
    assert_eq!(
        parse_output(ExperimentKind::NoncontigBandwidth, BANDWIDTH_OUTPUT),
        Some(Measurement {
            size: Some(1048576),
            value: 12040.11
        })
    );
}

#[test]
pub fn single_column_output() {
    assert_eq!(
        parse_output(ExperimentKind::MpiOverhead, "overhead in us:\n0.42\n"),
        Some(Measurement {
            size: None,
            value: 0.42
        })
    );
    assert_eq!(parse_output(ExperimentKind::Other, "no numbers here\n"), None);
}

#[test]
pub fn render_run_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("osu_osu_latency.out"), LATENCY_OUTPUT).unwrap();
    fs::write(dir.path().join("osu_osu_bw.out"), BANDWIDTH_OUTPUT).unwrap();
    fs::write(dir.path().join("osu_osu_ibcast.out"), "").unwrap();

    let accounting = JobAccounting::default();
    for name in ["osu_osu_latency", "osu_osu_bw", "osu_osu_ibcast"] {
        accounting.enqueue(name);
        accounting.start(name);
    }
    accounting.finish("osu_osu_latency", true);
    accounting.finish("osu_osu_bw", true);
    accounting.finish("osu_osu_ibcast", false);
    accounting.persist(&dir.path().join(STATUS_FILE_NAME)).unwrap();

    let report = render(dir.path()).unwrap();

    assert_eq!(
        report,
        "  osu_osu_bw: 12040.11 MB/s (1048576 bytes)
  osu_osu_ibcast: failed
  osu_osu_latency: 1.52 us (1 bytes)
3 experiments, 2 completed, 1 failed
"
    );
}

#[test]
pub fn outputs_of_previous_runs_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("osu_osu_latency.out"), LATENCY_OUTPUT).unwrap();
    // left behind by an earlier long run
    fs::write(dir.path().join("osu_osu_ibcast.out"), BANDWIDTH_OUTPUT).unwrap();

    let accounting = JobAccounting::default();
    accounting.enqueue("osu_osu_latency");
    accounting.start("osu_osu_latency");
    accounting.finish("osu_osu_latency", true);
    accounting.persist(&dir.path().join(STATUS_FILE_NAME)).unwrap();

    let report = render(dir.path()).unwrap();

    assert!(!report.contains("osu_osu_ibcast"));
    assert!(report.ends_with("1 experiments, 1 completed, 0 failed\n"));
}

#[test]
pub fn unparseable_results_are_an_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("smb_mpi_overhead.out"), "Segmentation fault\n").unwrap();

    assert!(matches!(
        render(dir.path()),
        Err(ReportError::Unparseable(name)) if name == "smb_mpi_overhead"
    ));
}

#[test]
pub fn missing_run_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        render(&dir.path().join("run")),
        Err(ReportError::MissingRunDir(_))
    ));
}

#[test]
pub fn results_are_persisted_next_to_basedir() {
    let dir = tempfile::tempdir().unwrap();
    let basedir = dir.path().join("openhpca");
    let run_dir = basedir.join("run");
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(run_dir.join("osu_osu_latency.out"), LATENCY_OUTPUT).unwrap();

    let reporter = ResultReporter::new(&basedir);
    let results = reporter.render_and_persist(&run_dir).unwrap();

    let persisted = dir.path().join(RESULTS_FILE_NAME);
    assert_eq!(fs::read_to_string(&persisted).unwrap(), results);
    assert_eq!(
        fs::metadata(&persisted).unwrap().permissions().mode() & 0o777,
        RESULTS_FILE_PERMISSION
    );
    assert!(results.ends_with("1 experiments, 1 completed, 0 failed\n"));
}
