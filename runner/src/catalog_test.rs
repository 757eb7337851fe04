use crate::{
    catalog::{detect_installed, detect_suite},
    config::SuiteConfig,
};
use globset::Glob;
use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

// default temporary directories are hidden, which discovery skips
fn tempdir() -> tempfile::TempDir {
    tempfile::Builder::new().prefix("openhpca").tempdir().unwrap()
}

fn write_file(path: &Path, mode: u32) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

fn suite(path: PathBuf, glob: Option<&str>) -> SuiteConfig {
    SuiteConfig {
        path,
        glob: glob.map(|glob| Glob::new(glob).unwrap()),
        params: vec!["-i".to_owned(), "100".to_owned()],
    }
}

#[test]
pub fn discovers_executables_sorted() {
    let dir = tempdir();
    write_file(&dir.path().join("pt2pt/osu_latency"), 0o755);
    write_file(&dir.path().join("collective/osu_ibcast"), 0o755);
    write_file(&dir.path().join("pt2pt/osu_bw"), 0o755);
    write_file(&dir.path().join("README"), 0o644);

    let install = detect_suite("osu", &suite(dir.path().to_path_buf(), None)).unwrap();
    let names: Vec<_> = install.sub_benchmarks.iter().map(|sub| sub.name.as_str()).collect();

    assert_eq!(names, vec!["osu_bw", "osu_ibcast", "osu_latency"]);

    let latency = install.get("osu_latency").unwrap();
    assert_eq!(latency.bin_path, dir.path().join("pt2pt"));
    assert_eq!(latency.bin_name, "osu_latency");
    assert_eq!(latency.bin_args, vec!["-i", "100"]);
}

#[test]
pub fn glob_restricts_discovery() {
    let dir = tempdir();
    write_file(&dir.path().join("osu_latency"), 0o755);
    write_file(&dir.path().join("helper.sh"), 0o755);

    let install = detect_suite("osu", &suite(dir.path().to_path_buf(), Some("osu_*"))).unwrap();

    assert_eq!(install.sub_benchmarks.len(), 1);
    assert_eq!(install.sub_benchmarks[0].name, "osu_latency");
}

#[test]
pub fn missing_install_dir_is_skipped() {
    let dir = tempdir();
    write_file(&dir.path().join("smb/mpi_overhead"), 0o755);

    let benchmarks = BTreeMap::from([
        ("smb".to_owned(), suite(dir.path().join("smb"), None)),
        ("osu".to_owned(), suite(dir.path().join("not-installed"), None)),
    ]);
    let catalog = detect_installed(&benchmarks);

    assert_eq!(catalog.keys().collect::<Vec<_>>(), vec!["smb"]);
    assert_eq!(catalog["smb"].sub_benchmarks[0].name, "mpi_overhead");
}
