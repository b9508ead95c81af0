//! Runtime configuration loading through the crate entry point

use std::fs;

use tempfile::tempdir;
use vmframe::util::logger::LogLevel;

#[test]
fn test_load_runtime_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("vmframe.toml");
    fs::write(
        &path,
        "[gc]\nparallel_root_scan = false\n\n[log]\nlevel = \"warn\"\n",
    )
    .unwrap();

    let config = vmframe::load_runtime(&path).unwrap();
    assert!(!config.gc.parallel_root_scan);
    assert_eq!(config.log.level, LogLevel::Warn);
}

#[test]
fn test_load_runtime_missing_file() {
    let dir = tempdir().unwrap();
    let config = vmframe::load_runtime(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config, vmframe::RuntimeConfig::default());
}

#[test]
fn test_load_runtime_reports_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[platform]\nneeds_deopt_suspend = \"yes\"\n").unwrap();

    let err = vmframe::load_runtime(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("Failed to load runtime config"));
}
