//! End-to-end test of the generic resolver and the dispatcher, using a
//! lockfile with no artifacts so that no network access is needed.

use cachi2::models::input::PackageInput;
use cachi2::models::Request;
use cachi2::resolver::resolve_packages;
use std::collections::BTreeSet;
use std::fs;
use tempfile::tempdir;

#[tokio::test]
async fn test_generic_package_end_to_end() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(
        source.join("artifacts.lock.yaml"),
        "metadata:\n  version: \"1.0\"\nartifacts: []\n",
    )
    .unwrap();

    let packages: Vec<PackageInput> =
        vec![serde_json::from_str(r#"{"type": "generic"}"#).unwrap()];
    let request = Request::new(
        &source,
        temp.path().join("output"),
        packages,
        BTreeSet::new(),
    )
    .unwrap();

    let output = resolve_packages(&request).await.unwrap();
    assert!(output.sbom.components.is_empty());
    assert!(output.build_config.environment_variables.is_empty());
    // the canonical deps layout is created even when empty
    assert!(temp.path().join("output/deps/generic").is_dir());
}

#[tokio::test]
async fn test_missing_lockfile_fails_the_request() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    fs::create_dir(&source).unwrap();

    let packages: Vec<PackageInput> =
        vec![serde_json::from_str(r#"{"type": "generic"}"#).unwrap()];
    let request = Request::new(
        &source,
        temp.path().join("output"),
        packages,
        BTreeSet::new(),
    )
    .unwrap();

    let error = resolve_packages(&request).await.unwrap_err();
    assert!(error.to_string().contains("artifacts.lock.yaml"));
}

#[tokio::test]
async fn test_explicit_lockfile_must_be_absolute() {
    let temp = tempdir().unwrap();
    let source = temp.path().join("source");
    fs::create_dir(&source).unwrap();

    let packages: Vec<PackageInput> = vec![
        serde_json::from_str(r#"{"type": "generic", "lockfile": "relative/lock.yaml"}"#).unwrap(),
    ];
    let request = Request::new(
        &source,
        temp.path().join("output"),
        packages,
        BTreeSet::new(),
    )
    .unwrap();

    let error = resolve_packages(&request).await.unwrap_err();
    assert!(error.to_string().contains("not absolute"));
}
