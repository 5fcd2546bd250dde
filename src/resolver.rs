//! The resolver dispatcher.
//!
//! Routes each input package to its resolver (a pattern match on the tagged
//! [`PackageInput`] enum) and merges the per-package results into a single
//! [`RequestOutput`]. The merge is commutative: components dedupe under
//! their purl key with property sets combined, environment variables and
//! project files must not conflict.

use crate::models::{PackageInput, Request, RequestOutput};
use crate::package_managers;
use anyhow::Result;
use tracing::info;

/// Run all requested package managers, return their combined output.
pub async fn resolve_packages(request: &Request) -> Result<RequestOutput> {
    let mut output = RequestOutput::empty();
    for package in &request.packages {
        info!(
            "processing the {} package at {:?}",
            package.type_name(),
            package.path()
        );
        let package_output = resolve_package(request, package).await?;
        output = output.merge(package_output)?;
    }
    Ok(output)
}

async fn resolve_package(request: &Request, package: &PackageInput) -> Result<RequestOutput> {
    match package {
        PackageInput::Gomod(input) => {
            package_managers::gomod::fetch_gomod_source(request, input).await
        }
        PackageInput::Pip(input) => package_managers::pip::fetch_pip_source(request, input).await,
        PackageInput::Npm(input) => package_managers::npm::fetch_npm_source(request, input).await,
        PackageInput::Yarn(input) => {
            package_managers::fetch_metayarn_source(request, input).await
        }
        PackageInput::Cargo(input) => {
            package_managers::cargo::fetch_cargo_source(request, input).await
        }
        PackageInput::Bundler(input) => {
            package_managers::bundler::fetch_bundler_source(request, input).await
        }
        PackageInput::Generic(input) => {
            package_managers::generic::fetch_generic_source(request, input).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::input::PackageInput;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_failing_package_fails_the_request() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        // a gomod package without go.mod is rejected
        let packages: Vec<PackageInput> =
            vec![serde_json::from_str(r#"{"type": "gomod"}"#).unwrap()];
        let request = Request::new(
            temp.path().join("src"),
            temp.path().join("out"),
            packages,
            BTreeSet::new(),
        )
        .unwrap();
        assert!(resolve_packages(&request).await.is_err());
    }

    #[tokio::test]
    async fn test_generic_package_resolves_offline() {
        // a generic package with an empty artifact list exercises the full
        // dispatcher path without any network access
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        fs::write(
            temp.path().join("src/artifacts.lock.yaml"),
            "metadata:\n  version: \"1.0\"\nartifacts: []\n",
        )
        .unwrap();
        let packages: Vec<PackageInput> =
            vec![serde_json::from_str(r#"{"type": "generic"}"#).unwrap()];
        let request = Request::new(
            temp.path().join("src"),
            temp.path().join("out"),
            packages,
            BTreeSet::new(),
        )
        .unwrap();
        let output = resolve_packages(&request).await.unwrap();
        assert!(output.sbom.components.is_empty());
        assert!(temp.path().join("out/deps/generic").is_dir());
    }
}
