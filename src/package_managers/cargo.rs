//! The cargo resolver.
//!
//! Vendors every crate pinned in `Cargo.lock` into `deps/cargo/vendor` by
//! driving `cargo vendor --locked --frozen`, then rewrites the source
//! replacement block cargo prints so the build consumes the vendored tree
//! via `.cargo/config.toml`.
//!
//! The SBOM comes from `Cargo.lock` directly: registry packages carry their
//! lockfile checksum, git packages a `vcs_url` qualifier. Workspace path
//! packages are represented by the main package component alone.

use crate::core::{Cachi2Error, package_rejected};
use crate::git::get_repo_id;
use crate::models::input::PlainPackageInput;
use crate::models::{EnvironmentVariable, ProjectFile, Request, RequestOutput};
use crate::purl::Purl;
use crate::sbom::Component;
use crate::utils::ToolCommand;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use url::Url;

#[derive(Debug, Deserialize)]
struct CargoLockfile {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

#[derive(Debug, Deserialize)]
struct LockedPackage {
    name: String,
    version: String,
    source: Option<String>,
    checksum: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CargoManifest {
    package: Option<ManifestPackage>,
}

#[derive(Debug, Deserialize)]
struct ManifestPackage {
    name: String,
    version: Option<String>,
}

/// Resolve and fetch cargo dependencies for the given request.
pub async fn fetch_cargo_source(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let manifest_path = package_dir.join_within_root("Cargo.toml")?;
    let lockfile_path = package_dir.join_within_root("Cargo.lock")?;
    if !manifest_path.path().is_file() || !lockfile_path.path().is_file() {
        return Err(package_rejected(
            format!(
                "Cargo.toml and Cargo.lock must be present in {}",
                package_dir.path().display()
            ),
            "Run `cargo generate-lockfile` to create Cargo.lock and commit both files.",
        )
        .into());
    }

    let vendor_dir = request.package_output_dir("cargo")?.join_within_root("vendor")?;
    std::fs::create_dir_all(vendor_dir.path())?;

    info!("vendoring cargo dependencies of {}", package_dir.path().display());
    let config_block = ToolCommand::new("cargo")
        .args(["vendor", "--locked", "--frozen"])
        .arg(vendor_dir.path().display().to_string())
        .current_dir(package_dir.path())
        .with_timeout(request.config.subprocess_timeout)
        .run()
        .await
        .context("cargo vendor failed")?;

    // cargo prints the [source] replacement block pointing at the absolute
    // vendor path; templatize it so the build can mount the output anywhere.
    let template = config_block.replace(
        &vendor_dir.path().display().to_string(),
        "${output_dir}/deps/cargo/vendor",
    );
    let cargo_config = ProjectFile::new(
        request.source_dir.join_within_root(".cargo/config.toml")?.path(),
        template,
    );

    let components = sbom_components(request, package, lockfile_path.path()).await?;

    RequestOutput::new(
        components,
        vec![EnvironmentVariable::path("CARGO_HOME", "deps/cargo")],
        vec![cargo_config],
    )
    .map_err(Into::into)
}

async fn sbom_components(
    request: &Request,
    package: &PlainPackageInput,
    lockfile_path: &Path,
) -> Result<Vec<Component>> {
    let lockfile: CargoLockfile = toml::from_str(&std::fs::read_to_string(lockfile_path)?)
        .map_err(|e| Cachi2Error::LockfileError {
            reason: format!("failed to parse Cargo.lock: {e}"),
            file: lockfile_path.to_path_buf(),
            line: None,
            solution: None,
        })?;

    let mut components = Vec::with_capacity(lockfile.package.len() + 1);
    if let Some(main) = main_package_component(request, package).await? {
        components.push(main);
    }

    for locked in &lockfile.package {
        match locked.source.as_deref() {
            Some(source) if source.starts_with("registry+") => {
                let mut purl =
                    Purl::new("cargo", &locked.name).with_version(&locked.version);
                if let Some(checksum) = &locked.checksum {
                    purl = purl.with_qualifier("checksum", format!("sha256:{checksum}"));
                }
                components.push(Component::library(
                    locked.name.clone(),
                    Some(locked.version.clone()),
                    purl,
                ));
            }
            Some(source) if source.starts_with("git+") => {
                let vcs_url = git_source_to_vcs_url(source)?;
                let purl = Purl::new("cargo", &locked.name)
                    .with_version(&locked.version)
                    .with_qualifier("vcs_url", vcs_url);
                components.push(Component::library(
                    locked.name.clone(),
                    Some(locked.version.clone()),
                    purl,
                ));
            }
            Some(other) => {
                return Err(Cachi2Error::LockfileError {
                    reason: format!(
                        "unsupported source for crate {}: {other:?}",
                        locked.name
                    ),
                    file: lockfile_path.to_path_buf(),
                    line: None,
                    solution: None,
                }
                .into());
            }
            // No source: the workspace root or a path member, covered by the
            // main package component.
            None => {}
        }
    }
    Ok(components)
}

async fn main_package_component(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<Option<Component>> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let manifest_path = package_dir.join_within_root("Cargo.toml")?;
    let manifest: CargoManifest = toml::from_str(&std::fs::read_to_string(manifest_path.path())?)
        .with_context(|| format!("failed to parse {}", manifest_path.path().display()))?;

    let Some(manifest_package) = manifest.package else {
        // a virtual workspace manifest has no [package] table
        return Ok(None);
    };

    let repo_id = get_repo_id(request.source_dir.path()).await?;
    let mut purl = Purl::new("cargo", &manifest_package.name)
        .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
        .with_subpath(package_dir.subpath_from_root().display().to_string());
    if let Some(version) = &manifest_package.version {
        purl = purl.with_version(version);
    }

    Ok(Some(Component::library(
        manifest_package.name,
        manifest_package.version,
        purl,
    )))
}

/// Convert a Cargo.lock git source string into a purl `vcs_url` qualifier.
///
/// `git+https://github.com/org/repo?rev=deadbeef#<commit>` becomes
/// `git+https://github.com/org/repo@<commit>`.
fn git_source_to_vcs_url(source: &str) -> Result<String, Cachi2Error> {
    let invalid = |why: &str| {
        Cachi2Error::InvalidInput(format!("invalid git source {source:?}: {why}"))
    };
    let stripped = source.strip_prefix("git+").ok_or_else(|| invalid("missing git+ prefix"))?;
    let url = Url::parse(stripped).map_err(|_| invalid("unparseable url"))?;
    let commit = url.fragment().ok_or_else(|| invalid("missing commit fragment"))?.to_string();

    let mut clean = url.clone();
    clean.set_fragment(None);
    clean.set_query(None);
    Ok(format!("git+{clean}@{commit}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_source_to_vcs_url() {
        let source = "git+https://github.com/rust-lang/cargo?rev=abc123#0123456789abcdef0123456789abcdef01234567";
        assert_eq!(
            git_source_to_vcs_url(source).unwrap(),
            "git+https://github.com/rust-lang/cargo@0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_git_source_without_commit_is_rejected() {
        assert!(git_source_to_vcs_url("git+https://github.com/org/repo").is_err());
        assert!(git_source_to_vcs_url("https://github.com/org/repo#abc").is_err());
    }

    #[test]
    fn test_lockfile_parsing_and_purls() {
        let lock = r#"
version = 3

[[package]]
name = "serde"
version = "1.0.200"
source = "registry+https://github.com/rust-lang/crates.io-index"
checksum = "ddc6f9cc94d67c0e21aaf7eda3a010fd3af78ebf6e096aa6e2e13c79749cce4f"

[[package]]
name = "mycrate"
version = "0.1.0"

[[package]]
name = "helper"
version = "0.3.0"
source = "git+https://github.com/org/helper?branch=main#0123456789abcdef0123456789abcdef01234567"
"#;
        let parsed: CargoLockfile = toml::from_str(lock).unwrap();
        assert_eq!(parsed.package.len(), 3);
        assert_eq!(parsed.package[0].checksum.as_deref().unwrap().len(), 64);
        assert!(parsed.package[1].source.is_none());
    }

    #[test]
    fn test_registry_purl_carries_checksum() {
        let purl = Purl::new("cargo", "serde")
            .with_version("1.0.200")
            .with_qualifier("checksum", "sha256:ddc6f9cc");
        assert_eq!(
            purl.to_string(),
            "pkg:cargo/serde@1.0.200?checksum=sha256:ddc6f9cc"
        );
    }

    #[test]
    fn test_vendor_config_templating() {
        let stdout = "[source.crates-io]\nreplace-with = \"vendored-sources\"\n\n\
                      [source.vendored-sources]\ndirectory = \"/work/output/deps/cargo/vendor\"\n";
        let template = stdout.replace("/work/output/deps/cargo/vendor", "${output_dir}/deps/cargo/vendor");
        let file = ProjectFile::new("/src/.cargo/config.toml", template);
        let resolved = file.resolve_content(Path::new("/mnt/out"));
        assert!(resolved.contains("directory = \"/mnt/out/deps/cargo/vendor\""));
    }
}
