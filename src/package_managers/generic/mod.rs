//! The generic artifact resolver.
//!
//! Processes a checked-in `artifacts.lock.yaml` naming arbitrary files (and
//! maven artifacts) with their checksums, downloads everything into
//! `deps/generic/` and reports one SBOM component per artifact.

mod models;

pub use models::{GenericLockfileV1, LockfileArtifact, MavenAttributes, ResolvedArtifact};

use crate::core::{Cachi2Error, package_rejected};
use crate::fetch::{Artifact, fetch_many};
use crate::models::input::GenericPackageInput;
use crate::models::{Request, RequestOutput};
use crate::purl::Purl;
use crate::sbom::{Component, ExternalReference};
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::info;

const DEFAULT_LOCKFILE_NAME: &str = "artifacts.lock.yaml";
const LOCKFILE_VERSION: &str = "1.0";

/// Resolve and fetch generic dependencies for the given request.
pub async fn fetch_generic_source(
    request: &Request,
    package: &GenericPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let lockfile_path = match &package.lockfile {
        Some(lockfile) => {
            if !lockfile.is_absolute() {
                return Err(package_rejected(
                    format!(
                        "supplied generic lockfile path '{}' is not absolute, refusing to continue",
                        lockfile.display()
                    ),
                    "Make sure the supplied path to the generic lockfile is absolute.",
                )
                .into());
            }
            lockfile.clone()
        }
        None => package_dir.join_within_root(DEFAULT_LOCKFILE_NAME)?.path().to_path_buf(),
    };

    let output_dir = request.package_output_dir("generic")?;
    let artifacts = load_lockfile(&lockfile_path)?;
    info!("reading generic lockfile: {}", lockfile_path.display());

    let downloads: Vec<Artifact> = artifacts
        .iter()
        .map(|artifact| {
            let target = output_dir.join_within_root(artifact.filename())?;
            Ok(Artifact::new(
                artifact.download_url(),
                vec![artifact.checksum().clone()],
                target.path().to_path_buf(),
            ))
        })
        .collect::<Result<_, Cachi2Error>>()?;

    fetch_many(&request.config, &downloads).await?;

    let components = artifacts.iter().map(sbom_component).collect();
    RequestOutput::new(components, vec![], vec![]).map_err(Into::into)
}

fn load_lockfile(lockfile_path: &Path) -> Result<Vec<ResolvedArtifact>> {
    if !lockfile_path.exists() {
        return Err(package_rejected(
            format!(
                "cachi2 generic lockfile '{}' does not exist, refusing to continue",
                lockfile_path.display()
            ),
            format!(
                "Make sure your repository has the '{DEFAULT_LOCKFILE_NAME}' lockfile checked in, \
                 or that the supplied lockfile path is correct."
            ),
        )
        .into());
    }

    let content = std::fs::read_to_string(lockfile_path)?;
    let lockfile: GenericLockfileV1 = serde_yaml::from_str(&content).map_err(|e| {
        Cachi2Error::LockfileError {
            reason: format!("invalid lockfile format: {e}"),
            file: lockfile_path.to_path_buf(),
            line: e.location().map(|l| l.line()),
            solution: Some(
                "Check the correct format and whether any keys are missing in the lockfile."
                    .to_string(),
            ),
        }
    })?;

    if lockfile.metadata.version != LOCKFILE_VERSION {
        return Err(Cachi2Error::LockfileError {
            reason: format!(
                "unsupported lockfile version {:?}, expected {LOCKFILE_VERSION:?}",
                lockfile.metadata.version
            ),
            file: lockfile_path.to_path_buf(),
            line: None,
            solution: None,
        }
        .into());
    }

    let artifacts = lockfile
        .artifacts
        .into_iter()
        .map(LockfileArtifact::resolve)
        .collect::<Result<Vec<_>, _>>()?;

    // Conflicting target filenames would silently overwrite each other.
    let mut filenames = BTreeSet::new();
    let mut urls = BTreeSet::new();
    for artifact in &artifacts {
        if !filenames.insert(artifact.filename().to_string()) {
            return Err(Cachi2Error::LockfileError {
                reason: format!("duplicate filename in lockfile: {:?}", artifact.filename()),
                file: lockfile_path.to_path_buf(),
                line: None,
                solution: Some("Give conflicting artifacts distinct 'filename' values.".to_string()),
            }
            .into());
        }
        if !urls.insert(artifact.download_url().to_string()) {
            return Err(Cachi2Error::LockfileError {
                reason: format!(
                    "duplicate download_url in lockfile: {:?}",
                    artifact.download_url()
                ),
                file: lockfile_path.to_path_buf(),
                line: None,
                solution: None,
            }
            .into());
        }
    }

    Ok(artifacts)
}

fn sbom_component(artifact: &ResolvedArtifact) -> Component {
    match artifact {
        ResolvedArtifact::File {
            download_url,
            filename,
            checksum,
        } => {
            let purl = Purl::new("generic", filename)
                .with_qualifier("checksum", checksum.to_string())
                .with_qualifier("download_url", download_url);
            Component::library(filename.clone(), None, purl)
                .with_external_reference(ExternalReference::distribution(download_url))
        }
        ResolvedArtifact::Maven {
            attributes,
            download_url,
            checksum,
            ..
        } => {
            let mut purl = Purl::new("maven", &attributes.artifact_id)
                .with_namespace(&attributes.group_id)
                .with_version(&attributes.version)
                .with_qualifier(
                    "type",
                    attributes.artifact_type.as_deref().unwrap_or("jar"),
                )
                .with_qualifier("repository_url", &attributes.repository_url)
                .with_qualifier("checksum", checksum.to_string());
            if let Some(classifier) = &attributes.classifier {
                purl = purl.with_qualifier("classifier", classifier);
            }
            Component::library(
                attributes.artifact_id.clone(),
                Some(attributes.version.clone()),
                purl,
            )
            .with_external_reference(ExternalReference::distribution(download_url))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumInfo;

    fn file_artifact(url: &str, filename: &str) -> ResolvedArtifact {
        ResolvedArtifact::File {
            download_url: url.to_string(),
            filename: filename.to_string(),
            checksum: ChecksumInfo::new("sha256", "abc123"),
        }
    }

    #[test]
    fn test_file_component_purl_and_reference() {
        let component = sbom_component(&file_artifact(
            "https://example.org/archive.tar.gz",
            "archive.tar.gz",
        ));
        assert_eq!(
            component.purl,
            "pkg:generic/archive.tar.gz?checksum=sha256:abc123&download_url=https://example.org/archive.tar.gz"
        );
        assert_eq!(
            component.external_references,
            vec![ExternalReference::distribution("https://example.org/archive.tar.gz")]
        );
        assert!(component.version.is_none());
    }

    #[test]
    fn test_maven_component_purl() {
        let attributes = MavenAttributes {
            repository_url: "https://repo.maven.apache.org/maven2".to_string(),
            group_id: "org.apache.commons".to_string(),
            artifact_id: "commons-lang3".to_string(),
            version: "3.12.0".to_string(),
            artifact_type: None,
            classifier: None,
        };
        let download_url = attributes.resolve_url().unwrap();
        let component = sbom_component(&ResolvedArtifact::Maven {
            attributes,
            download_url,
            filename: "commons-lang3-3.12.0.jar".to_string(),
            checksum: ChecksumInfo::new("sha512", "def456"),
        });
        assert_eq!(
            component.purl,
            "pkg:maven/org.apache.commons/commons-lang3@3.12.0\
             ?checksum=sha512:def456\
             &repository_url=https://repo.maven.apache.org/maven2\
             &type=jar"
        );
    }

    #[test]
    fn test_missing_lockfile_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let err = load_lockfile(&temp.path().join(DEFAULT_LOCKFILE_NAME)).unwrap_err();
        let cachi2_err = err.downcast_ref::<Cachi2Error>().unwrap();
        assert!(matches!(cachi2_err, Cachi2Error::PackageRejected { .. }));
    }

    #[test]
    fn test_duplicate_filenames_are_fatal() {
        let temp = tempfile::tempdir().unwrap();
        let lockfile_path = temp.path().join(DEFAULT_LOCKFILE_NAME);
        std::fs::write(
            &lockfile_path,
            r#"
metadata:
  version: "1.0"
artifacts:
  - download_url: https://example.org/a/file.jar
    checksum: sha256:aaa
  - download_url: https://example.org/b/file.jar
    checksum: sha256:bbb
"#,
        )
        .unwrap();
        let err = load_lockfile(&lockfile_path).unwrap_err();
        assert!(err.to_string().contains("duplicate filename"));
    }

    #[test]
    fn test_wrong_version_is_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let lockfile_path = temp.path().join(DEFAULT_LOCKFILE_NAME);
        std::fs::write(
            &lockfile_path,
            "metadata:\n  version: \"2.0\"\nartifacts: []\n",
        )
        .unwrap();
        let err = load_lockfile(&lockfile_path).unwrap_err();
        assert!(err.to_string().contains("unsupported lockfile version"));
    }

    #[test]
    fn test_valid_lockfile_loads() {
        let temp = tempfile::tempdir().unwrap();
        let lockfile_path = temp.path().join(DEFAULT_LOCKFILE_NAME);
        std::fs::write(
            &lockfile_path,
            r#"
metadata:
  version: "1.0"
artifacts:
  - download_url: https://example.org/a.tar.gz
    checksum: sha256:abc
"#,
        )
        .unwrap();
        let artifacts = load_lockfile(&lockfile_path).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].filename(), "a.tar.gz");
    }
}
