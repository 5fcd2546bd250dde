//! Schema of the generic artifact lockfile, version 1.0.

use crate::checksum::ChecksumInfo;
use crate::core::Cachi2Error;
use serde::Deserialize;
use url::Url;

/// The `metadata` section of the lockfile.
#[derive(Debug, Clone, Deserialize)]
pub struct LockfileMetadata {
    pub version: String,
}

/// Attributes of a maven-type artifact, from which the download URL is
/// synthesized.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MavenAttributes {
    pub repository_url: String,
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    /// Packaging type, `jar` when unset.
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub classifier: Option<String>,
}

impl MavenAttributes {
    /// The standard maven repository layout URL for these coordinates.
    pub fn resolve_url(&self) -> Result<String, Cachi2Error> {
        let extension = self.artifact_type.as_deref().unwrap_or("jar");
        let classifier_suffix = self
            .classifier
            .as_deref()
            .map(|c| format!("-{c}"))
            .unwrap_or_default();
        let url = format!(
            "{}/{}/{}/{}/{}-{}{}.{}",
            self.repository_url.trim_end_matches('/'),
            self.group_id.replace('.', "/"),
            self.artifact_id,
            self.version,
            self.artifact_id,
            self.version,
            classifier_suffix,
            extension,
        );
        Url::parse(&url).map_err(|e| {
            Cachi2Error::InvalidInput(format!("invalid maven repository_url {url:?}: {e}"))
        })?;
        Ok(url)
    }
}

/// A single artifact entry.
///
/// Either a plain `download_url` artifact or a `type: maven` artifact with
/// coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct LockfileArtifact {
    #[serde(rename = "type")]
    pub artifact_type: Option<String>,
    pub download_url: Option<String>,
    pub filename: Option<String>,
    /// `algorithm:digest`.
    pub checksum: String,
    pub attributes: Option<MavenAttributes>,
}

/// A validated artifact with its resolved URL and target filename.
#[derive(Debug, Clone)]
pub enum ResolvedArtifact {
    File {
        download_url: String,
        filename: String,
        checksum: ChecksumInfo,
    },
    Maven {
        attributes: MavenAttributes,
        download_url: String,
        filename: String,
        checksum: ChecksumInfo,
    },
}

impl ResolvedArtifact {
    pub fn download_url(&self) -> &str {
        match self {
            Self::File { download_url, .. } | Self::Maven { download_url, .. } => download_url,
        }
    }

    pub fn filename(&self) -> &str {
        match self {
            Self::File { filename, .. } | Self::Maven { filename, .. } => filename,
        }
    }

    pub fn checksum(&self) -> &ChecksumInfo {
        match self {
            Self::File { checksum, .. } | Self::Maven { checksum, .. } => checksum,
        }
    }
}

impl LockfileArtifact {
    /// Validate this entry and resolve its URL and target filename.
    pub fn resolve(self) -> Result<ResolvedArtifact, Cachi2Error> {
        let checksum = ChecksumInfo::from_pair(&self.checksum)?;

        match self.artifact_type.as_deref() {
            Some("maven") => {
                let attributes = self.attributes.ok_or_else(|| {
                    Cachi2Error::InvalidInput(
                        "maven artifact is missing its 'attributes' mapping".to_string(),
                    )
                })?;
                let download_url = attributes.resolve_url()?;
                let filename = match self.filename {
                    Some(filename) => filename,
                    None => filename_from_url(&download_url)?,
                };
                Ok(ResolvedArtifact::Maven {
                    attributes,
                    download_url,
                    filename,
                    checksum,
                })
            }
            None => {
                let download_url = self.download_url.ok_or_else(|| {
                    Cachi2Error::InvalidInput(
                        "artifact must have either a download_url or type: maven".to_string(),
                    )
                })?;
                Url::parse(&download_url).map_err(|e| {
                    Cachi2Error::InvalidInput(format!("invalid download_url {download_url:?}: {e}"))
                })?;
                let filename = match self.filename {
                    Some(filename) => filename,
                    None => filename_from_url(&download_url)?,
                };
                Ok(ResolvedArtifact::File {
                    download_url,
                    filename,
                    checksum,
                })
            }
            Some(other) => Err(Cachi2Error::InvalidInput(format!(
                "unknown artifact type: {other:?}"
            ))),
        }
    }
}

fn filename_from_url(download_url: &str) -> Result<String, Cachi2Error> {
    let parsed = Url::parse(download_url)
        .map_err(|e| Cachi2Error::InvalidInput(format!("invalid url {download_url:?}: {e}")))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| {
            Cachi2Error::InvalidInput(format!(
                "cannot determine a filename from {download_url:?}, please specify one"
            ))
        })
}

/// The whole lockfile.
#[derive(Debug, Clone, Deserialize)]
pub struct GenericLockfileV1 {
    pub metadata: LockfileMetadata,
    pub artifacts: Vec<LockfileArtifact>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maven_url_synthesis() {
        let attributes = MavenAttributes {
            repository_url: "https://repo.maven.apache.org/maven2".to_string(),
            group_id: "org.apache.commons".to_string(),
            artifact_id: "commons-lang3".to_string(),
            version: "3.12.0".to_string(),
            artifact_type: None,
            classifier: None,
        };
        assert_eq!(
            attributes.resolve_url().unwrap(),
            "https://repo.maven.apache.org/maven2/org/apache/commons/commons-lang3/3.12.0/commons-lang3-3.12.0.jar"
        );
    }

    #[test]
    fn test_maven_url_with_classifier_and_type() {
        let attributes = MavenAttributes {
            repository_url: "https://repo.example.org/releases/".to_string(),
            group_id: "io.example".to_string(),
            artifact_id: "widget".to_string(),
            version: "1.2.3".to_string(),
            artifact_type: Some("tar.gz".to_string()),
            classifier: Some("linux-x86_64".to_string()),
        };
        assert_eq!(
            attributes.resolve_url().unwrap(),
            "https://repo.example.org/releases/io/example/widget/1.2.3/widget-1.2.3-linux-x86_64.tar.gz"
        );
    }

    #[test]
    fn test_filename_defaults_to_url_basename() {
        let artifact = LockfileArtifact {
            artifact_type: None,
            download_url: Some("https://example.org/dir/archive.tar.gz".to_string()),
            filename: None,
            checksum: "sha256:abc123".to_string(),
            attributes: None,
        };
        let resolved = artifact.resolve().unwrap();
        assert_eq!(resolved.filename(), "archive.tar.gz");
        assert_eq!(resolved.checksum(), &ChecksumInfo::new("sha256", "abc123"));
    }

    #[test]
    fn test_artifact_requires_url_or_maven_type() {
        let artifact = LockfileArtifact {
            artifact_type: None,
            download_url: None,
            filename: None,
            checksum: "sha256:abc".to_string(),
            attributes: None,
        };
        assert!(artifact.resolve().is_err());
    }

    #[test]
    fn test_bad_checksum_format_is_rejected() {
        let artifact = LockfileArtifact {
            artifact_type: None,
            download_url: Some("https://example.org/a.jar".to_string()),
            filename: None,
            checksum: "not-a-pair".to_string(),
            attributes: None,
        };
        assert!(artifact.resolve().is_err());
    }

    #[test]
    fn test_yaml_parses() {
        let yaml = r#"
metadata:
  version: "1.0"
artifacts:
  - download_url: https://example.org/a.tar.gz
    checksum: sha256:abc123
  - type: maven
    checksum: sha512:def456
    attributes:
      repository_url: https://repo.maven.apache.org/maven2
      group_id: io.example
      artifact_id: widget
      version: "1.0"
"#;
        let lockfile: GenericLockfileV1 = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(lockfile.metadata.version, "1.0");
        assert_eq!(lockfile.artifacts.len(), 2);
    }
}
