//! Resolver outputs: environment variables, project-file edits and the
//! merged request output.

use crate::core::Cachi2Error;
use crate::sbom::{Component, Sbom};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How an environment variable's value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvVarKind {
    /// The value is used as-is.
    Literal,
    /// The value is a path relative to the output directory.
    Path,
}

/// An environment variable the build must set to consume the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
    pub kind: EnvVarKind,
}

impl EnvironmentVariable {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: EnvVarKind::Literal,
        }
    }

    pub fn path(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: EnvVarKind::Path,
        }
    }

    /// The final value: `path` variables are joined to the output directory.
    pub fn resolve_value(&self, relative_to: &Path) -> String {
        match self.kind {
            EnvVarKind::Literal => self.value.clone(),
            EnvVarKind::Path => relative_to.join(&self.value).display().to_string(),
        }
    }
}

/// A file to be written into the user's project directory.
///
/// Typically used to inject configuration files (e.g. `.cargo/config.toml`)
/// or to modify lockfiles (e.g. `requirements.txt`). The content may contain
/// the `${output_dir}` placeholder, replaced at injection time so the build
/// can mount the output directory anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub abspath: PathBuf,
    pub template: String,
}

impl ProjectFile {
    pub fn new(abspath: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            abspath: abspath.into(),
            template: template.into(),
        }
    }

    /// Return the resolved content of this file.
    ///
    /// Only the `${output_dir}` placeholder is substituted; anything else
    /// that looks like a placeholder stays as-is.
    pub fn resolve_content(&self, output_dir: &Path) -> String {
        self.template
            .replace("${output_dir}", &output_dir.display().to_string())
    }
}

/// Holds output used to configure a repository for a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub environment_variables: Vec<EnvironmentVariable>,
    pub project_files: Vec<ProjectFile>,
}

impl BuildConfig {
    /// Sort by name/path and reject conflicting duplicates.
    fn normalized(mut self) -> Result<Self, Cachi2Error> {
        self.environment_variables
            .sort_by(|a, b| a.name.cmp(&b.name));
        self.environment_variables.dedup();
        for pair in self.environment_variables.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(Cachi2Error::InvalidInput(format!(
                    "conflicting values for environment variable {}: {:?} X {:?}",
                    pair[0].name, pair[0].value, pair[1].value
                )));
            }
        }

        self.project_files.sort_by(|a, b| a.abspath.cmp(&b.abspath));
        self.project_files.dedup();
        for pair in self.project_files.windows(2) {
            if pair[0].abspath == pair[1].abspath {
                return Err(Cachi2Error::InvalidInput(format!(
                    "conflicting edits for project file {}",
                    pair[0].abspath.display()
                )));
            }
        }
        Ok(self)
    }
}

/// Results of processing one or more packages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOutput {
    pub sbom: Sbom,
    pub build_config: BuildConfig,
}

impl RequestOutput {
    pub fn empty() -> Self {
        Self {
            sbom: Sbom::default(),
            build_config: BuildConfig::default(),
        }
    }

    /// Build a resolver result from its parts.
    pub fn new(
        components: Vec<Component>,
        environment_variables: Vec<EnvironmentVariable>,
        project_files: Vec<ProjectFile>,
    ) -> Result<Self, Cachi2Error> {
        Ok(Self {
            sbom: Sbom::from_components(components),
            build_config: BuildConfig {
                environment_variables,
                project_files,
            }
            .normalized()?,
        })
    }

    /// Merge another resolver's output into this one.
    ///
    /// Component merging is commutative; environment variables and project
    /// files must not conflict across resolvers.
    pub fn merge(self, other: Self) -> Result<Self, Cachi2Error> {
        let mut environment_variables = self.build_config.environment_variables;
        environment_variables.extend(other.build_config.environment_variables);
        let mut project_files = self.build_config.project_files;
        project_files.extend(other.build_config.project_files);

        Ok(Self {
            sbom: self.sbom.merge(other.sbom),
            build_config: BuildConfig {
                environment_variables,
                project_files,
            }
            .normalized()?,
        })
    }
}

/// Summary of one resolved input package, recorded in `output.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSummary {
    #[serde(rename = "type")]
    pub package_type: String,
    pub path: PathBuf,
}

/// The machine-readable summary written to `<output>/output.json`.
///
/// `generate-env` and `inject-files` read it back to learn which
/// environment variables and project-file edits the resolvers requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub packages: Vec<PackageSummary>,
    pub build_config: BuildConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_resolution() {
        let path_var = EnvironmentVariable::path("GOMODCACHE", "deps/gomod/pkg/mod");
        assert_eq!(
            path_var.resolve_value(Path::new("/cachi2/output")),
            "/cachi2/output/deps/gomod/pkg/mod"
        );

        let literal = EnvironmentVariable::literal("GOFLAGS", "-mod=mod");
        assert_eq!(literal.resolve_value(Path::new("/anywhere")), "-mod=mod");
    }

    #[test]
    fn test_project_file_substitution() {
        let file = ProjectFile::new(
            "/src/requirements.txt",
            "foo @ file://${output_dir}/deps/pip/foo.tar.gz\nbar==1.0  # $other stays\n",
        );
        let content = file.resolve_content(Path::new("/cachi2/output"));
        assert_eq!(
            content,
            "foo @ file:///cachi2/output/deps/pip/foo.tar.gz\nbar==1.0  # $other stays\n"
        );
    }

    #[test]
    fn test_merge_detects_env_conflicts() {
        let a = RequestOutput::new(
            vec![],
            vec![EnvironmentVariable::literal("GOFLAGS", "-mod=mod")],
            vec![],
        )
        .unwrap();
        let b = RequestOutput::new(
            vec![],
            vec![EnvironmentVariable::literal("GOFLAGS", "-mod=vendor")],
            vec![],
        )
        .unwrap();
        assert!(a.merge(b).is_err());
    }

    #[test]
    fn test_merge_dedupes_identical_env_vars() {
        let make = || {
            RequestOutput::new(
                vec![],
                vec![EnvironmentVariable::literal("PIP_NO_INDEX", "true")],
                vec![],
            )
            .unwrap()
        };
        let merged = make().merge(make()).unwrap();
        assert_eq!(merged.build_config.environment_variables.len(), 1);
    }
}
