//! The request model.
//!
//! A [`Request`] is the immutable description of one cachi2 run: where the
//! source repository is, where output goes, which packages to process and
//! which global flags apply. Construction validates everything up front so
//! the resolvers can assume a sane request.
//!
//! The JSON accepted on the command line maps directly onto these types;
//! [`PackageInput`] is a tagged union discriminated by the `type` field.

use crate::core::{Cachi2Error, Config};
use crate::paths::RootedPath;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

fn default_package_path() -> PathBuf {
    PathBuf::from(".")
}

/// Input options for a pip package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
    /// Requirements files with install-time dependencies.
    /// Defaults to `requirements.txt` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements_files: Option<Vec<PathBuf>>,
    /// Requirements files with build-time dependencies.
    /// Defaults to `requirements-build.txt` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements_build_files: Option<Vec<PathBuf>>,
    /// Allow fetching wheels, not just source distributions.
    #[serde(default)]
    pub allow_binary: bool,
}

/// Input options for a bundler package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundlerPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
    /// Allow fetching platform-specific gems.
    #[serde(default)]
    pub allow_binary: bool,
}

/// Input options for a generic package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenericPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
    /// Path to the artifact lockfile, when not `artifacts.lock.yaml` in
    /// `path`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<PathBuf>,
}

/// Options shared by package managers that take no extra configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlainPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
}

/// One package to process, discriminated by package-manager type.
///
/// Dispatch on this enum is a pattern match in the resolver; shared behavior
/// lives in the utility modules, not in any base type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PackageInput {
    Gomod(PlainPackageInput),
    Pip(PipPackageInput),
    Npm(PlainPackageInput),
    Yarn(PlainPackageInput),
    Cargo(PlainPackageInput),
    Bundler(BundlerPackageInput),
    Generic(GenericPackageInput),
}

impl PackageInput {
    /// The package-manager name as it appears in user input and under
    /// `deps/` in the output directory.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Gomod(_) => "gomod",
            Self::Pip(_) => "pip",
            Self::Npm(_) => "npm",
            Self::Yarn(_) => "yarn",
            Self::Cargo(_) => "cargo",
            Self::Bundler(_) => "bundler",
            Self::Generic(_) => "generic",
        }
    }

    /// The package directory, relative to the source root.
    pub fn path(&self) -> &Path {
        match self {
            Self::Gomod(p) | Self::Npm(p) | Self::Yarn(p) | Self::Cargo(p) => &p.path,
            Self::Pip(p) => &p.path,
            Self::Bundler(p) => &p.path,
            Self::Generic(p) => &p.path,
        }
    }

    /// Construct a package of the given type with default options, e.g. for
    /// the `"gomod"` shorthand CLI input.
    pub fn from_type_name(type_name: &str) -> Result<Self, Cachi2Error> {
        let plain = PlainPackageInput {
            path: default_package_path(),
        };
        match type_name {
            "gomod" => Ok(Self::Gomod(plain)),
            "pip" => Ok(Self::Pip(PipPackageInput {
                path: default_package_path(),
                requirements_files: None,
                requirements_build_files: None,
                allow_binary: false,
            })),
            "npm" => Ok(Self::Npm(plain)),
            "yarn" => Ok(Self::Yarn(plain)),
            "cargo" => Ok(Self::Cargo(plain)),
            "bundler" => Ok(Self::Bundler(BundlerPackageInput {
                path: default_package_path(),
                allow_binary: false,
            })),
            "generic" => Ok(Self::Generic(GenericPackageInput {
                path: default_package_path(),
                lockfile: None,
            })),
            other => Err(Cachi2Error::InvalidInput(format!(
                "unknown package manager: {other:?}"
            ))),
        }
    }
}

/// Global request flags.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Flag {
    CgoDisable,
    DevPackageManagers,
    ForceGomodTidy,
    GomodVendorCheck,
}

impl std::str::FromStr for Flag {
    type Err = Cachi2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cgo-disable" => Ok(Self::CgoDisable),
            "dev-package-managers" => Ok(Self::DevPackageManagers),
            "force-gomod-tidy" => Ok(Self::ForceGomodTidy),
            "gomod-vendor-check" => Ok(Self::GomodVendorCheck),
            other => Err(Cachi2Error::InvalidInput(format!(
                "unknown flag: {other:?}"
            ))),
        }
    }
}

/// Holds all data needed for the processing of a single request.
#[derive(Debug, Clone)]
pub struct Request {
    pub source_dir: RootedPath,
    pub output_dir: RootedPath,
    pub packages: Vec<PackageInput>,
    pub flags: BTreeSet<Flag>,
    pub config: Config,
}

impl Request {
    /// Validate and build a request.
    ///
    /// # Errors
    /// [`Cachi2Error::InvalidInput`] when a directory is not absolute, the
    /// package list is empty, or a package path does not point at an
    /// existing directory inside the source tree.
    pub fn new(
        source_dir: impl AsRef<Path>,
        output_dir: impl AsRef<Path>,
        packages: Vec<PackageInput>,
        flags: BTreeSet<Flag>,
    ) -> anyhow::Result<Self> {
        let source_dir = RootedPath::new(source_dir)?;
        let output_dir = RootedPath::new(output_dir)?;

        if packages.is_empty() {
            return Err(Cachi2Error::InvalidInput(
                "at least one package must be defined, got an empty list".to_string(),
            )
            .into());
        }

        // De-duplicate while preserving order.
        let mut seen = BTreeSet::new();
        let mut unique_packages = Vec::with_capacity(packages.len());
        for package in packages {
            let key = (package.type_name(), package.path().to_path_buf());
            if seen.insert(key) {
                unique_packages.push(package);
            }
        }

        for package in &unique_packages {
            let abspath = source_dir.join_within_root(package.path()).map_err(|_| {
                Cachi2Error::InvalidInput(format!(
                    "package path (a symlink?) leads outside source directory: {}",
                    package.path().display()
                ))
            })?;
            if !abspath.path().is_dir() {
                return Err(Cachi2Error::InvalidInput(format!(
                    "package path does not exist (or is not a directory): {}",
                    package.path().display()
                ))
                .into());
            }
        }

        Ok(Self {
            source_dir,
            output_dir,
            packages: unique_packages,
            flags,
            config: Config::default(),
        })
    }

    /// The package directory of `package`, confined to the source tree.
    pub fn package_dir(&self, package: &PackageInput) -> Result<RootedPath, Cachi2Error> {
        self.source_dir.join_within_root(package.path())
    }

    /// `<output>/deps/<pm>`, created on demand.
    pub fn package_output_dir(&self, pm: &str) -> anyhow::Result<RootedPath> {
        let dir = self.output_dir.join_within_root(Path::new("deps").join(pm))?;
        std::fs::create_dir_all(dir.path())?;
        Ok(dir)
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.flags.contains(&flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn gomod_json(path: &str) -> String {
        format!(r#"{{"type": "gomod", "path": "{path}"}}"#)
    }

    #[test]
    fn test_package_input_deserializes_by_tag() {
        let package: PackageInput = serde_json::from_str(&gomod_json(".")).unwrap();
        assert_eq!(package.type_name(), "gomod");
        assert_eq!(package.path(), Path::new("."));

        let package: PackageInput = serde_json::from_str(
            r#"{"type": "pip", "requirements_files": ["requirements.txt"], "allow_binary": true}"#,
        )
        .unwrap();
        match package {
            PackageInput::Pip(pip) => {
                assert!(pip.allow_binary);
                assert_eq!(
                    pip.requirements_files,
                    Some(vec![PathBuf::from("requirements.txt")])
                );
            }
            other => panic!("expected pip, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let result: Result<PackageInput, _> =
            serde_json::from_str(r#"{"type": "gomod", "frobnicate": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<PackageInput, _> = serde_json::from_str(r#"{"type": "conan"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_request_requires_packages() {
        let temp = tempdir().unwrap();
        let result = Request::new(temp.path(), temp.path().join("out"), vec![], BTreeSet::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_request_rejects_missing_package_dir() {
        let temp = tempdir().unwrap();
        let packages = vec![serde_json::from_str(&gomod_json("no-such-dir")).unwrap()];
        let result = Request::new(temp.path(), temp.path().join("out"), packages, BTreeSet::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_request_rejects_escaping_package_path() {
        let temp = tempdir().unwrap();
        let packages = vec![serde_json::from_str(&gomod_json("../escape")).unwrap()];
        let result = Request::new(temp.path(), temp.path().join("out"), packages, BTreeSet::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_request_dedupes_packages() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("app")).unwrap();
        let packages = vec![
            serde_json::from_str(&gomod_json("app")).unwrap(),
            serde_json::from_str(&gomod_json("app")).unwrap(),
        ];
        let request =
            Request::new(temp.path(), temp.path().join("out"), packages, BTreeSet::new()).unwrap();
        assert_eq!(request.packages.len(), 1);
    }

    #[test]
    fn test_flags_parse() {
        assert_eq!("cgo-disable".parse::<Flag>().unwrap(), Flag::CgoDisable);
        assert!("no-such-flag".parse::<Flag>().is_err());
    }

    #[test]
    fn test_package_output_dir_is_created() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("src")).unwrap();
        let packages = vec![serde_json::from_str(&gomod_json(".")).unwrap()];
        let request = Request::new(
            temp.path().join("src"),
            temp.path().join("out"),
            packages,
            BTreeSet::new(),
        )
        .unwrap();
        let deps = request.package_output_dir("gomod").unwrap();
        assert!(deps.path().is_dir());
        assert!(deps.path().ends_with("deps/gomod"));
    }
}
