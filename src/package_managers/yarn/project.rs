//! Parse the relevant files of a Yarn Berry project: `package.json` and
//! `.yarnrc.yml`.

use crate::core::{Cachi2Error, package_rejected};
use crate::paths::RootedPath;
use anyhow::Result;
use serde_yaml::Value;
use tracing::debug;

/// Settings in `.yarnrc.yml` that hold filesystem paths. Each must stay
/// inside the source tree.
const PATH_SETTINGS: &[&str] = &[
    "cacheFolder",
    "deferredVersionFolder",
    "globalFolder",
    "installStatePath",
    "patchFolder",
    "pnpDataPath",
    "pnpUnpluggedFolder",
    "virtualFolder",
    "yarnPath",
];

/// The parsed `.yarnrc.yml`. Missing file behaves as an empty mapping.
#[derive(Debug, Clone)]
pub struct YarnRc {
    path: RootedPath,
    pub data: serde_yaml::Mapping,
}

impl YarnRc {
    pub fn from_file(path: RootedPath) -> Result<Self> {
        let data = if path.path().is_file() {
            let content = std::fs::read_to_string(path.path())?;
            match serde_yaml::from_str::<Value>(&content).map_err(|e| {
                package_rejected(
                    format!("can't parse the .yarnrc.yml file: {e}"),
                    "The .yarnrc.yml file must contain valid YAML.",
                )
            })? {
                Value::Mapping(mapping) => mapping,
                Value::Null => serde_yaml::Mapping::new(),
                _ => {
                    return Err(package_rejected(
                        ".yarnrc.yml must be a YAML mapping",
                        "Please check the contents of the file.",
                    )
                    .into());
                }
            }
        } else {
            serde_yaml::Mapping::new()
        };
        Ok(Self { path, data })
    }

    pub fn path(&self) -> &RootedPath {
        &self.path
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// The configured cache folder, `./.yarn/cache` by default.
    pub fn cache_folder(&self) -> String {
        self.get_str("cacheFolder")
            .unwrap_or("./.yarn/cache")
            .to_string()
    }

    pub fn yarn_path(&self) -> Option<&str> {
        self.get_str("yarnPath")
    }

    /// Every path setting must stay inside the source tree.
    pub fn validate_paths(&self, source_dir: &RootedPath) -> Result<(), Cachi2Error> {
        for setting in PATH_SETTINGS {
            if let Some(value) = self.get_str(setting) {
                debug!("validating yarnrc path setting {setting}: {value}");
                source_dir.join_within_root(value)?;
            }
        }
        Ok(())
    }

    /// Serialize, with our overrides applied, for the duration of the
    /// request.
    pub fn render_with_overrides(&self, overrides: &serde_yaml::Mapping) -> Result<String> {
        let mut merged = self.data.clone();
        // plugins may run arbitrary code at install time; only the vendored
        // exec plugin is allowed to stay
        if let Some(Value::Sequence(plugins)) = merged.get("plugins").cloned() {
            let kept: Vec<Value> = plugins
                .into_iter()
                .filter(|plugin| {
                    let path = match plugin {
                        Value::String(path) => Some(path.as_str()),
                        Value::Mapping(mapping) => {
                            mapping.get("path").and_then(Value::as_str)
                        }
                        _ => None,
                    };
                    path.is_some_and(|path| path.ends_with("plugin-exec.cjs"))
                })
                .collect();
            if kept.is_empty() {
                merged.remove("plugins");
            } else {
                merged.insert(Value::from("plugins"), Value::Sequence(kept));
            }
        }
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
        Ok(serde_yaml::to_string(&Value::Mapping(merged))?)
    }
}

/// The parsed `package.json`.
#[derive(Debug, Clone)]
pub struct PackageJson {
    pub data: serde_json::Value,
}

impl PackageJson {
    pub fn from_file(path: &RootedPath) -> Result<Self> {
        let content = std::fs::read_to_string(path.path()).map_err(|_| {
            package_rejected(
                "the package.json file must be present for the yarn package manager",
                "Please double-check that you have specified the correct path \
                 to the package directory containing this file.",
            )
        })?;
        let data = serde_json::from_str(&content).map_err(|e| {
            package_rejected(
                format!("can't parse the package.json file: {e}"),
                "The package.json file must contain valid JSON.",
            )
        })?;
        Ok(Self { data })
    }

    pub fn name(&self) -> Option<&str> {
        self.data.get("name").and_then(serde_json::Value::as_str)
    }

    pub fn version(&self) -> Option<&str> {
        self.data.get("version").and_then(serde_json::Value::as_str)
    }

    /// The `packageManager` field, e.g. `yarn@3.6.1`.
    pub fn package_manager(&self) -> Option<&str> {
        self.data
            .get("packageManager")
            .and_then(serde_json::Value::as_str)
    }
}

/// A directory containing yarn sources.
#[derive(Debug, Clone)]
pub struct Project {
    pub source_dir: RootedPath,
    pub yarn_rc: YarnRc,
    pub package_json: PackageJson,
}

impl Project {
    pub fn from_source_dir(source_dir: RootedPath) -> Result<Self> {
        let package_json = PackageJson::from_file(&source_dir.join_within_root("package.json")?)?;
        let yarn_rc = YarnRc::from_file(source_dir.join_within_root(".yarnrc.yml")?)?;
        Ok(Self {
            source_dir,
            yarn_rc,
            package_json,
        })
    }

    /// Whether the project uses the zero-installs workflow (commits its
    /// cache or unplugged packages into the repository).
    pub fn is_zero_installs(&self) -> Result<bool> {
        let unplugged = self.source_dir.join_within_root(".yarn/unplugged")?;
        if unplugged.path().is_dir() {
            return Ok(true);
        }
        let cache = self.source_dir.join_within_root(self.yarn_rc.cache_folder())?;
        if cache.path().is_dir() {
            let has_archives = std::fs::read_dir(cache.path())?
                .flatten()
                .any(|entry| entry.file_name().to_string_lossy().ends_with(".zip"));
            return Ok(has_archives);
        }
        Ok(false)
    }

    /// The yarn major.minor.patch version this project expects, from
    /// `yarnPath` or `packageManager`.
    pub fn yarn_version(&self) -> Result<(u64, u64, u64), Cachi2Error> {
        let from_yarn_path = self.yarn_rc.yarn_path().and_then(version_from_yarn_path);
        let from_package_manager = self
            .package_json
            .package_manager()
            .and_then(version_from_package_manager);

        match (from_yarn_path, from_package_manager) {
            (Some(a), Some(b)) if a != b => Err(package_rejected(
                format!(
                    "mismatch between the yarn versions specified by yarnPath (yarn@{}.{}.{}) \
                     and packageManager (yarn@{}.{}.{})",
                    a.0, a.1, a.2, b.0, b.1, b.2
                ),
                "Ensure that the versions of yarn specified by yarnPath in .yarnrc.yml and \
                 packageManager in package.json agree.",
            )),
            (Some(version), _) | (None, Some(version)) => Ok(version),
            (None, None) => Err(package_rejected(
                "unable to determine the yarn version to use to process the request",
                "Ensure that either yarnPath is defined in .yarnrc.yml or that packageManager \
                 is defined in package.json.",
            )),
        }
    }
}

/// `.yarn/releases/yarn-3.6.1.cjs` -> (3, 6, 1)
fn version_from_yarn_path(yarn_path: &str) -> Option<(u64, u64, u64)> {
    let file_name = std::path::Path::new(yarn_path).file_name()?.to_str()?;
    let version = file_name.strip_prefix("yarn-")?.strip_suffix(".cjs")?;
    parse_semver(version)
}

/// `yarn@3.6.1` -> (3, 6, 1)
fn version_from_package_manager(package_manager: &str) -> Option<(u64, u64, u64)> {
    let version = package_manager.strip_prefix("yarn@")?;
    // strip any +sha224.<hash> suffix
    let version = version.split_once('+').map_or(version, |(v, _)| v);
    parse_semver(version)
}

fn parse_semver(version: &str) -> Option<(u64, u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some((major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn project_with(package_json: &str, yarnrc: Option<&str>) -> (tempfile::TempDir, Project) {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("package.json"), package_json).unwrap();
        if let Some(yarnrc) = yarnrc {
            fs::write(temp.path().join(".yarnrc.yml"), yarnrc).unwrap();
        }
        let source_dir = RootedPath::new(temp.path()).unwrap();
        let project = Project::from_source_dir(source_dir).unwrap();
        (temp, project)
    }

    #[test]
    fn test_yarn_version_from_package_manager() {
        let (_temp, project) = project_with(r#"{"packageManager": "yarn@3.6.1"}"#, None);
        assert_eq!(project.yarn_version().unwrap(), (3, 6, 1));
    }

    #[test]
    fn test_yarn_version_from_yarn_path() {
        let (_temp, project) = project_with(
            "{}",
            Some("yarnPath: .yarn/releases/yarn-3.2.4.cjs\n"),
        );
        assert_eq!(project.yarn_version().unwrap(), (3, 2, 4));
    }

    #[test]
    fn test_yarn_version_mismatch_is_rejected() {
        let (_temp, project) = project_with(
            r#"{"packageManager": "yarn@3.6.1"}"#,
            Some("yarnPath: .yarn/releases/yarn-3.2.4.cjs\n"),
        );
        assert!(project.yarn_version().is_err());
    }

    #[test]
    fn test_yarn_version_unknown_is_rejected() {
        let (_temp, project) = project_with("{}", None);
        assert!(project.yarn_version().is_err());
    }

    #[test]
    fn test_yarnrc_path_validation() {
        let (_temp, project) = project_with(
            "{}",
            Some("cacheFolder: ../../outside\n"),
        );
        assert!(project.yarn_rc.validate_paths(&project.source_dir).is_err());

        let (_temp2, project2) = project_with(
            "{}",
            Some("cacheFolder: ./.yarn/cache\n"),
        );
        project2.yarn_rc.validate_paths(&project2.source_dir).unwrap();
    }

    #[test]
    fn test_zero_installs_detection() {
        let (temp, project) = project_with("{}", None);
        assert!(!project.is_zero_installs().unwrap());

        fs::create_dir_all(temp.path().join(".yarn/unplugged")).unwrap();
        assert!(project.is_zero_installs().unwrap());
    }

    #[test]
    fn test_zero_installs_from_committed_cache() {
        let (temp, project) = project_with("{}", None);
        fs::create_dir_all(temp.path().join(".yarn/cache")).unwrap();
        fs::write(temp.path().join(".yarn/cache/pkg-npm-1.0.0.zip"), "").unwrap();
        assert!(project.is_zero_installs().unwrap());
    }

    #[test]
    fn test_plugins_are_dropped_except_exec() {
        let (_temp, project) = project_with(
            "{}",
            Some(
                "plugins:\n  - .yarn/plugins/@yarnpkg/plugin-exec.cjs\n  - .yarn/plugins/@yarnpkg/plugin-typescript.cjs\n",
            ),
        );
        let rendered = project
            .yarn_rc
            .render_with_overrides(&serde_yaml::Mapping::new())
            .unwrap();
        assert!(rendered.contains("plugin-exec.cjs"));
        assert!(!rendered.contains("plugin-typescript.cjs"));
    }

    #[test]
    fn test_overrides_are_applied() {
        let (_temp, project) = project_with("{}", Some("enableTelemetry: true\n"));
        let mut overrides = serde_yaml::Mapping::new();
        overrides.insert("enableTelemetry".into(), false.into());
        overrides.insert("enableScripts".into(), false.into());
        let rendered = project.yarn_rc.render_with_overrides(&overrides).unwrap();
        assert!(rendered.contains("enableTelemetry: false"));
        assert!(rendered.contains("enableScripts: false"));
    }
}
