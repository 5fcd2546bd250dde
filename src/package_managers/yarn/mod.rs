//! The Yarn Berry resolver.
//!
//! Runs `yarn install --mode=skip-build` with the project's cache redirected
//! to `deps/yarn` as a global cache, then reads the resolved package list
//! (with cache paths and checksums) from `yarn info --all --recursive
//! --cache --json`.
//!
//! Zero-install repositories are refused; plugins other than the vendored
//! exec plugin are disabled for the duration of the install; the
//! `.yarnrc.yml` is restored to its original content afterwards.

pub mod locators;
pub mod project;

pub use locators::{Locator, parse_locator};
pub use project::{PackageJson, Project, YarnRc};

use crate::checksum::ChecksumInfo;
use crate::core::{Cachi2Error, package_rejected};
use crate::git::{RepoID, get_repo_id};
use crate::models::input::PlainPackageInput;
use crate::models::{EnvironmentVariable, Request, RequestOutput};
use crate::paths::RootedPath;
use crate::purl::Purl;
use crate::sbom::Component;
use crate::utils::ToolCommand;
use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

/// Resolve and fetch yarn Berry dependencies for the given request.
pub async fn fetch_yarn_source(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let project = Project::from_source_dir(package_dir)?;

    let (major, minor, patch) = project.yarn_version()?;
    if major < 3 || major >= 4 {
        return Err(package_rejected(
            format!("unsupported Yarn version '{major}.{minor}.{patch}' detected"),
            "Please pick a different version of Yarn (3.0.0 <= Yarn version < 4.0.0).",
        )
        .into());
    }

    if project.is_zero_installs()? {
        return Err(Cachi2Error::UnsupportedFeature {
            reason: "Yarn Zero-Install detected, PnP zero installs are unsupported".to_string(),
            solution: Some(
                "Please convert your project to a regular install-based one.\n\
                 Depending on whether you use Yarn's PnP or a different node linker setting, \
                 make sure to remove the '.yarn/cache' or 'node_modules' directories respectively."
                    .to_string(),
            ),
            docs: Some("https://yarnpkg.com/features/caching#zero-installs".to_string()),
        }
        .into());
    }

    project.yarn_rc.validate_paths(&project.source_dir)?;

    let global_folder = request.package_output_dir("yarn")?;
    let packages = with_isolated_yarnrc(&project, &global_folder, || async {
        run_yarn_install(request, &project).await?;
        resolve_packages(request, &project).await
    })
    .await?;

    let repo_id = get_repo_id(request.source_dir.path()).await?;
    let mut components = Vec::with_capacity(packages.len() + 1);
    components.push(main_package_component(&project, &repo_id)?);
    for yarn_package in &packages {
        components.push(create_component(yarn_package, &project, &repo_id)?);
    }

    RequestOutput::new(components, build_environment_variables(), vec![]).map_err(Into::into)
}

/// A package listed by the `yarn info` command.
#[derive(Debug, Clone)]
pub struct YarnInfoPackage {
    raw_locator: String,
    /// `None` when yarn reports `0.0.0-use.local` (soft-link deps).
    version: Option<String>,
    /// Hex digest from `cache_key/checksum`.
    checksum: Option<String>,
    /// Path of the cache archive, absent for soft-link deps.
    cache_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YarnInfoEntry {
    value: String,
    children: YarnInfoChildren,
}

#[derive(Debug, Deserialize)]
struct YarnInfoChildren {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Cache")]
    cache: YarnInfoCache,
}

#[derive(Debug, Deserialize)]
struct YarnInfoCache {
    #[serde(rename = "Checksum")]
    checksum: Option<String>,
    #[serde(rename = "Path")]
    path: Option<String>,
}

impl YarnInfoPackage {
    fn from_info_line(line: &str) -> Result<Self> {
        let entry: YarnInfoEntry =
            serde_json::from_str(line).context("unexpected 'yarn info' output line")?;
        let version = match entry.children.version.as_str() {
            "0.0.0-use.local" => None,
            version => Some(version.to_string()),
        };
        let checksum = entry
            .children
            .cache
            .checksum
            .map(|checksum| checksum.rsplit('/').next().unwrap_or(&checksum).to_string());
        Ok(Self {
            raw_locator: entry.value,
            version,
            checksum,
            cache_path: entry.children.cache.path,
        })
    }
}

/// Write the sanitized `.yarnrc.yml`, run `operation`, then restore the
/// original file content no matter what.
async fn with_isolated_yarnrc<F, Fut, T>(
    project: &Project,
    global_folder: &RootedPath,
    operation: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let yarnrc_path = project.yarn_rc.path().path().to_path_buf();
    let original = if yarnrc_path.exists() {
        Some(std::fs::read_to_string(&yarnrc_path)?)
    } else {
        None
    };

    let mut overrides = serde_yaml::Mapping::new();
    overrides.insert("checksumBehavior".into(), "throw".into());
    overrides.insert("enableGlobalCache".into(), true.into());
    overrides.insert("enableImmutableInstalls".into(), true.into());
    overrides.insert("enableMirror".into(), true.into());
    overrides.insert("enableScripts".into(), false.into());
    overrides.insert("enableStrictSsl".into(), true.into());
    overrides.insert("enableTelemetry".into(), false.into());
    overrides.insert(
        "globalFolder".into(),
        global_folder.path().display().to_string().into(),
    );
    overrides.insert("ignorePath".into(), true.into());
    overrides.insert("pnpMode".into(), "strict".into());
    overrides.insert("unsafeHttpWhitelist".into(), serde_yaml::Value::Sequence(vec![]));

    std::fs::write(
        &yarnrc_path,
        project.yarn_rc.render_with_overrides(&overrides)?,
    )?;

    let result = operation().await;

    match original {
        Some(content) => std::fs::write(&yarnrc_path, content)?,
        None => {
            let _ = std::fs::remove_file(&yarnrc_path);
        }
    }
    result
}

async fn run_yarn_install(request: &Request, project: &Project) -> Result<()> {
    info!(
        "fetching the yarn dependencies at {}",
        project.source_dir.path().display()
    );
    ToolCommand::new("yarn")
        .args(["install", "--mode=skip-build"])
        .current_dir(project.source_dir.path())
        .env("COREPACK_ENABLE_DOWNLOAD_PROMPT", "0")
        .with_timeout(request.config.subprocess_timeout)
        .run()
        .await
        .context("yarn install failed")?;
    Ok(())
}

async fn resolve_packages(request: &Request, project: &Project) -> Result<Vec<YarnInfoPackage>> {
    // --all: all workspaces; --recursive: transitive deps; --cache: include
    // cache entry info. The output is NDJSON, one object per package.
    let output = ToolCommand::new("yarn")
        .args(["info", "--all", "--recursive", "--cache", "--json"])
        .current_dir(project.source_dir.path())
        .with_timeout(request.config.subprocess_timeout)
        .run()
        .await
        .context("yarn info failed")?;

    let packages: Vec<YarnInfoPackage> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(YarnInfoPackage::from_info_line)
        .collect::<Result<_>>()?;

    let mut unsupported = 0;
    for yarn_package in &packages {
        if let Err(error) = parse_locator(&yarn_package.raw_locator) {
            tracing::error!("{error}");
            unsupported += 1;
        }
    }
    if unsupported > 0 {
        return Err(Cachi2Error::UnsupportedFeature {
            reason: format!("found {unsupported} unsupported dependencies, more details in the logs"),
            solution: None,
            docs: None,
        }
        .into());
    }
    Ok(packages)
}

fn main_package_component(project: &Project, repo_id: &RepoID) -> Result<Component> {
    let name = project.package_json.name().unwrap_or("workspace").to_string();
    let version = project.package_json.version().map(ToString::to_string);
    let mut purl = scoped_npm_purl(&name)
        .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
        .with_subpath(project.source_dir.subpath_from_root().display().to_string());
    if let Some(ref version) = version {
        purl = purl.with_version(version);
    }
    Ok(Component::library(name, version, purl))
}

fn scoped_npm_purl(name: &str) -> Purl {
    let lowercase = name.to_lowercase();
    match lowercase.split_once('/') {
        Some((scope, bare_name)) => Purl::new("npm", bare_name).with_namespace(scope),
        None => Purl::new("npm", lowercase),
    }
}

/// Create an SBOM component for one `yarn info` entry.
fn create_component(
    yarn_package: &YarnInfoPackage,
    project: &Project,
    repo_id: &RepoID,
) -> Result<Component> {
    let locator = parse_locator(&yarn_package.raw_locator)?;
    let name = locator.scoped_name();

    let (version, mut purl) = match &locator {
        Locator::Npm { version, .. } => {
            let version = yarn_package.version.clone().unwrap_or_else(|| version.clone());
            (Some(version.clone()), scoped_npm_purl(&name).with_version(&version))
        }
        Locator::Workspace { relpath, .. } => {
            let packjson_path = project
                .source_dir
                .join_within_root(relpath)?
                .join_within_root("package.json")?;
            let version = read_version_from_package_json(&packjson_path);
            let mut purl = scoped_npm_purl(&name)
                .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
                .with_subpath(
                    project
                        .source_dir
                        .join_within_root(relpath)?
                        .subpath_from_root()
                        .display()
                        .to_string(),
                );
            if let Some(ref version) = version {
                purl = purl.with_version(version);
            }
            (version, purl)
        }
        Locator::File { relpath, .. } | Locator::Portal { relpath, .. } | Locator::Link { relpath, .. } => {
            let version = yarn_package.version.clone();
            let mut purl = scoped_npm_purl(&name)
                .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier());
            if let Ok(confined) = project.source_dir.join_within_root(relpath) {
                purl = purl.with_subpath(confined.subpath_from_root().display().to_string());
            }
            if let Some(ref version) = version {
                purl = purl.with_version(version);
            }
            (version, purl)
        }
        Locator::Patch { .. } => {
            let version = yarn_package.version.clone();
            let mut purl = scoped_npm_purl(&name);
            if let Some(ref version) = version {
                purl = purl.with_version(version);
            }
            (version, purl)
        }
        Locator::Https { url, .. } => {
            let version = yarn_package.version.clone();
            let mut purl = scoped_npm_purl(&name).with_qualifier("download_url", url);
            if let Some(ref checksum) = yarn_package.checksum {
                purl = purl.with_qualifier(
                    "checksum",
                    ChecksumInfo::new("sha512", checksum).to_string(),
                );
            }
            if let Some(ref version) = version {
                purl = purl.with_version(version);
            }
            (version, purl)
        }
    };

    if let Some(ref cache_path) = yarn_package.cache_path {
        tracing::debug!("{}: cached at {cache_path}", yarn_package.raw_locator);
    }
    Ok(Component::library(name, version, purl))
}

fn read_version_from_package_json(path: &RootedPath) -> Option<String> {
    let content = std::fs::read_to_string(path.path()).ok()?;
    let data: serde_json::Value = serde_json::from_str(&content).ok()?;
    data.get("version")
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
}

fn build_environment_variables() -> Vec<EnvironmentVariable> {
    vec![
        EnvironmentVariable::path("YARN_GLOBAL_FOLDER", "deps/yarn"),
        EnvironmentVariable::literal("YARN_ENABLE_GLOBAL_CACHE", "false"),
        EnvironmentVariable::literal("YARN_ENABLE_MIRROR", "true"),
        EnvironmentVariable::literal("YARN_ENABLE_IMMUTABLE_CACHE", "false"),
    ]
}
