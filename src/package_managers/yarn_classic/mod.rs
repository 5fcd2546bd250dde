//! The Yarn 1.x ("Classic") resolver.
//!
//! Drives `yarn install` with an offline-mirror configuration so that every
//! tarball lands in `deps/yarn-classic`, while the SBOM is computed from
//! `yarn.lock` directly. Plug'n'Play projects are refused, as are git and
//! exec locators.

pub mod lockfile;

pub use lockfile::{YarnLock, YarnLockEntry, is_berry_lockfile, is_v1_lockfile};

use crate::checksum::ChecksumInfo;
use crate::core::{Cachi2Error, package_rejected};
use crate::git::{RepoID, get_repo_id};
use crate::models::input::PlainPackageInput;
use crate::models::{EnvironmentVariable, Request, RequestOutput};
use crate::paths::RootedPath;
use crate::purl::Purl;
use crate::sbom::{Component, Property};
use crate::utils::ToolCommand;
use anyhow::{Context, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{info, warn};
use url::Url;

const NPM_REGISTRY_CNAMES: &[&str] = &["registry.npmjs.org", "registry.yarnpkg.com"];

/// Resolve and fetch yarn Classic dependencies for the given request.
pub async fn fetch_yarn_classic_source(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let package_json = read_package_json(&package_dir)?;

    reject_pnp_projects(&package_dir, &package_json)?;
    warn_about_mirror_overrides(&package_dir)?;

    let lockfile_path = package_dir.join_within_root("yarn.lock")?;
    let content = std::fs::read_to_string(lockfile_path.path()).map_err(|_| {
        package_rejected(
            "the yarn.lock file must be present for the yarn package manager",
            "Please double-check that you have specified the correct path \
             to the package directory containing this file.",
        )
    })?;
    let yarn_lock = YarnLock::parse(&content, lockfile_path.path())?;

    let workspaces = extract_workspaces(&package_dir, &package_json)?;
    let runtime_dep_ids = find_runtime_deps(&package_json, &yarn_lock, &workspaces);

    let repo_id = get_repo_id(request.source_dir.path()).await?;

    let mut components = Vec::new();
    components.push(workspace_component(&package_json, &package_dir, &repo_id)?);
    for workspace in &workspaces {
        components.push(workspace_component(
            &workspace.package_json,
            &workspace.path,
            &repo_id,
        )?);
    }
    for entry in &yarn_lock.entries {
        components.push(entry_component(entry, &runtime_dep_ids, &package_dir, &repo_id)?);
    }

    populate_offline_mirror(request, &package_dir).await?;

    RequestOutput::new(components, build_environment_variables(), vec![]).map_err(Into::into)
}

fn read_package_json(package_dir: &RootedPath) -> Result<Value> {
    let path = package_dir.join_within_root("package.json")?;
    let content = std::fs::read_to_string(path.path()).map_err(|_| {
        package_rejected(
            "the package.json file must be present for the yarn package manager",
            "Please double-check that you have specified the correct path \
             to the package directory containing this file.",
        )
    })?;
    serde_json::from_str(&content).map_err(|e| {
        package_rejected(
            format!("can't parse the package.json file: {e}"),
            "The package.json file must contain valid JSON. \
             Refer to the parser error and fix the contents of the file.",
        )
        .into()
    })
}

/// Plug'n'Play projects cannot be fed from an offline mirror.
fn reject_pnp_projects(package_dir: &RootedPath, package_json: &Value) -> Result<()> {
    let install_config_pnp = package_json
        .pointer("/installConfig/pnp")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let pnp_cjs_exists = std::fs::read_dir(package_dir.path())
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry.file_name().to_string_lossy().ends_with(".pnp.cjs")
            })
        })
        .unwrap_or(false);
    let node_modules_exists = package_dir.path().join("node_modules").exists();

    if install_config_pnp || pnp_cjs_exists || node_modules_exists {
        return Err(Cachi2Error::UnsupportedFeature {
            reason: "Yarn Plug'n'Play (PnP) is not supported".to_string(),
            solution: Some(
                "Please convert your project to a regular install-based one and remove \
                 any node_modules directory or *.pnp.cjs file."
                    .to_string(),
            ),
            docs: None,
        }
        .into());
    }
    Ok(())
}

/// Mirror/registry overrides in `.yarnrc`/`.npmrc` are ignored while
/// fetching but will be honored by yarn at build time; surface the
/// asymmetry.
fn warn_about_mirror_overrides(package_dir: &RootedPath) -> Result<()> {
    for rc_file in [".yarnrc", ".npmrc"] {
        let path = package_dir.join_within_root(rc_file)?;
        if path.path().is_file() {
            warn!(
                "{rc_file} is present; any registry/mirror overrides in it are ignored while \
                 fetching but will be honored by the build"
            );
        }
    }
    Ok(())
}

/// A workspace directory with its parsed package.json.
struct Workspace {
    path: RootedPath,
    package_json: Value,
}

/// Resolve the `workspaces` globs of the root package.json.
fn extract_workspaces(package_dir: &RootedPath, package_json: &Value) -> Result<Vec<Workspace>> {
    let globs: Vec<String> = match package_json.get("workspaces") {
        Some(Value::Array(globs)) => globs
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        Some(Value::Object(object)) => object
            .get("packages")
            .and_then(Value::as_array)
            .map(|globs| {
                globs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut workspaces = Vec::new();
    for glob_pattern in &globs {
        let full_pattern = package_dir.path().join(glob_pattern);
        let matches = glob::glob(&full_pattern.display().to_string())
            .with_context(|| format!("invalid workspaces glob: {glob_pattern:?}"))?;
        for path in matches.flatten() {
            if !path.is_dir() {
                continue;
            }
            // confinement check: a glob like "../elsewhere/*" must not pass
            let relative = path
                .strip_prefix(package_dir.path())
                .map(PathBuf::from)
                .map_err(|_| Cachi2Error::PathOutsideRoot {
                    subpath: glob_pattern.clone(),
                    root: package_dir.root().to_path_buf(),
                })?;
            let workspace_dir = package_dir.join_within_root(&relative)?;
            if !workspace_dir.path().join("package.json").is_file() {
                return Err(package_rejected(
                    format!("workspace {} does not contain 'package.json'", relative.display()),
                    "Every yarn workspace must have a package.json file.",
                )
                .into());
            }
            let package_json = serde_json::from_str(&std::fs::read_to_string(
                workspace_dir.path().join("package.json"),
            )?)?;
            workspaces.push(Workspace {
                path: workspace_dir,
                package_json,
            });
        }
    }
    Ok(workspaces)
}

/// Identify all runtime dependency ids (`name@resolved-version`) reachable
/// from `dependencies`, `peerDependencies` or `optionalDependencies` of the
/// root package and its workspaces. Everything else in the lockfile is a dev
/// dependency.
///
/// The lockfile is loaded into a directed graph (one node per resolved
/// entry, edges following the declared ranges) and the runtime set is the
/// union of everything reachable from the root dependencies.
fn find_runtime_deps(
    main_package_json: &Value,
    yarn_lock: &YarnLock,
    workspaces: &[Workspace],
) -> BTreeSet<String> {
    let mut graph: DiGraph<&YarnLockEntry, ()> = DiGraph::new();
    // compound keys ("a@^1.0.0, a@^1.2.0") expand to a 1:1 key -> node map
    let mut node_by_key: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    let mut node_indices = Vec::with_capacity(yarn_lock.entries.len());
    for entry in &yarn_lock.entries {
        let index = graph.add_node(entry);
        node_indices.push(index);
        for key in &entry.keys {
            node_by_key.insert(key.as_str(), index);
        }
    }
    for (entry, &from) in yarn_lock.entries.iter().zip(&node_indices) {
        for (name, range) in &entry.dependencies {
            let key = format!("{name}@{range}");
            if let Some(&to) = node_by_key.get(key.as_str()) {
                if !graph.contains_edge(from, to) {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }

    let mut roots: Vec<NodeIndex> = Vec::new();
    let all_package_jsons =
        std::iter::once(main_package_json).chain(workspaces.iter().map(|w| &w.package_json));
    for package_json in all_package_jsons {
        for dep_type in ["dependencies", "peerDependencies", "optionalDependencies"] {
            let Some(dependencies) = package_json.get(dep_type).and_then(Value::as_object) else {
                continue;
            };
            for (name, range) in dependencies {
                let key = format!("{name}@{}", range.as_str().unwrap_or_default());
                if let Some(&index) = node_by_key.get(key.as_str()) {
                    roots.push(index);
                }
                // peerDependencies are not always present in the yarn.lock
            }
        }
    }

    let mut visited: BTreeSet<String> = BTreeSet::new();
    for root in roots {
        let mut bfs = Bfs::new(&graph, root);
        while let Some(index) = bfs.next(&graph) {
            let entry = graph[index];
            visited.insert(format!(
                "{}@{}",
                entry.name,
                entry.version.as_deref().unwrap_or_default()
            ));
        }
    }
    visited
}

fn workspace_component(
    package_json: &Value,
    directory: &RootedPath,
    repo_id: &RepoID,
) -> Result<Component> {
    let name = package_json
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("workspace")
        .to_string();
    let version = package_json
        .get("version")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let mut purl = scoped_npm_purl(&name)
        .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
        .with_subpath(directory.subpath_from_root().display().to_string());
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

fn entry_component(
    entry: &YarnLockEntry,
    runtime_dep_ids: &BTreeSet<String>,
    package_dir: &RootedPath,
    repo_id: &RepoID,
) -> Result<Component> {
    let resolved = entry.resolved.as_deref().unwrap_or_default();
    reject_unsupported_locator(&entry.name, resolved)?;

    let mut purl = scoped_npm_purl(&entry.name);
    if let Some(ref version) = entry.version {
        purl = purl.with_version(version);
    }

    if let Ok(url) = Url::parse(resolved) {
        let is_registry = url
            .host_str()
            .is_some_and(|host| NPM_REGISTRY_CNAMES.contains(&host));
        if !is_registry && (url.scheme() == "https" || url.scheme() == "http") {
            let mut clean = url.clone();
            clean.set_fragment(None);
            purl = purl.with_qualifier("download_url", clean.to_string());
            if let Some(ref integrity) = entry.integrity {
                if let Ok(checksum) = ChecksumInfo::from_sri(integrity) {
                    purl = purl.with_qualifier("checksum", checksum.to_string());
                }
            }
        }
    } else if resolved.starts_with("file:") || !resolved.contains("://") {
        // local file dependency
        let subpath = resolved.trim_start_matches("file:");
        purl = purl.with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier());
        if let Ok(confined) = package_dir.join_within_root(subpath) {
            purl = purl.with_subpath(confined.subpath_from_root().display().to_string());
        }
    }

    let dep_id = format!(
        "{}@{}",
        entry.name,
        entry.version.as_deref().unwrap_or_default()
    );
    let mut properties = Vec::new();
    if !runtime_dep_ids.contains(&dep_id) {
        properties.push(Property::new("cdx:npm:package:development", "true"));
    }

    Ok(
        Component::library(entry.name.clone(), entry.version.clone(), purl)
            .with_properties(properties),
    )
}

/// git, github and exec locators cannot be mirrored offline.
fn reject_unsupported_locator(name: &str, resolved: &str) -> Result<(), Cachi2Error> {
    let lowered = resolved.to_lowercase();
    let refused = lowered.starts_with("git:")
        || lowered.starts_with("git+")
        || lowered.starts_with("github:")
        || lowered.starts_with("gitlab:")
        || lowered.starts_with("bitbucket:")
        || lowered.starts_with("exec:")
        || lowered.ends_with(".git");
    if refused {
        return Err(Cachi2Error::UnsupportedFeature {
            reason: format!("{name}@{resolved}: git and exec locators are not supported with yarn Classic"),
            solution: Some(
                "Please replace the dependency with a registry or plain https tarball one."
                    .to_string(),
            ),
            docs: None,
        });
    }
    Ok(())
}

/// Run `yarn install` configured to populate the offline mirror under
/// `deps/yarn-classic`.
async fn populate_offline_mirror(request: &Request, package_dir: &RootedPath) -> Result<()> {
    let mirror_dir = request.package_output_dir("yarn-classic")?;
    info!(
        "populating the yarn offline mirror at {}",
        mirror_dir.path().display()
    );
    ToolCommand::new("yarn")
        .args([
            "install",
            "--no-default-rc",
            "--frozen-lockfile",
            "--disable-pnp",
            "--ignore-engines",
            "--non-interactive",
        ])
        .current_dir(package_dir.path())
        .env("YARN_YARN_OFFLINE_MIRROR", mirror_dir.path().display().to_string())
        .env("YARN_YARN_OFFLINE_MIRROR_PRUNING", "false")
        .env("YARN_IGNORE_PATH", "true")
        .env("YARN_IGNORE_SCRIPTS", "true")
        .env("COREPACK_ENABLE_PROJECT_SPEC", "0")
        .with_timeout(request.config.subprocess_timeout)
        .run()
        .await
        .context("yarn install failed")?;
    Ok(())
}

fn build_environment_variables() -> Vec<EnvironmentVariable> {
    vec![
        EnvironmentVariable::path("YARN_YARN_OFFLINE_MIRROR", "deps/yarn-classic"),
        EnvironmentVariable::literal("YARN_YARN_OFFLINE_MIRROR_PRUNING", "false"),
        EnvironmentVariable::path("YARN_GLOBAL_FOLDER", "deps/yarn"),
        EnvironmentVariable::literal("YARN_ENABLE_GLOBAL_CACHE", "false"),
        EnvironmentVariable::literal("YARN_ENABLE_MIRROR", "true"),
        EnvironmentVariable::literal("YARN_ENABLE_IMMUTABLE_CACHE", "false"),
    ]
}
