//! The npm resolver.
//!
//! Converts a v2/v3 `package-lock.json` into a local tarball cache and a
//! rewritten lockfile such that `npm install --offline` succeeds. Every
//! `packages` entry is classified by its `resolved` locator:
//!
//! - registry tarballs are downloaded and verified against their SRI
//!   `integrity`
//! - plain https tarballs are downloaded (integrity mandatory) into
//!   `external-<name>/`
//! - git locators are cloned at the pinned commit and packed as tarballs
//!   (the CLI-added `integrity` is stripped: it would not match the
//!   repacked archive)
//! - `file:` locators and workspace links resolve in place
//!
//! The lockfile rewrite replaces every remote `resolved` with a
//! `file://${output_dir}/...` URL and blanks the corresponding version
//! strings in `package.json` files so npm does not attempt a re-resolution.

use crate::checksum::ChecksumInfo;
use crate::core::{Cachi2Error, package_rejected};
use crate::fetch::{Artifact, fetch_many};
use crate::git::{RepoID, clone_as_tarball, get_repo_id};
use crate::models::input::PlainPackageInput;
use crate::models::{ProjectFile, Request, RequestOutput};
use crate::paths::RootedPath;
use crate::purl::Purl;
use crate::sbom::{Component, Property};
use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};
use url::Url;

const NPM_REGISTRY_CNAMES: &[&str] = &["registry.npmjs.org", "registry.yarnpkg.com"];
const DEPENDENCY_TYPES: &[&str] = &[
    "dependencies",
    "devDependencies",
    "optionalDependencies",
    "peerDependencies",
];

/// Resolve and fetch npm dependencies for the given request.
pub async fn fetch_npm_source(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let npm_deps_dir = request.package_output_dir("npm")?;

    let lockfile = PackageLock::from_package_dir(&package_dir)?;
    info!(
        "{}: lockfileVersion {}",
        lockfile.lockfile_path.path().display(),
        lockfile.lockfile_version
    );

    let repo_id = get_repo_id(request.source_dir.path()).await?;

    let mut components = vec![lockfile.main_package_component(&repo_id)?];
    for entry in &lockfile.entries {
        components.push(entry.to_component(&lockfile, &repo_id)?);
    }

    let download_paths = download_dependencies(request, &lockfile, &npm_deps_dir).await?;

    let mut project_files = vec![lockfile.rewritten_lockfile(&download_paths)?];
    project_files.extend(lockfile.rewritten_package_json_files(&package_dir)?);

    RequestOutput::new(components, vec![], project_files).map_err(Into::into)
}

/// How a `resolved` locator is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LocatorKind {
    Registry,
    Git,
    File,
    Https,
}

/// `github:`/`gitlab:`/`bitbucket:` shorthands become full `git+ssh://` URLs.
fn normalize_resolved_url(resolved: &str) -> String {
    for (shorthand, domain) in [
        ("github:", "github.com"),
        ("gitlab:", "gitlab.com"),
        ("bitbucket:", "bitbucket.org"),
    ] {
        if let Some(path) = resolved.strip_prefix(shorthand) {
            let (namespace_repo, ref_) = match path.split_once('#') {
                Some((namespace_repo, ref_)) => (namespace_repo, Some(ref_)),
                None => (path, None),
            };
            let mut url = format!("git+ssh://git@{domain}/{namespace_repo}.git");
            if let Some(ref_) = ref_ {
                url.push('#');
                url.push_str(ref_);
            }
            return url;
        }
    }
    resolved.to_string()
}

fn classify_resolved_url(resolved: &str) -> LocatorKind {
    if resolved.starts_with("file:") {
        return LocatorKind::File;
    }
    if resolved.starts_with("git:") || resolved.starts_with("git+") {
        return LocatorKind::Git;
    }
    if let Ok(url) = Url::parse(resolved) {
        if let Some(host) = url.host_str() {
            if NPM_REGISTRY_CNAMES.contains(&host) {
                return LocatorKind::Registry;
            }
        }
        if url.scheme() == "https" || url.scheme() == "http" {
            return LocatorKind::Https;
        }
    }
    // a bare path (v2 file deps may omit the file: prefix)
    LocatorKind::File
}

/// Info extracted from a git locator such as
/// `git+ssh://git@github.com/namespace/repo.git#<commit>`.
#[derive(Debug, Clone)]
struct NpmGitInfo {
    url: String,
    ref_: String,
    host: String,
    namespace: String,
    repo: String,
}

fn extract_git_info(resolved: &str) -> Result<NpmGitInfo, Cachi2Error> {
    let invalid = |what: &str| {
        Cachi2Error::InvalidInput(format!("{resolved} is not a valid VCS url. {what} is missing."))
    };

    let (clean_url, ref_) = resolved.split_once('#').ok_or_else(|| invalid("ref"))?;
    let clean_url = clean_url.strip_prefix("git+").unwrap_or(clean_url);

    let parsed = Url::parse(clean_url).map_err(|_| invalid("url"))?;
    let host = parsed.host_str().ok_or_else(|| invalid("host"))?.to_string();
    let namespace_repo = parsed
        .path()
        .trim_matches('/')
        .trim_end_matches(".git")
        .to_string();
    let (namespace, repo) = namespace_repo
        .rsplit_once('/')
        .ok_or_else(|| invalid("namespace"))?;
    if repo.is_empty() {
        return Err(invalid("repo"));
    }

    Ok(NpmGitInfo {
        url: clean_url.to_string(),
        ref_: ref_.to_lowercase(),
        host,
        namespace: namespace.to_string(),
        repo: repo.to_string(),
    })
}

/// Pick the strongest of the space-separated hashes in an SRI string.
fn strongest_sri_checksum(integrity: &str) -> Result<ChecksumInfo, Cachi2Error> {
    fn strength(algorithm: &str) -> u8 {
        match algorithm {
            "sha512" => 4,
            "sha384" => 3,
            "sha256" => 2,
            "sha1" => 1,
            _ => 0,
        }
    }

    integrity
        .split_whitespace()
        .map(ChecksumInfo::from_sri)
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .max_by_key(|checksum| strength(&checksum.algorithm))
        .ok_or_else(|| {
            Cachi2Error::InvalidInput(format!("empty integrity value: {integrity:?}"))
        })
}

/// One entry of the lockfile's `packages` map (other than the root).
#[derive(Debug, Clone)]
struct PackageEntry {
    /// Key in the `packages` map, e.g. `node_modules/@scope/name`.
    path: String,
    name: String,
    version: Option<String>,
    resolved: Option<String>,
    integrity: Option<String>,
    dev: bool,
    optional: bool,
    bundled: bool,
}

impl PackageEntry {
    /// The resolved locator; bundled deps have none, file deps fall back to
    /// their path.
    fn resolved_url(&self) -> Option<String> {
        if let Some(ref resolved) = self.resolved {
            return Some(resolved.clone());
        }
        if self.bundled {
            return None;
        }
        Some(format!("file:{}", self.path))
    }

    fn to_component(&self, lockfile: &PackageLock, repo_id: &RepoID) -> Result<Component> {
        let purl = npm_purl(
            &self.name,
            self.version.as_deref(),
            self.resolved_url().as_deref(),
            self.integrity.as_deref(),
            repo_id,
            &lockfile.package_dir,
        )?;

        let mut properties = Vec::new();
        if self.dev {
            properties.push(Property::new("cdx:npm:package:development", "true"));
        }
        if self.bundled {
            properties.push(Property::new("cdx:npm:package:bundled", "true"));
        }
        // `optional` has no standard CycloneDX property; npm's devOptional
        // entries are already covered by `dev`.
        let _ = self.optional;

        Ok(
            Component::library(self.name.clone(), self.version.clone(), purl)
                .with_properties(properties),
        )
    }
}

/// Build the npm purl for one package.
///
/// <https://github.com/package-url/purl-spec/blob/master/PURL-TYPES.rst#npm>
fn npm_purl(
    name: &str,
    version: Option<&str>,
    resolved_url: Option<&str>,
    integrity: Option<&str>,
    repo_id: &RepoID,
    package_dir: &RootedPath,
) -> Result<Purl> {
    let lowercase_name = name.to_lowercase();
    let (namespace, bare_name) = match lowercase_name.split_once('/') {
        Some((namespace, bare_name)) => (Some(namespace.to_string()), bare_name.to_string()),
        None => (None, lowercase_name.clone()),
    };

    let mut purl = Purl::new("npm", bare_name);
    if let Some(namespace) = namespace {
        purl = purl.with_namespace(namespace);
    }
    if let Some(version) = version {
        purl = purl.with_version(version);
    }

    let Some(resolved_url) = resolved_url else {
        // bundled dependency: same purl as a registry dependency
        return Ok(purl);
    };

    let resolved_url = normalize_resolved_url(resolved_url);
    match classify_resolved_url(&resolved_url) {
        LocatorKind::Registry => {}
        LocatorKind::Git => {
            let info = extract_git_info(&resolved_url)?;
            let git_repo_id = RepoID {
                origin_url: info.url,
                commit_id: info.ref_,
            };
            purl = purl.with_qualifier("vcs_url", git_repo_id.as_vcs_url_qualifier());
        }
        LocatorKind::File => {
            purl = purl.with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier());
            let subpath = resolved_url.trim_start_matches("file:");
            let confined = package_dir.join_within_root(subpath)?;
            purl = purl.with_subpath(confined.subpath_from_root().display().to_string());
        }
        LocatorKind::Https => {
            purl = purl.with_qualifier("download_url", resolved_url.clone());
            if let Some(integrity) = integrity {
                let checksum = strongest_sri_checksum(integrity)?;
                purl = purl.with_qualifier("checksum", checksum.to_string());
            }
        }
    }
    Ok(purl)
}

/// A parsed `package-lock.json` (v2/v3).
#[derive(Debug)]
struct PackageLock {
    lockfile_path: RootedPath,
    package_dir: RootedPath,
    data: Value,
    lockfile_version: u64,
    entries: Vec<PackageEntry>,
    /// Relative paths of workspace directories (from `link: true` entries
    /// matching the root package's `workspaces` globs).
    workspaces: Vec<String>,
}

impl PackageLock {
    fn from_package_dir(package_dir: &RootedPath) -> Result<Self> {
        let lockfile_path = ["npm-shrinkwrap.json", "package-lock.json"]
            .iter()
            .map(|name| package_dir.join_within_root(name))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .find(|path| path.path().exists())
            .ok_or_else(|| {
                package_rejected(
                    "the npm-shrinkwrap.json or package-lock.json file must be present for the \
                     npm package manager",
                    "Please double-check that you have specified the correct path to the package \
                     directory containing one of those two files.",
                )
            })?;

        let data: Value = serde_json::from_str(&std::fs::read_to_string(lockfile_path.path())?)
            .with_context(|| format!("failed to parse {}", lockfile_path.path().display()))?;

        let lockfile_version = data
            .get("lockfileVersion")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if !(2..=3).contains(&lockfile_version) {
            return Err(Cachi2Error::UnsupportedFeature {
                reason: format!(
                    "lockfileVersion {lockfile_version} from {} is not supported",
                    lockfile_path.path().display()
                ),
                solution: Some(
                    "Please use a supported lockfileVersion, which are versions 2 and 3. \
                     Upgrade the lockfile with `npm install --lockfile-version 3`."
                        .to_string(),
                ),
                docs: None,
            }
            .into());
        }

        let mut lock = Self {
            lockfile_path,
            package_dir: package_dir.clone(),
            lockfile_version,
            entries: Vec::new(),
            workspaces: Vec::new(),
            data,
        };
        lock.collect_entries()?;
        Ok(lock)
    }

    fn root_workspace_globs(&self) -> Vec<String> {
        self.data
            .pointer("/packages//workspaces")
            .and_then(Value::as_array)
            .map(|globs| {
                globs
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|glob| glob.trim_start_matches("./").to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn collect_entries(&mut self) -> Result<()> {
        let workspace_globs = self.root_workspace_globs();
        let Some(packages) = self.data.get("packages").and_then(Value::as_object) else {
            return Ok(());
        };

        for (package_path, package_data) in packages {
            if package_path.is_empty() {
                continue;
            }
            if package_data.get("link").and_then(Value::as_bool) == Some(true) {
                if let Some(resolved) = package_data.get("resolved").and_then(Value::as_str) {
                    if workspace_globs.iter().any(|glob| fnmatch(glob, resolved)) {
                        self.workspaces.push(resolved.to_string());
                    }
                }
                continue;
            }

            let name = package_data
                .get("name")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .unwrap_or_else(|| package_name_from_path(package_path));

            self.entries.push(PackageEntry {
                path: package_path.clone(),
                name,
                version: package_data
                    .get("version")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                resolved: package_data
                    .get("resolved")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                integrity: package_data
                    .get("integrity")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
                dev: package_data.get("dev").and_then(Value::as_bool).unwrap_or(false)
                    || package_data
                        .get("devOptional")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                optional: package_data
                    .get("optional")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                bundled: package_data
                    .get("inBundle")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
        Ok(())
    }

    fn main_package_component(&self, repo_id: &RepoID) -> Result<Component> {
        let name = self
            .data
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Cachi2Error::LockfileError {
                    reason: "package-lock.json is missing the package name".to_string(),
                    file: self.lockfile_path.path().to_path_buf(),
                    line: None,
                    solution: None,
                }
            })?;
        let version = self.data.get("version").and_then(Value::as_str);

        let purl = npm_purl(
            name,
            version,
            Some("file:."),
            None,
            repo_id,
            &self.package_dir,
        )?;
        Ok(Component::library(
            name.to_string(),
            version.map(ToString::to_string),
            purl,
        ))
    }

    /// The rewritten lockfile as a ProjectFile: remote locators replaced
    /// with templated local paths, dependency version strings blanked.
    fn rewritten_lockfile(
        &self,
        download_paths: &BTreeMap<String, PathBuf>,
    ) -> Result<ProjectFile> {
        let mut data = self.data.clone();
        let Some(packages) = data.get_mut("packages").and_then(Value::as_object_mut) else {
            return Ok(ProjectFile::new(
                self.lockfile_path.path(),
                serde_json::to_string_pretty(&data)? + "\n",
            ));
        };

        for (package_path, package_data) in packages.iter_mut() {
            let Some(package_object) = package_data.as_object_mut() else {
                continue;
            };

            if !package_path.is_empty()
                && package_object.get("link").and_then(Value::as_bool) != Some(true)
            {
                let resolved = package_object
                    .get("resolved")
                    .and_then(Value::as_str)
                    .map(normalize_resolved_url);
                if let Some(resolved) = resolved {
                    let kind = classify_resolved_url(&resolved);
                    if kind == LocatorKind::Git {
                        // the repacked archive has a different digest
                        package_object.remove("integrity");
                    }
                    if kind != LocatorKind::File {
                        if let Some(local) = download_paths.get(&resolved) {
                            package_object.insert(
                                "resolved".to_string(),
                                json!(format!("file://${{output_dir}}/{}", local.display())),
                            );
                        }
                    }
                }
            }

            blank_remote_dependency_versions(package_object);
        }

        Ok(ProjectFile::new(
            self.lockfile_path.path(),
            serde_json::to_string_pretty(&data)? + "\n",
        ))
    }

    /// Rewritten `package.json` files for the main package and every
    /// workspace.
    fn rewritten_package_json_files(&self, package_dir: &RootedPath) -> Result<Vec<ProjectFile>> {
        let mut paths = vec![package_dir.join_within_root("package.json")?];
        for workspace in &self.workspaces {
            paths.push(package_dir.join_within_root(workspace)?.join_within_root("package.json")?);
        }

        let mut project_files = Vec::new();
        for path in paths {
            let mut content: Value =
                serde_json::from_str(&std::fs::read_to_string(path.path())?)
                    .with_context(|| format!("failed to parse {}", path.path().display()))?;
            if let Some(object) = content.as_object_mut() {
                blank_remote_dependency_versions(object);
            }
            project_files.push(ProjectFile::new(
                path.path(),
                serde_json::to_string_pretty(&content)? + "\n",
            ));
        }
        Ok(project_files)
    }
}

/// In any dependencies map, blank the version strings that would make npm
/// reach for the network (anything but local paths and plain semver ranges).
fn blank_remote_dependency_versions(package_object: &mut Map<String, Value>) {
    for dep_type in DEPENDENCY_TYPES {
        let Some(dependencies) = package_object.get_mut(*dep_type).and_then(Value::as_object_mut)
        else {
            continue;
        };
        let to_blank: Vec<String> = dependencies
            .iter()
            .filter(|(_, version)| {
                version
                    .as_str()
                    .is_some_and(|version| is_remote_dependency_version(version))
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in to_blank {
            dependencies.insert(name, json!(""));
        }
    }
}

/// True for git/https dependency version strings, false for `file:` paths
/// and registry semver ranges.
fn is_remote_dependency_version(version: &str) -> bool {
    if version.starts_with("file:") {
        return false;
    }
    let has_scheme = version
        .split_once(':')
        .is_some_and(|(scheme, _)| scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+'));
    has_scheme || version.contains('/')
}

fn package_name_from_path(package_path: &str) -> String {
    let path = PathBuf::from(package_path);
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path
        .parent()
        .and_then(|parent| parent.file_name())
        .map(|parent| parent.to_string_lossy().into_owned())
        .unwrap_or_default();
    if parent.starts_with('@') {
        format!("{parent}/{name}")
    } else {
        name
    }
}

/// Minimal fnmatch: `*` matches any run of characters, `?` a single one.
fn fnmatch(pattern: &str, value: &str) -> bool {
    fn matches(pattern: &[u8], value: &[u8]) -> bool {
        match (pattern.first(), value.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                matches(&pattern[1..], value)
                    || (!value.is_empty() && matches(pattern, &value[1..]))
            }
            (Some(b'?'), Some(_)) => matches(&pattern[1..], &value[1..]),
            (Some(p), Some(v)) if p == v => matches(&pattern[1..], &value[1..]),
            _ => false,
        }
    }
    matches(pattern.as_bytes(), value.as_bytes())
}

/// Download every remote dependency, returning a map of normalized resolved
/// URL to the download path relative to the output directory.
async fn download_dependencies(
    request: &Request,
    lockfile: &PackageLock,
    npm_deps_dir: &RootedPath,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut download_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut artifacts = Vec::new();
    let mut git_fetches: Vec<(NpmGitInfo, RootedPath)> = Vec::new();

    for entry in &lockfile.entries {
        let Some(resolved) = entry.resolved_url() else {
            continue;
        };
        let resolved = normalize_resolved_url(&resolved);

        match classify_resolved_url(&resolved) {
            LocatorKind::File => continue,
            LocatorKind::Git => {
                let info = extract_git_info(&resolved)?;
                let target = npm_deps_dir
                    .join_within_root(&info.host)?
                    .join_within_root(&info.namespace)?
                    .join_within_root(&info.repo)?
                    .join_within_root(format!(
                        "{}-external-gitcommit-{}.tgz",
                        info.repo, info.ref_
                    ))?;
                download_paths.insert(resolved.clone(), relative_to_output(request, &target));
                git_fetches.push((info, target));
            }
            LocatorKind::Registry => {
                let version = entry.version.clone().unwrap_or_default();
                let archive_name = format!("{}-{version}.tgz", entry.name)
                    .trim_start_matches('@')
                    .replace('/', "-");
                let target = npm_deps_dir.join_within_root(&archive_name)?;
                let checksums = entry
                    .integrity
                    .as_deref()
                    .map(sri_checksums)
                    .transpose()?
                    .unwrap_or_default();
                if checksums.is_empty() {
                    warn!("missing integrity for {resolved}, integrity check skipped");
                }
                download_paths.insert(resolved.clone(), relative_to_output(request, &target));
                if !target.path().exists() {
                    artifacts.push(Artifact::new(
                        resolved,
                        checksums,
                        target.path().to_path_buf(),
                    ));
                }
            }
            LocatorKind::Https => {
                let Some(ref integrity) = entry.integrity else {
                    return Err(package_rejected(
                        format!(
                            "{} is missing integrity checksum. It is mandatory for https \
                             dependencies.",
                            entry.name
                        ),
                        "Please double-check that your package-lock.json dependencies specify \
                         integrity. Try to rerun `npm install` on your repository.",
                    )
                    .into());
                };
                let checksum = strongest_sri_checksum(integrity)?;
                let target = npm_deps_dir
                    .join_within_root(format!("external-{}", entry.name))?
                    .join_within_root(format!(
                        "{}-external-{}-{}.tgz",
                        entry.name, checksum.algorithm, checksum.hexdigest
                    ))?;
                download_paths.insert(resolved.clone(), relative_to_output(request, &target));
                if !target.path().exists() {
                    artifacts.push(Artifact::new(
                        resolved,
                        sri_checksums(integrity)?,
                        target.path().to_path_buf(),
                    ));
                }
            }
        }
    }

    fetch_many(&request.config, &artifacts).await?;

    for (info, target) in &git_fetches {
        if !target.path().exists() {
            clone_as_tarball(&info.url, &info.ref_, target.path()).await?;
        }
    }

    Ok(download_paths)
}

fn relative_to_output(request: &Request, target: &RootedPath) -> PathBuf {
    target
        .path()
        .strip_prefix(request.output_dir.root())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| target.path().to_path_buf())
}

/// All parseable checksums from an SRI string.
fn sri_checksums(integrity: &str) -> Result<Vec<ChecksumInfo>, Cachi2Error> {
    integrity
        .split_whitespace()
        .map(ChecksumInfo::from_sri)
        .collect()
}
