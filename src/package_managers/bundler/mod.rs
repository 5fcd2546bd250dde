//! The bundler resolver.
//!
//! `bundle install` is never executed. The `Gemfile.lock` is parsed
//! directly; registry gems are downloaded into the bundler cache layout
//! (`deps/bundler/vendor/cache`), git gems are cloned as checked-out
//! working trees, and PATH gems are only validated to live inside the
//! source tree.
//!
//! The build consumes a generated bundler config (via `BUNDLE_APP_CONFIG`)
//! rather than a mutated `.bundle/config` in the user's repository.

mod parser;

pub use parser::{
    BundlerDependency, GemDependency, GitDependency, PathDependency, parse_lockfile,
};

use crate::checksum::ChecksumInfo;
use crate::fetch::{Artifact, fetch_many};
use crate::git::{clone_checked_out, get_repo_id};
use crate::models::input::BundlerPackageInput;
use crate::models::{EnvironmentVariable, ProjectFile, Request, RequestOutput};
use crate::purl::Purl;
use crate::sbom::{Component, Property};
use anyhow::Result;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

/// Resolve and fetch bundler dependencies for the given request.
pub async fn fetch_bundler_source(
    request: &Request,
    package: &BundlerPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let dependencies = parse_lockfile(&package_dir)?;
    info!(
        "{}: {} dependencies in Gemfile.lock",
        package_dir.path().display(),
        dependencies.len()
    );

    let cache_dir = request
        .package_output_dir("bundler")?
        .join_within_root("vendor/cache")?;
    std::fs::create_dir_all(cache_dir.path())?;

    let mut downloads = Vec::new();
    let mut components = vec![main_package_component(request, package).await?];
    let mut git_dependencies = Vec::new();

    let repo_id = get_repo_id(request.source_dir.path()).await?;
    let lockfile_relpath = package_dir
        .join_within_root(parser::GEMFILE_LOCK)?
        .subpath_from_root()
        .to_path_buf();

    for dependency in &dependencies {
        match dependency {
            BundlerDependency::Gem(gem) => {
                if gem.platform.is_some() && !package.allow_binary {
                    warn!(
                        "skipping platform-specific gem {} (allow_binary is false)",
                        gem.file_stem()
                    );
                    continue;
                }
                let target = cache_dir.join_within_root(format!("{}.gem", gem.file_stem()))?;
                let checksums = gem
                    .checksum
                    .iter()
                    .map(|digest| ChecksumInfo::new("sha256", digest))
                    .collect::<Vec<_>>();
                let mut properties = Vec::new();
                if checksums.is_empty() {
                    properties.push(Property::new(
                        "cachi2:missing_hash:in_file",
                        lockfile_relpath.display().to_string(),
                    ));
                }
                if gem.platform.is_some() {
                    properties.push(Property::new("cachi2:bundler:package:binary", "true"));
                }
                downloads.push(Artifact::new(
                    gem.remote_location(),
                    checksums,
                    target.path().to_path_buf(),
                ));
                components.push(
                    Component::library(
                        gem.name.clone(),
                        Some(gem.version.clone()),
                        Purl::new("gem", &gem.name).with_version(&gem.version),
                    )
                    .with_properties(properties),
                );
            }
            BundlerDependency::Git(git) => {
                git_dependencies.push(git.clone());
                let purl = Purl::new("gem", &git.name)
                    .with_version(&git.version)
                    .with_qualifier("vcs_url", format!("git+{}@{}", git.url, git.ref_));
                components.push(Component::library(
                    git.name.clone(),
                    Some(git.version.clone()),
                    purl,
                ));
            }
            BundlerDependency::Path(path) => {
                let purl = Purl::new("gem", &path.name)
                    .with_version(&path.version)
                    .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
                    .with_subpath(
                        package_dir
                            .join_within_root(&path.subpath)?
                            .subpath_from_root()
                            .display()
                            .to_string(),
                    );
                components.push(Component::library(
                    path.name.clone(),
                    Some(path.version.clone()),
                    purl,
                ));
            }
        }
    }

    fetch_many(&request.config, &downloads).await?;

    for git in &git_dependencies {
        let target = cache_dir.join_within_root(git.cache_dir_name())?;
        if !target.path().exists() {
            clone_checked_out(&git.url, &git.ref_, target.path()).await?;
        }
    }

    let (config_file, mut env) = build_config(request, &git_dependencies)?;
    env.push(EnvironmentVariable::path("BUNDLE_APP_CONFIG", "bundler"));

    RequestOutput::new(components, env, vec![config_file]).map_err(Into::into)
}

async fn main_package_component(
    request: &Request,
    package: &BundlerPackageInput,
) -> Result<Component> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let repo_id = get_repo_id(request.source_dir.path()).await?;
    let name = package_dir
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "package".to_string());
    let purl = Purl::new("gem", &name)
        .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
        .with_subpath(package_dir.subpath_from_root().display().to_string());
    Ok(Component::library(name, None, purl))
}

/// Render the bundler config consumed via `BUNDLE_APP_CONFIG` and the env
/// vars pointing git gems at their local checkouts.
fn build_config(
    request: &Request,
    git_dependencies: &[GitDependency],
) -> Result<(ProjectFile, Vec<EnvironmentVariable>)> {
    let mut content = String::from("---\n");
    content.push_str("BUNDLE_CACHE_PATH: \"${output_dir}/deps/bundler/vendor/cache\"\n");
    content.push_str("BUNDLE_DEPLOYMENT: \"true\"\n");
    content.push_str("BUNDLE_NO_PRUNE: \"true\"\n");
    content.push_str("BUNDLE_ALLOW_OFFLINE_INSTALL: \"true\"\n");
    content.push_str("BUNDLE_DISABLE_VERSION_CHECK: \"true\"\n");

    let mut env = Vec::new();
    if !git_dependencies.is_empty() {
        content.push_str("BUNDLE_DISABLE_LOCAL_BRANCH_CHECK: \"true\"\n");
        content.push_str("BUNDLE_DISABLE_LOCAL_REVISION_CHECK: \"true\"\n");
    }
    for git in git_dependencies {
        let config_key = git.name.to_uppercase().replace('-', "_");
        let cache_subpath = format!("deps/bundler/vendor/cache/{}", git.cache_dir_name());
        writeln!(
            content,
            "BUNDLE_LOCAL__{config_key}: \"${{output_dir}}/{cache_subpath}\""
        )?;
        env.push(EnvironmentVariable::path(
            format!("BUNDLE_LOCAL__{config_key}"),
            cache_subpath,
        ));
    }

    let config_path = request.output_dir.join_within_root("bundler/config")?;
    Ok((
        ProjectFile::new(config_path.path(), content),
        env,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::input::PackageInput;
    use std::collections::BTreeSet;
    use std::fs;
    use tempfile::tempdir;

    fn make_request(temp: &Path) -> Request {
        fs::create_dir_all(temp.join("src")).unwrap();
        let packages = vec![
            serde_json::from_str::<PackageInput>(r#"{"type": "bundler"}"#).unwrap(),
        ];
        Request::new(temp.join("src"), temp.join("out"), packages, BTreeSet::new()).unwrap()
    }

    #[test]
    fn test_config_has_all_settings() {
        let temp = tempdir().unwrap();
        let request = make_request(temp.path());
        let git = GitDependency {
            name: "my-gem".into(),
            version: "0.1.0".into(),
            url: "https://github.com/x/y".into(),
            ref_: "abcdef0123456789abcdef0123456789abcdef01".into(),
        };
        let (config, env) = build_config(&request, &[git]).unwrap();

        assert!(config.abspath.ends_with("bundler/config"));
        let resolved = config.resolve_content(Path::new("/cachi2/output"));
        assert!(resolved.contains("BUNDLE_CACHE_PATH: \"/cachi2/output/deps/bundler/vendor/cache\""));
        assert!(resolved.contains("BUNDLE_DEPLOYMENT: \"true\""));
        assert!(resolved.contains("BUNDLE_NO_PRUNE: \"true\""));
        assert!(resolved.contains("BUNDLE_ALLOW_OFFLINE_INSTALL: \"true\""));
        assert!(resolved.contains("BUNDLE_DISABLE_VERSION_CHECK: \"true\""));
        assert!(resolved.contains("BUNDLE_DISABLE_LOCAL_BRANCH_CHECK: \"true\""));
        assert!(resolved.contains("BUNDLE_DISABLE_LOCAL_REVISION_CHECK: \"true\""));
        assert!(
            resolved.contains("BUNDLE_LOCAL__MY_GEM: \"/cachi2/output/deps/bundler/vendor/cache/y-abcdef012345\"")
        );

        assert_eq!(env.len(), 1);
        assert_eq!(env[0].name, "BUNDLE_LOCAL__MY_GEM");
        assert_eq!(
            env[0].resolve_value(Path::new("/cachi2/output")),
            "/cachi2/output/deps/bundler/vendor/cache/y-abcdef012345"
        );
    }

    #[test]
    fn test_config_without_git_gems_omits_local_checks() {
        let temp = tempdir().unwrap();
        let request = make_request(temp.path());
        let (config, env) = build_config(&request, &[]).unwrap();
        assert!(!config.template.contains("BUNDLE_DISABLE_LOCAL_BRANCH_CHECK"));
        assert!(env.is_empty());
    }
}
