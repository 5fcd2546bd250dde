//! The gomod resolver.
//!
//! Drives the Go toolchain in an isolated cache rooted at `deps/gomod` so a
//! later `go build` works offline, and reports both the modules and the
//! packages that make up the build.
//!
//! Repositories with a populated `vendor/` directory are handled without
//! touching the module cache: `go mod vendor` is re-run and any divergence
//! from the committed vendor content is fatal. Everything else goes through
//! `go mod download` into `deps/gomod/pkg/mod`, after which the enumeration
//! commands run with `GOPROXY=off` - the network phase is over.

pub mod parser;
pub mod version;

pub use parser::{ParsedModule, ParsedPackage};
pub use version::{GoVersion, ToolchainPolicy};

use crate::core::{Cachi2Error, package_rejected};
use crate::models::input::{Flag, PlainPackageInput};
use crate::models::{EnvironmentVariable, Request, RequestOutput};
use crate::paths::RootedPath;
use crate::purl::Purl;
use crate::sbom::{Component, Property};
use crate::utils::ToolCommand;
use anyhow::{Context, Result};
use parser::GoEnv;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolve and fetch gomod dependencies for the given request.
pub async fn fetch_gomod_source(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<RequestOutput> {
    let version_output = ToolCommand::new("go").arg("version").run().await?;
    info!("Go version: {}", version_output.trim());
    let host_version = version::parse_host_go_version(&version_output).ok_or_else(|| {
        Cachi2Error::ToolError {
            command: "go version".to_string(),
            stderr: format!("unexpected output: {version_output:?}"),
        }
    })?;

    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let gomod_path = package_dir.join_within_root("go.mod")?;
    if !gomod_path.path().is_file() {
        return Err(package_rejected(
            format!(
                "the go.mod file must be present for the Go module at: {}",
                package_dir.path().display()
            ),
            "Please double-check that you have specified correct paths to your Go modules.",
        )
        .into());
    }

    let go_mod_content = std::fs::read_to_string(gomod_path.path())?;
    let policy = version::toolchain_policy(&go_mod_content, host_version)?;
    debug!("GOTOOLCHAIN policy: {}", policy.gotoolchain);

    // a go.work file means every workspace member goes through the same flow
    let module_dirs = workspace_module_dirs(request, &package_dir, &policy).await?;

    let mut components = Vec::new();
    let mut vendored = false;
    for module_dir in &module_dirs {
        let resolution = resolve_module(request, module_dir, &policy).await?;
        vendored = vendored || resolution.vendored;
        components.extend(resolution.components);
    }

    let goflags = if vendored { "-mod=vendor" } else { "-mod=mod" };
    let environment_variables = vec![
        EnvironmentVariable::path("GOCACHE", "deps/gomod/cache"),
        EnvironmentVariable::literal("GOFLAGS", goflags),
        EnvironmentVariable::path("GOMODCACHE", "deps/gomod/pkg/mod"),
        EnvironmentVariable::path("GOPATH", "deps/gomod"),
        EnvironmentVariable::literal("GOTOOLCHAIN", policy.gotoolchain.clone()),
    ];

    RequestOutput::new(components, environment_variables, vec![]).map_err(Into::into)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoWork {
    #[serde(default)]
    r#use: Option<Vec<GoWorkUse>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoWorkUse {
    disk_path: String,
}

/// The module directories to process: the members of the go.work workspace,
/// or just the package directory itself.
async fn workspace_module_dirs(
    request: &Request,
    package_dir: &RootedPath,
    policy: &ToolchainPolicy,
) -> Result<Vec<RootedPath>> {
    if !package_dir.path().join("go.work").exists() {
        return Ok(vec![package_dir.clone()]);
    }

    if policy.directive.is_none_or(|directive| directive < GoVersion::new(1, 21, 0)) {
        return Err(Cachi2Error::UnsupportedFeature {
            reason: "go.work workspaces require a 'go' directive of 1.21 or newer".to_string(),
            solution: Some("Please update the go directive in go.mod.".to_string()),
            docs: None,
        }
        .into());
    }

    info!("go.work detected, resolving every workspace module");
    let env = go_env(request, package_dir, policy, None)?;
    let output = parser::run_go(
        &["work", "edit", "-json"],
        &env,
        package_dir.path(),
        false,
        request.config.subprocess_timeout,
    )
    .await?;
    let go_work: GoWork = serde_json::from_str(&output).context("failed to parse go work edit -json")?;

    let mut dirs = Vec::new();
    for use_directive in go_work.r#use.unwrap_or_default() {
        let module_dir = package_dir.join_within_root(&use_directive.disk_path)?;
        if !module_dir.path().join("go.mod").is_file() {
            return Err(package_rejected(
                format!(
                    "the go.mod file must be present for the Go module at: {}",
                    module_dir.path().display()
                ),
                "Every go.work use directive must point at a module directory.",
            )
            .into());
        }
        dirs.push(module_dir);
    }
    if dirs.is_empty() {
        dirs.push(package_dir.clone());
    }
    Ok(dirs)
}

fn go_env(
    request: &Request,
    _module_dir: &RootedPath,
    policy: &ToolchainPolicy,
    scratch: Option<&Path>,
) -> Result<GoEnv> {
    let (gopath, gocache, gomodcache) = match scratch {
        // the vendored flow must leave deps/gomod/pkg/mod empty
        Some(scratch) => (
            scratch.to_path_buf(),
            scratch.join("cache"),
            scratch.join("pkg/mod"),
        ),
        None => {
            let deps_dir = request.package_output_dir("gomod")?;
            (
                deps_dir.path().to_path_buf(),
                deps_dir.path().join("cache"),
                deps_dir.path().join("pkg/mod"),
            )
        }
    };
    Ok(GoEnv {
        gopath: gopath.display().to_string(),
        gocache: gocache.display().to_string(),
        gomodcache: gomodcache.display().to_string(),
        goproxy: request.config.goproxy_url.clone(),
        gotoolchain: policy.gotoolchain.clone(),
        cgo_enabled: request.has_flag(Flag::CgoDisable).then(|| "0".to_string()),
        goflags: String::new(),
    })
}

struct ModuleResolution {
    components: Vec<Component>,
    vendored: bool,
}

async fn resolve_module(
    request: &Request,
    module_dir: &RootedPath,
    policy: &ToolchainPolicy,
) -> Result<ModuleResolution> {
    info!(
        "fetching the gomod dependencies at {:?}",
        module_dir.subpath_from_root()
    );
    parser::protect_against_symlinks(module_dir)?;

    let vendor_dir = module_dir.path().join("vendor");
    let should_vendor = request.has_flag(Flag::GomodVendorCheck)
        || (vendor_dir.is_dir() && std::fs::read_dir(&vendor_dir)?.next().is_some());
    let can_make_changes = !vendor_dir.exists();

    // the vendored flow keeps the module cache in a scratch dir so that
    // deps/gomod/pkg/mod stays empty
    let scratch = if should_vendor {
        Some(tempfile::tempdir().context("failed to create a scratch go cache")?)
    } else {
        None
    };
    let env = go_env(request, module_dir, policy, scratch.as_ref().map(|dir| dir.path()))?;
    let timeout = request.config.subprocess_timeout;
    let cwd = module_dir.path();

    let downloaded_modules: Vec<ParsedModule> = if should_vendor {
        info!("vendoring the gomod dependencies");
        parser::run_download(&["mod", "vendor"], &env, cwd, timeout).await?;
        if !can_make_changes && vendor_changed(request, module_dir).await? {
            return Err(Cachi2Error::PackageRejected {
                reason: "the content of the vendor directory is not consistent with go.mod"
                    .to_string(),
                solution: Some(
                    "Please try running `go mod vendor` and committing the changes.\n\
                     Note that you may need to `git add --force` ignored files in the vendor/ dir."
                        .to_string(),
                ),
                docs: None,
            }
            .into());
        }
        parser::parse_vendor(module_dir)?
    } else {
        info!("downloading the gomod dependencies");
        let output =
            parser::run_download(&["mod", "download", "-json"], &env, cwd, timeout).await?;
        parser::load_json_stream(&output)?
    };

    if request.has_flag(Flag::ForceGomodTidy) {
        parser::run_go(&["mod", "tidy"], &env, cwd, false, timeout).await?;
    }

    // after the download phase, go must not touch the network
    let offline = !should_vendor;
    let mut list_args: Vec<&str> = vec!["list", "-e"];
    if !should_vendor {
        list_args.extend(["-mod", "readonly"]);
    }

    let main_module_name = {
        let mut args = list_args.clone();
        args.push("-m");
        parser::run_go(&args, &env, cwd, offline, timeout).await?.trim().to_string()
    };

    let go_list_deps = |pattern: &'static str| {
        let mut args = list_args.clone();
        args.extend(["-deps", "-json=ImportPath,Module,Standard,Deps", pattern]);
        let env = env.clone();
        async move {
            let output = parser::run_go(&args, &env, cwd, offline, timeout).await?;
            parser::load_json_stream::<ParsedPackage>(&output)
        }
    };

    // "all" gives the complete module list (including test-only deps)
    let all_pattern_packages = go_list_deps("all").await?;
    let package_modules: Vec<ParsedModule> = all_pattern_packages
        .iter()
        .filter_map(|pkg| pkg.module.clone())
        .filter(|module| !module.main)
        .collect();
    let all_modules = parser::deduplicate_resolved_modules(package_modules, downloaded_modules);
    parser::validate_local_replacements(&all_modules, module_dir)?;

    // "./..." gives the packages compiled into the final binary
    let all_packages = go_list_deps("./...").await?;

    let main_module = main_module(request, module_dir, &main_module_name).await?;
    build_components(request, module_dir, main_module, &all_modules, &all_packages).map(
        |components| ModuleResolution {
            components,
            vendored: should_vendor,
        },
    )
}

/// Compare the vendor directory against the committed state.
async fn vendor_changed(request: &Request, module_dir: &RootedPath) -> Result<bool> {
    let subpath = module_dir.subpath_from_root();
    let vendor = subpath.join("vendor");

    let changes = ToolCommand::new("git")
        .args(["status", "--porcelain", "--"])
        .arg(vendor.display().to_string())
        .current_dir(request.source_dir.path())
        .run()
        .await?;
    if changes.trim().is_empty() {
        return Ok(false);
    }
    tracing::error!("the vendor directory changed after running `go mod vendor`:\n{changes}");
    Ok(true)
}

/// The main module with its repo-derived version and real path.
struct MainModule {
    name: String,
    version: String,
    real_path: String,
}

async fn main_module(
    request: &Request,
    module_dir: &RootedPath,
    main_module_name: &str,
) -> Result<MainModule> {
    let repo_name = repository_name(request).await?;
    let subpath = module_dir.subpath_from_root().display().to_string();
    let real_path = if subpath.is_empty() || subpath == "." {
        repo_name
    } else {
        format!("{repo_name}/{subpath}")
    };
    let version = version::get_golang_version(
        main_module_name,
        request.source_dir.path(),
        &subpath,
    )
    .await?;
    Ok(MainModule {
        name: main_module_name.to_string(),
        version,
        real_path,
    })
}

/// The repository name resolved from the git origin URL: scheme, ssh user
/// and the .git suffix stripped.
async fn repository_name(request: &Request) -> Result<String> {
    let repo_id = crate::git::get_repo_id(request.source_dir.path()).await?;
    let url = repo_id.origin_url;
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("ssh://"))
        .unwrap_or(&url);
    let stripped = stripped.strip_prefix("git@").unwrap_or(stripped);
    Ok(stripped
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .replace(':', "/"))
}

fn module_purl(real_path: &str, version: &str) -> Purl {
    golang_purl(real_path, Some(version), "module")
}

fn golang_purl(path: &str, version: Option<&str>, package_type: &str) -> Purl {
    let (namespace, name) = match path.rsplit_once('/') {
        Some((namespace, name)) => (Some(namespace), name),
        None => (None, path),
    };
    let mut purl = Purl::new("golang", name).with_qualifier("type", package_type);
    if let Some(namespace) = namespace {
        purl = purl.with_namespace(namespace);
    }
    if let Some(version) = version {
        purl = purl.with_version(version);
    }
    purl
}

/// A resolved module ready for SBOM emission.
#[derive(Debug, Clone)]
struct Module {
    name: String,
    original_name: String,
    real_path: String,
    version: String,
    missing_hash: bool,
}

fn build_components(
    request: &Request,
    module_dir: &RootedPath,
    main_module: MainModule,
    parsed_modules: &[ParsedModule],
    parsed_packages: &[ParsedPackage],
) -> Result<Vec<Component>> {
    let go_sum_relpath = {
        let subpath = module_dir.subpath_from_root();
        if subpath == Path::new(".") || subpath.as_os_str().is_empty() {
            PathBuf::from("go.sum")
        } else {
            subpath.join("go.sum")
        }
    };
    let go_sum_entries = {
        let go_sum_path = module_dir.path().join("go.sum");
        if go_sum_path.is_file() {
            version::parse_go_sum(&std::fs::read_to_string(&go_sum_path)?)
        } else {
            HashSet::new()
        }
    };

    let main = Module {
        name: main_module.name.clone(),
        original_name: main_module.name.clone(),
        real_path: main_module.real_path,
        version: main_module.version,
        missing_hash: false,
    };

    let main_real_path = main.real_path.clone();
    let main_version = main.version.clone();
    let mut modules = vec![main];
    for parsed in parsed_modules {
        modules.push(create_module(
            module_dir,
            parsed,
            &go_sum_entries,
            &main_real_path,
            &main_version,
        )?);
    }

    let mut components = Vec::new();
    for module in &modules {
        let mut properties = Vec::new();
        if module.missing_hash {
            properties.push(Property::new(
                "cachi2:missing_hash:in_file",
                go_sum_relpath.display().to_string(),
            ));
        }
        components.push(
            Component::library(
                module.name.clone(),
                Some(module.version.clone()),
                module_purl(&module.real_path, &module.version),
            )
            .with_properties(properties),
        );
    }

    // packages refer to their parent module by its original (pre-replace) name
    let indexed_modules: BTreeMap<&str, &Module> = modules
        .iter()
        .map(|module| (module.original_name.as_str(), module))
        .collect();

    for package in parsed_packages {
        if package.standard {
            components.push(Component::library(
                package.import_path.clone(),
                None,
                golang_purl(&package.import_path, None, "package"),
            ));
            continue;
        }

        let parent = match &package.module {
            Some(module) => indexed_modules.get(module.path.as_str()).copied(),
            None => find_parent_module(&package.import_path, &indexed_modules),
        };
        let Some(parent) = parent else {
            return Err(Cachi2Error::InvalidInput(format!(
                "could not find the parent module of the Go package {}",
                package.import_path
            ))
            .into());
        };

        let relative = package
            .import_path
            .strip_prefix(&parent.original_name)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or_default();
        let (name, real_path) = if relative.is_empty() {
            (parent.name.clone(), parent.real_path.clone())
        } else {
            (
                format!("{}/{relative}", parent.name),
                format!("{}/{relative}", parent.real_path),
            )
        };

        let mut properties = Vec::new();
        if parent.missing_hash {
            properties.push(Property::new(
                "cachi2:missing_hash:in_file",
                go_sum_relpath.display().to_string(),
            ));
        }
        components.push(
            Component::library(
                name,
                Some(parent.version.clone()),
                golang_purl(&real_path, Some(&parent.version), "package"),
            )
            .with_properties(properties),
        );
    }

    Ok(components)
}

fn create_module(
    module_dir: &RootedPath,
    parsed: &ParsedModule,
    go_sum_entries: &HashSet<(String, String)>,
    main_real_path: &str,
    main_version: &str,
) -> Result<Module> {
    let module = match &parsed.replace {
        None => {
            let version = parsed.version.clone().unwrap_or_default();
            let missing_hash =
                !go_sum_entries.contains(&(parsed.path.clone(), version.clone()));
            Module {
                name: parsed.path.clone(),
                original_name: parsed.path.clone(),
                real_path: parsed.path.clone(),
                version,
                missing_hash,
            }
        }
        Some(replace) if replace.version.is_some() => {
            // module/name v1.0.0 => replace/name v1.2.3
            let version = replace.version.clone().unwrap_or_default();
            let missing_hash =
                !go_sum_entries.contains(&(replace.path.clone(), version.clone()));
            Module {
                name: replace.path.clone(),
                original_name: parsed.path.clone(),
                real_path: replace.path.clone(),
                version,
                missing_hash,
            }
        }
        Some(replace) => {
            // module/name v1.0.0 => ./local/path - a directory inside the repo
            module_dir.join_within_root(&replace.path)?;
            let real_path = normalize_path(&format!("{main_real_path}/{}", replace.path));
            Module {
                name: parsed.path.clone(),
                original_name: parsed.path.clone(),
                real_path,
                version: parsed
                    .version
                    .clone()
                    .unwrap_or_else(|| main_version.to_string()),
                missing_hash: false,
            }
        }
    };
    Ok(module)
}

/// Resolve "." and ".." segments in a slash-separated module path.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

fn find_parent_module<'a>(
    import_path: &str,
    indexed_modules: &BTreeMap<&str, &'a Module>,
) -> Option<&'a Module> {
    indexed_modules
        .iter()
        .filter(|(name, _)| {
            import_path == **name || import_path.starts_with(&format!("{name}/"))
        })
        .max_by_key(|(name, _)| name.len())
        .map(|(_, module)| *module)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_purl() {
        let purl = module_purl("github.com/release-engineering/retrodep/v2", "v2.1.0");
        assert_eq!(
            purl.to_string(),
            "pkg:golang/github.com/release-engineering/retrodep/v2@v2.1.0?type=module"
        );
    }

    #[test]
    fn test_stdlib_package_purl_has_no_version() {
        let purl = golang_purl("net/http", None, "package");
        assert_eq!(purl.to_string(), "pkg:golang/net/http?type=package");
        let purl = golang_purl("fmt", None, "package");
        assert_eq!(purl.to_string(), "pkg:golang/fmt?type=package");
    }

    #[test]
    fn test_find_parent_module_prefers_longest_match() {
        let module_a = Module {
            name: "example.com/a".into(),
            original_name: "example.com/a".into(),
            real_path: "example.com/a".into(),
            version: "v1.0.0".into(),
            missing_hash: false,
        };
        let module_ab = Module {
            name: "example.com/a/b".into(),
            original_name: "example.com/a/b".into(),
            real_path: "example.com/a/b".into(),
            version: "v2.0.0".into(),
            missing_hash: false,
        };
        let indexed: BTreeMap<&str, &Module> = [
            ("example.com/a", &module_a),
            ("example.com/a/b", &module_ab),
        ]
        .into_iter()
        .collect();

        let found = find_parent_module("example.com/a/b/c", &indexed).unwrap();
        assert_eq!(found.name, "example.com/a/b");
        // no false prefix matches: "example.com/ab" is not under "example.com/a"
        assert!(find_parent_module("other.org/x", &indexed).is_none());
    }

    #[test]
    fn test_missing_go_sum_entry_sets_property() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/go.mod"), "module m\n").unwrap();
        let packages = vec![serde_json::from_str(r#"{"type": "gomod"}"#).unwrap()];
        let request = Request::new(
            temp.path().join("src"),
            temp.path().join("out"),
            packages,
            Default::default(),
        )
        .unwrap();
        let module_dir = request.source_dir.clone();

        let parsed = ParsedModule {
            path: "example.com/unsummed".into(),
            version: Some("v1.0.0".into()),
            main: false,
            replace: None,
        };
        let module =
            create_module(&module_dir, &parsed, &HashSet::new(), "repo/m", "v1.0.0").unwrap();
        assert!(module.missing_hash);

        let mut entries = HashSet::new();
        entries.insert(("example.com/unsummed".to_string(), "v1.0.0".to_string()));
        let module = create_module(&module_dir, &parsed, &entries, "repo/m", "v1.0.0").unwrap();
        assert!(!module.missing_hash);
    }

    #[test]
    fn test_replaced_module_uses_replacement_identity() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/go.mod"), "module m\n").unwrap();
        let packages = vec![serde_json::from_str(r#"{"type": "gomod"}"#).unwrap()];
        let request = Request::new(
            temp.path().join("src"),
            temp.path().join("out"),
            packages,
            Default::default(),
        )
        .unwrap();
        let module_dir = request.source_dir.clone();

        let parsed = ParsedModule {
            path: "example.com/original".into(),
            version: Some("v1.0.0".into()),
            main: false,
            replace: Some(Box::new(ParsedModule {
                path: "example.com/fork".into(),
                version: Some("v1.0.1".into()),
                main: false,
                replace: None,
            })),
        };
        let module =
            create_module(&module_dir, &parsed, &HashSet::new(), "repo/m", "v1.0.0").unwrap();
        assert_eq!(module.name, "example.com/fork");
        assert_eq!(module.original_name, "example.com/original");
        assert_eq!(module.version, "v1.0.1");
    }
}
