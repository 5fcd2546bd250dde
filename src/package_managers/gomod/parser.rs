//! Driving the go toolchain and parsing its JSON output.
//!
//! All go invocations run in an isolated environment (GOPATH, GOCACHE and
//! GOMODCACHE under the control of the resolver) and go through the shared
//! [`ToolCommand`] builder. Download commands get retries (go is bad at
//! retrying network errors itself); enumeration commands run with
//! `GOPROXY=off` so that any attempt to reach the network after the
//! download phase fails loudly.

use crate::core::Cachi2Error;
use crate::paths::RootedPath;
use crate::utils::ToolCommand;
use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// How many times download commands are attempted.
const DOWNLOAD_MAX_TRIES: usize = 5;

/// A Go module as returned by the `-json` option of various commands
/// (relevant fields only). See `go help mod download` and `go help list`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ParsedModule {
    pub path: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub main: bool,
    #[serde(default)]
    pub replace: Option<Box<ParsedModule>>,
}

/// A Go package as returned by the `-json` option of `go list`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct ParsedPackage {
    pub import_path: String,
    #[serde(default)]
    pub standard: bool,
    #[serde(default)]
    pub module: Option<ParsedModule>,
}

/// Environment for the go subprocesses of one module resolution.
#[derive(Debug, Clone)]
pub struct GoEnv {
    pub gopath: String,
    pub gocache: String,
    pub gomodcache: String,
    pub goproxy: String,
    pub gotoolchain: String,
    pub cgo_enabled: Option<String>,
    pub goflags: String,
}

impl GoEnv {
    fn apply(&self, mut command: ToolCommand, offline: bool) -> ToolCommand {
        command = command
            .env("GO111MODULE", "on")
            .env("GOPATH", &self.gopath)
            .env("GOCACHE", &self.gocache)
            .env("GOMODCACHE", &self.gomodcache)
            .env("GOTOOLCHAIN", &self.gotoolchain)
            .env("GOFLAGS", &self.goflags)
            .env("PATH", std::env::var("PATH").unwrap_or_default())
            .env("HOME", std::env::var("HOME").unwrap_or_default());
        command = if offline {
            command.env("GOPROXY", "off")
        } else {
            command.env("GOPROXY", &self.goproxy)
        };
        if let Some(ref cgo) = self.cgo_enabled {
            command = command.env("CGO_ENABLED", cgo);
        }
        command
    }
}

/// Run a go command, mapping failures to [`Cachi2Error::ToolError`].
pub async fn run_go(
    args: &[&str],
    env: &GoEnv,
    cwd: &Path,
    offline: bool,
    timeout: Duration,
) -> Result<String> {
    let command = ToolCommand::new("go")
        .args(args.iter().copied())
        .current_dir(cwd)
        .with_timeout(timeout);
    env.apply(command, offline).run().await
}

/// Run a go command that downloads dependencies, retrying transient
/// failures with exponential backoff (1s, 2s, 4s, ...).
pub async fn run_download(
    args: &[&str],
    env: &GoEnv,
    cwd: &Path,
    timeout: Duration,
) -> Result<String> {
    let mut delay = Duration::from_secs(1);
    let mut last_error = None;
    for attempt in 1..=DOWNLOAD_MAX_TRIES {
        match run_go(args, env, cwd, false, timeout).await {
            Ok(output) => return Ok(output),
            Err(error) => {
                warn!("go download attempt {attempt}/{DOWNLOAD_MAX_TRIES} failed: {error:#}");
                last_error = Some(error);
                if attempt < DOWNLOAD_MAX_TRIES {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(Cachi2Error::ToolError {
        command: format!("go {}", args.join(" ")),
        stderr: format!(
            "tried the command {DOWNLOAD_MAX_TRIES} times, last error: {:#}",
            last_error.expect("looped at least once")
        ),
    }
    .into())
}

/// Parse a stream of concatenated JSON objects, as printed by
/// `go mod download -json` and `go list -json`.
pub fn load_json_stream<T: serde::de::DeserializeOwned>(stream: &str) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut deserializer = serde_json::Deserializer::from_str(stream).into_iter::<T>();
    for item in &mut deserializer {
        items.push(item?);
    }
    Ok(items)
}

/// Deduplicate modules reported by `go list` and `go mod download`.
///
/// The `go list` modules carry replace data and take precedence.
pub fn deduplicate_resolved_modules(
    package_modules: Vec<ParsedModule>,
    downloaded_modules: Vec<ParsedModule>,
) -> Vec<ParsedModule> {
    fn unique_key(module: &ParsedModule) -> (String, Option<String>) {
        match &module.replace {
            None => (module.path.clone(), module.version.clone()),
            Some(replace) if replace.version.is_some() => {
                (replace.path.clone(), replace.version.clone())
            }
            // module/name v1.0.0 => ./local/path
            Some(replace) => (module.path.clone(), Some(replace.path.clone())),
        }
    }

    let mut seen = std::collections::BTreeSet::new();
    let mut result = Vec::new();
    for module in package_modules.into_iter().chain(downloaded_modules) {
        if seen.insert(unique_key(&module)) {
            result.push(module);
        }
    }
    result
}

/// Local (filesystem) replacements must stay inside the repository.
pub fn validate_local_replacements(
    modules: &[ParsedModule],
    app_dir: &RootedPath,
) -> Result<(), Cachi2Error> {
    for module in modules {
        if let Some(ref replace) = module.replace {
            if replace.version.is_none()
                && (replace.path.starts_with("./") || replace.path.starts_with("../"))
            {
                debug!(
                    "validating local replacement {} => {}",
                    module.path, replace.path
                );
                app_dir.join_within_root(&replace.path)?;
            }
        }
    }
    Ok(())
}

/// Symlinked go files could make the go command read files outside the
/// repository; refuse them up front.
pub fn protect_against_symlinks(app_dir: &RootedPath) -> Result<(), Cachi2Error> {
    let check = |relative: &Path| -> Result<(), Cachi2Error> {
        app_dir.join_within_root(relative).map(|_| ()).map_err(|_| {
            Cachi2Error::PackageRejected {
                reason: format!(
                    "joining path '{}' to '{}': target is outside the source tree",
                    relative.display(),
                    app_dir.path().display()
                ),
                solution: Some(
                    "Found a potentially harmful symlink, which would make the go command read \
                     a file outside of your source repository. Refusing to proceed."
                        .to_string(),
                ),
                docs: None,
            }
        })
    };

    check(Path::new("go.mod"))?;
    check(Path::new("go.sum"))?;
    check(Path::new("vendor/modules.txt"))?;
    for entry in walkdir::WalkDir::new(app_dir.path()).into_iter().flatten() {
        if entry.path().extension().is_some_and(|ext| ext == "go") {
            if let Ok(relative) = entry.path().strip_prefix(app_dir.path()) {
                check(relative)?;
            }
        }
    }
    Ok(())
}

/// Parse `vendor/modules.txt` into the module list it vouches for.
///
/// Format: `# <module> <version>` lines introduce modules, `## explicit`
/// annotations and plain package lines follow.
pub fn parse_vendor(module_dir: &RootedPath) -> Result<Vec<ParsedModule>> {
    let modules_txt = module_dir.join_within_root("vendor/modules.txt")?;
    if !modules_txt.path().exists() {
        return Ok(vec![]);
    }
    let content = std::fs::read_to_string(modules_txt.path())?;

    let unexpected_format = |line: &str| Cachi2Error::LockfileError {
        reason: format!("vendor/modules.txt: unexpected format: {line:?}"),
        file: modules_txt.path().to_path_buf(),
        line: None,
        solution: None,
    };

    let mut modules = Vec::new();
    for line in content.lines() {
        if let Some(module_line) = line.strip_prefix("# ") {
            let parts: Vec<&str> = module_line.split_whitespace().collect();
            let module = match parts.as_slice() {
                // # <module> <version>
                [path, version] if version.starts_with('v') => ParsedModule {
                    path: (*path).to_string(),
                    version: Some((*version).to_string()),
                    main: false,
                    replace: None,
                },
                // # <module> => <replacement-path>
                [path, "=>", replacement] => ParsedModule {
                    path: (*path).to_string(),
                    version: None,
                    main: false,
                    replace: Some(Box::new(ParsedModule {
                        path: (*replacement).to_string(),
                        version: None,
                        main: false,
                        replace: None,
                    })),
                },
                // # <module> <version> => <replacement> <version>
                [path, version, "=>", replacement_path, replacement_version] => ParsedModule {
                    path: (*path).to_string(),
                    version: Some((*version).to_string()),
                    main: false,
                    replace: Some(Box::new(ParsedModule {
                        path: (*replacement_path).to_string(),
                        version: Some((*replacement_version).to_string()),
                        main: false,
                        replace: None,
                    })),
                },
                // # <module> <version> => <local-path>
                [path, version, "=>", replacement] => ParsedModule {
                    path: (*path).to_string(),
                    version: Some((*version).to_string()),
                    main: false,
                    replace: Some(Box::new(ParsedModule {
                        path: (*replacement).to_string(),
                        version: None,
                        main: false,
                        replace: None,
                    })),
                },
                [_single] => continue, // e.g. "# explicit" markers on old go versions
                _ => return Err(unexpected_format(line).into()),
            };
            modules.push(module);
        }
    }
    Ok(modules)
}
