//! Parsing of Yarn Berry locator strings.
//!
//! A locator looks like `[@scope/]name@<protocol>:<reference>`, e.g.
//! `@babel/core@npm:7.21.0` or
//! `left-pad@patch:left-pad@npm%3A1.3.0#./fix.patch::version=1.3.0&hash=abc`.
//!
//! Supported protocols: `npm:`, `workspace:`, `patch:`, `file:`, `portal:`,
//! `link:` and plain `https://` tarball URLs. `exec:`, `git:` and `github:`
//! locators are refused.

use crate::core::Cachi2Error;
use crate::purl::percent_decode;
use std::path::PathBuf;

/// A parsed locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Npm {
        scope: Option<String>,
        name: String,
        version: String,
    },
    Workspace {
        scope: Option<String>,
        name: String,
        relpath: PathBuf,
    },
    Patch {
        scope: Option<String>,
        name: String,
        /// The decoded locator of the package being patched.
        inner_locator: String,
        /// Path to the patch file, when not a built-in patch.
        patch_path: Option<PathBuf>,
    },
    File {
        scope: Option<String>,
        name: String,
        relpath: PathBuf,
    },
    Portal {
        scope: Option<String>,
        name: String,
        relpath: PathBuf,
    },
    Link {
        scope: Option<String>,
        name: String,
        relpath: PathBuf,
    },
    Https {
        scope: Option<String>,
        name: String,
        url: String,
    },
}

impl Locator {
    /// The package name including the scope, e.g. `@babel/core`.
    pub fn scoped_name(&self) -> String {
        let (scope, name) = match self {
            Locator::Npm { scope, name, .. }
            | Locator::Workspace { scope, name, .. }
            | Locator::Patch { scope, name, .. }
            | Locator::File { scope, name, .. }
            | Locator::Portal { scope, name, .. }
            | Locator::Link { scope, name, .. }
            | Locator::Https { scope, name, .. } => (scope, name),
        };
        match scope {
            Some(scope) => format!("@{scope}/{name}"),
            None => name.clone(),
        }
    }
}

/// Parse a locator string from the `yarn info` output.
pub fn parse_locator(raw: &str) -> Result<Locator, Cachi2Error> {
    let invalid =
        || Cachi2Error::InvalidInput(format!("could not parse the yarn locator {raw:?}"));
    let refused = |protocol: &str| Cachi2Error::UnsupportedFeature {
        reason: format!("{protocol} locators are not supported with yarn Berry: {raw}"),
        solution: Some(
            "Please replace the dependency with a registry, file or plain https tarball one."
                .to_string(),
        ),
        docs: None,
    };

    // split "[@scope/]name" from the reference
    let (scope, rest) = match raw.strip_prefix('@') {
        Some(rest) => {
            let (scope, rest) = rest.split_once('/').ok_or_else(invalid)?;
            (Some(scope.to_string()), rest)
        }
        None => (None, raw),
    };
    let (name, reference) = rest.split_once('@').ok_or_else(invalid)?;
    let name = name.to_string();
    if name.is_empty() || reference.is_empty() {
        return Err(invalid());
    }

    if let Some(version) = reference.strip_prefix("npm:") {
        return Ok(Locator::Npm {
            scope,
            name,
            version: version.to_string(),
        });
    }
    if let Some(relpath) = reference.strip_prefix("workspace:") {
        return Ok(Locator::Workspace {
            scope,
            name,
            relpath: PathBuf::from(relpath),
        });
    }
    if let Some(reference) = reference.strip_prefix("patch:") {
        // patch:<inner>#<patch-path>::<params>
        let without_params = reference.split_once("::").map_or(reference, |(body, _)| body);
        let (inner, patch) = match without_params.split_once('#') {
            Some((inner, patch)) => (inner, Some(patch)),
            None => (without_params, None),
        };
        let patch_path = patch
            .filter(|patch| !patch.starts_with("~builtin<") && !patch.starts_with("builtin<"))
            .map(PathBuf::from);
        return Ok(Locator::Patch {
            scope,
            name,
            inner_locator: percent_decode(inner),
            patch_path,
        });
    }
    // file:./path::locator=ctx -> ./path
    let strip_params =
        |reference: &str| PathBuf::from(reference.split_once("::").map_or(reference, |(p, _)| p));
    if let Some(reference) = reference.strip_prefix("file:") {
        return Ok(Locator::File {
            scope,
            name,
            relpath: strip_params(reference),
        });
    }
    if let Some(reference) = reference.strip_prefix("portal:") {
        return Ok(Locator::Portal {
            scope,
            name,
            relpath: strip_params(reference),
        });
    }
    if let Some(reference) = reference.strip_prefix("link:") {
        return Ok(Locator::Link {
            scope,
            name,
            relpath: strip_params(reference),
        });
    }
    if reference.starts_with("https://") {
        if reference.contains(".git#") || reference.contains("commit=") {
            return Err(refused("git"));
        }
        return Ok(Locator::Https {
            scope,
            name,
            url: reference.to_string(),
        });
    }
    for banned in ["exec:", "git:", "git+ssh:", "git+https:", "github:"] {
        if reference.starts_with(banned) {
            return Err(refused(banned.trim_end_matches(':')));
        }
    }
    Err(Cachi2Error::UnsupportedFeature {
        reason: format!("unsupported yarn locator protocol: {raw}"),
        solution: None,
        docs: None,
    })
}
