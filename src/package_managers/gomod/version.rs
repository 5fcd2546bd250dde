//! Go version handling: the `go` directive policy, `go.sum` entries, and
//! resolving the main module's version from git metadata the way the go
//! tool itself would (exact tag, or a pseudo-version).

use crate::core::{Cachi2Error, package_rejected};
use crate::utils::ToolCommand;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;

/// A `major.minor[.patch]` Go version. Go language versions in `go.mod` may
/// omit the patch level; release versions never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GoVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl GoVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse(version: &str) -> Option<Self> {
        let version = version.trim().strip_prefix("go").unwrap_or(version.trim());
        let version = version.strip_prefix('v').unwrap_or(version);
        // cut off pre-release/metadata suffixes like rc1
        let numeric: String = version
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let mut parts = numeric.split('.').filter(|part| !part.is_empty());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|patch| patch.parse().ok()).unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

impl std::fmt::Display for GoVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// The toolchain selection for one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainPolicy {
    /// Value for the GOTOOLCHAIN variable during resolution and build.
    pub gotoolchain: String,
    /// The `go` directive, when present.
    pub directive: Option<GoVersion>,
}

/// The `go` directive in a go.mod file.
static GO_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*go\s+(\d+\.\d+(?:\.\d+)?(?:\w+)?)\s*$").unwrap());

pub fn parse_go_directive(go_mod_content: &str) -> Option<GoVersion> {
    GO_DIRECTIVE
        .captures(go_mod_content)
        .and_then(|captures| GoVersion::parse(&captures[1]))
}

/// Decide the toolchain policy for a module.
///
/// Modules with a `go` directive of 1.21 or newer opt in to toolchain
/// switching: the host toolchain floors at `<major>.<minor>.0` and
/// `GOTOOLCHAIN=auto` lets go self-upgrade to the requested release. When
/// the requested micro version is above what the host can provide, the host
/// ceiling wins (the policy clamps rather than refusing). Older directives
/// must be satisfiable by the host toolchain directly.
pub fn toolchain_policy(
    go_mod_content: &str,
    host_version: GoVersion,
) -> Result<ToolchainPolicy, Cachi2Error> {
    let directive = parse_go_directive(go_mod_content);

    match directive {
        Some(requested) if requested >= GoVersion::new(1, 21, 0) => Ok(ToolchainPolicy {
            gotoolchain: "auto".to_string(),
            directive: Some(requested),
        }),
        Some(requested) => {
            if GoVersion::new(requested.major, requested.minor, 0)
                > GoVersion::new(host_version.major, host_version.minor, 0)
            {
                return Err(package_rejected(
                    format!(
                        "the module requires Go {requested} but the host toolchain is \
                         {host_version} and toolchain switching requires a 'go' directive \
                         of 1.21 or newer"
                    ),
                    "Please lower the go directive in go.mod or build with a newer Go toolchain.",
                ));
            }
            Ok(ToolchainPolicy {
                gotoolchain: "local".to_string(),
                directive: Some(requested),
            })
        }
        None => Ok(ToolchainPolicy {
            gotoolchain: "local".to_string(),
            directive: None,
        }),
    }
}

/// Parse the host `go version` output, e.g.
/// `go version go1.21.5 linux/amd64`.
pub fn parse_host_go_version(version_output: &str) -> Option<GoVersion> {
    version_output
        .split_whitespace()
        .find(|word| word.starts_with("go1") || word.starts_with("go2"))
        .and_then(GoVersion::parse)
}

/// The set of `module@version` pairs that have a content hash in go.sum.
///
/// Each go.sum line is `<module> <version>[/go.mod] <hash>`; only the
/// content entries (without the `/go.mod` suffix) vouch for the module zip.
pub fn parse_go_sum(go_sum_content: &str) -> HashSet<(String, String)> {
    let mut entries = HashSet::new();
    for line in go_sum_content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(module), Some(version), Some(_hash)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if version.ends_with("/go.mod") {
            continue;
        }
        entries.insert((module.to_string(), version.to_string()));
    }
    entries
}

static SEMVER_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^v(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)(?P<rest>[-+].*)?$").unwrap()
});

fn parse_semver_tag(tag: &str) -> Option<(u64, u64, u64, String)> {
    let captures = SEMVER_TAG.captures(tag)?;
    Some((
        captures["major"].parse().ok()?,
        captures["minor"].parse().ok()?,
        captures["patch"].parse().ok()?,
        captures.name("rest").map_or(String::new(), |m| m.as_str().to_string()),
    ))
}

/// Resolve the version of the main module the way `go` would: an exact
/// semver tag on HEAD if there is one, otherwise a pseudo-version derived
/// from the latest reachable tag, the commit timestamp and the abbreviated
/// commit hash.
///
/// For modules in a subdirectory of the repository, tags must be prefixed
/// with the subpath (e.g. `submodule/v1.0.0`).
pub async fn get_golang_version(module_name: &str, app_dir: &Path, subpath: &str) -> Result<String> {
    let tag_prefix = if subpath.is_empty() || subpath == "." {
        String::new()
    } else {
        format!("{subpath}/")
    };

    // major version suffix of the module (e.g. /v2) constrains which tags apply
    let major_suffix: Option<u64> = module_name
        .rsplit('/')
        .next()
        .and_then(|last| last.strip_prefix('v'))
        .and_then(|version| version.parse().ok());

    let matches_major = |major: u64| match major_suffix {
        Some(suffix) => major == suffix,
        None => major <= 1,
    };

    // exact tags pointing at HEAD win
    let exact_tags = ToolCommand::new("git")
        .args(["tag", "--points-at", "HEAD"])
        .current_dir(app_dir)
        .run()
        .await?;
    let best_exact = exact_tags
        .lines()
        .filter_map(|tag| tag.strip_prefix(tag_prefix.as_str()))
        .filter_map(|tag| parse_semver_tag(tag).map(|parsed| (parsed, tag.to_string())))
        .filter(|((major, _, _, _), _)| matches_major(*major))
        .max();
    if let Some((_, tag)) = best_exact {
        return Ok(tag);
    }

    // otherwise, build a pseudo-version from the latest reachable tag
    let head_info = ToolCommand::new("git")
        .args(["log", "-1", "--format=%H %ct"])
        .current_dir(app_dir)
        .run()
        .await?;
    let mut parts = head_info.split_whitespace();
    let commit = parts.next().unwrap_or_default();
    let timestamp: i64 = parts.next().and_then(|t| t.parse().ok()).unwrap_or(0);
    let short_commit = &commit[..commit.len().min(12)];
    let utc_time = chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .unwrap_or(chrono::DateTime::UNIX_EPOCH)
        .format("%Y%m%d%H%M%S");

    let described = ToolCommand::new("git")
        .args([
            "describe",
            "--tags",
            "--abbrev=0",
            "--match",
            &format!("{tag_prefix}v*"),
        ])
        .current_dir(app_dir)
        .run()
        .await
        .ok();

    let base_tag = described
        .as_deref()
        .map(str::trim)
        .and_then(|tag| tag.strip_prefix(tag_prefix.as_str()))
        .and_then(|tag| parse_semver_tag(tag).map(|parsed| (parsed, tag.to_string())))
        .filter(|((major, _, _, _), _)| matches_major(*major));

    let version = match base_tag {
        Some(((major, minor, patch, rest), _)) if rest.is_empty() => {
            // vX.Y.(Z+1)-0.<timestamp>-<commit>
            format!("v{major}.{minor}.{}-0.{utc_time}-{short_commit}", patch + 1)
        }
        Some(((major, minor, patch, rest), _)) => {
            // vX.Y.Z-pre.0.<timestamp>-<commit>
            format!("v{major}.{minor}.{patch}{rest}.0.{utc_time}-{short_commit}")
        }
        None => {
            let major = major_suffix.unwrap_or(0);
            format!("v{major}.0.0-{utc_time}-{short_commit}")
        }
    };
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_go_version_parse() {
        assert_eq!(GoVersion::parse("1.21"), Some(GoVersion::new(1, 21, 0)));
        assert_eq!(GoVersion::parse("go1.21.5"), Some(GoVersion::new(1, 21, 5)));
        assert_eq!(GoVersion::parse("1.18"), Some(GoVersion::new(1, 18, 0)));
        assert_eq!(GoVersion::parse("not-a-version"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(GoVersion::new(1, 21, 0) > GoVersion::new(1, 20, 14));
        assert!(GoVersion::new(1, 21, 5) > GoVersion::new(1, 21, 0));
    }

    #[test]
    fn test_parse_go_directive() {
        let go_mod = "module example.com/foo\n\ngo 1.21.3\n\nrequire example.com/bar v1.0.0\n";
        assert_eq!(parse_go_directive(go_mod), Some(GoVersion::new(1, 21, 3)));
        assert_eq!(parse_go_directive("module example.com/foo\n"), None);
    }

    #[test]
    fn test_toolchain_policy_for_modern_modules() {
        let go_mod = "module m\n\ngo 1.22.1\n";
        let policy = toolchain_policy(go_mod, GoVersion::new(1, 21, 5)).unwrap();
        assert_eq!(policy.gotoolchain, "auto");
    }

    #[test]
    fn test_toolchain_policy_for_old_modules() {
        let go_mod = "module m\n\ngo 1.18\n";
        let policy = toolchain_policy(go_mod, GoVersion::new(1, 21, 5)).unwrap();
        assert_eq!(policy.gotoolchain, "local");
    }

    #[test]
    fn test_toolchain_policy_rejects_unsatisfiable_directive() {
        // pre-1.21 directives cannot trigger a toolchain upgrade
        let go_mod = "module m\n\ngo 1.20\n";
        assert!(toolchain_policy(go_mod, GoVersion::new(1, 19, 10)).is_err());
    }

    #[test]
    fn test_parse_host_go_version() {
        assert_eq!(
            parse_host_go_version("go version go1.21.5 linux/amd64"),
            Some(GoVersion::new(1, 21, 5))
        );
        assert_eq!(parse_host_go_version("gibberish"), None);
    }

    #[test]
    fn test_parse_go_sum() {
        let go_sum = "\
github.com/go-logr/logr v1.2.3 h1:abc=\n\
github.com/go-logr/logr v1.2.3/go.mod h1:def=\n\
golang.org/x/net v0.17.0/go.mod h1:ghi=\n";
        let entries = parse_go_sum(go_sum);
        assert!(entries.contains(&("github.com/go-logr/logr".to_string(), "v1.2.3".to_string())));
        // only a /go.mod entry: the module zip itself is not vouched for
        assert!(!entries.contains(&("golang.org/x/net".to_string(), "v0.17.0".to_string())));
    }

    #[test]
    fn test_parse_semver_tag() {
        assert_eq!(parse_semver_tag("v1.2.3"), Some((1, 2, 3, String::new())));
        assert_eq!(
            parse_semver_tag("v2.0.0-rc1"),
            Some((2, 0, 0, "-rc1".to_string()))
        );
        assert_eq!(parse_semver_tag("1.2.3"), None);
        assert_eq!(parse_semver_tag("vendor"), None);
    }
}
