//! Native `Gemfile.lock` parser.
//!
//! The lockfile is a line-oriented format with unindented section headers
//! (`GEM`, `GIT`, `PATH`, `PLATFORMS`, `DEPENDENCIES`, `CHECKSUMS`,
//! `BUNDLED WITH`). Source sections carry `remote:`/`revision:` attributes
//! and a `specs:` list where 4-space indentation marks a resolved gem and
//! deeper indentation marks its dependencies (which we do not need - every
//! resolved gem has its own 4-space entry).

use crate::core::Cachi2Error;
use crate::paths::RootedPath;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const GEMFILE: &str = "Gemfile";
pub const GEMFILE_LOCK: &str = "Gemfile.lock";

/// A gem resolved from a rubygems remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GemDependency {
    pub name: String,
    pub version: String,
    /// The remote URL of the serving gem source.
    pub source: String,
    /// Platform suffix for binary gems (e.g. `x86_64-linux`), if any.
    pub platform: Option<String>,
    /// sha256 digest from the `CHECKSUMS` section, when the lockfile has one.
    pub checksum: Option<String>,
}

impl GemDependency {
    /// Remote location to download this gem from.
    pub fn remote_location(&self) -> String {
        format!(
            "{}/gems/{}.gem",
            self.source.trim_end_matches('/'),
            self.file_stem()
        )
    }

    /// `<name>-<version>[-<platform>]`, the gem's canonical file stem.
    pub fn file_stem(&self) -> String {
        match &self.platform {
            Some(platform) => format!("{}-{}-{platform}", self.name, self.version),
            None => format!("{}-{}", self.name, self.version),
        }
    }
}

/// A gem coming from a git repository at a pinned revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitDependency {
    pub name: String,
    pub version: String,
    pub url: String,
    /// Full 40-hex commit.
    pub ref_: String,
}

impl GitDependency {
    /// Directory name of the unpacked working tree in the cache:
    /// `<repo basename>-<first 12 hex of the commit>`.
    pub fn cache_dir_name(&self) -> String {
        let basename = self
            .url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.url)
            .trim_end_matches(".git");
        format!("{basename}-{}", &self.ref_[..12])
    }
}

/// A gem located inside the project tree itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDependency {
    pub name: String,
    pub version: String,
    /// Subpath from the package root.
    pub subpath: PathBuf,
}

/// One parsed dependency of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundlerDependency {
    Gem(GemDependency),
    Git(GitDependency),
    Path(PathDependency),
}

static SPEC_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^    (\S+) \(([^()]+)\)$").unwrap());
static CHECKSUM_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^  (\S+) \(([^()]+)\)(?: sha256=([0-9a-f]{64}))?").unwrap());
static FULL_COMMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{40}$").unwrap());

#[derive(Debug, PartialEq)]
enum Section {
    Gem,
    Git,
    Path,
    Checksums,
    Other,
}

/// Parse a `Gemfile.lock` and return the full dependency list.
///
/// `package_dir` confines PATH dependencies to the package root.
pub fn parse_lockfile(
    package_dir: &RootedPath,
) -> Result<Vec<BundlerDependency>, Cachi2Error> {
    let lockfile_path = package_dir.join_within_root(GEMFILE_LOCK)?;
    let gemfile_path = package_dir.join_within_root(GEMFILE)?;
    if !lockfile_path.path().exists() || !gemfile_path.path().exists() {
        return Err(Cachi2Error::PackageRejected {
            reason: "Gemfile and Gemfile.lock must be present in the package directory"
                .to_string(),
            solution: Some(
                "Run `bundle init` to generate the Gemfile.\n\
                 Run `bundle lock` to generate the Gemfile.lock."
                    .to_string(),
            ),
            docs: None,
        });
    }

    let content = std::fs::read_to_string(lockfile_path.path())?;
    parse_lockfile_content(&content, lockfile_path.path(), package_dir)
}

fn parse_lockfile_content(
    content: &str,
    lockfile_path: &Path,
    package_dir: &RootedPath,
) -> Result<Vec<BundlerDependency>, Cachi2Error> {
    let lockfile_error = |line_no: usize, reason: String| Cachi2Error::LockfileError {
        reason,
        file: lockfile_path.to_path_buf(),
        line: Some(line_no),
        solution: None,
    };

    let mut dependencies: Vec<BundlerDependency> = Vec::new();
    let mut checksums: HashMap<String, String> = HashMap::new();

    let mut section = Section::Other;
    let mut remote: Option<String> = None;
    let mut revision: Option<String> = None;
    let mut in_specs = false;

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.is_empty() {
            continue;
        }

        if !line.starts_with(' ') {
            section = match line {
                "GEM" => Section::Gem,
                "GIT" => Section::Git,
                "PATH" => Section::Path,
                "CHECKSUMS" => Section::Checksums,
                _ => Section::Other,
            };
            remote = None;
            revision = None;
            in_specs = false;
            continue;
        }

        match section {
            Section::Checksums => {
                if let Some(captures) = CHECKSUM_LINE.captures(line) {
                    if let Some(digest) = captures.get(3) {
                        checksums.insert(
                            format!("{} ({})", &captures[1], &captures[2]),
                            digest.as_str().to_string(),
                        );
                    }
                }
            }
            Section::Gem | Section::Git | Section::Path => {
                if let Some(value) = line.strip_prefix("  remote: ") {
                    remote = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("  revision: ") {
                    revision = Some(value.trim().to_string());
                } else if line == "  specs:" {
                    in_specs = true;
                } else if in_specs {
                    let Some(captures) = SPEC_LINE.captures(line) else {
                        // deeper indentation: a spec's own dependency list
                        continue;
                    };
                    let name = captures[1].to_string();
                    let raw_version = captures[2].to_string();
                    let remote = remote.clone().ok_or_else(|| {
                        lockfile_error(line_no, "spec appears before its source remote".into())
                    })?;

                    match section {
                        Section::Gem => {
                            let (version, platform) = split_platform(&raw_version);
                            dependencies.push(BundlerDependency::Gem(GemDependency {
                                checksum: None,
                                name,
                                version,
                                source: remote,
                                platform,
                            }));
                        }
                        Section::Git => {
                            let ref_ = revision.clone().ok_or_else(|| {
                                lockfile_error(
                                    line_no,
                                    "GIT section is missing its revision".into(),
                                )
                            })?;
                            if !FULL_COMMIT.is_match(&ref_) {
                                return Err(lockfile_error(
                                    line_no,
                                    format!(
                                        "git revision is not a full commit hash: {ref_:?}"
                                    ),
                                ));
                            }
                            dependencies.push(BundlerDependency::Git(GitDependency {
                                name,
                                version: raw_version,
                                url: remote,
                                ref_: ref_.to_lowercase(),
                            }));
                        }
                        Section::Path => {
                            let subpath = PathBuf::from(&remote);
                            package_dir.join_within_root(&subpath).map_err(|_| {
                                Cachi2Error::PackageRejected {
                                    reason: format!(
                                        "PATH dependency {remote:?} is not within the package root"
                                    ),
                                    solution: Some(
                                        "PATH dependencies must live inside the repository."
                                            .to_string(),
                                    ),
                                    docs: None,
                                }
                            })?;
                            dependencies.push(BundlerDependency::Path(PathDependency {
                                name,
                                version: raw_version,
                                subpath,
                            }));
                        }
                        _ => unreachable!(),
                    }
                }
            }
            Section::Other => {}
        }
    }

    // Attach checksums from the CHECKSUMS section to their gems.
    if !checksums.is_empty() {
        for dependency in &mut dependencies {
            if let BundlerDependency::Gem(gem) = dependency {
                let key = match &gem.platform {
                    Some(platform) => format!("{} ({}-{platform})", gem.name, gem.version),
                    None => format!("{} ({})", gem.name, gem.version),
                };
                gem.checksum = checksums.get(&key).cloned();
            }
        }
    }

    Ok(dependencies)
}

/// Split a lockfile version like `1.15.4-x86_64-linux` into the version and
/// the platform suffix.
fn split_platform(raw: &str) -> (String, Option<String>) {
    match raw.split_once('-') {
        Some((version, platform)) => (version.to_string(), Some(platform.to_string())),
        None => (raw.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const SAMPLE: &str = "\
GIT
  remote: https://github.com/x/y
  revision: abcdef0123456789abcdef0123456789abcdef01
  specs:
    y (0.1.0)

GEM
  remote: https://rubygems.org/
  specs:
    rake (13.0.6)
    nokogiri (1.15.4-x86_64-linux)
      racc (~> 1.4)
    racc (1.7.1)

PATH
  remote: gems/inner
  specs:
    inner (0.2.0)

PLATFORMS
  ruby
  x86_64-linux

DEPENDENCIES
  inner!
  nokogiri
  rake
  y!

BUNDLED WITH
   2.4.10
";

    fn package_with_lockfile(content: &str) -> (tempfile::TempDir, RootedPath) {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(GEMFILE), "source 'https://rubygems.org'\n").unwrap();
        fs::write(temp.path().join(GEMFILE_LOCK), content).unwrap();
        fs::create_dir_all(temp.path().join("gems/inner")).unwrap();
        let root = RootedPath::new(temp.path()).unwrap();
        (temp, root)
    }

    #[test]
    fn test_parses_all_sections() {
        let (_temp, package_dir) = package_with_lockfile(SAMPLE);
        let deps = parse_lockfile(&package_dir).unwrap();
        assert_eq!(deps.len(), 5);

        let gems: Vec<_> = deps
            .iter()
            .filter_map(|d| match d {
                BundlerDependency::Gem(g) => Some(g),
                _ => None,
            })
            .collect();
        assert_eq!(gems.len(), 3);
        assert_eq!(gems[0].name, "rake");
        assert_eq!(gems[0].version, "13.0.6");
        assert_eq!(gems[0].platform, None);
        assert_eq!(
            gems[0].remote_location(),
            "https://rubygems.org/gems/rake-13.0.6.gem"
        );

        let binary = gems.iter().find(|g| g.name == "nokogiri").unwrap();
        assert_eq!(binary.version, "1.15.4");
        assert_eq!(binary.platform.as_deref(), Some("x86_64-linux"));
        assert_eq!(binary.file_stem(), "nokogiri-1.15.4-x86_64-linux");
    }

    #[test]
    fn test_git_dependency() {
        let (_temp, package_dir) = package_with_lockfile(SAMPLE);
        let deps = parse_lockfile(&package_dir).unwrap();
        let git = deps
            .iter()
            .find_map(|d| match d {
                BundlerDependency::Git(g) => Some(g),
                _ => None,
            })
            .unwrap();
        assert_eq!(git.name, "y");
        assert_eq!(git.url, "https://github.com/x/y");
        assert_eq!(git.ref_, "abcdef0123456789abcdef0123456789abcdef01");
        assert_eq!(git.cache_dir_name(), "y-abcdef012345");
    }

    #[test]
    fn test_path_dependency_confinement() {
        let (_temp, package_dir) = package_with_lockfile(SAMPLE);
        let deps = parse_lockfile(&package_dir).unwrap();
        let path = deps
            .iter()
            .find_map(|d| match d {
                BundlerDependency::Path(p) => Some(p),
                _ => None,
            })
            .unwrap();
        assert_eq!(path.subpath, PathBuf::from("gems/inner"));

        let escaping = SAMPLE.replace("remote: gems/inner", "remote: ../outside");
        let (_temp2, package_dir2) = package_with_lockfile(&escaping);
        assert!(parse_lockfile(&package_dir2).is_err());
    }

    #[test]
    fn test_short_git_revision_is_rejected() {
        let truncated = SAMPLE.replace("abcdef0123456789abcdef0123456789abcdef01", "abcdef");
        let (_temp, package_dir) = package_with_lockfile(&truncated);
        let err = parse_lockfile(&package_dir).unwrap_err();
        assert!(matches!(err, Cachi2Error::LockfileError { .. }));
    }

    #[test]
    fn test_missing_gemfile_is_rejected() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join(GEMFILE_LOCK), SAMPLE).unwrap();
        let root = RootedPath::new(temp.path()).unwrap();
        let err = parse_lockfile(&root).unwrap_err();
        assert!(matches!(err, Cachi2Error::PackageRejected { .. }));
    }

    #[test]
    fn test_checksums_section_is_attached() {
        let with_checksums = format!(
            "{SAMPLE}\nCHECKSUMS\n  rake (13.0.6) sha256={}\n",
            "ab".repeat(32)
        );
        let (_temp, package_dir) = package_with_lockfile(&with_checksums);
        let deps = parse_lockfile(&package_dir).unwrap();
        let rake = deps
            .iter()
            .find_map(|d| match d {
                BundlerDependency::Gem(g) if g.name == "rake" => Some(g),
                _ => None,
            })
            .unwrap();
        assert_eq!(rake.checksum.as_deref(), Some("ab".repeat(32).as_str()));
    }
}
