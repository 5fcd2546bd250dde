//! Parsing and re-rendering of pip requirements files.
//!
//! Supports the documented requirements-file syntax: line continuations,
//! comments, global and per-requirement options, PyPI requirements, and
//! direct-access URL/VCS requirements (`name @ https://...`). Local file
//! paths are not supported.

use crate::core::Cachi2Error;
use crate::purl::percent_decode;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Kind of a single requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementKind {
    Pypi,
    Url,
    Vcs,
}

/// One parsed requirement line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipRequirement {
    /// The package name, PEP 503 normalized.
    pub package: String,
    /// The package name as written in the requirements file.
    pub raw_package: String,
    pub kind: RequirementKind,
    pub extras: Vec<String>,
    /// `(operator, version)` pairs, e.g. `("==", "1.0.0")`.
    pub version_specs: Vec<(String, String)>,
    pub environment_marker: Option<String>,
    /// Values of `--hash` options, each `algorithm:digest`.
    pub hashes: Vec<String>,
    /// URL fragment qualifiers of a direct-access requirement.
    pub qualifiers: BTreeMap<String, String>,
    /// The requirement line without options.
    pub download_line: String,
    /// Per-requirement options other than `--hash` (i.e. `-e`/`--editable`).
    pub options: Vec<String>,
}

/// A parsed requirements file: global options plus requirements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipRequirementsFile {
    pub requirements: Vec<PipRequirement>,
    pub options: Vec<String>,
}

const URL_SCHEMES: &[&str] = &["http", "https", "ftp"];
const VCS_SCHEMES: &[&str] = &[
    "bzr", "bzr+ftp", "bzr+http", "bzr+https", "git", "git+ftp", "git+http", "git+https", "hg",
    "hg+ftp", "hg+http", "hg+https", "svn", "svn+ftp", "svn+http", "svn+https",
];

/// Options allowed in a requirements file, mapped to whether they take a
/// value.
static OPTIONS: Lazy<BTreeMap<&'static str, bool>> = Lazy::new(|| {
    BTreeMap::from([
        ("--constraint", true),
        ("--editable", false),
        ("--extra-index-url", true),
        ("--find-links", true),
        ("--hash", true),
        ("--index-url", true),
        ("--no-binary", true),
        ("--no-index", false),
        ("--only-binary", true),
        ("--pre", false),
        ("--prefer-binary", false),
        ("--require-hashes", false),
        ("--requirement", true),
        ("--trusted-host", true),
        ("--use-feature", true),
        ("-c", true),
        ("-e", false),
        ("-f", true),
        ("-i", true),
        ("-r", true),
    ])
});

/// Options that apply to a single requirement rather than the whole file.
const REQUIREMENT_OPTIONS: &[&str] = &["-e", "--editable", "--hash"];

static NAME_AND_EXTRAS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<name>[A-Za-z0-9][A-Za-z0-9._-]*)\s*(?:\[(?P<extras>[^\]]*)\])?\s*(?P<rest>.*)$")
        .unwrap()
});
static VERSION_SPEC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(===|==|~=|!=|<=|>=|<|>)\s*(\S+)$").unwrap());
static HAS_NAME_IN_DIRECT_ACCESS: Lazy<Regex> = Lazy::new(|| Regex::new(r"@.+://").unwrap());
static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|\s)#.*$").unwrap());

/// PEP 503 name normalization: runs of `-`, `_`, `.` become a single `-`,
/// everything lowercased.
pub fn canonicalize_name(name: &str) -> String {
    static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-_.]+").unwrap());
    SEPARATORS.replace_all(name, "-").to_lowercase()
}

fn lockfile_error(file: &Path, line: Option<usize>, reason: String) -> Cachi2Error {
    Cachi2Error::LockfileError {
        reason,
        file: file.to_path_buf(),
        line,
        solution: None,
    }
}

impl PipRequirementsFile {
    /// Parse the requirements file at `path`.
    pub fn parse(path: &Path) -> Result<Self, Cachi2Error> {
        let content = std::fs::read_to_string(path)?;
        Self::parse_content(&content, path)
    }

    fn parse_content(content: &str, path: &Path) -> Result<Self, Cachi2Error> {
        let mut requirements = Vec::new();
        let mut options = Vec::new();

        for (line_no, line) in logical_lines(content) {
            let (global_options, requirement_options, requirement_line) =
                split_options_and_requirement(&line)
                    .map_err(|reason| lockfile_error(path, Some(line_no), reason))?;
            options.extend(global_options);
            if !requirement_line.is_empty() {
                requirements.push(
                    PipRequirement::from_line(&requirement_line, requirement_options)
                        .map_err(|e| match e {
                            Cachi2Error::InvalidInput(reason) => {
                                lockfile_error(path, Some(line_no), reason)
                            }
                            other => other,
                        })?,
                );
            } else if !requirement_options.is_empty() {
                return Err(lockfile_error(
                    path,
                    Some(line_no),
                    format!(
                        "requirements file option(s) {requirement_options:?} can only be applied \
                         to a requirement"
                    ),
                ));
            }
        }

        Ok(Self {
            requirements,
            options,
        })
    }

    /// Render the file back out (used for the rewritten requirements file).
    pub fn generate_file_content(&self) -> String {
        let mut out = String::new();
        if !self.options.is_empty() {
            out.push_str(&self.options.join(" "));
            out.push('\n');
        }
        for requirement in &self.requirements {
            out.push_str(&requirement.to_string());
            out.push('\n');
        }
        out
    }
}

/// Yield `(line number, logical line)` pairs: continuations joined, comments
/// stripped, blanks skipped.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut result = Vec::new();
    let mut buffer = String::new();
    let mut start_line = 0usize;

    for (index, line) in content.lines().enumerate() {
        if buffer.is_empty() {
            start_line = index + 1;
        }
        if let Some(stripped) = line.strip_suffix('\\') {
            buffer.push_str(stripped);
            continue;
        }
        buffer.push_str(line);
        let logical = LINE_COMMENT.replace(&buffer, "").trim().to_string();
        if !logical.is_empty() {
            result.push((start_line, logical));
        }
        buffer.clear();
    }
    if !buffer.is_empty() {
        let logical = LINE_COMMENT.replace(&buffer, "").trim().to_string();
        if !logical.is_empty() {
            result.push((start_line, logical));
        }
    }
    result
}

type SplitLine = (Vec<String>, Vec<String>, String);

fn split_options_and_requirement(line: &str) -> Result<SplitLine, String> {
    let mut global_options: Vec<String> = Vec::new();
    let mut requirement_options: Vec<String> = Vec::new();
    let mut requirement: Vec<String> = Vec::new();

    let mut requires_value = false;
    let mut last_was_requirement_option = false;

    for part in line.split_whitespace() {
        if requires_value {
            if last_was_requirement_option {
                requirement_options.push(part.to_string());
            } else {
                global_options.push(part.to_string());
            }
            requires_value = false;
        } else if part.starts_with('-') {
            let (option, value) = match part.split_once('=') {
                Some((option, value)) => (option, Some(value)),
                None => (part, None),
            };
            let Some(&takes_value) = OPTIONS.get(option) else {
                return Err(format!("unknown requirements file option {part:?}"));
            };
            if value.is_some() && !takes_value {
                return Err(format!("unexpected value for requirements file option {part:?}"));
            }

            last_was_requirement_option = REQUIREMENT_OPTIONS.contains(&option);
            let target = if last_was_requirement_option {
                &mut requirement_options
            } else {
                &mut global_options
            };
            target.push(option.to_string());
            if let Some(value) = value {
                target.push(value.to_string());
            } else {
                requires_value = takes_value;
            }
        } else {
            requirement.push(part.to_string());
        }
    }

    if requires_value {
        return Err("requirements file option requires a value".to_string());
    }

    Ok((global_options, requirement_options, requirement.join(" ")))
}

impl PipRequirement {
    /// Parse one requirement (without its options) plus its per-requirement
    /// options.
    pub fn from_line(line: &str, options: Vec<String>) -> Result<Self, Cachi2Error> {
        let (hashes, options) = split_hashes_from_options(options);

        match assess_direct_access(line)? {
            Some(kind) => Self::from_direct_access_line(line, kind, hashes, options),
            None => Self::from_pypi_line(line, hashes, options),
        }
    }

    fn from_pypi_line(
        line: &str,
        hashes: Vec<String>,
        options: Vec<String>,
    ) -> Result<Self, Cachi2Error> {
        let (spec, marker) = match line.split_once(';') {
            Some((spec, marker)) => (spec.trim(), Some(marker.trim().to_string())),
            None => (line.trim(), None),
        };

        let captures = NAME_AND_EXTRAS.captures(spec).ok_or_else(|| {
            Cachi2Error::InvalidInput(format!("unable to parse the requirement {line:?}"))
        })?;
        let raw_package = captures["name"].to_string();
        let extras = captures
            .name("extras")
            .map(|extras| {
                extras
                    .as_str()
                    .split(',')
                    .map(|extra| extra.trim().to_string())
                    .filter(|extra| !extra.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let rest = captures["rest"].trim();
        let mut version_specs = Vec::new();
        if !rest.is_empty() {
            for spec_part in rest.split(',') {
                let spec_part = spec_part.trim();
                let captures = VERSION_SPEC.captures(spec_part).ok_or_else(|| {
                    Cachi2Error::InvalidInput(format!(
                        "unable to parse the version specifier {spec_part:?} in {line:?}"
                    ))
                })?;
                version_specs.push((captures[1].to_string(), captures[2].to_string()));
            }
        }

        Ok(Self {
            package: canonicalize_name(&raw_package),
            raw_package,
            kind: RequirementKind::Pypi,
            extras,
            version_specs,
            environment_marker: marker,
            hashes,
            qualifiers: BTreeMap::new(),
            download_line: line.to_string(),
            options,
        })
    }

    fn from_direct_access_line(
        line: &str,
        kind: RequirementKind,
        hashes: Vec<String>,
        options: Vec<String>,
    ) -> Result<Self, Cachi2Error> {
        let (mut package_name, url_part) = if HAS_NAME_IN_DIRECT_ACCESS.is_match(line) {
            let (name, url) = line.split_once('@').expect("regex guarantees an @");
            (Some(name.trim().to_string()), url.trim().to_string())
        } else {
            (None, line.trim().to_string())
        };

        // For direct access requirements, a space is needed before the
        // environment marker semicolon.
        let (url_str, marker) = match url_part.split_once("; ") {
            Some((url, marker)) => (url.trim().to_string(), Some(marker.trim().to_string())),
            None => (url_part, None),
        };

        let mut qualifiers = BTreeMap::new();
        if let Some((_, fragment)) = url_str.split_once('#') {
            for section in fragment.split('&') {
                if let Some((attr, value)) = section.split_once('=') {
                    let value = percent_decode(value);
                    if attr == "egg" {
                        // The egg name wins over the name before '@', matching
                        // pip's behavior.
                        package_name = Some(value.clone());
                    }
                    qualifiers.insert(attr.to_string(), value);
                }
            }
        }

        let raw_package = package_name.ok_or_else(|| Cachi2Error::PackageRejected {
            reason: format!(
                "dependency name could not be determined from the requirement {line:?} \
                 (cachi2 needs the name to be explicitly declared)"
            ),
            solution: Some("Please specify the name of the dependency: <name> @ <url>".to_string()),
            docs: None,
        })?;

        let mut download_line = format!("{raw_package} @ {url_str}");
        if let Some(ref marker) = marker {
            download_line.push_str("; ");
            download_line.push_str(marker);
        }

        Ok(Self {
            package: canonicalize_name(&raw_package),
            raw_package,
            kind,
            extras: Vec::new(),
            version_specs: Vec::new(),
            environment_marker: marker,
            hashes,
            qualifiers,
            download_line,
            options,
        })
    }

    /// The URL of a direct-access requirement.
    pub fn url(&self) -> &str {
        debug_assert!(self.kind != RequirementKind::Pypi);
        // download_line is "package @ url[; marker]"
        let after_at = self
            .download_line
            .split_once('@')
            .map(|(_, rest)| rest.trim())
            .unwrap_or_default();
        after_at.split("; ").next().unwrap_or(after_at).trim()
    }

    /// Duplicate this requirement, replacing the URL (turning it into a
    /// `url`-kind requirement). Used when rewriting requirements files to
    /// point at the local cache.
    pub fn with_replaced_url(&self, url: &str) -> Self {
        let mut download_line = format!("{} @ {url}", self.raw_package);
        let qualifiers_line = self
            .qualifiers
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("&");
        if !qualifiers_line.is_empty() {
            download_line.push('#');
            download_line.push_str(&qualifiers_line);
        }
        if let Some(ref marker) = self.environment_marker {
            download_line.push_str(" ; ");
            download_line.push_str(marker);
        }

        // pip does not support editable mode for URL requirements
        let options: Vec<String> = self
            .options
            .iter()
            .filter(|option| *option != "-e" && *option != "--editable")
            .cloned()
            .collect();

        Self {
            package: self.package.clone(),
            raw_package: self.raw_package.clone(),
            kind: RequirementKind::Url,
            extras: Vec::new(),
            version_specs: Vec::new(),
            environment_marker: self.environment_marker.clone(),
            hashes: self.hashes.clone(),
            qualifiers: self.qualifiers.clone(),
            download_line,
            options,
        }
    }
}

impl fmt::Display for PipRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for option in &self.options {
            write!(f, "{option} ")?;
        }
        write!(f, "{}", self.download_line)?;
        for hash in &self.hashes {
            write!(f, " --hash={hash}")?;
        }
        Ok(())
    }
}

fn split_hashes_from_options(options: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut hashes = Vec::new();
    let mut rest = Vec::new();
    let mut next_is_hash = false;
    for option in options {
        if next_is_hash {
            hashes.push(option);
            next_is_hash = false;
        } else if option == "--hash" {
            next_is_hash = true;
        } else {
            rest.push(option);
        }
    }
    (hashes, rest)
}

/// Determine whether the line is a direct-access requirement and of which
/// kind.
fn assess_direct_access(line: &str) -> Result<Option<RequirementKind>, Cachi2Error> {
    if !line.contains(':') {
        return Ok(None);
    }
    // extract the scheme, stripping the "name @" prefix if present
    let before_colon = line.split(':').next().unwrap_or_default();
    let scheme_parts: Vec<&str> = before_colon.split('@').collect();
    if scheme_parts.len() > 2 {
        return Err(Cachi2Error::InvalidInput(format!(
            "unable to extract scheme from direct access requirement {line:?}"
        )));
    }
    let scheme = scheme_parts
        .last()
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();

    if URL_SCHEMES.contains(&scheme.as_str()) {
        Ok(Some(RequirementKind::Url))
    } else if VCS_SCHEMES.contains(&scheme.as_str()) {
        Ok(Some(RequirementKind::Vcs))
    } else if line.contains("://") {
        Err(Cachi2Error::UnsupportedFeature {
            reason: format!(
                "direct references with {scheme:?} scheme are not supported, {line:?}"
            ),
            solution: None,
            docs: None,
        })
    } else {
        // a colon can legally appear in an environment marker
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> PipRequirementsFile {
        PipRequirementsFile::parse_content(content, Path::new("requirements.txt")).unwrap()
    }

    #[test]
    fn test_pinned_requirement() {
        let file = parse("requests==2.31.0\n");
        assert_eq!(file.requirements.len(), 1);
        let req = &file.requirements[0];
        assert_eq!(req.package, "requests");
        assert_eq!(req.kind, RequirementKind::Pypi);
        assert_eq!(req.version_specs, vec![("==".to_string(), "2.31.0".to_string())]);
    }

    #[test]
    fn test_name_normalization() {
        let file = parse("Django_Rest.Framework==3.14.0\n");
        assert_eq!(file.requirements[0].package, "django-rest-framework");
        assert_eq!(file.requirements[0].raw_package, "Django_Rest.Framework");
    }

    #[test]
    fn test_extras_and_marker() {
        let file = parse("celery[redis,pytest] == 4.3.0 ; python_version >= '3.8'\n");
        let req = &file.requirements[0];
        assert_eq!(req.extras, vec!["redis".to_string(), "pytest".to_string()]);
        assert_eq!(req.version_specs, vec![("==".to_string(), "4.3.0".to_string())]);
        assert_eq!(req.environment_marker.as_deref(), Some("python_version >= '3.8'"));
    }

    #[test]
    fn test_hashes_are_split_from_options() {
        let file = parse(
            "aiowsgi==0.7 --hash=sha256:1111111111111111111111111111111111111111111111111111111111111111\n",
        );
        let req = &file.requirements[0];
        assert_eq!(req.hashes.len(), 1);
        assert!(req.hashes[0].starts_with("sha256:"));
        assert!(req.options.is_empty());
    }

    #[test]
    fn test_vcs_requirement() {
        let file = parse(
            "osbs-client @ git+https://github.com/containerbuildsystem/osbs-client@8d7d7fadff38c8367796e6ac0b3516b65483db24\n",
        );
        let req = &file.requirements[0];
        assert_eq!(req.kind, RequirementKind::Vcs);
        assert_eq!(req.package, "osbs-client");
        assert_eq!(
            req.url(),
            "git+https://github.com/containerbuildsystem/osbs-client@8d7d7fadff38c8367796e6ac0b3516b65483db24"
        );
    }

    #[test]
    fn test_url_requirement_with_fragment_checksum() {
        let file = parse(
            "operator-manifest @ https://github.com/containerbuildsystem/operator-manifest/archive/v0.0.1.tar.gz#sha256=aaaabbbb\n",
        );
        let req = &file.requirements[0];
        assert_eq!(req.kind, RequirementKind::Url);
        assert_eq!(req.qualifiers.get("sha256").map(String::as_str), Some("aaaabbbb"));
    }

    #[test]
    fn test_egg_fragment_overrides_name() {
        let file = parse("foo @ https://example.org/bar.tar.gz#egg=spam&sha256=abc\n");
        assert_eq!(file.requirements[0].package, "spam");
    }

    #[test]
    fn test_direct_access_without_name_is_rejected() {
        let result = PipRequirementsFile::parse_content(
            "https://example.org/archive.tar.gz\n",
            Path::new("requirements.txt"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let result = PipRequirementsFile::parse_content(
            "spam @ file:///local/path\n",
            Path::new("requirements.txt"),
        );
        assert!(matches!(
            result.unwrap_err(),
            Cachi2Error::UnsupportedFeature { .. }
        ));
    }

    #[test]
    fn test_comments_and_continuations() {
        let file = parse(
            "# a comment\nrequests\\\n==2.31.0  # trailing comment\n\naiohttp==3.8.4\n",
        );
        assert_eq!(file.requirements.len(), 2);
        assert_eq!(file.requirements[0].download_line, "requests==2.31.0");
    }

    #[test]
    fn test_global_options_collected() {
        let file = parse("--require-hashes\nrequests==2.31.0 --hash=sha256:abc\n");
        assert_eq!(file.options, vec!["--require-hashes".to_string()]);
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let result = PipRequirementsFile::parse_content(
            "--frobnicate\nrequests==2.31.0\n",
            Path::new("requirements.txt"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_render_round_trip() {
        let content = "--require-hashes\nrequests==2.31.0 --hash=sha256:abc\n";
        let file = parse(content);
        assert_eq!(file.generate_file_content(), content);
    }

    #[test]
    fn test_replace_url_for_rewrite() {
        let file = parse(
            "osbs-client @ git+https://github.com/containerbuildsystem/osbs-client@8d7d7fadff38c8367796e6ac0b3516b65483db24\n",
        );
        let replaced = file.requirements[0]
            .with_replaced_url("file://${output_dir}/deps/pip/github.com/containerbuildsystem/osbs-client/osbs-client-external-gitcommit-8d7d7fadff38c8367796e6ac0b3516b65483db24.tar.gz");
        assert_eq!(
            replaced.to_string(),
            "osbs-client @ file://${output_dir}/deps/pip/github.com/containerbuildsystem/osbs-client/osbs-client-external-gitcommit-8d7d7fadff38c8367796e6ac0b3516b65483db24.tar.gz"
        );
    }
}
