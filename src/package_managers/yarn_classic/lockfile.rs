//! Parser for the Yarn 1.x (`yarn lockfile v1`) format.
//!
//! The format is indentation based. An entry starts with one or more
//! comma-separated `name@range` keys on an unindented line ending in `:`,
//! followed by 2-space-indented `key "value"` lines and optional
//! `dependencies:` / `optionalDependencies:` sub-blocks with 4-space-indented
//! `name "range"` lines.

use crate::core::{Cachi2Error, package_rejected};
use std::collections::BTreeMap;
use std::path::Path;

pub const LOCKFILE_HEADER: &str = "# yarn lockfile v1";

/// One resolved entry of a v1 yarn.lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YarnLockEntry {
    /// The `name@range` keys this entry satisfies (quotes stripped).
    pub keys: Vec<String>,
    /// The package name (identical across all keys).
    pub name: String,
    pub version: Option<String>,
    /// The `resolved` locator, usually `https://...#<sha1>`.
    pub resolved: Option<String>,
    /// SRI integrity value.
    pub integrity: Option<String>,
    /// Direct dependencies: name -> range.
    pub dependencies: BTreeMap<String, String>,
}

/// A parsed v1 yarn.lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YarnLock {
    pub entries: Vec<YarnLockEntry>,
}

/// Whether the content is a v1 lockfile (identified by its header comment).
pub fn is_v1_lockfile(content: &str) -> bool {
    content
        .lines()
        .take_while(|line| line.trim().is_empty() || line.starts_with('#'))
        .any(|line| line.trim() == LOCKFILE_HEADER)
}

/// Whether the content is a Yarn Berry lockfile (identified by the
/// `__metadata:` mapping).
pub fn is_berry_lockfile(content: &str) -> bool {
    content.lines().any(|line| line.trim_end() == "__metadata:")
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

/// `name@range` -> name: everything before the last `@` (but a leading `@`
/// belongs to the scope).
fn name_from_key(key: &str) -> String {
    match key[1..].rfind('@') {
        Some(index) => key[..index + 1].to_string(),
        None => key.to_string(),
    }
}

impl YarnLock {
    pub fn parse(content: &str, path: &Path) -> Result<Self, Cachi2Error> {
        if !is_v1_lockfile(content) {
            return Err(Cachi2Error::LockfileError {
                reason: "yarn.lock is not in the v1 format".to_string(),
                file: path.to_path_buf(),
                line: None,
                solution: None,
            });
        }

        let mut entries: Vec<YarnLockEntry> = Vec::new();
        let mut current: Option<YarnLockEntry> = None;
        // "dependencies" or "optionalDependencies" while inside a sub-block
        let mut in_dependency_block = false;

        for (index, raw_line) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if !line.starts_with(' ') {
                // a new entry header
                if let Some(entry) = current.take() {
                    entries.push(entry);
                }
                let header = line.strip_suffix(':').ok_or_else(|| Cachi2Error::LockfileError {
                    reason: format!("expected an entry header ending in ':', got {line:?}"),
                    file: path.to_path_buf(),
                    line: Some(line_no),
                    solution: None,
                })?;
                let keys: Vec<String> = header.split(", ").map(unquote).collect();
                let name = name_from_key(&keys[0]);
                current = Some(YarnLockEntry {
                    keys,
                    name,
                    ..YarnLockEntry::default()
                });
                in_dependency_block = false;
            } else if let Some(rest) = line.strip_prefix("    ") {
                // inside a dependencies sub-block
                if !in_dependency_block {
                    continue;
                }
                let Some(entry) = current.as_mut() else { continue };
                let (dep_name, dep_range) = match rest.trim().split_once(' ') {
                    Some((dep_name, dep_range)) => (unquote(dep_name), unquote(dep_range)),
                    None => (unquote(rest), String::new()),
                };
                entry.dependencies.insert(dep_name, dep_range);
            } else if let Some(rest) = line.strip_prefix("  ") {
                let Some(entry) = current.as_mut() else {
                    return Err(Cachi2Error::LockfileError {
                        reason: format!("unexpected indented line outside an entry: {line:?}"),
                        file: path.to_path_buf(),
                        line: Some(line_no),
                        solution: None,
                    });
                };
                if rest == "dependencies:" || rest == "optionalDependencies:" {
                    in_dependency_block = true;
                    continue;
                }
                in_dependency_block = false;
                let (key, value) = match rest.split_once(' ') {
                    Some((key, value)) => (key.trim(), unquote(value)),
                    None => (rest.trim(), String::new()),
                };
                match key {
                    "version" => entry.version = Some(value),
                    "resolved" => entry.resolved = Some(value),
                    "integrity" => entry.integrity = Some(value),
                    _ => {}
                }
            }
        }
        if let Some(entry) = current.take() {
            entries.push(entry);
        }

        if entries.is_empty() {
            return Err(package_rejected(
                "the yarn.lock file must not be empty",
                "Please verify the content of the file.",
            ));
        }

        Ok(Self { entries })
    }

    /// Look up the entry satisfying `name@range`.
    pub fn entry_for(&self, name: &str, range: &str) -> Option<&YarnLockEntry> {
        let key = format!("{name}@{range}");
        self.entries
            .iter()
            .find(|entry| entry.keys.iter().any(|k| k == &key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"# THIS IS AN AUTOGENERATED FILE. DO NOT EDIT THIS FILE DIRECTLY.
# yarn lockfile v1


"@babel/code-frame@^7.0.0":
  version "7.22.13"
  resolved "https://registry.yarnpkg.com/@babel/code-frame/-/code-frame-7.22.13.tgz#e3c1c099402598483b7a8c46a721d1038803755e"
  integrity sha512-XktuhWlJ5g+3TJXc5upd9Ks1HutSArik6jf2eAjYFyIOf4ej3RN+184cZbzDvbPnuTJIUhPKKJE3cIsYTiAT3w==
  dependencies:
    "@babel/highlight" "^7.22.13"
    chalk "^2.4.2"

chalk@^2.4.2, chalk@^2.0.0:
  version "2.4.2"
  resolved "https://registry.yarnpkg.com/chalk/-/chalk-2.4.2.tgz#cd42541677a54333cf541a49108c1432b44c9424"
  integrity sha512-Mti+f9lpJNcwF4tWV8/OrTTtF1gZi+f8FqlyAdouralcFWFQWF2+NgCHShjkCb+IFBLq9buZwE1xckQU4peSuQ==

custom-pkg@https://example.org/custom-pkg-1.0.0.tgz:
  version "1.0.0"
  resolved "https://example.org/custom-pkg-1.0.0.tgz#abc123"
"#;

    #[test]
    fn test_header_detection() {
        assert!(is_v1_lockfile(SAMPLE));
        assert!(!is_v1_lockfile("__metadata:\n  version: 6\n"));
        assert!(is_berry_lockfile("__metadata:\n  version: 6\n"));
        assert!(!is_berry_lockfile(SAMPLE));
    }

    #[test]
    fn test_parse_entries() {
        let lock = YarnLock::parse(SAMPLE, Path::new("yarn.lock")).unwrap();
        assert_eq!(lock.entries.len(), 3);

        let code_frame = &lock.entries[0];
        assert_eq!(code_frame.name, "@babel/code-frame");
        assert_eq!(code_frame.version.as_deref(), Some("7.22.13"));
        assert!(
            code_frame
                .resolved
                .as_deref()
                .unwrap()
                .starts_with("https://registry.yarnpkg.com/")
        );
        assert_eq!(code_frame.dependencies.len(), 2);
        assert_eq!(
            code_frame.dependencies.get("@babel/highlight").map(String::as_str),
            Some("^7.22.13")
        );
    }

    #[test]
    fn test_multi_key_entry() {
        let lock = YarnLock::parse(SAMPLE, Path::new("yarn.lock")).unwrap();
        let chalk = lock.entry_for("chalk", "^2.0.0").unwrap();
        assert_eq!(chalk.version.as_deref(), Some("2.4.2"));
        assert_eq!(chalk.keys.len(), 2);
        assert!(lock.entry_for("chalk", "^3.0.0").is_none());
    }

    #[test]
    fn test_name_from_key() {
        assert_eq!(name_from_key("chalk@^2.4.2"), "chalk");
        assert_eq!(name_from_key("@babel/core@^7.0.0"), "@babel/core");
        assert_eq!(
            name_from_key("custom@https://example.org/custom.tgz"),
            "custom"
        );
    }

    #[test]
    fn test_non_v1_is_rejected() {
        let err = YarnLock::parse("__metadata:\n", Path::new("yarn.lock")).unwrap_err();
        assert!(matches!(err, Cachi2Error::LockfileError { .. }));
    }

    #[test]
    fn test_empty_lockfile_is_rejected() {
        let err = YarnLock::parse("# yarn lockfile v1\n", Path::new("yarn.lock")).unwrap_err();
        assert!(matches!(err, Cachi2Error::PackageRejected { .. }));
    }
}
