//! Path confinement for cachi2.
//!
//! Every dependency-supplied relative path is resolved through a
//! [`RootedPath`], which guarantees the result stays inside a declared root
//! directory. Reads under the source tree and writes under the output tree
//! both go through this guard, preventing path traversal attacks from
//! hostile lockfiles.
//!
//! ```no_run
//! use cachi2::paths::RootedPath;
//!
//! # fn main() -> anyhow::Result<()> {
//! let source = RootedPath::new("/some/directory")?;
//! source.join_within_root("vendor/modules.txt")?;     // ok
//! assert!(source.join_within_root("..").is_err());    // escapes the root
//! assert!(source.join_within_root("/abs").is_err());  // absolute
//! # Ok(())
//! # }
//! ```

use crate::core::Cachi2Error;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A path that is guaranteed to stay at or below a root directory.
///
/// [`join_within_root`](Self::join_within_root) joins further components and
/// remembers the original root; [`re_root`](Self::re_root) makes the joined
/// result the new root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootedPath {
    root: PathBuf,
    path: PathBuf,
}

impl RootedPath {
    /// Create a `RootedPath`. The path becomes both the current path and the
    /// root. Must be absolute.
    pub fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.is_absolute() {
            anyhow::bail!("path must be absolute: {}", path.display());
        }
        // Resolve symlinks in the root itself so that later prefix checks
        // compare like with like.
        let root = if path.exists() {
            path.canonicalize()?
        } else {
            normalize_lexically(path)
        };
        Ok(Self {
            path: root.clone(),
            root,
        })
    }

    /// The root directory which this path is not allowed to leave.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The current path, guaranteed to be at or below the root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current path relative to the root.
    pub fn subpath_from_root(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(Path::new("."))
    }

    /// Safely join path components and make the result the new root.
    ///
    /// # Errors
    /// [`Cachi2Error::PathOutsideRoot`] if the result is not a subpath of the
    /// current root (absolute path, `..` traversal or symlink escape).
    pub fn re_root(&self, subpath: impl AsRef<Path>) -> Result<Self, Cachi2Error> {
        let joined = self.resolve_join(subpath.as_ref())?;
        Ok(Self {
            root: joined.clone(),
            path: joined,
        })
    }

    /// Safely join path components but remember the original root.
    ///
    /// # Errors
    /// [`Cachi2Error::PathOutsideRoot`] if the result is not a subpath of the
    /// root.
    pub fn join_within_root(&self, subpath: impl AsRef<Path>) -> Result<Self, Cachi2Error> {
        let joined = self.resolve_join(subpath.as_ref())?;
        Ok(Self {
            root: self.root.clone(),
            path: joined,
        })
    }

    fn resolve_join(&self, subpath: &Path) -> Result<PathBuf, Cachi2Error> {
        let joined = self.path.join(subpath);
        let resolved = resolve_path(&joined);
        if !resolved.starts_with(&self.root) {
            return Err(Cachi2Error::PathOutsideRoot {
                subpath: subpath.display().to_string(),
                root: self.root.clone(),
            });
        }
        Ok(resolved)
    }
}

impl fmt::Display for RootedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl AsRef<Path> for RootedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Resolve a path the way `Path::resolve` would in other languages: symlinks
/// in the existing prefix are followed, the non-existent remainder is
/// normalized lexically.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Canonicalize the deepest existing ancestor, then re-append the rest.
    let normalized = normalize_lexically(path);
    let mut existing = normalized.as_path();
    let mut remainder = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
    let mut result = existing.canonicalize().unwrap_or_else(|_| existing.to_path_buf());
    for name in remainder.iter().rev() {
        result.push(name);
    }
    result
}

/// Normalize `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            other => result.push(other.as_os_str()),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_join_within_root_accepts_subpaths() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = RootedPath::new(temp.path())?;

        let sub = root.join_within_root("vendor/modules.txt")?;
        assert!(sub.path().ends_with("vendor/modules.txt"));
        assert_eq!(sub.root(), root.root());
        assert_eq!(sub.subpath_from_root(), Path::new("vendor/modules.txt"));
        Ok(())
    }

    #[test]
    fn test_join_within_root_rejects_traversal() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = RootedPath::new(temp.path())?;

        assert!(matches!(
            root.join_within_root(".."),
            Err(Cachi2Error::PathOutsideRoot { .. })
        ));
        assert!(root.join_within_root("foo/../../escape").is_err());
        // `..` that stays within the root is fine
        assert!(root.join_within_root("foo/../bar").is_ok());
        Ok(())
    }

    #[test]
    fn test_join_within_root_rejects_absolute() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = RootedPath::new(temp.path())?;
        assert!(root.join_within_root("/etc/passwd").is_err());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_join_within_root_rejects_symlink_escape() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let inner = temp.path().join("inner");
        fs::create_dir(&inner)?;
        std::os::unix::fs::symlink(temp.path(), inner.join("sneaky"))?;

        let root = RootedPath::new(&inner)?;
        assert!(matches!(
            root.join_within_root("sneaky"),
            Err(Cachi2Error::PathOutsideRoot { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_re_root_tightens_the_boundary() -> anyhow::Result<()> {
        let temp = tempdir()?;
        fs::create_dir(temp.path().join("sub"))?;
        let root = RootedPath::new(temp.path())?;

        let rerooted = root.re_root("sub")?;
        // after re-rooting, `..` would escape the *new* root
        assert!(rerooted.join_within_root("..").is_err());
        // but join_within_root keeps the original root
        let joined = root.join_within_root("sub")?;
        assert!(joined.join_within_root("..").is_ok());
        Ok(())
    }

    #[test]
    fn test_new_requires_absolute_path() {
        assert!(RootedPath::new("relative/path").is_err());
    }

    #[test]
    fn test_nonexistent_subpaths_resolve() -> anyhow::Result<()> {
        let temp = tempdir()?;
        let root = RootedPath::new(temp.path())?;
        // deps/pip does not exist yet; the join must still work and confine
        let sub = root.join_within_root("deps/pip/packages.tar.gz")?;
        assert!(sub.path().starts_with(root.root()));
        Ok(())
    }
}
