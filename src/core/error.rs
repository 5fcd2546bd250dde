//! Error handling for cachi2
//!
//! This module provides the error types and user-friendly error reporting
//! for the whole engine. The error system is designed around two core
//! principles:
//! 1. **Strongly-typed errors** for precise error handling in code
//! 2. **User-friendly messages** with actionable suggestions for CLI users
//!
//! # Architecture
//!
//! The error system consists of two main types:
//! - [`Cachi2Error`] - enumerated error kinds for all failure cases
//! - [`ErrorDisplay`] - the terminal rendering of an error chain, with the
//!   appropriate process exit code
//!
//! Errors are propagated as `anyhow::Error` through most of the codebase
//! (with `.context()` for extra detail) and downcast back to [`Cachi2Error`]
//! at the CLI boundary for friendly display.
//!
//! # Error Categories
//!
//! ## Invalid Usage
//! These are fixable by the user - a bad request, a bad repository - and
//! exit with code 2:
//! - [`Cachi2Error::InvalidInput`] - the request itself is malformed
//! - [`Cachi2Error::PathOutsideRoot`] - a path escaped its confining root
//! - [`Cachi2Error::PackageRejected`] - the package does not meet our
//!   requirements (missing lockfile, unpinned requirement, ...)
//! - [`Cachi2Error::LockfileError`] - a lockfile is missing or one of its
//!   entries is unusable
//! - [`Cachi2Error::UnsupportedFeature`] - valid but not implemented (PnP
//!   Zero-Installs, npm v1 lockfiles, ...)
//!
//! ## Everything Else
//! These exit with code 1 and may be worth retrying:
//! - [`Cachi2Error::FetchError`] - network failure after retries
//! - [`Cachi2Error::ChecksumMismatch`] - a download failed verification
//! - [`Cachi2Error::ToolError`] - a subprocess (`go`, `yarn`, `cargo`,
//!   `git`) exited non-zero
//! - [`Cachi2Error::Io`] - converted automatically from [`std::io::Error`]
//!
//! # Examples
//!
//! ## Classifying an error
//!
//! ```rust
//! use cachi2::core::{Cachi2Error, package_rejected};
//!
//! let error = package_rejected(
//!     "Gemfile.lock is missing",
//!     "Run `bundle lock` to generate it.",
//! );
//! assert!(error.is_invalid_usage());
//!
//! let error = Cachi2Error::FetchError("connection reset".to_string());
//! assert!(!error.is_invalid_usage());
//! ```
//!
//! ## Rendering a friendly message
//!
//! The reason comes first, the suggested remedy indented below it:
//!
//! ```rust
//! use cachi2::core::package_rejected;
//!
//! let error = package_rejected(
//!     "Gemfile.lock is missing",
//!     "Run `bundle lock` to generate it.",
//! );
//! assert_eq!(
//!     error.friendly_msg(),
//!     "Gemfile.lock is missing\n  Run `bundle lock` to generate it."
//! );
//! ```
//!
//! ## Reporting at the CLI boundary
//!
//! ```rust
//! use cachi2::core::{Cachi2Error, ErrorDisplay};
//!
//! let error = anyhow::Error::from(Cachi2Error::InvalidInput("bad request".into()));
//! let display = ErrorDisplay::from_error(&error);
//! assert_eq!(display.exit_code(), 2);
//! // display.display() prints the colored message to stderr
//! ```

use colored::Colorize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for cachi2 operations.
#[derive(Error, Debug)]
pub enum Cachi2Error {
    /// User input was invalid (malformed request JSON, bad flag combination,
    /// a path pointing outside the source tree, ...).
    #[error("{0}")]
    InvalidInput(String),

    /// A dependency-supplied path escaped its confining root directory.
    #[error("joining path '{subpath}' to '{root}': target is outside the root")]
    PathOutsideRoot {
        /// The offending subpath.
        subpath: String,
        /// The root the path tried to escape.
        root: PathBuf,
    },

    /// cachi2 refused to process the package the user requested.
    ///
    /// Either the package appears invalid (e.g. missing go.mod for a Go
    /// module) or it does not meet our extra requirements (e.g. missing
    /// checksums).
    #[error("{reason}")]
    PackageRejected {
        reason: String,
        /// A potential solution, shown indented below the reason.
        solution: Option<String>,
        /// Link to relevant documentation, if any.
        docs: Option<String>,
    },

    /// A required lockfile is missing or one of its entries is unusable.
    #[error("{reason}")]
    LockfileError {
        reason: String,
        /// The lockfile the error refers to.
        file: PathBuf,
        /// Line number within the lockfile, when known.
        line: Option<usize>,
        solution: Option<String>,
    },

    /// cachi2 does not support a feature the user requested.
    #[error("{reason}")]
    UnsupportedFeature {
        reason: String,
        solution: Option<String>,
        docs: Option<String>,
    },

    /// Failed to fetch a dependency or other data needed to process a package.
    #[error("{0}")]
    FetchError(String),

    /// A downloaded file did not match any of its expected checksums.
    #[error("failed to verify {file_name} against any of the provided checksums")]
    ChecksumMismatch {
        file_name: String,
        /// `algorithm:digest` pairs that were expected.
        expected: Vec<String>,
        /// `algorithm:digest` pairs that were computed.
        actual: Vec<String>,
    },

    /// A subprocess tool exited non-zero.
    #[error("the command `{command}` failed")]
    ToolError {
        command: String,
        /// Captured standard error, size-bounded by the caller.
        stderr: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Cachi2Error {
    /// Whether the error was caused by invalid usage (fixable by the user).
    ///
    /// Usage errors exit with code 2, everything else with code 1.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cachi2::core::Cachi2Error;
    ///
    /// assert!(Cachi2Error::InvalidInput("bad json".into()).is_invalid_usage());
    /// assert!(!Cachi2Error::FetchError("DNS failure".into()).is_invalid_usage());
    /// ```
    pub fn is_invalid_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::PathOutsideRoot { .. }
                | Self::PackageRejected { .. }
                | Self::LockfileError { .. }
                | Self::UnsupportedFeature { .. }
        )
    }

    /// The suggested remedy for this error, if there is one.
    pub fn solution(&self) -> Option<String> {
        match self {
            Self::PackageRejected { solution, .. } | Self::LockfileError { solution, .. } => {
                solution.clone()
            }
            Self::UnsupportedFeature { solution, .. } => solution.clone().or_else(|| {
                Some(
                    "If you need cachi2 to support this feature, please contact the maintainers."
                        .to_string(),
                )
            }),
            Self::PathOutsideRoot { .. } => Some(
                "With security in mind, cachi2 will not access files outside the \
                 specified source/output directories."
                    .to_string(),
            ),
            Self::FetchError(_) => Some(
                "The error might be intermittent, please try again.\n\
                 If the issue seems to be on the cachi2 side, please contact the maintainers."
                    .to_string(),
            ),
            Self::ChecksumMismatch { .. } => Some(
                "Please check if the expected checksums are correct.\n\
                 Caution is advised; if the checksum previously did match, \
                 someone may have tampered with the file!"
                    .to_string(),
            ),
            Self::ToolError { .. } => Some(
                "The output of the failing command should provide more details, \
                 please check the logs."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Link to relevant documentation, if any.
    pub fn docs(&self) -> Option<&str> {
        match self {
            Self::PackageRejected { docs, .. } | Self::UnsupportedFeature { docs, .. } => {
                docs.as_deref()
            }
            _ => None,
        }
    }

    /// Return the user-friendly representation of this error.
    ///
    /// The reason on the first line, the solution indented below it, then an
    /// optional docs link:
    ///
    /// ```text
    /// go.sum is missing an entry for golang.org/x/net
    ///   Run `go mod tidy` to regenerate go.sum.
    ///   Docs: https://...
    /// ```
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cachi2::core::Cachi2Error;
    ///
    /// let error = Cachi2Error::UnsupportedFeature {
    ///     reason: "npm v1 lockfiles are not supported".into(),
    ///     solution: None,
    ///     docs: None,
    /// };
    /// // UnsupportedFeature falls back to the default suggestion
    /// assert!(error.friendly_msg().contains("contact the maintainers"));
    /// ```
    pub fn friendly_msg(&self) -> String {
        let mut msg = self.to_string();
        if let Some(solution) = self.solution() {
            for line in solution.lines() {
                msg.push_str("\n  ");
                msg.push_str(line);
            }
        }
        if let Some(docs) = self.docs() {
            msg.push_str("\n  Docs: ");
            msg.push_str(docs);
        }
        msg
    }
}

/// Terminal-colored rendering of an error chain for CLI reporting.
pub struct ErrorDisplay {
    kind: &'static str,
    message: String,
    exit_code: i32,
}

impl ErrorDisplay {
    /// Classify an error chain for display, downcasting to [`Cachi2Error`]
    /// when possible.
    ///
    /// Errors that are not a [`Cachi2Error`] (e.g. a bare I/O failure with
    /// anyhow context) render their full context chain and exit with
    /// code 1.
    ///
    /// # Arguments
    ///
    /// * `error` - the error chain that aborted the command
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cachi2::core::{Cachi2Error, ErrorDisplay};
    ///
    /// let error = anyhow::Error::from(Cachi2Error::FetchError("connection reset".into()));
    /// let display = ErrorDisplay::from_error(&error);
    /// assert_eq!(display.exit_code(), 1);
    /// ```
    pub fn from_error(error: &anyhow::Error) -> Self {
        if let Some(e) = error.downcast_ref::<Cachi2Error>() {
            Self {
                kind: error_kind_name(e),
                message: e.friendly_msg(),
                exit_code: if e.is_invalid_usage() { 2 } else { 1 },
            }
        } else {
            Self {
                kind: "Error",
                message: format!("{error:#}"),
                exit_code: 1,
            }
        }
    }

    /// Print the error to stderr with colors.
    pub fn display(&self) {
        eprintln!("{} {}", format!("{}:", self.kind).red().bold(), self.message);
    }

    /// The process exit code appropriate for this error.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl fmt::Display for ErrorDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

fn error_kind_name(error: &Cachi2Error) -> &'static str {
    match error {
        Cachi2Error::InvalidInput(_) => "InvalidInput",
        Cachi2Error::PathOutsideRoot { .. } => "PathOutsideRoot",
        Cachi2Error::PackageRejected { .. } => "PackageRejected",
        Cachi2Error::LockfileError { .. } => "LockfileError",
        Cachi2Error::UnsupportedFeature { .. } => "UnsupportedFeature",
        Cachi2Error::FetchError(_) => "FetchError",
        Cachi2Error::ChecksumMismatch { .. } => "ChecksumMismatch",
        Cachi2Error::ToolError { .. } => "ToolError",
        Cachi2Error::Io(_) => "IoError",
    }
}

/// Shorthand for a [`Cachi2Error::PackageRejected`] with a solution.
///
/// # Arguments
///
/// * `reason` - why the package was rejected
/// * `solution` - a potential fix, politely suggested to the user
///
/// # Examples
///
/// ```rust
/// use cachi2::core::{Cachi2Error, package_rejected};
///
/// let error = package_rejected(
///     "the go.mod file must be present",
///     "Please double-check the path to your Go module.",
/// );
/// assert!(matches!(error, Cachi2Error::PackageRejected { .. }));
/// ```
pub fn package_rejected(reason: impl Into<String>, solution: impl Into<String>) -> Cachi2Error {
    Cachi2Error::PackageRejected {
        reason: reason.into(),
        solution: Some(solution.into()),
        docs: None,
    }
}

/// Shorthand for a [`Cachi2Error::UnsupportedFeature`] with the default solution.
///
/// # Arguments
///
/// * `reason` - what was requested and why it is not supported
///
/// # Examples
///
/// ```rust
/// use cachi2::core::unsupported;
///
/// let error = unsupported("exec locators are not supported");
/// assert!(error.is_invalid_usage());
/// ```
pub fn unsupported(reason: impl Into<String>) -> Cachi2Error {
    Cachi2Error::UnsupportedFeature {
        reason: reason.into(),
        solution: None,
        docs: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_errors_exit_with_2() {
        let usage = Cachi2Error::InvalidInput("bad json".into());
        assert!(usage.is_invalid_usage());

        let fetch = Cachi2Error::FetchError("connection reset".into());
        assert!(!fetch.is_invalid_usage());

        let tool = Cachi2Error::ToolError {
            command: "go mod download".into(),
            stderr: String::new(),
        };
        assert!(!tool.is_invalid_usage());
    }

    #[test]
    fn test_friendly_msg_indents_solution() {
        let err = package_rejected(
            "Gemfile.lock is missing",
            "Run `bundle lock` to generate it.",
        );
        let msg = err.friendly_msg();
        assert_eq!(
            msg,
            "Gemfile.lock is missing\n  Run `bundle lock` to generate it."
        );
    }

    #[test]
    fn test_friendly_msg_includes_docs_link() {
        let err = Cachi2Error::UnsupportedFeature {
            reason: "Yarn Zero-Installs are not supported".into(),
            solution: Some("Delete the .yarn/unplugged directory.".into()),
            docs: Some("https://yarnpkg.com/features/caching#zero-installs".into()),
        };
        let msg = err.friendly_msg();
        assert!(msg.ends_with("Docs: https://yarnpkg.com/features/caching#zero-installs"));
    }

    #[test]
    fn test_unsupported_feature_has_default_solution() {
        let err = unsupported("npm v1 lockfiles are not supported");
        assert!(err.friendly_msg().contains("contact the maintainers"));
    }

    #[test]
    fn test_display_classification() {
        let err = anyhow::Error::from(Cachi2Error::FetchError("DNS failure".into()));
        let display = ErrorDisplay::from_error(&err);
        assert_eq!(display.exit_code(), 1);

        let err = anyhow::Error::from(Cachi2Error::InvalidInput("nope".into()));
        let display = ErrorDisplay::from_error(&err);
        assert_eq!(display.exit_code(), 2);
    }
}
