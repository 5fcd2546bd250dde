//! Subprocess driving for the native package-manager tools.
//!
//! The resolvers shell out to `go`, `yarn`, `cargo` and `git`. All of those
//! invocations go through [`ToolCommand`], a fluent builder that handles
//! working directories, scoped environment variables, timeouts and output
//! capture in one place.
//!
//! A command failure surfaces as [`Cachi2Error::ToolError`] carrying a
//! size-bounded copy of the tool's stderr.

use crate::core::Cachi2Error;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

/// Maximum number of stderr bytes included in a [`Cachi2Error::ToolError`].
const MAX_STDERR_IN_ERROR: usize = 8192;

/// Default timeout for tool invocations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Builder for executing an external tool with consistent error handling.
///
/// This builder provides a fluent API for subprocess construction that
/// ensures consistent behavior across every tool cachi2 drives. It handles
/// timeout management, error context, scoped environment variables and
/// output capture in a unified way.
///
/// # Features
///
/// - **Fluent API**: chainable methods for building commands
/// - **Timeout management**: configurable timeouts with a sensible default
/// - **Scoped environment**: variables apply to one invocation only, never
///   to the cachi2 process itself
/// - **Bounded diagnostics**: stderr is captured and size-limited before it
///   lands in an error message
///
/// # Examples
///
/// ```rust,ignore
/// use cachi2::utils::ToolCommand;
///
/// # async fn example() -> anyhow::Result<()> {
/// // Simple command with output capture
/// let version = ToolCommand::new("go").arg("version").run().await?;
///
/// // Command with working directory, environment and timeout
/// let stdout = ToolCommand::new("go")
///     .args(["mod", "download", "-json"])
///     .current_dir("/path/to/module")
///     .env("GOMODCACHE", "/output/deps/gomod/pkg/mod")
///     .with_timeout(std::time::Duration::from_secs(600))
///     .run()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Default Configuration
///
/// New commands are created with sensible defaults:
/// - **Timeout**: 5 minutes (300 seconds)
/// - **Working directory**: current process directory
/// - **Environment**: inherits from the parent process, plus any variables
///   added with [`env`](Self::env)/[`envs`](Self::envs)
/// - **stdin**: closed (tools must never prompt)
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env_vars: Vec<(String, String)>,
    timeout_duration: Duration,
}

impl ToolCommand {
    /// Create a new builder for the given program.
    ///
    /// # Arguments
    ///
    /// * `program` - The executable to run, looked up on `PATH` (e.g. `go`,
    ///   `yarn`, `cargo`, `git`)
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// let cmd = ToolCommand::new("git").args(["rev-parse", "HEAD"]);
    /// ```
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            env_vars: Vec::new(),
            timeout_duration: DEFAULT_TIMEOUT,
        }
    }

    /// Add a single argument to the command.
    ///
    /// Arguments are passed to the tool in the order they are added. This
    /// method is useful when building commands dynamically or when an
    /// argument is added conditionally.
    ///
    /// # Arguments
    ///
    /// * `arg` - The argument to add (converted to `String`)
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// let mut cmd = ToolCommand::new("go").args(["list", "-e"]);
    /// if offline {
    ///     cmd = cmd.arg("-mod=readonly");
    /// }
    /// ```
    ///
    /// # Note
    ///
    /// For adding multiple arguments at once, prefer [`args`](Self::args).
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments to the command.
    ///
    /// This is the preferred method for adding several arguments at once.
    /// Arguments can be provided as any iterable of string-like values.
    ///
    /// # Arguments
    ///
    /// * `args` - An iterable of arguments to append to the command
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// // Array literals
    /// let cmd = ToolCommand::new("cargo").args(["vendor", "--locked", "--frozen"]);
    ///
    /// // Mixing with `arg`
    /// let cmd2 = ToolCommand::new("git")
    ///     .args(["fetch", "--quiet"])
    ///     .arg("origin");
    /// ```
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the command.
    ///
    /// The command executes in the specified directory, typically the
    /// package directory being resolved. If not set, the command runs in
    /// the current process working directory.
    ///
    /// # Arguments
    ///
    /// * `dir` - Path to the directory where the command should run
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// let cmd = ToolCommand::new("yarn")
    ///     .args(["install", "--mode=skip-build"])
    ///     .current_dir("/path/to/project");
    /// ```
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable for the command execution.
    ///
    /// Environment variables configure tool behavior without touching any
    /// global configuration: the variable applies to this invocation only.
    /// The resolvers use this to point caches into the output directory
    /// and to disable anything interactive.
    ///
    /// # Arguments
    ///
    /// * `key` - Environment variable name
    /// * `value` - Environment variable value
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// let cmd = ToolCommand::new("git")
    ///     .args(["fetch", "--depth", "1", "origin", revision])
    ///     // don't let git prompt for credentials we don't have
    ///     .env("GIT_TERMINAL_PROMPT", "0");
    /// ```
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Add multiple environment variables for the command execution.
    ///
    /// # Arguments
    ///
    /// * `vars` - An iterable of `(key, value)` pairs
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// let cmd = ToolCommand::new("go")
    ///     .args(["mod", "download", "-json"])
    ///     .envs([
    ///         ("GOPATH", "/output/deps/gomod"),
    ///         ("GOMODCACHE", "/output/deps/gomod/pkg/mod"),
    ///     ]);
    /// ```
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set a custom timeout for the command.
    ///
    /// On expiry the child process is killed and the invocation fails with
    /// a [`Cachi2Error::ToolError`] naming the timeout.
    ///
    /// # Arguments
    ///
    /// * `duration` - Maximum time to wait for the command to complete
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    /// use std::time::Duration;
    ///
    /// // vendoring large dependency trees can outlast the default timeout
    /// let cmd = ToolCommand::new("cargo")
    ///     .args(["vendor", "--locked", "--frozen"])
    ///     .with_timeout(Duration::from_secs(600));
    /// ```
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// The command line this builder will execute, for logs and errors.
    fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Execute the command, requiring exit status 0, and return its stdout.
    ///
    /// stdout and stderr are both captured; stderr is logged at debug level
    /// and, on failure, included (size-bounded) in the error. stdin is
    /// closed so a misbehaving tool can never hang waiting for input.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use cachi2::utils::ToolCommand;
    ///
    /// # async fn example() -> anyhow::Result<()> {
    /// let head = ToolCommand::new("git")
    ///     .args(["rev-parse", "HEAD"])
    ///     .current_dir("/path/to/repo")
    ///     .run()
    ///     .await?;
    /// println!("HEAD is {}", head.trim());
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// [`Cachi2Error::ToolError`] on non-zero exit or timeout, with bounded
    /// stderr; an [`anyhow::Error`] with context if the program could not
    /// be spawned at all (e.g. the tool is not installed).
    pub async fn run(self) -> Result<String> {
        let command_line = self.command_line();
        debug!("running: {command_line}");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = timeout(self.timeout_duration, cmd.output())
            .await
            .map_err(|_| {
                Cachi2Error::ToolError {
                    command: command_line.clone(),
                    stderr: format!(
                        "timed out after {} seconds",
                        self.timeout_duration.as_secs()
                    ),
                }
            })?
            .with_context(|| format!("failed to spawn `{command_line}`"))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            debug!("{} stderr: {}", self.program, stderr.trim_end());
        }

        if !output.status.success() {
            return Err(Cachi2Error::ToolError {
                command: command_line,
                stderr: truncate_output(&stderr),
            }
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_STDERR_IN_ERROR {
        return output.to_string();
    }
    let mut end = MAX_STDERR_IN_ERROR;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[... truncated]", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = ToolCommand::new("echo").arg("hello").run().await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_error() {
        let err = ToolCommand::new("false").run().await.unwrap_err();
        let tool_err = err.downcast_ref::<Cachi2Error>().unwrap();
        assert!(matches!(tool_err, Cachi2Error::ToolError { .. }));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let temp = tempfile::tempdir().unwrap();
        let out = ToolCommand::new("sh")
            .args(["-c", "echo $CACHI2_TEST_VAR && pwd"])
            .env("CACHI2_TEST_VAR", "value")
            .current_dir(temp.path())
            .run()
            .await
            .unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("value"));
        let pwd = lines.next().unwrap();
        assert_eq!(
            std::fs::canonicalize(pwd).unwrap(),
            std::fs::canonicalize(temp.path()).unwrap()
        );
    }

    #[test]
    fn test_truncate_output_bounds_size() {
        let big = "e".repeat(MAX_STDERR_IN_ERROR * 2);
        let truncated = truncate_output(&big);
        assert!(truncated.len() < big.len());
        assert!(truncated.ends_with("[... truncated]"));
    }
}
