//! Command-line interface for cachi2.
//!
//! Three subcommands cover the whole workflow:
//! - `fetch-deps` resolves and downloads everything, writing `bom.json` and
//!   `output.json` into the output directory
//! - `generate-env` renders the environment variables the build must set
//! - `inject-files` applies the project-file edits the resolvers requested
//!
//! The `PKG` argument of `fetch-deps` accepts either a bare package-manager
//! name (`gomod`), one JSON object (`{"type": "pip", "path": "."}`), a JSON
//! array of objects, or a full `{"packages": [...], "flags": [...]}` object.

mod fetch_deps;
mod generate_env;
mod inject_files;

pub use fetch_deps::parse_raw_input;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Pre-fetch project dependencies for hermetic builds and generate an SBOM.
#[derive(Parser)]
#[command(name = "cachi2", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set the log level.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch dependencies for supported package managers.
    FetchDeps {
        /// The package(s) to process: a package manager name or JSON.
        #[arg(value_name = "PKG")]
        raw_input: String,

        /// Process the git repository at this path.
        #[arg(long, default_value = ".")]
        source: PathBuf,

        /// Write output files to this directory.
        #[arg(long, default_value = "./cachi2-output")]
        output: PathBuf,

        /// Set CGO_ENABLED=0 while processing gomod packages.
        #[arg(long)]
        cgo_disable: bool,

        /// Run `go mod tidy` after downloading go dependencies.
        #[arg(long)]
        force_gomod_tidy: bool,

        /// Vendor go dependencies without making unexpected changes; fail if
        /// the committed vendor directory would change.
        #[arg(long)]
        gomod_vendor_check: bool,

        /// Allow package managers that are still in development.
        #[arg(long, hide = true)]
        dev_package_managers: bool,

        /// Also write an SPDX rendering of the SBOM (bom.spdx.json).
        #[arg(long)]
        sbom_output_type_spdx: bool,
    },

    /// Generate the environment variables needed to use the fetched
    /// dependencies.
    GenerateEnv {
        /// The output directory populated by a previous fetch-deps command.
        from_output_dir: PathBuf,

        /// Generate output as if the output directory was at this path
        /// instead.
        #[arg(long)]
        for_output_dir: Option<PathBuf>,

        /// Write to this file instead of standard output.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Format to use: env, json or dotenv. Defaults to json or is
        /// derived from the output file name.
        #[arg(short = 'f', long)]
        format: Option<String>,
    },

    /// Inject the project files needed to use the fetched dependencies.
    InjectFiles {
        /// The output directory populated by a previous fetch-deps command.
        from_output_dir: PathBuf,

        /// Resolve file content as if the output directory was at this path
        /// instead.
        #[arg(long)]
        for_output_dir: Option<PathBuf>,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::FetchDeps {
                raw_input,
                source,
                output,
                cgo_disable,
                force_gomod_tidy,
                gomod_vendor_check,
                dev_package_managers,
                sbom_output_type_spdx,
            } => {
                fetch_deps::run(fetch_deps::FetchDepsArgs {
                    raw_input,
                    source,
                    output,
                    cgo_disable,
                    force_gomod_tidy,
                    gomod_vendor_check,
                    dev_package_managers,
                    sbom_output_type_spdx,
                })
                .await
            }
            Commands::GenerateEnv {
                from_output_dir,
                for_output_dir,
                output,
                format,
            } => generate_env::run(from_output_dir, for_output_dir, output, format),
            Commands::InjectFiles {
                from_output_dir,
                for_output_dir,
            } => inject_files::run(from_output_dir, for_output_dir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_fetch_deps() {
        let cli = Cli::try_parse_from(["cachi2", "fetch-deps", "gomod"]).unwrap();
        match cli.command {
            Commands::FetchDeps { raw_input, source, output, .. } => {
                assert_eq!(raw_input, "gomod");
                assert_eq!(source, PathBuf::from("."));
                assert_eq!(output, PathBuf::from("./cachi2-output"));
            }
            _ => panic!("expected fetch-deps"),
        }
    }

    #[test]
    fn test_cli_parses_generate_env() {
        let cli = Cli::try_parse_from([
            "cachi2",
            "generate-env",
            "cachi2-output",
            "--for-output-dir",
            "/build/output",
            "-f",
            "env",
        ])
        .unwrap();
        match cli.command {
            Commands::GenerateEnv { for_output_dir, format, .. } => {
                assert_eq!(for_output_dir, Some(PathBuf::from("/build/output")));
                assert_eq!(format.as_deref(), Some("env"));
            }
            _ => panic!("expected generate-env"),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["cachi2"]).is_err());
    }
}
