//! The `fetch-deps` subcommand.

use crate::core::Cachi2Error;
use crate::models::input::{Flag, PackageInput, Request};
use crate::models::output::{OutputFile, PackageSummary};
use crate::resolver;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info};

pub struct FetchDepsArgs {
    pub raw_input: String,
    pub source: PathBuf,
    pub output: PathBuf,
    pub cgo_disable: bool,
    pub force_gomod_tidy: bool,
    pub gomod_vendor_check: bool,
    pub dev_package_managers: bool,
    pub sbom_output_type_spdx: bool,
}

/// The full JSON input form: packages plus optional flags.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInput {
    packages: Vec<PackageInput>,
    #[serde(default)]
    flags: Vec<Flag>,
}

/// Parse the PKG argument: a bare package-manager name, one JSON object, a
/// JSON array of objects, or a `{"packages": [...], "flags": [...]}` object.
pub fn parse_raw_input(raw_input: &str) -> Result<(Vec<PackageInput>, Vec<Flag>), Cachi2Error> {
    let looks_like_json = raw_input.trim_start().starts_with(['{', '[']);
    if !looks_like_json {
        return Ok((vec![PackageInput::from_type_name(raw_input.trim())?], vec![]));
    }

    let value: serde_json::Value = serde_json::from_str(raw_input)
        .map_err(|e| Cachi2Error::InvalidInput(format!("PKG looks like JSON but is not valid JSON: {e}")))?;

    let invalid = |e: serde_json::Error| Cachi2Error::InvalidInput(format!("invalid PKG input: {e}"));

    if value.is_object() && value.get("packages").is_some() {
        let input: RawInput = serde_json::from_value(value).map_err(invalid)?;
        Ok((input.packages, input.flags))
    } else if value.is_object() {
        let package: PackageInput = serde_json::from_value(value).map_err(invalid)?;
        Ok((vec![package], vec![]))
    } else if value.is_array() {
        let packages: Vec<PackageInput> = serde_json::from_value(value).map_err(invalid)?;
        Ok((packages, vec![]))
    } else {
        Err(Cachi2Error::InvalidInput(format!(
            "PKG must be a package manager name, an object or an array: {raw_input:?}"
        )))
    }
}

pub async fn run(args: FetchDepsArgs) -> Result<()> {
    let (packages, mut flags_list) = parse_raw_input(&args.raw_input)?;

    if args.cgo_disable {
        flags_list.push(Flag::CgoDisable);
    }
    if args.force_gomod_tidy {
        flags_list.push(Flag::ForceGomodTidy);
    }
    if args.gomod_vendor_check {
        flags_list.push(Flag::GomodVendorCheck);
    }
    if args.dev_package_managers {
        flags_list.push(Flag::DevPackageManagers);
    }
    let flags: BTreeSet<Flag> = flags_list.into_iter().collect();

    let source = std::fs::canonicalize(&args.source)
        .map_err(|_| Cachi2Error::InvalidInput(format!("source directory does not exist: {}", args.source.display())))?;
    std::fs::create_dir_all(&args.output)?;
    let output = std::fs::canonicalize(&args.output)?;

    // a stale deps directory would mix old and new artifacts
    let deps_dir = output.join("deps");
    if deps_dir.exists() {
        debug!("removing existing deps directory {}", deps_dir.display());
        std::fs::remove_dir_all(&deps_dir)?;
    }

    let request = Request::new(source, output, packages, flags)?;
    let request_output = resolver::resolve_packages(&request).await?;

    let output_file = OutputFile {
        packages: request
            .packages
            .iter()
            .map(|package| PackageSummary {
                package_type: package.type_name().to_string(),
                path: package.path().to_path_buf(),
            })
            .collect(),
        build_config: request_output.build_config.clone(),
    };
    let output_json_path = request.output_dir.join_within_root("output.json")?;
    std::fs::write(
        output_json_path.path(),
        serde_json::to_string_pretty(&output_file)? + "\n",
    )
    .context("failed to write output.json")?;

    let bom_path = request.output_dir.join_within_root("bom.json")?;
    std::fs::write(bom_path.path(), request_output.sbom.to_cyclonedx_json()?)
        .context("failed to write bom.json")?;

    if args.sbom_output_type_spdx {
        let spdx_path = request.output_dir.join_within_root("bom.spdx.json")?;
        std::fs::write(spdx_path.path(), request_output.sbom.to_spdx_json()?)
            .context("failed to write bom.spdx.json")?;
    }

    info!(r"all dependencies fetched successfully \o/");
    Ok(())
}
