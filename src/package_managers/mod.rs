//! The per-ecosystem resolvers.
//!
//! Each resolver takes the validated [`Request`](crate::models::Request) and
//! one package input, fetches everything that package's lockfile pins, and
//! returns its share of the SBOM plus any environment variables and
//! project-file edits the build will need.

pub mod bundler;
pub mod cargo;
pub mod generic;
pub mod gomod;
pub mod npm;
pub mod pip;
pub mod yarn;
pub mod yarn_classic;

use crate::core::package_rejected;
use crate::models::input::PlainPackageInput;
use crate::models::{Request, RequestOutput};
use anyhow::Result;

/// Dispatch a `yarn` package to the Classic or Berry resolver based on the
/// `yarn.lock` format: the `# yarn lockfile v1` header means Classic, a
/// `__metadata:` mapping means Berry.
pub async fn fetch_metayarn_source(
    request: &Request,
    package: &PlainPackageInput,
) -> Result<RequestOutput> {
    let package_dir = request.source_dir.join_within_root(&package.path)?;
    let lockfile_path = package_dir.join_within_root("yarn.lock")?;
    let content = std::fs::read_to_string(lockfile_path.path()).map_err(|_| {
        package_rejected(
            "the yarn.lock file must be present for the yarn package manager",
            "Please double-check that you have specified the correct path \
             to the package directory containing this file.",
        )
    })?;

    if yarn_classic::is_v1_lockfile(&content) {
        yarn_classic::fetch_yarn_classic_source(request, package).await
    } else if yarn_classic::is_berry_lockfile(&content) {
        yarn::fetch_yarn_source(request, package).await
    } else {
        Err(package_rejected(
            "could not determine the yarn.lock format (neither v1 nor Berry)",
            "Please regenerate the lockfile with `yarn install`.",
        )
        .into())
    }
}
