//! cachi2 - pre-fetch dependencies for hermetic builds
//!
//! cachi2 downloads every dependency a source repository declares in its
//! lockfiles, lays them out on disk the way the native package managers
//! expect to consume them offline, and emits a Software Bill of Materials
//! describing exactly what was fetched. It targets container-image build
//! pipelines that demand hermetic, reproducible and auditable builds.
//!
//! # Architecture Overview
//!
//! The core is the package-manager resolution engine: one resolver per
//! ecosystem under [`package_managers`], each of which
//! - parses a lockfile or pinned manifest,
//! - enumerates every direct and transitive dependency with its
//!   cryptographic identity,
//! - downloads each artifact into the canonical cache layout under
//!   `<output>/deps/<pm>/`,
//! - rewrites or synthesizes configuration so the native tool uses that
//!   cache, and
//! - produces SBOM components with package URLs and provenance properties.
//!
//! Cross-ecosystem machinery is shared:
//! - [`fetch`] - concurrent, checksum-verified artifact downloading
//! - [`checksum`] - algorithm-agnostic streamed digest verification
//! - [`git`] - cloning pinned commits and packing reproducible tarballs
//! - [`paths`] - confinement of every resolved path to its root directory
//! - [`sbom`] - the component model, dedupe-merge and CycloneDX/SPDX output
//! - [`purl`] - canonical package URL rendering
//!
//! The engine never executes project code: no install scripts, no
//! lifecycle hooks, no `setup.py`. Lockfiles must pin exact versions;
//! nothing a lockfile does not name is ever downloaded.

pub mod checksum;
pub mod cli;
pub mod core;
pub mod extras;
pub mod fetch;
pub mod git;
pub mod models;
pub mod package_managers;
pub mod paths;
pub mod purl;
pub mod resolver;
pub mod sbom;
pub mod utils;
