//! Data models: the validated request and the resolver outputs.

pub mod input;
pub mod output;

pub use input::{Flag, PackageInput, Request};
pub use output::{BuildConfig, EnvironmentVariable, ProjectFile, RequestOutput};
