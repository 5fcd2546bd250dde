//! Core types shared across the whole engine: the error taxonomy and the
//! request-scoped configuration.

pub mod config;
pub mod error;

pub use config::Config;
pub use error::{Cachi2Error, ErrorDisplay, package_rejected, unsupported};
