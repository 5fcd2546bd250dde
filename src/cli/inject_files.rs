//! The `inject-files` subcommand.

use crate::cli::generate_env::read_output_file;
use crate::core::Cachi2Error;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

pub fn run(from_output_dir: PathBuf, for_output_dir: Option<PathBuf>) -> Result<()> {
    let from_output_dir = std::fs::canonicalize(&from_output_dir).map_err(|_| {
        Cachi2Error::InvalidInput(format!(
            "output directory does not exist: {}",
            from_output_dir.display()
        ))
    })?;
    let for_output_dir = for_output_dir.unwrap_or_else(|| from_output_dir.clone());

    let output_file = read_output_file(&from_output_dir)?;

    for project_file in &output_file.build_config.project_files {
        if project_file.abspath.exists() {
            info!("overwriting {}", project_file.abspath.display());
        } else {
            info!("creating {}", project_file.abspath.display());
            if let Some(parent) = project_file.abspath.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = project_file.resolve_content(&for_output_dir);
        std::fs::write(&project_file.abspath, content)
            .with_context(|| format!("failed to write {}", project_file.abspath.display()))?;
    }
    Ok(())
}
