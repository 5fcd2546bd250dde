//! The `generate-env` subcommand.

use crate::core::Cachi2Error;
use crate::extras::envfile::{EnvFormat, generate_envfile};
use crate::models::output::OutputFile;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub fn run(
    from_output_dir: PathBuf,
    for_output_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    format: Option<String>,
) -> Result<()> {
    let from_output_dir = std::fs::canonicalize(&from_output_dir).map_err(|_| {
        Cachi2Error::InvalidInput(format!(
            "output directory does not exist: {}",
            from_output_dir.display()
        ))
    })?;
    let for_output_dir = for_output_dir.unwrap_or_else(|| from_output_dir.clone());

    let env_format = match format {
        Some(format) => format.parse()?,
        None => match &output {
            Some(path) => EnvFormat::based_on_suffix(path)?,
            None => EnvFormat::Json,
        },
    };

    let output_file = read_output_file(&from_output_dir)?;
    let content = generate_envfile(&output_file.build_config, env_format, &for_output_dir)?;

    match output {
        Some(path) => std::fs::write(&path, content + "\n")
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{content}"),
    }
    Ok(())
}

/// Load `output.json` from a directory populated by `fetch-deps`.
pub fn read_output_file(output_dir: &Path) -> Result<OutputFile> {
    let path = output_dir.join("output.json");
    if !path.exists() {
        return Err(Cachi2Error::InvalidInput(format!(
            "no output.json found in {}. Please use a directory populated by a previous \
             fetch-deps command.",
            output_dir.display()
        ))
        .into());
    }
    let content = std::fs::read_to_string(&path)?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::output::{BuildConfig, PackageSummary};
    use crate::models::EnvironmentVariable;
    use tempfile::tempdir;

    fn write_output_json(dir: &Path) {
        let output_file = OutputFile {
            packages: vec![PackageSummary {
                package_type: "pip".to_string(),
                path: PathBuf::from("."),
            }],
            build_config: BuildConfig {
                environment_variables: vec![
                    EnvironmentVariable::path("PIP_FIND_LINKS", "deps/pip"),
                    EnvironmentVariable::literal("PIP_NO_INDEX", "true"),
                ],
                project_files: vec![],
            },
        };
        std::fs::write(
            dir.join("output.json"),
            serde_json::to_string_pretty(&output_file).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_generate_env_to_file() {
        let temp = tempdir().unwrap();
        write_output_json(temp.path());
        let out_file = temp.path().join("vars.env");

        run(
            temp.path().to_path_buf(),
            Some(PathBuf::from("/mounted/output")),
            Some(out_file.clone()),
            None,
        )
        .unwrap();

        let content = std::fs::read_to_string(out_file).unwrap();
        assert!(content.contains("export PIP_FIND_LINKS=/mounted/output/deps/pip"));
        assert!(content.contains("export PIP_NO_INDEX=true"));
    }

    #[test]
    fn test_missing_output_json_is_invalid_input() {
        let temp = tempdir().unwrap();
        let err = read_output_file(temp.path()).unwrap_err();
        let cachi2_err = err.downcast_ref::<Cachi2Error>().unwrap();
        assert!(matches!(cachi2_err, Cachi2Error::InvalidInput(_)));
    }
}
