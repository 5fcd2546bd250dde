//! Rendering of environment variables for the build.
//!
//! `generate-env` turns the build config produced by `fetch-deps` into a
//! file the build can consume: a shell snippet of `export` lines, a JSON
//! array, or a dotenv file. Path-kind variables are resolved against the
//! output directory (`--for-output-dir` when the directory will be mounted
//! somewhere else at build time).

use crate::core::Cachi2Error;
use crate::models::BuildConfig;
use serde_json::json;
use std::path::Path;

/// Supported environment file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvFormat {
    Env,
    Json,
    Dotenv,
}

impl EnvFormat {
    /// Determine the format from an output file name.
    pub fn based_on_suffix(filepath: &Path) -> Result<Self, Cachi2Error> {
        let suffix = filepath
            .extension()
            .map(|extension| extension.to_string_lossy().into_owned())
            .unwrap_or_default();
        match suffix.as_str() {
            "env" | "sh" => Ok(Self::Env),
            "json" => Ok(Self::Json),
            "dotenv" => Ok(Self::Dotenv),
            "" => Err(Cachi2Error::UnsupportedFeature {
                reason: format!("cannot determine envfile format, file has no suffix: {}", filepath.display()),
                solution: Some(
                    "Please use one of the supported suffixes: env, sh, json, dotenv.\n\
                     You can also define the format explicitly instead of letting cachi2 choose."
                        .to_string(),
                ),
                docs: None,
            }),
            other => Err(Cachi2Error::UnsupportedFeature {
                reason: format!("cannot determine envfile format, unsupported suffix: {other}"),
                solution: Some(
                    "Please use one of the supported suffixes: env, sh, json, dotenv.".to_string(),
                ),
                docs: None,
            }),
        }
    }
}

impl std::str::FromStr for EnvFormat {
    type Err = Cachi2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "env" | "sh" => Ok(Self::Env),
            "json" => Ok(Self::Json),
            "dotenv" => Ok(Self::Dotenv),
            other => Err(Cachi2Error::InvalidInput(format!(
                "unsupported environment file format: {other:?}"
            ))),
        }
    }
}

/// Generate an environment file in the specified format.
///
/// - json: `[{"name": "GOCACHE", "value": "/output/deps/gomod"}, ...]`
/// - env: `export GOCACHE=/output/deps/gomod` lines
/// - dotenv: `GOCACHE=/output/deps/gomod` lines
pub fn generate_envfile(
    build_config: &BuildConfig,
    format: EnvFormat,
    relative_to_path: &Path,
) -> anyhow::Result<String> {
    let env_vars: Vec<(String, String)> = build_config
        .environment_variables
        .iter()
        .map(|env_var| (env_var.name.clone(), env_var.resolve_value(relative_to_path)))
        .collect();

    let content = match format {
        EnvFormat::Json => {
            let values: Vec<_> = env_vars
                .iter()
                .map(|(name, value)| json!({"name": name, "value": value}))
                .collect();
            serde_json::to_string(&values)?
        }
        EnvFormat::Env => env_vars
            .iter()
            .map(|(name, value)| format!("export {name}={}", shell_quote(value)))
            .collect::<Vec<_>>()
            .join("\n"),
        EnvFormat::Dotenv => env_vars
            .iter()
            .map(|(name, value)| format!("{name}={}", shell_quote(value)))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    Ok(content)
}

/// Quote a value for POSIX shells when necessary.
fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'=' | b':' | b','));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EnvironmentVariable;

    fn build_config() -> BuildConfig {
        BuildConfig {
            environment_variables: vec![
                EnvironmentVariable::path("GOMODCACHE", "deps/gomod/pkg/mod"),
                EnvironmentVariable::literal("GOFLAGS", "-mod=mod"),
                EnvironmentVariable::literal("SPACES", "a value with spaces"),
            ],
            project_files: vec![],
        }
    }

    #[test]
    fn test_env_format() {
        let content =
            generate_envfile(&build_config(), EnvFormat::Env, Path::new("/cachi2/output")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            [
                "export GOMODCACHE=/cachi2/output/deps/gomod/pkg/mod",
                "export GOFLAGS=-mod=mod",
                "export SPACES='a value with spaces'",
            ]
        );
    }

    #[test]
    fn test_json_format() {
        let content =
            generate_envfile(&build_config(), EnvFormat::Json, Path::new("/cachi2/output")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed[0]["name"], "GOMODCACHE");
        assert_eq!(parsed[0]["value"], "/cachi2/output/deps/gomod/pkg/mod");
    }

    #[test]
    fn test_dotenv_format() {
        let content =
            generate_envfile(&build_config(), EnvFormat::Dotenv, Path::new("/out")).unwrap();
        assert!(content.starts_with("GOMODCACHE=/out/deps/gomod/pkg/mod\n"));
        assert!(!content.contains("export "));
    }

    #[test]
    fn test_format_from_suffix() {
        assert_eq!(EnvFormat::based_on_suffix(Path::new("vars.env")).unwrap(), EnvFormat::Env);
        assert_eq!(EnvFormat::based_on_suffix(Path::new("vars.sh")).unwrap(), EnvFormat::Env);
        assert_eq!(EnvFormat::based_on_suffix(Path::new("vars.json")).unwrap(), EnvFormat::Json);
        assert!(EnvFormat::based_on_suffix(Path::new("vars")).is_err());
        assert!(EnvFormat::based_on_suffix(Path::new("vars.yaml")).is_err());
    }

    #[test]
    fn test_every_path_value_starts_with_for_output_dir() {
        let content =
            generate_envfile(&build_config(), EnvFormat::Json, Path::new("/mnt/x")).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&content).unwrap();
        for entry in parsed {
            let value = entry["value"].as_str().unwrap();
            if value.contains("deps/") {
                assert!(value.starts_with("/mnt/x"), "{value} should start with /mnt/x");
            }
        }
    }
}
