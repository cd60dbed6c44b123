// Configuration loader
// Layers ~/.codetune/config.toml (or an explicit file) with CODETUNE_* environment variables

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use super::settings::TrainConfig;
use crate::errors::{config_parse_error, file_not_found_error};

/// Default configuration location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".codetune/config.toml"))
}

/// Load the training configuration
///
/// An explicit `path` must exist. Without one, `~/.codetune/config.toml` is
/// read when present. Environment variables such as
/// `CODETUNE_OPTIM__LEARNING_RATE=1e-4` override file values; a double
/// underscore separates the section from the key.
pub fn load_config(path: Option<&Path>) -> Result<TrainConfig> {
    let mut builder = Config::builder();

    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(file_not_found_error(
                    &path.display().to_string(),
                    "Config file"
                ));
            }
            tracing::info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        None => {
            if let Some(default_path) = default_config_path() {
                builder = builder
                    .add_source(File::from(default_path).format(FileFormat::Toml).required(false));
            }
        }
    }

    let settings = builder
        .add_source(
            Environment::with_prefix("CODETUNE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| anyhow::anyhow!(config_parse_error(&e.to_string())))?;

    let config: TrainConfig = settings
        .try_deserialize()
        .map_err(|e| anyhow::anyhow!(config_parse_error(&e.to_string())))?;

    config.validate().context("Invalid training configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        fs::write(
            &path,
            r#"
            [model]
            base_model = "models/tiny"
            max_seq_len = 128

            [lora]
            rank = 4
            alpha = 8
            target_modules = ["q", "v"]
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.model.base_model, PathBuf::from("models/tiny"));
        assert_eq!(config.model.max_seq_len, 128);
        assert_eq!(config.lora.rank, 4);
        assert_eq!(config.lora.target_modules, vec!["q", "v"]);
        assert_eq!(config.optim.train_batch_size, 4);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[optim]\nepochs = 0\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
