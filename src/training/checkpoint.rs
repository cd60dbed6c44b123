// Checkpoint management: final run output and periodic step snapshots
//
// A checkpoint directory holds adapter_model.safetensors, adapter_config.json,
// the tokenizer file, training_config.json and checkpoint.json metadata.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::TrainConfig;
use crate::models::{BaseModel, LoraModel, TextTokenizer};

/// File name of the hyperparameter record
pub const TRAINING_CONFIG_FILE: &str = "training_config.json";
/// File name of the checkpoint metadata
pub const CHECKPOINT_METADATA_FILE: &str = "checkpoint.json";

const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// Adapter hyperparameters in the training record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraRecord {
    pub r: usize,
    pub lora_alpha: usize,
    pub lora_dropout: f64,
}

/// Optimizer hyperparameters in the training record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArgsRecord {
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
}

/// Language weighting settings in the training record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageRecord {
    pub cross_language_learning: bool,
    pub rust_weight: f64,
    pub elixir_weight: f64,
}

/// Contents of training_config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub base_model: String,
    pub lora_config: LoraRecord,
    pub training_args: TrainingArgsRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rust_elixir_specific: Option<LanguageRecord>,
}

impl TrainingRecord {
    pub fn from_config(config: &TrainConfig) -> Self {
        let language = &config.language;
        Self {
            base_model: config.model.base_model.display().to_string(),
            lora_config: LoraRecord {
                r: config.lora.rank,
                lora_alpha: config.lora.alpha,
                lora_dropout: config.lora.dropout,
            },
            training_args: TrainingArgsRecord {
                learning_rate: config.optim.learning_rate,
                epochs: config.optim.epochs,
                batch_size: config.optim.train_batch_size,
            },
            rust_elixir_specific: language.language_aware.then(|| LanguageRecord {
                cross_language_learning: language.cross_language_learning,
                rust_weight: language.rust_weight,
                elixir_weight: language.elixir_weight,
            }),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read training record: {:?}", path))?;
        serde_json::from_str(&json).context("Failed to parse training record JSON")
    }
}

/// Checkpoint metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Directory the checkpoint lives in
    pub path: PathBuf,
    /// Optimizer step at save time
    pub global_step: usize,
    pub epoch: usize,
    /// Mean training loss of the epoch so far
    pub train_loss: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Writes run output and manages periodic checkpoints
pub struct CheckpointManager {
    output_dir: PathBuf,
    /// Maximum number of periodic checkpoints to keep
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(output_dir: PathBuf, max_checkpoints: usize) -> Self {
        Self {
            output_dir,
            max_checkpoints,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write a complete checkpoint into `dir`
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &self,
        dir: &Path,
        model: &LoraModel,
        tokenizer: &dyn TextTokenizer,
        record: &TrainingRecord,
        global_step: usize,
        epoch: usize,
        train_loss: Option<f64>,
    ) -> Result<Checkpoint> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", dir))?;

        model.save_adapter(dir).context("Failed to save adapter")?;
        tokenizer.save(dir).context("Failed to save tokenizer")?;

        let record_json =
            serde_json::to_string_pretty(record).context("Failed to serialize training record")?;
        fs::write(dir.join(TRAINING_CONFIG_FILE), record_json)
            .with_context(|| format!("Failed to write training record in {:?}", dir))?;

        let checkpoint = Checkpoint {
            path: dir.to_path_buf(),
            global_step,
            epoch,
            train_loss,
            timestamp: Utc::now(),
        };
        let metadata_json = serde_json::to_string_pretty(&checkpoint)
            .context("Failed to serialize checkpoint metadata")?;
        fs::write(dir.join(CHECKPOINT_METADATA_FILE), metadata_json)
            .with_context(|| format!("Failed to write checkpoint metadata in {:?}", dir))?;

        Ok(checkpoint)
    }

    /// Final run output directly in the output directory
    pub fn save_final(
        &self,
        model: &LoraModel,
        tokenizer: &dyn TextTokenizer,
        record: &TrainingRecord,
        global_step: usize,
        epoch: usize,
    ) -> Result<Checkpoint> {
        let checkpoint = self.write(
            &self.output_dir,
            model,
            tokenizer,
            record,
            global_step,
            epoch,
            None,
        )?;
        tracing::info!(path = ?self.output_dir, global_step, "Saved model");
        Ok(checkpoint)
    }

    /// Periodic snapshot in `checkpoint-<step>/`, pruning old snapshots
    pub fn save_step(
        &self,
        model: &LoraModel,
        tokenizer: &dyn TextTokenizer,
        record: &TrainingRecord,
        global_step: usize,
        epoch: usize,
        train_loss: Option<f64>,
    ) -> Result<Checkpoint> {
        let dir = self
            .output_dir
            .join(format!("{}{}", CHECKPOINT_PREFIX, global_step));
        let checkpoint = self.write(&dir, model, tokenizer, record, global_step, epoch, train_loss)?;

        tracing::info!(path = ?dir, global_step, epoch, "Created checkpoint");

        self.cleanup_old_checkpoints()?;
        Ok(checkpoint)
    }

    /// Periodic checkpoints, newest first
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        let mut checkpoints = Vec::new();

        if !self.output_dir.exists() {
            return Ok(checkpoints);
        }

        for entry in fs::read_dir(&self.output_dir)
            .with_context(|| format!("Failed to read output directory: {:?}", self.output_dir))?
        {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
                .and_then(|s| s.parse::<usize>().ok());
            if let Some(step) = step {
                checkpoints.push((step, path));
            }
        }

        checkpoints.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(checkpoints)
    }

    /// Keep only the newest `max_checkpoints` periodic checkpoints
    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;

        if checkpoints.len() > self.max_checkpoints {
            let to_delete = &checkpoints[self.max_checkpoints..];
            for (step, path) in to_delete {
                fs::remove_dir_all(path)
                    .with_context(|| format!("Failed to delete checkpoint directory: {:?}", path))?;
                tracing::debug!(step, "Deleted checkpoint");
            }

            tracing::info!(
                deleted = to_delete.len(),
                kept = self.max_checkpoints,
                "Cleaned up old checkpoints"
            );
        }

        Ok(())
    }
}

/// Load an adapter checkpoint against its base model
pub fn load_checkpoint(base: &BaseModel, dir: &Path) -> Result<LoraModel> {
    LoraModel::load_adapter(base, dir)
        .with_context(|| format!("Failed to load adapter checkpoint from {:?}", dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AdapterBuilder, ByteTokenizer, LoraConfig, Seq2SeqConfig};
    use candle_core::Device;
    use tempfile::TempDir;

    fn tiny_model() -> (BaseModel, LoraModel) {
        let config = Seq2SeqConfig {
            vocab_size: 259,
            d_model: 16,
            num_heads: 2,
            num_encoder_layers: 1,
            num_decoder_layers: 1,
            d_ff: 32,
            max_position: 64,
            dropout: 0.0,
            ..Seq2SeqConfig::default()
        };
        let base = BaseModel::random(config, &Device::Cpu).unwrap();
        let lora = LoraConfig {
            rank: 2,
            alpha: 4,
            dropout: 0.0,
            target_modules: vec!["q".into(), "v".into()],
            ..LoraConfig::default()
        };
        let model = AdapterBuilder::new(lora, 1).build(&base).unwrap();
        (base, model)
    }

    #[test]
    fn test_record_keys_language_aware() {
        let record = TrainingRecord::from_config(&TrainConfig::default());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["lora_config"]["r"], 16);
        assert_eq!(json["lora_config"]["lora_alpha"], 32);
        assert_eq!(json["training_args"]["epochs"], 12);
        assert_eq!(json["training_args"]["batch_size"], 4);
        assert_eq!(json["rust_elixir_specific"]["cross_language_learning"], false);
        assert_eq!(json["rust_elixir_specific"]["rust_weight"], 1.0);
    }

    #[test]
    fn test_record_omits_language_section_when_generic() {
        let mut config = TrainConfig::default();
        config.language.language_aware = false;
        let json = serde_json::to_value(TrainingRecord::from_config(&config)).unwrap();
        assert!(json.get("rust_elixir_specific").is_none());
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_final_save_writes_all_files() {
        let temp_dir = TempDir::new().unwrap();
        let (base, model) = tiny_model();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf(), 2);
        let record = TrainingRecord::from_config(&TrainConfig::default());

        manager
            .save_final(&model, &ByteTokenizer::new(), &record, 3, 1)
            .unwrap();

        for file in [
            "adapter_model.safetensors",
            "adapter_config.json",
            "byte_tokenizer.json",
            TRAINING_CONFIG_FILE,
            CHECKPOINT_METADATA_FILE,
        ] {
            assert!(temp_dir.path().join(file).exists(), "missing {}", file);
        }
        assert_eq!(TrainingRecord::load(&temp_dir.path().join(TRAINING_CONFIG_FILE)).unwrap(), record);
        assert!(load_checkpoint(&base, temp_dir.path()).is_ok());
    }

    #[test]
    fn test_retention_keeps_newest() {
        let temp_dir = TempDir::new().unwrap();
        let (_base, model) = tiny_model();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf(), 2);
        let record = TrainingRecord::from_config(&TrainConfig::default());
        let tokenizer = ByteTokenizer::new();

        for step in [5, 10, 15] {
            manager
                .save_step(&model, &tokenizer, &record, step, 0, Some(1.0))
                .unwrap();
        }

        let steps: Vec<usize> = manager
            .list_checkpoints()
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(steps, vec![15, 10]);
        assert!(!temp_dir.path().join("checkpoint-5").exists());
    }
}
