// Configuration structs
//
// Every field carries a default so partial TOML files and environment
// overrides deserialize cleanly.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::device::DevicePreference;
use crate::errors::TrainError;

/// Full training configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ModelSection,
    pub data: DataSection,
    pub optim: OptimSection,
    pub lora: LoraSection,
    pub language: LanguageSection,
    pub run: RunSection,
}

/// Base model and sequence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    /// Directory holding config.json, model.safetensors and a tokenizer file
    pub base_model: PathBuf,
    /// Maximum prompt and label length in tokens
    pub max_seq_len: usize,
    /// Execution device
    pub device: DevicePreference,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            base_model: PathBuf::from("models/base"),
            max_seq_len: 1024,
            device: DevicePreference::Auto,
        }
    }
}

/// How records with missing fields are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordPolicy {
    /// Missing fields become empty strings (degenerate examples are kept)
    #[default]
    Lenient,
    /// Records with an empty instruction or output are rejected
    Strict,
}

/// Dataset locations and collation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    pub train_file: PathBuf,
    pub eval_file: Option<PathBuf>,
    pub record_policy: RecordPolicy,
    /// Round padded lengths up to a multiple of this value (0 disables)
    pub pad_to_multiple_of: usize,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            train_file: PathBuf::from("data/train.jsonl"),
            eval_file: None,
            record_policy: RecordPolicy::Lenient,
            pad_to_multiple_of: 8,
        }
    }
}

/// What happens to a partial accumulation window at the end of an epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccumulationBoundary {
    /// Apply an optimizer step for the partial window: ceil(N / K) steps per epoch
    #[default]
    Flush,
    /// Discard the partial window: floor(N / K) steps per epoch
    Drop,
}

impl AccumulationBoundary {
    /// Optimizer steps one epoch of `num_batches` micro-batches produces
    pub fn steps_per_epoch(self, num_batches: usize, accumulation: usize) -> usize {
        let accumulation = accumulation.max(1);
        match self {
            AccumulationBoundary::Flush => num_batches.div_ceil(accumulation),
            AccumulationBoundary::Drop => num_batches / accumulation,
        }
    }
}

/// Optimizer, schedule and batching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimSection {
    pub train_batch_size: usize,
    pub eval_batch_size: usize,
    pub gradient_accumulation: usize,
    pub accumulation_boundary: AccumulationBoundary,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub epochs: usize,
    pub warmup_steps: usize,
    pub max_grad_norm: f64,
}

impl Default for OptimSection {
    fn default() -> Self {
        Self {
            train_batch_size: 4,
            eval_batch_size: 8,
            gradient_accumulation: 8,
            accumulation_boundary: AccumulationBoundary::Flush,
            learning_rate: 2.0e-4,
            weight_decay: 0.01,
            epochs: 12,
            warmup_steps: 1000,
            max_grad_norm: 1.0,
        }
    }
}

/// Low-rank adapter hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraSection {
    pub rank: usize,
    pub alpha: usize,
    pub dropout: f64,
    pub target_modules: Vec<String>,
}

impl Default for LoraSection {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32,
            dropout: 0.1,
            target_modules: ["q", "k", "v", "o", "wi", "wo"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
        }
    }
}

/// How per-example losses are combined in the weighted path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossReduction {
    /// Weight each example's loss by its token count (equals the unweighted
    /// batch loss when every weight is 1.0)
    #[default]
    Token,
    /// Plain mean over examples
    Example,
}

/// Language detection, prompt style and loss weighting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageSection {
    /// Classify outputs, augment instructions and use the code prompt
    pub language_aware: bool,
    /// Rescale per-example losses by language weight
    pub cross_language_learning: bool,
    pub rust_weight: f64,
    pub elixir_weight: f64,
    pub reduction: LossReduction,
}

impl Default for LanguageSection {
    fn default() -> Self {
        Self {
            language_aware: true,
            cross_language_learning: false,
            rust_weight: 1.0,
            elixir_weight: 1.0,
            reduction: LossReduction::Token,
        }
    }
}

/// Output, logging and reproducibility
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub output_dir: PathBuf,
    /// Log running loss every N optimizer steps
    pub log_every: usize,
    pub seed: u64,
    /// Write checkpoint-<step>/ every N optimizer steps (0 disables)
    pub save_steps: usize,
    /// Periodic checkpoints to keep
    pub save_total_limit: usize,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("runs/codetune"),
            log_every: 10,
            seed: 42,
            save_steps: 0,
            save_total_limit: 3,
        }
    }
}

impl TrainConfig {
    /// Reject values the training loop cannot run with
    pub fn validate(&self) -> Result<(), TrainError> {
        let fail = |msg: &str| Err(TrainError::Config(msg.to_string()));

        if self.model.max_seq_len == 0 {
            return fail("model.max_seq_len must be positive");
        }
        if self.optim.train_batch_size == 0 || self.optim.eval_batch_size == 0 {
            return fail("optim batch sizes must be positive");
        }
        if self.optim.gradient_accumulation == 0 {
            return fail("optim.gradient_accumulation must be positive");
        }
        if self.optim.epochs == 0 {
            return fail("optim.epochs must be positive");
        }
        if !(self.optim.learning_rate.is_finite() && self.optim.learning_rate > 0.0) {
            return fail("optim.learning_rate must be a positive number");
        }
        if self.optim.weight_decay < 0.0 {
            return fail("optim.weight_decay must not be negative");
        }
        if self.optim.max_grad_norm <= 0.0 {
            return fail("optim.max_grad_norm must be positive");
        }
        if self.lora.rank == 0 {
            return fail("lora.rank must be positive");
        }
        if !(0.0..1.0).contains(&self.lora.dropout) {
            return fail("lora.dropout must be in [0, 1)");
        }
        if self.lora.target_modules.is_empty() {
            return fail("lora.target_modules must name at least one module");
        }
        if self.run.log_every == 0 {
            return fail("run.log_every must be positive");
        }
        if self.run.save_steps > 0 && self.run.save_total_limit == 0 {
            return fail("run.save_total_limit must be positive when run.save_steps is set");
        }
        if self.language.cross_language_learning && !self.language.language_aware {
            return fail("language.cross_language_learning requires language.language_aware");
        }
        for (name, weight) in [
            ("rust_weight", self.language.rust_weight),
            ("elixir_weight", self.language.elixir_weight),
        ] {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(TrainError::Config(format!(
                    "language.{} must be a finite non-negative number",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Write the configuration as TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}
