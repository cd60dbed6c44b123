// Common model configuration
// Serialized as config.json beside the base model weights

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File name of the base model configuration
pub const MODEL_CONFIG_FILE: &str = "config.json";
/// File name of the base model weights
pub const MODEL_WEIGHTS_FILE: &str = "model.safetensors";

/// Encoder-decoder transformer hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seq2SeqConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub num_encoder_layers: usize,
    pub num_decoder_layers: usize,
    pub d_ff: usize,
    /// Size of the learned position tables
    pub max_position: usize,
    #[serde(default)]
    pub dropout: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
    #[serde(default)]
    pub decoder_start_token_id: u32,
}

fn default_layer_norm_eps() -> f64 {
    1e-6
}

fn default_eos_token_id() -> u32 {
    1
}

impl Default for Seq2SeqConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32_100,
            d_model: 512,
            num_heads: 8,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            d_ff: 2048,
            max_position: 1024,
            dropout: 0.1,
            layer_norm_eps: default_layer_norm_eps(),
            pad_token_id: 0,
            eos_token_id: default_eos_token_id(),
            decoder_start_token_id: 0,
        }
    }
}

impl Seq2SeqConfig {
    /// Small byte-vocabulary config for fast testing (works well on CPU)
    pub fn small() -> Self {
        Self {
            vocab_size: 259,
            d_model: 128,
            num_heads: 4,
            num_encoder_layers: 2,
            num_decoder_layers: 2,
            d_ff: 512,
            max_position: 1024,
            dropout: 0.0,
            ..Self::default()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.d_model % self.num_heads != 0 {
            anyhow::bail!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model,
                self.num_heads
            );
        }
        if self.vocab_size == 0 || self.d_ff == 0 || self.max_position == 0 {
            anyhow::bail!("vocab_size, d_ff and max_position must be positive");
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read model config from {:?}", path))?;
        let config: Self =
            serde_json::from_str(&json).context("Failed to parse model config JSON")?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize model config")?;
        fs::write(path, json).with_context(|| format!("Failed to write model config to {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_config_is_valid() {
        let config = Seq2SeqConfig::small();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 32);
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let config = Seq2SeqConfig {
            d_model: 30,
            num_heads: 4,
            ..Seq2SeqConfig::small()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MODEL_CONFIG_FILE);
        let config = Seq2SeqConfig::small();
        config.save(&path).unwrap();
        assert_eq!(Seq2SeqConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_optional_fields_default() {
        let config: Seq2SeqConfig = serde_json::from_str(
            r#"{"vocab_size": 259, "d_model": 16, "num_heads": 2,
                "num_encoder_layers": 1, "num_decoder_layers": 1,
                "d_ff": 32, "max_position": 64}"#,
        )
        .unwrap();
        assert_eq!(config.eos_token_id, 1);
        assert_eq!(config.dropout, 0.0);
        assert_eq!(config.layer_norm_eps, 1e-6);
    }
}
