// Base model persistence
// A base model directory holds config.json, model.safetensors and a tokenizer file

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::common::{Seq2SeqConfig, MODEL_CONFIG_FILE, MODEL_WEIGHTS_FILE};
use super::lora::LayerBuilder;
use super::seq2seq::Seq2SeqModel;
use super::tokenizer::{ByteTokenizer, TextTokenizer};

/// Frozen base weights plus their configuration
pub struct BaseModel {
    config: Seq2SeqConfig,
    vb: VarBuilder<'static>,
    /// Present for in-memory (freshly initialised) weights
    varmap: Option<VarMap>,
    source: Option<PathBuf>,
}

impl BaseModel {
    /// Memory-map weights from a base model directory
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let config = Seq2SeqConfig::load(&dir.join(MODEL_CONFIG_FILE))?;
        let weights = dir.join(MODEL_WEIGHTS_FILE);
        if !weights.exists() {
            anyhow::bail!("Model weights not found at {:?}", weights);
        }

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&weights], DType::F32, device)
                .with_context(|| format!("Failed to map {:?}", weights))?
        };

        tracing::info!(
            path = ?dir,
            d_model = config.d_model,
            vocab_size = config.vocab_size,
            "Loaded base model"
        );

        Ok(Self {
            config,
            vb,
            varmap: None,
            source: Some(dir.to_path_buf()),
        })
    }

    /// Randomly initialised in-memory weights
    pub fn random(config: Seq2SeqConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        // Building once materialises every variable in the map
        Seq2SeqModel::new(&config, &LayerBuilder::frozen(vb.clone()))?;

        Ok(Self {
            config,
            vb,
            varmap: Some(varmap),
            source: None,
        })
    }

    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn device(&self) -> &Device {
        self.vb.device()
    }

    pub fn var_builder(&self) -> VarBuilder<'static> {
        self.vb.clone()
    }

    /// Plain (unadapted) model over these weights
    pub fn build(&self) -> Result<Seq2SeqModel> {
        Seq2SeqModel::new(&self.config, &LayerBuilder::frozen(self.var_builder()))
    }

    /// Write config.json and model.safetensors (in-memory weights only)
    pub fn save(&self, dir: &Path) -> Result<()> {
        let varmap = self
            .varmap
            .as_ref()
            .context("Only in-memory base models can be saved")?;
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        let weights = dir.join(MODEL_WEIGHTS_FILE);
        varmap
            .save(&weights)
            .with_context(|| format!("Failed to save model weights to {:?}", weights))?;
        self.config.save(&dir.join(MODEL_CONFIG_FILE))?;

        tracing::info!(path = ?dir, "Saved base model");
        Ok(())
    }
}

/// Create a randomly initialised base model directory with a byte tokenizer
pub fn init_base_model(config: Seq2SeqConfig, dir: &Path, device: &Device) -> Result<BaseModel> {
    if config.vocab_size < ByteTokenizer::VOCAB_SIZE {
        anyhow::bail!(
            "vocab_size {} is smaller than the byte tokenizer vocabulary ({})",
            config.vocab_size,
            ByteTokenizer::VOCAB_SIZE
        );
    }
    let config = Seq2SeqConfig {
        pad_token_id: ByteTokenizer::PAD,
        eos_token_id: ByteTokenizer::EOS,
        decoder_start_token_id: ByteTokenizer::PAD,
        ..config
    };

    let base = BaseModel::random(config, device)?;
    base.save(dir)?;
    ByteTokenizer::new().save(dir)?;
    Ok(base)
}

/// Check if a base model directory looks complete
pub fn model_exists(dir: &Path) -> bool {
    dir.join(MODEL_CONFIG_FILE).exists() && dir.join(MODEL_WEIGHTS_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    fn tiny_config() -> Seq2SeqConfig {
        Seq2SeqConfig {
            vocab_size: 259,
            d_model: 16,
            num_heads: 2,
            num_encoder_layers: 1,
            num_decoder_layers: 1,
            d_ff: 32,
            max_position: 64,
            dropout: 0.0,
            ..Seq2SeqConfig::default()
        }
    }

    #[test]
    fn test_init_and_reload_base_model() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        assert!(!model_exists(dir.path()));

        let base = init_base_model(tiny_config(), dir.path(), &device).unwrap();
        assert!(model_exists(dir.path()));
        assert!(dir.path().join("byte_tokenizer.json").exists());

        let reloaded = BaseModel::load(dir.path(), &device).unwrap();
        assert_eq!(reloaded.config(), base.config());

        let input = Tensor::new(&[[5u32, 6, 1]], &device).unwrap();
        let mask = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        let dec = Tensor::new(&[[0u32, 9]], &device).unwrap();
        let a = base.build().unwrap().forward(&input, &mask, &dec, false).unwrap();
        let b = reloaded.build().unwrap().forward(&input, &mask, &dec, false).unwrap();
        let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap().max(0).unwrap();
        assert!(diff.to_scalar::<f32>().unwrap() < 1e-6);
    }

    #[test]
    fn test_rejects_small_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let config = Seq2SeqConfig {
            vocab_size: 100,
            ..tiny_config()
        };
        assert!(init_base_model(config, dir.path(), &Device::Cpu).is_err());
    }

    #[test]
    fn test_loaded_model_cannot_be_saved_again() {
        let dir = tempfile::tempdir().unwrap();
        init_base_model(tiny_config(), dir.path(), &Device::Cpu).unwrap();
        let loaded = BaseModel::load(dir.path(), &Device::Cpu).unwrap();
        assert!(loaded.save(&dir.path().join("copy")).is_err());
    }
}
