// LoRA (Low-Rank Adaptation) - Trainable adapters over a frozen base model
//
// Every projection is built through `LayerBuilder`. Base weights are detached
// so they never receive gradients; projections whose module name is listed in
// the adapter targets gain a low-rank branch whose variables live in a separate
// `VarMap`. Only that map is handed to the optimizer.
//
// y = W x + (alpha / rank) · B A dropout(x)
//
// `B` starts at zero, so a freshly built adapter reproduces the base model.
//
// # References
// - Paper: "LoRA: Low-Rank Adaptation of Large Language Models" (Hu et al., 2021)
// - https://arxiv.org/abs/2106.09685

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Shape, Tensor, Var};
use candle_nn::{Embedding, Init, Linear, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::persistence::BaseModel;
use super::seq2seq::Seq2SeqModel;
use crate::config::LoraSection;
use crate::data::Batch;
use crate::errors::TrainError;

/// File name of the adapter weights
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// File name of the adapter configuration
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// LoRA adapter configuration (fixed for a run)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the low-rank decomposition
    #[serde(rename = "r")]
    pub rank: usize,

    /// Scaling numerator; updates are scaled by alpha / rank
    #[serde(rename = "lora_alpha")]
    pub alpha: usize,

    #[serde(rename = "lora_dropout")]
    pub dropout: f64,

    /// Module names that receive adapters (e.g. ["q", "v"])
    pub target_modules: Vec<String>,

    #[serde(default = "default_task_type")]
    pub task_type: String,

    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

fn default_task_type() -> String {
    "SEQ_2_SEQ_LM".to_string()
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self::from_section(&LoraSection::default())
    }
}

impl LoraConfig {
    pub fn from_section(section: &LoraSection) -> Self {
        Self {
            rank: section.rank,
            alpha: section.alpha,
            dropout: section.dropout,
            target_modules: section.target_modules.clone(),
            task_type: default_task_type(),
            base_model_name_or_path: None,
        }
    }

    pub fn scale(&self) -> f64 {
        self.alpha as f64 / self.rank as f64
    }

    pub fn targets(&self, module: &str) -> bool {
        self.target_modules.iter().any(|t| t == module)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read adapter config from {:?}", path))?;
        serde_json::from_str(&json).context("Failed to parse adapter config JSON")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize adapter config")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write adapter config to {:?}", path))
    }
}

/// Trainable and total parameter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParameterReport {
    pub trainable: usize,
    pub total: usize,
}

impl ParameterReport {
    /// Trainable share in percent
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        100.0 * self.trainable as f64 / self.total as f64
    }
}

impl fmt::Display for ParameterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

#[derive(Debug, Default)]
struct ParamCounter {
    frozen: AtomicUsize,
    trainable: AtomicUsize,
}

#[derive(Clone)]
struct AdapterSlot {
    varmap: VarMap,
    config: LoraConfig,
    rng: Arc<Mutex<StdRng>>,
    adapted: Arc<Mutex<Vec<String>>>,
}

/// Builds layers from frozen base weights, attaching adapters where targeted
#[derive(Clone)]
pub struct LayerBuilder {
    base: VarBuilder<'static>,
    path: Vec<String>,
    adapter: Option<AdapterSlot>,
    counter: Arc<ParamCounter>,
}

impl LayerBuilder {
    /// Builder without adapters (plain base model)
    pub fn frozen(base: VarBuilder<'static>) -> Self {
        Self {
            base,
            path: Vec::new(),
            adapter: None,
            counter: Arc::new(ParamCounter::default()),
        }
    }

    /// Builder that creates adapter variables in `varmap`, with `A` drawn
    /// from a uniform distribution seeded by `seed`
    pub fn with_adapter(
        base: VarBuilder<'static>,
        varmap: VarMap,
        config: LoraConfig,
        seed: u64,
    ) -> Self {
        Self {
            base,
            path: Vec::new(),
            adapter: Some(AdapterSlot {
                varmap,
                config,
                rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
                adapted: Arc::new(Mutex::new(Vec::new())),
            }),
            counter: Arc::new(ParamCounter::default()),
        }
    }

    pub fn pp(&self, name: impl ToString) -> Self {
        let name = name.to_string();
        let mut path = self.path.clone();
        path.push(name.clone());
        Self {
            base: self.base.pp(name),
            path,
            adapter: self.adapter.clone(),
            counter: self.counter.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        self.base.device()
    }

    fn prefix(&self) -> String {
        self.path.join(".")
    }

    /// Fetch a frozen base tensor (hints only apply to fresh in-memory weights)
    pub fn tensor<S: Into<Shape>>(&self, shape: S, name: &str, init: Init) -> Result<Tensor> {
        let tensor = self
            .base
            .get_with_hints(shape, name, init)
            .with_context(|| format!("Missing base weight {}.{}", self.prefix(), name))?
            .detach();
        self.counter
            .frozen
            .fetch_add(tensor.elem_count(), Ordering::Relaxed);
        Ok(tensor)
    }

    pub fn embedding(&self, vocab: usize, dim: usize, name: &str) -> Result<Embedding> {
        let weight = self.pp(name).tensor(
            (vocab, dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Embedding::new(weight, dim))
    }

    pub fn layer_norm(&self, dim: usize, eps: f64, name: &str) -> Result<LayerNorm> {
        let vb = self.pp(name);
        Ok(LayerNorm {
            weight: vb.tensor(dim, "weight", Init::Const(1.0))?,
            bias: vb.tensor(dim, "bias", Init::Const(0.0))?,
            eps,
        })
    }

    /// Bias-free projection named `name`, adapted when `name` is a target
    pub fn linear(&self, in_dim: usize, out_dim: usize, name: &str) -> Result<AdaptedLinear> {
        let vb = self.pp(name);
        let weight = vb.tensor(
            (out_dim, in_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: (in_dim as f64).powf(-0.5),
            },
        )?;
        let base = Linear::new(weight, None);

        let lora = match &self.adapter {
            Some(slot) if slot.config.targets(name) => {
                Some(vb.lora_branch(slot, in_dim, out_dim)?)
            }
            _ => None,
        };

        Ok(AdaptedLinear { base, lora })
    }

    fn lora_branch(&self, slot: &AdapterSlot, in_dim: usize, out_dim: usize) -> Result<LoraBranch> {
        let rank = slot.config.rank;
        let device = self.device().clone();
        let prefix = self.prefix();

        // Kaiming-uniform bound for A; B is zero
        let bound = 1.0 / (in_dim as f64).sqrt();
        let values: Vec<f32> = {
            let mut rng = slot
                .rng
                .lock()
                .map_err(|_| anyhow::anyhow!("Adapter rng lock poisoned"))?;
            (0..rank * in_dim)
                .map(|_| rng.gen_range(-bound..bound) as f32)
                .collect()
        };
        let a = Var::from_tensor(&Tensor::from_vec(values, (rank, in_dim), &device)?)?;
        let b = Var::zeros((out_dim, rank), DType::F32, &device)?;

        {
            let mut data = slot
                .varmap
                .data()
                .lock()
                .map_err(|_| anyhow::anyhow!("Adapter variable map lock poisoned"))?;
            data.insert(format!("{}.lora_A.weight", prefix), a.clone());
            data.insert(format!("{}.lora_B.weight", prefix), b.clone());
        }
        slot.adapted
            .lock()
            .map_err(|_| anyhow::anyhow!("Adapter registry lock poisoned"))?
            .push(prefix);

        let count = a.elem_count() + b.elem_count();
        self.counter.trainable.fetch_add(count, Ordering::Relaxed);

        Ok(LoraBranch {
            a: Linear::new(a.as_tensor().clone(), None),
            b: Linear::new(b.as_tensor().clone(), None),
            scale: slot.config.scale(),
            dropout: slot.config.dropout as f32,
        })
    }

    /// Parameter counts of everything built so far
    pub fn report(&self) -> ParameterReport {
        let frozen = self.counter.frozen.load(Ordering::Relaxed);
        let trainable = self.counter.trainable.load(Ordering::Relaxed);
        ParameterReport {
            trainable,
            total: frozen + trainable,
        }
    }

    /// Fully-qualified names of the projections that received adapters
    pub fn adapted_modules(&self) -> Vec<String> {
        self.adapter
            .as_ref()
            .and_then(|slot| slot.adapted.lock().ok().map(|names| names.clone()))
            .unwrap_or_default()
    }
}

/// Layer normalization from primitive ops
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = x.rank() - 1;
        let mean = x.mean_keepdim(last)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(last)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?)
    }
}

#[derive(Debug, Clone)]
struct LoraBranch {
    a: Linear,
    b: Linear,
    scale: f64,
    dropout: f32,
}

/// Frozen projection with an optional low-rank update
#[derive(Debug, Clone)]
pub struct AdaptedLinear {
    base: Linear,
    lora: Option<LoraBranch>,
}

impl AdaptedLinear {
    pub fn is_adapted(&self) -> bool {
        self.lora.is_some()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let y = self.base.forward(x)?;
        let Some(lora) = &self.lora else {
            return Ok(y);
        };

        let x = if train && lora.dropout > 0.0 {
            candle_nn::ops::dropout(x, lora.dropout)?
        } else {
            x.clone()
        };
        let update = lora.b.forward(&lora.a.forward(&x)?)?;
        Ok((y + (update * lora.scale)?)?)
    }
}

/// Wraps a frozen base model with LoRA adapters
pub struct AdapterBuilder {
    config: LoraConfig,
    seed: u64,
}

impl AdapterBuilder {
    pub fn new(config: LoraConfig, seed: u64) -> Self {
        Self { config, seed }
    }

    pub fn build(&self, base: &BaseModel) -> Result<LoraModel> {
        let varmap = VarMap::new();
        let mut config = self.config.clone();
        if config.base_model_name_or_path.is_none() {
            config.base_model_name_or_path =
                base.source().map(|p| p.display().to_string());
        }

        let builder =
            LayerBuilder::with_adapter(base.var_builder(), varmap.clone(), config.clone(), self.seed);
        let model = Seq2SeqModel::new(base.config(), &builder)?;

        let adapted = builder.adapted_modules();
        if adapted.is_empty() {
            return Err(TrainError::AdapterMismatch(format!(
                "target modules {:?} not found in the base model",
                config.target_modules
            ))
            .into());
        }

        let report = builder.report();
        tracing::info!(
            rank = config.rank,
            alpha = config.alpha,
            adapted_modules = adapted.len(),
            trainable = report.trainable,
            total = report.total,
            "Built LoRA adapters"
        );

        Ok(LoraModel {
            model,
            adapter: varmap,
            config,
            report,
        })
    }
}

/// Base model plus trainable adapters
pub struct LoraModel {
    model: Seq2SeqModel,
    adapter: VarMap,
    config: LoraConfig,
    report: ParameterReport,
}

impl LoraModel {
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    pub fn model(&self) -> &Seq2SeqModel {
        &self.model
    }

    pub fn parameter_report(&self) -> ParameterReport {
        self.report
    }

    /// Adapter variables (the only parameters the optimizer sees)
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.adapter.all_vars()
    }

    pub fn adapter_varmap(&self) -> &VarMap {
        &self.adapter
    }

    /// Logits (b, t, vocab) for a collated batch
    pub fn forward_batch(&self, batch: &Batch, train: bool) -> Result<Tensor> {
        self.model.forward(
            &batch.input_ids,
            &batch.attention_mask,
            &batch.decoder_input_ids,
            train,
        )
    }

    /// Write adapter weights and configuration into `dir`
    pub fn save_adapter(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create adapter directory: {:?}", dir))?;
        let weights = dir.join(ADAPTER_WEIGHTS_FILE);
        self.adapter
            .save(&weights)
            .with_context(|| format!("Failed to save adapter weights to {:?}", weights))?;
        self.config.save(&dir.join(ADAPTER_CONFIG_FILE))?;
        tracing::debug!(path = ?weights, "Saved adapter");
        Ok(())
    }

    /// Rebuild the adapter layout from `dir`'s config and load its weights
    pub fn load_adapter(base: &BaseModel, dir: &Path) -> Result<Self> {
        let config = LoraConfig::load(&dir.join(ADAPTER_CONFIG_FILE))?;
        let mut model = AdapterBuilder::new(config, 0).build(base)?;

        let weights = dir.join(ADAPTER_WEIGHTS_FILE);
        let bytes =
            fs::read(&weights).with_context(|| format!("Failed to read {:?}", weights))?;
        let file = safetensors::SafeTensors::deserialize(&bytes)
            .with_context(|| format!("Failed to parse {:?}", weights))?;
        let stored: HashSet<String> = file.names().into_iter().cloned().collect();
        let expected: HashSet<String> = model
            .adapter
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("Adapter variable map lock poisoned"))?
            .keys()
            .cloned()
            .collect();

        let mut missing: Vec<_> = expected.difference(&stored).cloned().collect();
        let mut unexpected: Vec<_> = stored.difference(&expected).cloned().collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort();
            unexpected.sort();
            return Err(TrainError::AdapterMismatch(format!(
                "missing tensors {:?}, unexpected tensors {:?}",
                missing, unexpected
            ))
            .into());
        }

        model
            .adapter
            .load(&weights)
            .map_err(|e| TrainError::AdapterMismatch(e.to_string()))?;

        tracing::info!(path = ?weights, tensors = stored.len(), "Loaded adapter");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Seq2SeqConfig;

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

    fn lora_config(targets: &[&str]) -> LoraConfig {
        LoraConfig {
            rank: 4,
            alpha: 8,
            dropout: 0.0,
            target_modules: targets.iter().map(|t| t.to_string()).collect(),
            ..LoraConfig::default()
        }
    }

    #[test]
    fn test_lora_config_default() {
        let config = LoraConfig::default();
        assert_eq!(config.rank, 16);
        assert_eq!(config.alpha, 32);
        assert_eq!(config.scale(), 2.0);
        assert_eq!(config.task_type, "SEQ_2_SEQ_LM");
        assert!(config.targets("wi"));
        assert!(!config.targets("lm_head"));
    }

    #[test]
    fn test_adapter_config_uses_peft_keys() {
        let json = serde_json::to_value(lora_config(&["q"])).unwrap();
        assert_eq!(json["r"], 4);
        assert_eq!(json["lora_alpha"], 8);
        assert!(json.get("lora_dropout").is_some());
    }

    #[test]
    fn test_only_targets_are_adapted() {
        let base = BaseModel::random(tiny_config(), &Device::Cpu).unwrap();
        let model = AdapterBuilder::new(lora_config(&["q", "v"]), 0).build(&base).unwrap();

        // encoder self-attn + decoder self-attn + decoder cross-attn, q and v each
        assert_eq!(model.trainable_vars().len(), 3 * 2 * 2);

        let names: Vec<String> = model.adapter.data().lock().unwrap().keys().cloned().collect();
        assert!(names.iter().all(|n| n.contains(".q.lora_") || n.contains(".v.lora_")));
    }

    #[test]
    fn test_parameter_report() {
        let config = tiny_config();
        let base = BaseModel::random(config.clone(), &Device::Cpu).unwrap();
        let model = AdapterBuilder::new(lora_config(&["q"]), 0).build(&base).unwrap();
        let report = model.parameter_report();

        // three q projections, each A (4 x 16) + B (16 x 4)
        assert_eq!(report.trainable, 3 * (4 * 16 + 16 * 4));
        assert!(report.total > report.trainable);
        assert!(report.trainable_percent() > 0.0 && report.trainable_percent() < 100.0);
        assert!(report.to_string().starts_with("trainable params: 384 || all params: "));
    }

    #[test]
    fn test_unknown_targets_rejected() {
        let base = BaseModel::random(tiny_config(), &Device::Cpu).unwrap();
        let err = AdapterBuilder::new(lora_config(&["q_proj"]), 0)
            .build(&base)
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::AdapterMismatch(_))
        ));
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let base = BaseModel::random(tiny_config(), &Device::Cpu).unwrap();
        let first = AdapterBuilder::new(lora_config(&["q"]), 7).build(&base).unwrap();
        let second = AdapterBuilder::new(lora_config(&["q"]), 7).build(&base).unwrap();

        let name = "encoder.layers.0.self_attn.q.lora_A.weight";
        let a1 = first.adapter.data().lock().unwrap()[name].as_tensor().clone();
        let a2 = second.adapter.data().lock().unwrap()[name].as_tensor().clone();
        let diff = (a1 - a2).unwrap().abs().unwrap().sum_all().unwrap();
        assert_eq!(diff.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn test_layer_norm_normalizes_last_dim() {
        let device = Device::Cpu;
        let norm = LayerNorm {
            weight: Tensor::ones(4, DType::F32, &device).unwrap(),
            bias: Tensor::zeros(4, DType::F32, &device).unwrap(),
            eps: 1e-6,
        };
        let x = Tensor::new(&[[1f32, 2., 3., 4.], [10., 10., 10., 14.]], &device).unwrap();
        let y = norm.forward(&x).unwrap();
        let means = y.mean_keepdim(1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for m in means {
            assert!(m.abs() < 1e-5);
        }
    }
}
