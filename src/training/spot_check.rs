// Spot-check generation from a trained adapter
//
// Loads base model plus adapter, rebuilds prompts the way training did and
// generates an answer for the first few examples of a JSONL file. Decoding is
// greedy at temperature 0, otherwise sampled with optional nucleus filtering.

use anyhow::{Context, Result};
use candle_transformers::generation::LogitsProcessor;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::checkpoint::{load_checkpoint, TrainingRecord, TRAINING_CONFIG_FILE};
use crate::config::RecordPolicy;
use crate::data::{read_examples, Example, ExampleNormalizer, Language};
use crate::models::{BaseModel, LoraModel, TextTokenizer};

pub const DEFAULT_NUM_EXAMPLES: usize = 5;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 512;

/// Decoding settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sampling {
    /// 0 selects greedy decoding
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub seed: u64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: None,
            seed: 42,
        }
    }
}

impl Sampling {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    fn processor(&self) -> LogitsProcessor {
        let temperature = (!self.is_greedy()).then_some(self.temperature);
        LogitsProcessor::new(self.seed, temperature, self.top_p)
    }
}

/// One generated sample next to its reference
#[derive(Debug, Clone, Serialize)]
pub struct SpotCheckSample {
    pub instruction: String,
    pub input: String,
    pub expected: String,
    pub generated: String,
    pub language: Option<Language>,
}

impl fmt::Display for SpotCheckSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Instruction: {}", self.instruction)?;
        writeln!(f, "Input: {}", self.input)?;
        writeln!(f, "Expected: {}", self.expected)?;
        writeln!(f, "Model: {}", self.generated)?;
        write!(f, "{}", "-".repeat(80))
    }
}

/// Generation with a loaded adapter
pub struct SpotChecker {
    model: LoraModel,
    tokenizer: Arc<dyn TextTokenizer>,
    normalizer: ExampleNormalizer,
    max_new_tokens: usize,
    sampling: Sampling,
}

impl SpotChecker {
    pub fn new(
        model: LoraModel,
        tokenizer: Arc<dyn TextTokenizer>,
        max_seq_len: usize,
        language_aware: bool,
    ) -> Self {
        let normalizer = ExampleNormalizer::new(tokenizer.clone(), max_seq_len, language_aware);
        Self {
            model,
            tokenizer,
            normalizer,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            sampling: Sampling::default(),
        }
    }

    /// Load the adapter in `adapter_dir` on top of `base`
    ///
    /// Prompt style follows the run's training record: runs recorded with
    /// language settings get language-aware prompts.
    pub fn load(
        base: &BaseModel,
        adapter_dir: &Path,
        tokenizer: Arc<dyn TextTokenizer>,
        max_seq_len: usize,
    ) -> Result<Self> {
        let model = load_checkpoint(base, adapter_dir)?;

        let record_path = adapter_dir.join(TRAINING_CONFIG_FILE);
        let language_aware = if record_path.exists() {
            TrainingRecord::load(&record_path)?
                .rust_elixir_specific
                .is_some()
        } else {
            tracing::warn!(path = ?record_path, "No training record; using generic prompts");
            false
        };

        Ok(Self::new(model, tokenizer, max_seq_len, language_aware))
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    /// Each call starts a fresh sampler from the configured seed
    pub fn generate(&self, example: &Example) -> Result<SpotCheckSample> {
        let (prompt, language) = self.normalizer.build_prompt(example);
        let input_ids = self
            .tokenizer
            .encode(&prompt, self.normalizer.max_seq_len())?;
        let output_ids = self.model.model().generate_with(
            &input_ids,
            self.max_new_tokens,
            &mut self.sampling.processor(),
        )?;
        let generated = self.tokenizer.decode(&output_ids)?;

        Ok(SpotCheckSample {
            instruction: example.instruction.clone(),
            input: example.input.clone(),
            expected: example.output.clone(),
            generated,
            language,
        })
    }

    /// Generate for the first `num_examples` records of `path`
    pub fn run(&self, path: &Path, num_examples: usize) -> Result<Vec<SpotCheckSample>> {
        let examples = read_examples(path, RecordPolicy::Lenient)
            .with_context(|| format!("Failed to read examples from {:?}", path))?;

        let mut samples = Vec::new();
        for example in examples.iter().take(num_examples) {
            let sample = self.generate(example)?;
            tracing::debug!(
                language = ?sample.language,
                chars = sample.generated.len(),
                "Generated sample"
            );
            samples.push(sample);
        }
        Ok(samples)
    }
}
