// Example normalization: raw example → tokenized (input, label) pair

use anyhow::Result;
use std::sync::Arc;

use super::augment::augment_instruction;
use super::example::Example;
use super::language::{classify, Language};
use crate::models::TextTokenizer;

/// Tokenized example ready for collation
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub labels: Vec<u32>,
    /// Present only in language-aware mode
    pub language: Option<Language>,
    pub quality_score: f32,
}

/// Builds prompts and encodes examples
pub struct ExampleNormalizer {
    tokenizer: Arc<dyn TextTokenizer>,
    max_seq_len: usize,
    language_aware: bool,
}

impl ExampleNormalizer {
    pub fn new(tokenizer: Arc<dyn TextTokenizer>, max_seq_len: usize, language_aware: bool) -> Self {
        Self {
            tokenizer,
            max_seq_len,
            language_aware,
        }
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Prompt text and detected language for an example
    ///
    /// Language-aware prompts classify the output, augment the instruction and
    /// frame the input as context for a code answer.
    pub fn build_prompt(&self, example: &Example) -> (String, Option<Language>) {
        let instruction = example.instruction.trim();
        let input = example.input.trim();

        if self.language_aware {
            let language = classify(example.output.trim());
            let instruction = augment_instruction(instruction, language);
            (
                format!("{}\n\nContext: {}\n\n### Code Output", instruction, input),
                Some(language),
            )
        } else {
            (
                format!("{}\n\n{}\n\n### Desired Output", instruction, input),
                None,
            )
        }
    }

    pub fn normalize(&self, example: &Example) -> Result<TokenizedExample> {
        let (prompt, language) = self.build_prompt(example);
        let input_ids = self.tokenizer.encode(&prompt, self.max_seq_len)?;
        let labels = self
            .tokenizer
            .encode(example.output.trim(), self.max_seq_len)?;

        Ok(TokenizedExample {
            input_ids,
            labels,
            language,
            quality_score: example.quality_score,
        })
    }

    pub fn normalize_all(&self, examples: &[Example]) -> Result<Vec<TokenizedExample>> {
        let tokenized = examples
            .iter()
            .map(|ex| self.normalize(ex))
            .collect::<Result<Vec<_>>>()?;

        if self.language_aware {
            let count = |lang: Language| {
                tokenized
                    .iter()
                    .filter(|ex| ex.language == Some(lang))
                    .count()
            };
            tracing::info!(
                rust = count(Language::Rust),
                elixir = count(Language::Elixir),
                unknown = count(Language::Unknown),
                "Language distribution"
            );
        }

        Ok(tokenized)
    }
}
