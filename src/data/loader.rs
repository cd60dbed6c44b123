// Batch collation and per-epoch shuffling

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::language::Language;
use super::normalizer::TokenizedExample;

/// Label value excluded from the loss
pub const IGNORE_INDEX: i64 = -100;

/// Padded batch tensors
#[derive(Debug, Clone)]
pub struct Batch {
    /// (b, s) u32
    pub input_ids: Tensor,
    /// (b, s) f32, 1.0 for real tokens
    pub attention_mask: Tensor,
    /// (b, t) u32, labels shifted right behind the decoder start id
    pub decoder_input_ids: Tensor,
    /// (b, t) i64, `IGNORE_INDEX` at padding
    pub labels: Tensor,
    pub languages: Vec<Option<Language>>,
    pub quality_scores: Vec<f32>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.languages.len()
    }
}

/// Pads tokenized examples into a `Batch`
#[derive(Debug, Clone)]
pub struct Collator {
    pub pad_id: u32,
    /// T5-style models start decoding from the pad id
    pub decoder_start_id: u32,
    pub pad_to_multiple_of: usize,
    /// Upper bound on padded lengths (model position table size)
    pub max_len: usize,
}

impl Collator {
    fn padded_len(&self, longest: usize) -> usize {
        let longest = longest.max(1);
        let rounded = if self.pad_to_multiple_of > 1 {
            longest.div_ceil(self.pad_to_multiple_of) * self.pad_to_multiple_of
        } else {
            longest
        };
        rounded.min(self.max_len.max(longest))
    }

    pub fn collate(&self, examples: &[&TokenizedExample], device: &Device) -> Result<Batch> {
        let b = examples.len();
        let s = self.padded_len(examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0));
        let t = self.padded_len(examples.iter().map(|e| e.labels.len()).max().unwrap_or(0));

        let mut input_ids = vec![self.pad_id; b * s];
        let mut attention_mask = vec![0f32; b * s];
        let mut decoder_input_ids = vec![self.pad_id; b * t];
        let mut labels = vec![IGNORE_INDEX; b * t];

        for (row, ex) in examples.iter().enumerate() {
            for (col, &id) in ex.input_ids.iter().enumerate() {
                input_ids[row * s + col] = id;
                attention_mask[row * s + col] = 1.0;
            }
            decoder_input_ids[row * t] = self.decoder_start_id;
            for (col, &id) in ex.labels.iter().enumerate() {
                labels[row * t + col] = id as i64;
                if col + 1 < t {
                    decoder_input_ids[row * t + col + 1] = id;
                }
            }
        }

        Ok(Batch {
            input_ids: Tensor::from_vec(input_ids, (b, s), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (b, s), device)?,
            decoder_input_ids: Tensor::from_vec(decoder_input_ids, (b, t), device)?,
            labels: Tensor::from_vec(labels, (b, t), device)?,
            languages: examples.iter().map(|e| e.language).collect(),
            quality_scores: examples.iter().map(|e| e.quality_score).collect(),
        })
    }
}

/// Serves batches of a tokenized dataset
pub struct DataLoader {
    examples: Vec<TokenizedExample>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    collator: Collator,
}

impl DataLoader {
    pub fn new(
        examples: Vec<TokenizedExample>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        collator: Collator,
    ) -> Self {
        Self {
            examples,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            collator,
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Batches per epoch (last batch may be short)
    pub fn num_batches(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    /// Example indices per batch for `epoch`, shuffled from `seed + epoch`
    pub fn epoch_batches(&self, epoch: usize) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let rows: Vec<&TokenizedExample> = indices
            .iter()
            .filter_map(|&i| self.examples.get(i))
            .collect();
        self.collator.collate(&rows, device)
    }
}
