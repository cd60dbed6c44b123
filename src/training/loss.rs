// Token-level cross-entropy with optional per-language weighting

use anyhow::Result;
use candle_core::{DType, Tensor, D};

use crate::config::{LanguageSection, LossReduction};
use crate::data::{Language, LanguageWeights};

/// Per-example summed negative log-likelihood and token counts
pub struct ExampleLosses {
    /// (b) summed loss over non-ignored positions
    pub sums: Tensor,
    /// Non-ignored positions per example
    pub counts: Vec<f32>,
}

impl ExampleLosses {
    pub fn total_tokens(&self) -> f32 {
        self.counts.iter().sum()
    }
}

/// Cross-entropy summed per example, ignoring labels below zero
///
/// `logits` is (b, t, vocab) and `labels` is (b, t) i64.
pub fn per_example_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<ExampleLosses> {
    let mask = labels.ge(0i64)?;
    let safe_labels = mask
        .where_cond(labels, &labels.zeros_like()?)?
        .to_dtype(DType::U32)?;

    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let mask = mask.to_dtype(logits.dtype())?;
    let sums = (picked.neg()? * &mask)?.sum(1)?;
    let counts = mask.sum(1)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;

    Ok(ExampleLosses { sums, counts })
}

/// Mean cross-entropy over all non-ignored tokens of the batch
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let parts = per_example_cross_entropy(logits, labels)?;
    let tokens = parts.total_tokens().max(1.0) as f64;
    Ok((parts.sums.sum_all()? / tokens)?)
}

/// Scalar training loss for a batch
#[derive(Debug, Clone)]
pub struct LossEvaluator {
    weights: Option<LanguageWeights>,
    reduction: LossReduction,
}

impl LossEvaluator {
    pub fn unweighted() -> Self {
        Self {
            weights: None,
            reduction: LossReduction::Token,
        }
    }

    pub fn weighted(weights: LanguageWeights, reduction: LossReduction) -> Self {
        Self {
            weights: Some(weights),
            reduction,
        }
    }

    /// Weighted only when cross-language learning is enabled
    pub fn from_section(section: &LanguageSection) -> Self {
        if section.cross_language_learning {
            Self::weighted(LanguageWeights::from_section(section), section.reduction)
        } else {
            Self::unweighted()
        }
    }

    pub fn is_weighted(&self) -> bool {
        self.weights.is_some()
    }

    pub fn compute(
        &self,
        logits: &Tensor,
        labels: &Tensor,
        languages: &[Option<Language>],
    ) -> Result<Tensor> {
        let Some(weights) = &self.weights else {
            return cross_entropy(logits, labels);
        };

        let parts = per_example_cross_entropy(logits, labels)?;
        let batch = parts.counts.len();
        if languages.len() != batch {
            anyhow::bail!(
                "{} language tags for a batch of {} examples",
                languages.len(),
                batch
            );
        }

        let factors: Vec<f32> = match self.reduction {
            // sum_i w_i * n_i * ce_i / sum_i n_i
            LossReduction::Token => {
                let tokens = parts.total_tokens().max(1.0);
                languages
                    .iter()
                    .map(|lang| weights.weight(*lang) as f32 / tokens)
                    .collect()
            }
            // mean_i w_i * ce_i
            LossReduction::Example => languages
                .iter()
                .zip(&parts.counts)
                .map(|(lang, count)| weights.weight(*lang) as f32 / (count.max(1.0) * batch as f32))
                .collect(),
        };

        let factors = Tensor::from_vec(factors, batch, parts.sums.device())?
            .to_dtype(parts.sums.dtype())?;
        Ok((parts.sums * factors)?.sum_all()?)
    }
}
