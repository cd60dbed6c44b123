// Labeled examples and the line-delimited JSON reader

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::config::RecordPolicy;
use crate::errors::TrainError;

/// One labeled example as stored on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Example {
    pub instruction: String,
    pub input: String,
    pub output: String,
    pub quality_score: f32,
}

impl Example {
    pub fn new(
        instruction: impl Into<String>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            input: input.into(),
            output: output.into(),
            quality_score: 0.0,
        }
    }

    pub fn with_quality(mut self, quality_score: f32) -> Self {
        self.quality_score = quality_score;
        self
    }

    /// Empty instruction or empty output after trimming
    pub fn is_degenerate(&self) -> bool {
        self.instruction.trim().is_empty() || self.output.trim().is_empty()
    }
}

/// Read examples from a JSONL file
///
/// Blank lines are skipped. Malformed JSON is always an error carrying the
/// 1-based line number. Under the strict policy degenerate records are
/// rejected; under the lenient policy they are kept and counted.
pub fn read_examples(path: &Path, policy: RecordPolicy) -> Result<Vec<Example>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut examples = Vec::new();
    let mut degenerate = 0usize;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line =
            line.with_context(|| format!("Failed to read {}:{}", path.display(), line_no))?;
        if line.trim().is_empty() {
            continue;
        }

        let example: Example =
            serde_json::from_str(&line).map_err(|e| TrainError::InvalidRecord {
                path: path.to_path_buf(),
                line: line_no,
                reason: e.to_string(),
            })?;

        if example.is_degenerate() {
            if policy == RecordPolicy::Strict {
                let field = if example.instruction.trim().is_empty() {
                    "instruction"
                } else {
                    "output"
                };
                return Err(TrainError::InvalidRecord {
                    path: path.to_path_buf(),
                    line: line_no,
                    reason: format!("empty {}", field),
                }
                .into());
            }
            degenerate += 1;
        }

        examples.push(example);
    }

    if degenerate > 0 {
        tracing::warn!(
            path = %path.display(),
            degenerate,
            total = examples.len(),
            "Keeping examples with an empty instruction or output"
        );
    }
    tracing::info!(path = %path.display(), count = examples.len(), "Loaded examples");

    Ok(examples)
}
