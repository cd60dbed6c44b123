// Error types and user-friendly error messages
//
// `TrainError` names the failures the training pipeline can report on its own.
// The helper functions turn common failures into actionable messages for the CLI.

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Domain errors raised by the training pipeline
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainError {
    /// Configuration validation failures
    #[error("Configuration error: {0}")]
    Config(String),

    /// A JSONL record rejected by the strict record policy or unparsable
    #[error("Invalid record at {path}:{line}: {reason}")]
    InvalidRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Training set produced no batches
    #[error("Training set is empty: {0}")]
    EmptyDataset(String),

    /// Tokenizer produces ids the model cannot embed
    #[error("Tokenizer vocabulary ({tokenizer}) exceeds model vocabulary ({model})")]
    VocabularyMismatch { tokenizer: usize, model: usize },

    /// Adapter file does not match the adapter layout built for the base model
    #[error("Adapter mismatch: {0}")]
    AdapterMismatch(String),

    /// Operation attempted after the run reached its terminal state
    #[error("Training run already finished at step {global_step}")]
    RunFinished { global_step: usize },

    /// Operation attempted after an earlier run failed partway
    #[error("Training run failed at step {global_step}; start a new run")]
    RunFailed { global_step: usize },
}

/// Wrap an error with user-friendly context
pub trait UserFriendlyError {
    /// Add user-friendly context to this error
    fn user_context(self, message: &str) -> Self;

    /// Add user-friendly context with a suggestion
    fn user_context_with_suggestion(self, problem: &str, suggestion: &str) -> Self;
}

impl<T> UserFriendlyError for Result<T> {
    fn user_context(self, message: &str) -> Self {
        self.with_context(|| message.to_string())
    }

    fn user_context_with_suggestion(self, problem: &str, suggestion: &str) -> Self {
        self.with_context(|| {
            format!(
                "{}\n\n\x1b[1;33mSuggestion:\x1b[0m {}",
                problem, suggestion
            )
        })
    }
}

/// Format a config parse error with helpful suggestions
pub fn config_parse_error(error: &str) -> String {
    format!(
        "Failed to load training configuration\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Write a fresh default config and compare:\n\
           \x1b[36mcodetune init-config /tmp/codetune.toml\x1b[0m\n\n\
        2. Check environment overrides (sections use a double underscore):\n\
           \x1b[36menv | grep CODETUNE_\x1b[0m\n\n\
        3. Common mistakes:\n\
           • Missing quotes around strings\n\
           • Unknown section names (expected model, data, optim, lora, language, run)\n\
           • Numbers written as strings",
        error
    )
}

/// Format a file not found error with helpful suggestions
pub fn file_not_found_error(path: &str, description: &str) -> String {
    format!(
        "{} not found: {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • File has been moved or deleted\n\
        • Wrong path specified (relative paths resolve from the working directory)\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check if file exists:\n\
           \x1b[36mls -la {}\x1b[0m\n\n\
        2. Check parent directory:\n\
           \x1b[36mls -la $(dirname \"{}\")\x1b[0m",
        description, path, path, path
    )
}

/// Format a base model loading error with helpful suggestions
pub fn model_loading_error(base_model: &str, error: &str) -> String {
    format!(
        "Failed to load base model '{}'\n\n\
        \x1b[1;33mError:\x1b[0m {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • Directory is missing config.json or model.safetensors\n\
        • Weights were written for a different model configuration\n\
        • Insufficient memory on the selected device\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. List the model directory:\n\
           \x1b[36mls -la {}\x1b[0m\n\n\
        2. Create a fresh base model to verify the pipeline:\n\
           \x1b[36mcodetune init-base --output {}\x1b[0m\n\n\
        3. Force CPU execution:\n\
           \x1b[36mCODETUNE_MODEL__DEVICE=cpu codetune train ...\x1b[0m",
        base_model, error, base_model, base_model
    )
}

/// Wrap a generic error with suggestions
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!(
        "{}\n\n\
        \x1b[1;33mSuggestion:\x1b[0m {}",
        error, suggestion
    )
}
