// Language detection and per-language loss weights
//
// Detection is a best-effort lexical heuristic over the target code only.
// Markers are checked in a fixed order and the first family that matches
// wins, so a snippet mixing both families resolves to Elixir.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::config::LanguageSection;

/// Language tag attached to a training example
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Rust,
    Elixir,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Rust => "rust",
            Language::Elixir => "elixir",
            Language::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `def ` preceded by a non-identifier character (or start of text)
static ELIXIR_DEF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bdef ").expect("Failed to compile def regex"));

const ELIXIR_MARKERS: &[&str] = &["defmodule", "|>"];
const RUST_MARKERS: &[&str] = &["fn ", "struct ", "impl "];

/// Classify target code text (case-sensitive, first match wins)
pub fn classify(code: &str) -> Language {
    if ELIXIR_MARKERS.iter().any(|m| code.contains(m)) || ELIXIR_DEF.is_match(code) {
        return Language::Elixir;
    }
    if RUST_MARKERS.iter().any(|m| code.contains(m)) {
        return Language::Rust;
    }
    Language::Unknown
}

/// Tag → loss weight lookup with a required default
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageWeights {
    weights: HashMap<Language, f64>,
    default: f64,
}

impl LanguageWeights {
    pub fn new(default: f64) -> Self {
        Self {
            weights: HashMap::new(),
            default,
        }
    }

    /// All weights 1.0
    pub fn uniform() -> Self {
        Self::new(1.0)
    }

    pub fn with_weight(mut self, language: Language, weight: f64) -> Self {
        self.weights.insert(language, weight);
        self
    }

    pub fn from_section(section: &LanguageSection) -> Self {
        Self::uniform()
            .with_weight(Language::Rust, section.rust_weight)
            .with_weight(Language::Elixir, section.elixir_weight)
    }

    /// Weight for a tag; untagged examples and unlisted tags get the default
    pub fn weight(&self, language: Option<Language>) -> f64 {
        language
            .and_then(|lang| self.weights.get(&lang).copied())
            .unwrap_or(self.default)
    }

    /// True when every lookup yields 1.0
    pub fn is_uniform(&self) -> bool {
        self.default == 1.0 && self.weights.values().all(|w| *w == 1.0)
    }
}

impl Default for LanguageWeights {
    fn default() -> Self {
        Self::uniform()
    }
}
