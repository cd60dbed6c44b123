// Tokenizers for prompts and labels
//
// `TextTokenizer` is the capability the data pipeline and generation need.
// `HfTokenizer` wraps a HuggingFace `tokenizer.json`; `ByteTokenizer` is a
// self-contained byte-level vocabulary used by freshly initialised base models.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name for HuggingFace tokenizers
pub const HF_TOKENIZER_FILE: &str = "tokenizer.json";
/// File name for the byte-level tokenizer
pub const BYTE_TOKENIZER_FILE: &str = "byte_tokenizer.json";

/// Encode/decode capability with a truncation policy
pub trait TextTokenizer: Send + Sync {
    /// Encode text, appending end-of-sequence, truncated to at most `max_len`
    /// ids (end-of-sequence is kept when truncating)
    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>>;

    /// Decode ids, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    fn vocab_size(&self) -> usize;

    fn pad_id(&self) -> u32;

    fn eos_id(&self) -> u32;

    /// Persist into `dir`, returning the written file
    fn save(&self, dir: &Path) -> Result<PathBuf>;
}

/// Truncate keeping a trailing end-of-sequence id
fn truncate_keep_eos(mut ids: Vec<u32>, max_len: usize, eos_id: u32) -> Vec<u32> {
    if ids.len() <= max_len {
        return ids;
    }
    let ends_with_eos = ids.last() == Some(&eos_id);
    ids.truncate(max_len);
    if ends_with_eos {
        if let Some(last) = ids.last_mut() {
            *last = eos_id;
        }
    }
    ids
}

/// Byte-level tokenizer: `<pad>`=0, `</s>`=1, `<unk>`=2, bytes at 3..259
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteTokenizer;

#[derive(Serialize, Deserialize)]
struct ByteTokenizerFile {
    kind: String,
    vocab_size: usize,
}

impl ByteTokenizer {
    pub const PAD: u32 = 0;
    pub const EOS: u32 = 1;
    pub const UNK: u32 = 2;
    const OFFSET: u32 = 3;
    pub const VOCAB_SIZE: usize = 256 + Self::OFFSET as usize;

    pub fn new() -> Self {
        Self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: ByteTokenizerFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        if file.kind != "byte" || file.vocab_size != Self::VOCAB_SIZE {
            anyhow::bail!(
                "{} does not describe a byte tokenizer (kind={}, vocab_size={})",
                path.display(),
                file.kind,
                file.vocab_size
            );
        }
        Ok(Self)
    }
}

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>> {
        let mut ids: Vec<u32> = text.bytes().map(|b| b as u32 + Self::OFFSET).collect();
        ids.push(Self::EOS);
        Ok(truncate_keep_eos(ids, max_len, Self::EOS))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= Self::OFFSET && (id as usize) < Self::VOCAB_SIZE)
            .map(|&id| (id - Self::OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }

    fn pad_id(&self) -> u32 {
        Self::PAD
    }

    fn eos_id(&self) -> u32 {
        Self::EOS
    }

    fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(BYTE_TOKENIZER_FILE);
        let file = ByteTokenizerFile {
            kind: "byte".to_string(),
            vocab_size: Self::VOCAB_SIZE,
        };
        fs::write(&path, serde_json::to_string_pretty(&file)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// HuggingFace tokenizer loaded from `tokenizer.json`
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    eos_id: u32,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e))?;

        let pad_id = inner
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| inner.token_to_id("<pad>"))
            .unwrap_or(0);
        let eos_id = ["</s>", "<|endoftext|>", "<eos>"]
            .iter()
            .find_map(|tok| inner.token_to_id(tok))
            .unwrap_or(pad_id);

        tracing::debug!(
            path = %path.display(),
            vocab_size = inner.get_vocab_size(true),
            pad_id,
            eos_id,
            "Loaded HuggingFace tokenizer"
        );

        Ok(Self {
            inner,
            pad_id,
            eos_id,
        })
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str, max_len: usize) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization failed: {}", e))?;
        Ok(truncate_keep_eos(
            encoding.get_ids().to_vec(),
            max_len,
            self.eos_id,
        ))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Decoding failed: {}", e))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }

    fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(HF_TOKENIZER_FILE);
        self.inner
            .save(&path, false)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", path.display(), e))?;
        Ok(path)
    }
}

/// Load whichever tokenizer file `dir` contains (`tokenizer.json` preferred)
pub fn load_tokenizer(dir: &Path) -> Result<Arc<dyn TextTokenizer>> {
    let hf_path = dir.join(HF_TOKENIZER_FILE);
    if hf_path.exists() {
        return Ok(Arc::new(HfTokenizer::from_file(&hf_path)?));
    }
    let byte_path = dir.join(BYTE_TOKENIZER_FILE);
    if byte_path.exists() {
        return Ok(Arc::new(ByteTokenizer::load(&byte_path)?));
    }
    anyhow::bail!(
        "No tokenizer in {} (expected {} or {})",
        dir.display(),
        HF_TOKENIZER_FILE,
        BYTE_TOKENIZER_FILE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_encode_appends_eos() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("ab", 16).unwrap();
        assert_eq!(ids, vec![b'a' as u32 + 3, b'b' as u32 + 3, ByteTokenizer::EOS]);
        assert_eq!(tok.decode(&ids).unwrap(), "ab");
    }

    #[test]
    fn test_truncation_keeps_eos() {
        let tok = ByteTokenizer::new();
        let ids = tok.encode("abcdef", 4).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(*ids.last().unwrap(), ByteTokenizer::EOS);
        assert_eq!(tok.decode(&ids).unwrap(), "abc");
    }

    #[test]
    fn test_empty_text_encodes_to_eos() {
        let tok = ByteTokenizer::new();
        assert_eq!(tok.encode("", 8).unwrap(), vec![ByteTokenizer::EOS]);
        assert!(tok.encode("", 0).unwrap().is_empty());
    }

    #[test]
    fn test_decode_utf8_round_trip() {
        let tok = ByteTokenizer::new();
        let text = "défmodule |> ünïcode";
        let ids = tok.encode(text, 128).unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_save_and_load_tokenizer_dir() {
        let dir = tempfile::tempdir().unwrap();
        let written = ByteTokenizer::new().save(dir.path()).unwrap();
        assert!(written.ends_with(BYTE_TOKENIZER_FILE));
        let loaded = load_tokenizer(dir.path()).unwrap();
        assert_eq!(loaded.vocab_size(), ByteTokenizer::VOCAB_SIZE);
        assert_eq!(loaded.pad_id(), 0);
    }

    #[test]
    fn test_missing_tokenizer_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_tokenizer(dir.path()).is_err());
    }
}
