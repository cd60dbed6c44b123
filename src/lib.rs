// codetune - LoRA fine-tuning for instruction-to-code models
// Library exports

pub mod config;
pub mod data; // JSONL records, language tagging, batching
pub mod errors;
pub mod models; // Base model, adapters, tokenizers
pub mod training; // Loss, optimizer loop, checkpoints
