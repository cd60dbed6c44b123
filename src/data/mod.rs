// Data pipeline: records → normalized examples → padded batches

pub mod augment;
pub mod example;
pub mod language;
pub mod loader;
pub mod normalizer;

pub use augment::augment_instruction;
pub use example::{read_examples, Example};
pub use language::{classify, Language, LanguageWeights};
pub use loader::{Batch, Collator, DataLoader, IGNORE_INDEX};
pub use normalizer::{ExampleNormalizer, TokenizedExample};
