// Models: frozen encoder-decoder base, LoRA adapters, tokenizers

pub mod common;
pub mod lora;
pub mod persistence;
pub mod seq2seq;
pub mod tokenizer;

pub use common::{Seq2SeqConfig, MODEL_CONFIG_FILE, MODEL_WEIGHTS_FILE};
pub use lora::{
    AdaptedLinear, AdapterBuilder, LayerBuilder, LoraConfig, LoraModel, ParameterReport,
    ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE,
};
pub use persistence::{init_base_model, model_exists, BaseModel};
pub use seq2seq::Seq2SeqModel;
pub use tokenizer::{load_tokenizer, ByteTokenizer, HfTokenizer, TextTokenizer};
