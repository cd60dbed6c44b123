// Seq2Seq Model - Encoder-decoder transformer for code generation
//
// Pre-norm layers with learned positions. Projections use T5 module names
// (q, k, v, o, wi, wo) so adapter targets match T5-family configurations.

use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::Embedding;
use candle_transformers::generation::LogitsProcessor;

use super::common::Seq2SeqConfig;
use super::lora::{AdaptedLinear, LayerBuilder, LayerNorm};

const MASK_VALUE: f64 = -1e9;

/// Encoder-decoder transformer
pub struct Seq2SeqModel {
    config: Seq2SeqConfig,
    shared: Embedding,
    encoder: Encoder,
    decoder: Decoder,
    lm_head: AdaptedLinear,
    device: Device,
}

impl Seq2SeqModel {
    pub fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        config.validate()?;
        let shared = vb.embedding(config.vocab_size, config.d_model, "shared")?;
        let encoder = Encoder::new(config, &vb.pp("encoder"))?;
        let decoder = Decoder::new(config, &vb.pp("decoder"))?;
        let lm_head = vb.linear(config.d_model, config.vocab_size, "lm_head")?;

        Ok(Self {
            config: config.clone(),
            shared,
            encoder,
            decoder,
            lm_head,
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Encoder hidden states (b, s, d)
    pub fn encode(&self, input_ids: &Tensor, attention_mask: &Tensor, train: bool) -> Result<Tensor> {
        let embedded = self.shared.forward(input_ids)?;
        let key_mask = padding_mask(attention_mask)?;
        self.encoder.forward(&embedded, &key_mask, train)
    }

    /// Logits (b, t, vocab) given encoder states
    pub fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_states: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let embedded = self.shared.forward(decoder_input_ids)?;
        let cross_mask = padding_mask(attention_mask)?;
        let causal = causal_mask(decoder_input_ids.dim(1)?, &self.device)?;
        let hidden = self
            .decoder
            .forward(&embedded, encoder_states, &causal, &cross_mask, train)?;
        self.lm_head.forward(&hidden, train)
    }

    /// Logits (b, t, vocab) for teacher-forced decoding
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let encoder_states = self.encode(input_ids, attention_mask, train)?;
        self.decode(decoder_input_ids, &encoder_states, attention_mask, train)
    }

    /// Greedy decoding for a single prompt, returning generated ids without
    /// the decoder start token
    pub fn generate(&self, input_ids: &[u32], max_new_tokens: usize) -> Result<Vec<u32>> {
        self.decode_loop(input_ids, max_new_tokens, |logits| {
            Ok(logits.argmax(D::Minus1)?.to_scalar::<u32>()?)
        })
    }

    /// Decoding with a logits processor (greedy when it has no temperature)
    pub fn generate_with(
        &self,
        input_ids: &[u32],
        max_new_tokens: usize,
        sampler: &mut LogitsProcessor,
    ) -> Result<Vec<u32>> {
        self.decode_loop(input_ids, max_new_tokens, |logits| Ok(sampler.sample(logits)?))
    }

    fn decode_loop<F>(&self, input_ids: &[u32], max_new_tokens: usize, mut next_token: F) -> Result<Vec<u32>>
    where
        F: FnMut(&Tensor) -> Result<u32>,
    {
        let len = input_ids.len().min(self.config.max_position);
        let input = Tensor::new(&input_ids[..len], &self.device)?.unsqueeze(0)?;
        let mask = Tensor::ones((1, len), DType::F32, &self.device)?;
        let encoder_states = self.encode(&input, &mask, false)?;

        let budget = max_new_tokens.min(self.config.max_position.saturating_sub(1));
        let mut decoded = vec![self.config.decoder_start_token_id];
        for _ in 0..budget {
            let current = Tensor::new(decoded.as_slice(), &self.device)?.unsqueeze(0)?;
            let logits = self.decode(&current, &encoder_states, &mask, false)?;

            // Logits for last position
            let last = logits.i((0, decoded.len() - 1))?;
            let token = next_token(&last)?;

            if token == self.config.eos_token_id {
                break;
            }
            decoded.push(token);
        }

        Ok(decoded.split_off(1))
    }
}

/// Additive key padding mask (b, 1, 1, s) from a (b, s) 0/1 mask
fn padding_mask(attention_mask: &Tensor) -> Result<Tensor> {
    let (b, s) = attention_mask.dims2()?;
    let inverted = (attention_mask.ones_like()? - attention_mask)?;
    Ok((inverted * MASK_VALUE)?.reshape((b, 1, 1, s))?)
}

/// Additive causal mask (1, 1, t, t)
fn causal_mask(t: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..t)
        .flat_map(|i| (0..t).map(move |j| if j > i { MASK_VALUE as f32 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(values, (1, 1, t, t), device)?)
}

fn dropout(x: &Tensor, p: f64, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p as f32)?)
    } else {
        Ok(x.clone())
    }
}

/// Learned absolute positions added to token embeddings
struct Positions {
    table: Embedding,
}

impl Positions {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        Ok(Self {
            table: vb.embedding(config.max_position, config.d_model, "position")?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let seq_len = x.dim(1)?;
        let ids = Tensor::arange(0u32, seq_len as u32, x.device())?;
        let pos = self.table.forward(&ids)?;
        Ok(x.broadcast_add(&pos)?)
    }
}

struct Encoder {
    positions: Positions,
    layers: Vec<EncoderLayer>,
    final_norm: LayerNorm,
    dropout: f64,
}

impl Encoder {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        let layers = (0..config.num_encoder_layers)
            .map(|i| EncoderLayer::new(config, &vb.pp(format!("layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            positions: Positions::new(config, vb)?,
            layers,
            final_norm: vb.layer_norm(config.d_model, config.layer_norm_eps, "final_norm")?,
            dropout: config.dropout,
        })
    }

    fn forward(&self, x: &Tensor, key_mask: &Tensor, train: bool) -> Result<Tensor> {
        let mut hidden = dropout(&self.positions.forward(x)?, self.dropout, train)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, key_mask, train)?;
        }
        self.final_norm.forward(&hidden)
    }
}

struct EncoderLayer {
    self_attn: Attention,
    self_attn_norm: LayerNorm,
    ff: FeedForward,
    ff_norm: LayerNorm,
    dropout: f64,
}

impl EncoderLayer {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: Attention::new(config, &vb.pp("self_attn"))?,
            self_attn_norm: vb.layer_norm(config.d_model, eps, "self_attn_norm")?,
            ff: FeedForward::new(config, &vb.pp("ff"))?,
            ff_norm: vb.layer_norm(config.d_model, eps, "ff_norm")?,
            dropout: config.dropout,
        })
    }

    fn forward(&self, x: &Tensor, key_mask: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.self_attn_norm.forward(x)?;
        let attn = self.self_attn.forward(&normed, &normed, key_mask, train)?;
        let x = (x + dropout(&attn, self.dropout, train)?)?;

        let ff = self.ff.forward(&self.ff_norm.forward(&x)?, train)?;
        Ok((&x + dropout(&ff, self.dropout, train)?)?)
    }
}

struct Decoder {
    positions: Positions,
    layers: Vec<DecoderLayer>,
    final_norm: LayerNorm,
    dropout: f64,
}

impl Decoder {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        let layers = (0..config.num_decoder_layers)
            .map(|i| DecoderLayer::new(config, &vb.pp(format!("layers.{}", i))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            positions: Positions::new(config, vb)?,
            layers,
            final_norm: vb.layer_norm(config.d_model, config.layer_norm_eps, "final_norm")?,
            dropout: config.dropout,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        encoder_states: &Tensor,
        causal: &Tensor,
        cross_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mut hidden = dropout(&self.positions.forward(x)?, self.dropout, train)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, encoder_states, causal, cross_mask, train)?;
        }
        self.final_norm.forward(&hidden)
    }
}

struct DecoderLayer {
    self_attn: Attention,
    self_attn_norm: LayerNorm,
    cross_attn: Attention,
    cross_attn_norm: LayerNorm,
    ff: FeedForward,
    ff_norm: LayerNorm,
    dropout: f64,
}

impl DecoderLayer {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        let eps = config.layer_norm_eps;
        Ok(Self {
            self_attn: Attention::new(config, &vb.pp("self_attn"))?,
            self_attn_norm: vb.layer_norm(config.d_model, eps, "self_attn_norm")?,
            cross_attn: Attention::new(config, &vb.pp("cross_attn"))?,
            cross_attn_norm: vb.layer_norm(config.d_model, eps, "cross_attn_norm")?,
            ff: FeedForward::new(config, &vb.pp("ff"))?,
            ff_norm: vb.layer_norm(config.d_model, eps, "ff_norm")?,
            dropout: config.dropout,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        encoder_states: &Tensor,
        causal: &Tensor,
        cross_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let normed = self.self_attn_norm.forward(x)?;
        let attn = self.self_attn.forward(&normed, &normed, causal, train)?;
        let x = (x + dropout(&attn, self.dropout, train)?)?;

        let normed = self.cross_attn_norm.forward(&x)?;
        let cross = self
            .cross_attn
            .forward(&normed, encoder_states, cross_mask, train)?;
        let x = (&x + dropout(&cross, self.dropout, train)?)?;

        let ff = self.ff.forward(&self.ff_norm.forward(&x)?, train)?;
        Ok((&x + dropout(&ff, self.dropout, train)?)?)
    }
}

/// Multi-head attention (self or cross)
struct Attention {
    q: AdaptedLinear,
    k: AdaptedLinear,
    v: AdaptedLinear,
    o: AdaptedLinear,
    num_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            q: vb.linear(d, d, "q")?,
            k: vb.linear(d, d, "k")?,
            v: vb.linear(d, d, "v")?,
            o: vb.linear(d, d, "o")?,
            num_heads: config.num_heads,
            head_dim: config.head_dim(),
        })
    }

    /// (b, s, d) → (b, h, s, hd)
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, s, _) = x.dims3()?;
        Ok(x
            .reshape((b, s, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward(&self, x: &Tensor, kv: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let (b, t, d) = x.dims3()?;
        let q = self.split_heads(&self.q.forward(x, train)?)?;
        let k = self.split_heads(&self.k.forward(kv, train)?)?;
        let v = self.split_heads(&self.v.forward(kv, train)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let scores = scores.broadcast_add(mask)?;
        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;

        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, d))?;
        self.o.forward(&out, train)
    }
}

/// Position-wise feed-forward (ReLU)
struct FeedForward {
    wi: AdaptedLinear,
    wo: AdaptedLinear,
}

impl FeedForward {
    fn new(config: &Seq2SeqConfig, vb: &LayerBuilder) -> Result<Self> {
        Ok(Self {
            wi: vb.linear(config.d_model, config.d_ff, "wi")?,
            wo: vb.linear(config.d_ff, config.d_model, "wo")?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.wi.forward(x, train)?.relu()?;
        self.wo.forward(&hidden, train)
    }
}
