// Integration test: end-to-end fine-tuning on a tiny base model
// Covers step accounting, frozen base weights and adapter checkpoints

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::sync::Arc;

use codetune::config::{AccumulationBoundary, DevicePreference, TrainConfig};
use codetune::data::{Batch, Collator, Example, ExampleNormalizer, TokenizedExample};
use codetune::errors::TrainError;
use codetune::models::{BaseModel, ByteTokenizer, Seq2SeqConfig, TextTokenizer};
use codetune::training::{load_checkpoint, Trainer, TrainPhase};

const MAX_SEQ_LEN: usize = 24;

fn tiny_model_config() -> Seq2SeqConfig {
    Seq2SeqConfig {
        vocab_size: 259,
        d_model: 16,
        num_heads: 2,
        num_encoder_layers: 1,
        num_decoder_layers: 1,
        d_ff: 32,
        max_position: 64,
        dropout: 0.0,
        ..Seq2SeqConfig::default()
    }
}

fn tiny_train_config(output_dir: &std::path::Path) -> TrainConfig {
    let mut config = TrainConfig::default();
    config.model.max_seq_len = MAX_SEQ_LEN;
    config.model.device = DevicePreference::Cpu;
    config.optim.train_batch_size = 1;
    config.optim.eval_batch_size = 2;
    config.optim.gradient_accumulation = 2;
    config.optim.epochs = 2;
    config.optim.warmup_steps = 1;
    config.optim.learning_rate = 5e-2;
    config.lora.rank = 2;
    config.lora.alpha = 4;
    config.lora.dropout = 0.0;
    config.run.output_dir = output_dir.to_path_buf();
    config
}

fn tokenizer() -> Arc<dyn TextTokenizer> {
    Arc::new(ByteTokenizer::new())
}

fn dataset(n: usize) -> Vec<TokenizedExample> {
    let normalizer = ExampleNormalizer::new(tokenizer(), MAX_SEQ_LEN, true);
    let outputs = [
        "fn add(a: i32) -> i32 { a }",
        "defmodule M do end",
        "struct Point { x: i32 }",
        "x |> Enum.map(&f/1)",
        "impl Foo for Bar {}",
    ];
    (0..n)
        .map(|i| {
            let example = Example::new(format!("task {}", i), "", outputs[i % outputs.len()]);
            normalizer.normalize(&example).unwrap()
        })
        .collect()
}

fn fixed_batch(examples: &[TokenizedExample], device: &Device) -> Batch {
    let collator = Collator {
        pad_id: 0,
        decoder_start_id: 0,
        pad_to_multiple_of: 8,
        max_len: 64,
    };
    let rows: Vec<&TokenizedExample> = examples.iter().collect();
    collator.collate(&rows, device).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn test_step_count_follows_boundary_policy() -> Result<()> {
    let base = BaseModel::random(tiny_model_config(), &Device::Cpu)?;

    for (boundary, expected) in [(AccumulationBoundary::Flush, 6), (AccumulationBoundary::Drop, 4)] {
        let dir = tempfile::tempdir()?;
        let mut config = tiny_train_config(dir.path());
        config.optim.accumulation_boundary = boundary;

        let mut trainer = Trainer::new(config, &base, tokenizer(), dataset(5), None)?;
        assert_eq!(trainer.planned_steps(), expected);

        let summary = trainer.run()?;
        println!("{:?}: {} steps", boundary, summary.global_step);
        assert_eq!(summary.global_step, expected);
        assert_eq!(trainer.state().phase, TrainPhase::Done);
    }
    Ok(())
}

#[test]
fn test_fresh_adapter_matches_base_model() -> Result<()> {
    let device = Device::Cpu;
    let base = BaseModel::random(tiny_model_config(), &device)?;
    let dir = tempfile::tempdir()?;
    let trainer = Trainer::new(tiny_train_config(dir.path()), &base, tokenizer(), dataset(2), None)?;

    let batch = fixed_batch(&dataset(2), &device);
    let adapted = trainer.model().forward_batch(&batch, false)?;
    let plain = base.build()?.forward(
        &batch.input_ids,
        &batch.attention_mask,
        &batch.decoder_input_ids,
        false,
    )?;
    assert!(max_abs_diff(&adapted, &plain) < 1e-6);
    Ok(())
}

#[test]
fn test_training_leaves_base_weights_untouched() -> Result<()> {
    let device = Device::Cpu;
    let base = BaseModel::random(tiny_model_config(), &device)?;
    let batch = fixed_batch(&dataset(3), &device);
    let before = base.build()?.forward(
        &batch.input_ids,
        &batch.attention_mask,
        &batch.decoder_input_ids,
        false,
    )?;

    let dir = tempfile::tempdir()?;
    let mut trainer = Trainer::new(tiny_train_config(dir.path()), &base, tokenizer(), dataset(4), None)?;
    trainer.run()?;

    let after = base.build()?.forward(
        &batch.input_ids,
        &batch.attention_mask,
        &batch.decoder_input_ids,
        false,
    )?;
    assert_eq!(max_abs_diff(&before, &after), 0.0);

    // The adapters did move
    let adapted = trainer.model().forward_batch(&batch, false)?;
    assert!(max_abs_diff(&adapted, &before) > 0.0);
    Ok(())
}

#[test]
fn test_saved_adapter_reproduces_logits() -> Result<()> {
    let device = Device::Cpu;
    let base = BaseModel::random(tiny_model_config(), &device)?;
    let dir = tempfile::tempdir()?;
    let mut trainer = Trainer::new(
        tiny_train_config(dir.path()),
        &base,
        tokenizer(),
        dataset(4),
        Some(dataset(2)),
    )?;
    let summary = trainer.run()?;
    assert_eq!(summary.evals.len(), 2);

    let batch = fixed_batch(&dataset(3), &device);
    let trained = trainer.model().forward_batch(&batch, false)?;
    let reloaded = load_checkpoint(&base, dir.path())?.forward_batch(&batch, false)?;
    assert!(max_abs_diff(&trained, &reloaded) < 1e-5);
    Ok(())
}

#[test]
fn test_second_run_is_rejected() -> Result<()> {
    let base = BaseModel::random(tiny_model_config(), &Device::Cpu)?;
    let dir = tempfile::tempdir()?;
    let mut config = tiny_train_config(dir.path());
    config.optim.epochs = 1;

    let mut trainer = Trainer::new(config, &base, tokenizer(), dataset(2), None)?;
    trainer.run()?;

    let err = trainer.run().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TrainError>(),
        Some(TrainError::RunFinished { global_step: 1 })
    ));
    Ok(())
}

#[test]
fn test_periodic_checkpoints_are_pruned() -> Result<()> {
    let base = BaseModel::random(tiny_model_config(), &Device::Cpu)?;
    let dir = tempfile::tempdir()?;
    let mut config = tiny_train_config(dir.path());
    config.run.save_steps = 1;
    config.run.save_total_limit = 2;

    // 5 micro-batches, accumulation 2, flush → 3 steps per epoch, 6 total
    let mut trainer = Trainer::new(config, &base, tokenizer(), dataset(5), None)?;
    trainer.run()?;

    assert!(dir.path().join("checkpoint-6").exists());
    assert!(dir.path().join("checkpoint-5").exists());
    assert!(!dir.path().join("checkpoint-4").exists());
    assert!(dir.path().join("adapter_model.safetensors").exists());
    Ok(())
}
