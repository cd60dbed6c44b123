// Training loop driver
//
// idle → accumulating → stepped → (accumulating …) → evaluating → … → saving → done
// Any error inside `run` ends in failed.
//
// Micro-batch gradients are summed until `gradient_accumulation` batches have
// been seen (or the epoch ends under the flush policy), averaged, clipped and
// applied with the scheduled learning rate.

use anyhow::{Context, Result};
use candle_core::{Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use super::checkpoint::{CheckpointManager, TrainingRecord};
use super::loss::{cross_entropy, LossEvaluator};
use super::optimizer::{clip_grad_norm, GradientAccumulator};
use super::scheduler::CosineSchedule;
use crate::config::{AccumulationBoundary, TrainConfig};
use crate::data::{read_examples, Collator, DataLoader, ExampleNormalizer, TokenizedExample};
use crate::errors::{model_loading_error, TrainError};
use crate::models::{load_tokenizer, AdapterBuilder, BaseModel, LoraConfig, LoraModel, ParameterReport, TextTokenizer};

/// Driver phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainPhase {
    Idle,
    Accumulating,
    Stepped,
    Evaluating,
    Saving,
    Done,
    /// A run returned an error; the driver cannot be resumed
    Failed,
}

/// Mutable loop state
#[derive(Debug, Clone, Serialize)]
pub struct TrainingState {
    pub epoch: usize,
    pub global_step: usize,
    /// Sum of optimizer-step losses this epoch
    pub running_loss: f64,
    /// Optimizer steps this epoch
    pub epoch_steps: usize,
    /// Sum of micro-batch losses in the open accumulation window
    pub window_loss: f64,
    pub phase: TrainPhase,
}

impl TrainingState {
    fn new() -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            running_loss: 0.0,
            epoch_steps: 0,
            window_loss: 0.0,
            phase: TrainPhase::Idle,
        }
    }

    /// Mean optimizer-step loss this epoch
    pub fn mean_loss(&self) -> Option<f64> {
        (self.epoch_steps > 0).then(|| self.running_loss / self.epoch_steps as f64)
    }
}

/// One applied optimizer step
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StepOutcome {
    pub global_step: usize,
    /// Mean loss over the window's micro-batches
    pub loss: f64,
    /// Gradient norm before clipping
    pub grad_norm: f64,
    pub lr: f64,
    pub micro_batches: usize,
    /// Whether a progress line was logged for this step
    pub logged: bool,
}

/// Per-epoch evaluation result
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub epoch: usize,
    pub loss: f64,
    pub perplexity: f64,
    pub batches: usize,
}

/// What a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub global_step: usize,
    pub epochs: usize,
    pub final_train_loss: Option<f64>,
    pub evals: Vec<EvalReport>,
    pub parameters: ParameterReport,
    pub output_dir: PathBuf,
}

/// Fine-tuning driver for one run
pub struct Trainer {
    config: TrainConfig,
    model: LoraModel,
    vars: Vec<Var>,
    tokenizer: Arc<dyn TextTokenizer>,
    train_loader: DataLoader,
    eval_loader: Option<DataLoader>,
    loss: LossEvaluator,
    optimizer: AdamW,
    schedule: CosineSchedule,
    accumulator: GradientAccumulator,
    checkpoints: CheckpointManager,
    record: TrainingRecord,
    state: TrainingState,
    device: Device,
    show_progress: bool,
}

impl Trainer {
    /// Load base model, tokenizer and datasets named by `config`
    pub fn from_config(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let device = config.model.device.device()?;
        let base_dir = config.model.base_model.clone();

        let base = BaseModel::load(&base_dir, &device).map_err(|e| {
            anyhow::anyhow!(model_loading_error(
                &base_dir.display().to_string(),
                &format!("{:#}", e)
            ))
        })?;
        let tokenizer = load_tokenizer(&base_dir)?;

        let normalizer = ExampleNormalizer::new(
            tokenizer.clone(),
            config.model.max_seq_len,
            config.language.language_aware,
        );

        let train_examples = read_examples(&config.data.train_file, config.data.record_policy)
            .context("Failed to read training set")?;
        let train = normalizer.normalize_all(&train_examples)?;

        let eval = match &config.data.eval_file {
            Some(path) => {
                let examples = read_examples(path, config.data.record_policy)
                    .context("Failed to read evaluation set")?;
                Some(normalizer.normalize_all(&examples)?)
            }
            None => None,
        };

        Self::new(config, &base, tokenizer, train, eval)
    }

    /// Build a driver over already-normalized examples
    pub fn new(
        config: TrainConfig,
        base: &BaseModel,
        tokenizer: Arc<dyn TextTokenizer>,
        train: Vec<TokenizedExample>,
        eval: Option<Vec<TokenizedExample>>,
    ) -> Result<Self> {
        config.validate()?;
        let model_config = base.config();

        if tokenizer.vocab_size() > model_config.vocab_size {
            return Err(TrainError::VocabularyMismatch {
                tokenizer: tokenizer.vocab_size(),
                model: model_config.vocab_size,
            }
            .into());
        }
        if config.model.max_seq_len > model_config.max_position {
            return Err(TrainError::Config(format!(
                "model.max_seq_len ({}) exceeds the base model's max_position ({})",
                config.model.max_seq_len, model_config.max_position
            ))
            .into());
        }
        if train.is_empty() {
            return Err(TrainError::EmptyDataset(config.data.train_file.display().to_string()).into());
        }

        let collator = Collator {
            pad_id: tokenizer.pad_id(),
            decoder_start_id: model_config.decoder_start_token_id,
            pad_to_multiple_of: config.data.pad_to_multiple_of,
            max_len: model_config.max_position,
        };
        let optim = &config.optim;
        let train_loader = DataLoader::new(
            train,
            optim.train_batch_size,
            true,
            config.run.seed,
            collator.clone(),
        );
        let eval_loader = match eval {
            Some(examples) if examples.is_empty() => {
                tracing::warn!("Evaluation set is empty; evaluation will be skipped");
                None
            }
            Some(examples) => Some(DataLoader::new(
                examples,
                optim.eval_batch_size,
                false,
                config.run.seed,
                collator,
            )),
            None => None,
        };

        let model =
            AdapterBuilder::new(LoraConfig::from_section(&config.lora), config.run.seed).build(base)?;
        tracing::info!("{}", model.parameter_report());

        let vars = model.trainable_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: optim.learning_rate,
                weight_decay: optim.weight_decay,
                ..Default::default()
            },
        )?;

        let steps_per_epoch = optim
            .accumulation_boundary
            .steps_per_epoch(train_loader.num_batches(), optim.gradient_accumulation);
        let total_steps = steps_per_epoch * optim.epochs;
        let schedule = CosineSchedule::new(optim.learning_rate, optim.warmup_steps, total_steps);
        optimizer.set_learning_rate(schedule.lr());

        tracing::info!(
            examples = train_loader.len(),
            batches_per_epoch = train_loader.num_batches(),
            steps_per_epoch,
            total_steps,
            boundary = ?optim.accumulation_boundary,
            weighted_loss = config.language.cross_language_learning,
            "Prepared training run"
        );

        let checkpoints =
            CheckpointManager::new(config.run.output_dir.clone(), config.run.save_total_limit);
        let record = TrainingRecord::from_config(&config);
        let loss = LossEvaluator::from_section(&config.language);

        Ok(Self {
            loss,
            accumulator: GradientAccumulator::new(vars.clone()),
            vars,
            model,
            tokenizer,
            train_loader,
            eval_loader,
            optimizer,
            schedule,
            checkpoints,
            record,
            state: TrainingState::new(),
            device: base.device().clone(),
            show_progress: false,
            config,
        })
    }

    /// Render a progress bar over optimizer steps
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn model(&self) -> &LoraModel {
        &self.model
    }

    pub fn parameter_report(&self) -> ParameterReport {
        self.model.parameter_report()
    }

    /// Optimizer steps the whole run will apply
    pub fn planned_steps(&self) -> usize {
        self.schedule.total_steps()
    }

    /// Forward, loss and backward for one micro-batch; returns the loss
    fn train_micro_batch(&mut self, indices: &[usize]) -> Result<f64> {
        self.state.phase = TrainPhase::Accumulating;

        let batch = self.train_loader.batch(indices, &self.device)?;
        let logits = self.model.forward_batch(&batch, true)?;
        let loss = self.loss.compute(&logits, &batch.labels, &batch.languages)?;
        let loss_value = loss.to_scalar::<f32>()? as f64;

        let grads = loss.backward()?;
        self.accumulator.add(grads)?;
        self.state.window_loss += loss_value;

        Ok(loss_value)
    }

    /// Close the accumulation window and apply the optimizer
    fn optimizer_step(&mut self) -> Result<Option<StepOutcome>> {
        let micro_batches = self.accumulator.micro_batches();
        let Some(mut grads) = self.accumulator.finish()? else {
            return Ok(None);
        };

        let grad_norm = clip_grad_norm(&mut grads, &self.vars, self.config.optim.max_grad_norm)?;
        let lr = self.schedule.lr();
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;
        self.schedule.advance();

        let loss = self.state.window_loss / micro_batches.max(1) as f64;
        self.state.window_loss = 0.0;
        self.state.global_step += 1;
        self.state.running_loss += loss;
        self.state.epoch_steps += 1;
        self.state.phase = TrainPhase::Stepped;

        Ok(Some(StepOutcome {
            global_step: self.state.global_step,
            loss,
            grad_norm,
            lr,
            micro_batches,
            logged: false,
        }))
    }

    /// Logging, progress and periodic checkpoints after a step
    fn after_step(&mut self, outcome: &mut StepOutcome, progress: &ProgressBar) -> Result<()> {
        progress.inc(1);
        progress.set_message(format!("loss {:.4}", outcome.loss));

        let step = outcome.global_step;
        outcome.logged = should_log(step, self.config.run.log_every);
        if outcome.logged {
            tracing::info!(
                epoch = self.state.epoch,
                step,
                loss = self.state.mean_loss().unwrap_or(outcome.loss),
                lr = outcome.lr,
                grad_norm = outcome.grad_norm,
                "Training progress"
            );
        }

        let save_steps = self.config.run.save_steps;
        if save_steps > 0 && step % save_steps == 0 {
            self.checkpoints.save_step(
                &self.model,
                self.tokenizer.as_ref(),
                &self.record,
                step,
                self.state.epoch,
                self.state.mean_loss(),
            )?;
        }
        Ok(())
    }

    /// One pass over the training set
    pub fn run_epoch(&mut self, epoch: usize, progress: &ProgressBar) -> Result<Vec<StepOutcome>> {
        self.state.epoch = epoch;
        self.state.running_loss = 0.0;
        self.state.epoch_steps = 0;

        let accumulation = self.config.optim.gradient_accumulation;
        let mut steps = Vec::new();

        for indices in self.train_loader.epoch_batches(epoch) {
            self.train_micro_batch(&indices)?;

            if self.accumulator.micro_batches() == accumulation {
                if let Some(mut outcome) = self.optimizer_step()? {
                    self.after_step(&mut outcome, progress)?;
                    steps.push(outcome);
                }
            }
        }

        if !self.accumulator.is_empty() {
            match self.config.optim.accumulation_boundary {
                AccumulationBoundary::Flush => {
                    if let Some(mut outcome) = self.optimizer_step()? {
                        self.after_step(&mut outcome, progress)?;
                        steps.push(outcome);
                    }
                }
                AccumulationBoundary::Drop => {
                    tracing::debug!(
                        epoch,
                        micro_batches = self.accumulator.micro_batches(),
                        "Dropping partial accumulation window"
                    );
                    self.accumulator.discard();
                    self.state.window_loss = 0.0;
                }
            }
        }

        tracing::info!(
            epoch,
            steps = self.state.epoch_steps,
            train_loss = self.state.mean_loss(),
            "Finished epoch"
        );
        Ok(steps)
    }

    /// Mean base cross-entropy over the evaluation set
    pub fn evaluate(&mut self) -> Result<Option<EvalReport>> {
        let Some(loader) = &self.eval_loader else {
            return Ok(None);
        };
        self.state.phase = TrainPhase::Evaluating;

        let mut total = 0.0f64;
        let mut batches = 0usize;
        for indices in loader.epoch_batches(0) {
            let batch = loader.batch(&indices, &self.device)?;
            let logits = self.model.forward_batch(&batch, false)?;
            total += cross_entropy(&logits, &batch.labels)?.to_scalar::<f32>()? as f64;
            batches += 1;
        }

        if batches == 0 {
            tracing::warn!(epoch = self.state.epoch, "No evaluation batches; skipping");
            return Ok(None);
        }

        let loss = total / batches as f64;
        let report = EvalReport {
            epoch: self.state.epoch,
            loss,
            perplexity: loss.exp(),
            batches,
        };
        tracing::info!(
            epoch = report.epoch,
            eval_loss = report.loss,
            perplexity = report.perplexity,
            "Evaluation"
        );
        Ok(Some(report))
    }

    /// Run every epoch, evaluate after each, then save the adapter
    ///
    /// Any error leaves the driver in `Failed`; later calls are rejected.
    pub fn run(&mut self) -> Result<TrainingSummary> {
        let global_step = self.state.global_step;
        match self.state.phase {
            TrainPhase::Done => return Err(TrainError::RunFinished { global_step }.into()),
            TrainPhase::Failed => return Err(TrainError::RunFailed { global_step }.into()),
            _ => {}
        }

        let result = self.run_to_completion();
        if result.is_err() {
            self.state.phase = TrainPhase::Failed;
        }
        result
    }

    fn run_to_completion(&mut self) -> Result<TrainingSummary> {
        let progress = if self.show_progress {
            let pb = ProgressBar::new(self.planned_steps() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
                    .progress_chars("#>-"),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let epochs = self.config.optim.epochs;
        let mut evals = Vec::new();
        let mut final_train_loss = None;

        for epoch in 0..epochs {
            self.run_epoch(epoch, &progress)?;
            final_train_loss = self.state.mean_loss().or(final_train_loss);
            if let Some(report) = self.evaluate()? {
                evals.push(report);
            }
        }
        progress.finish_and_clear();

        self.state.phase = TrainPhase::Saving;
        self.checkpoints.save_final(
            &self.model,
            self.tokenizer.as_ref(),
            &self.record,
            self.state.global_step,
            epochs.saturating_sub(1),
        )?;
        self.state.phase = TrainPhase::Done;

        Ok(TrainingSummary {
            global_step: self.state.global_step,
            epochs,
            final_train_loss,
            evals,
            parameters: self.model.parameter_report(),
            output_dir: self.checkpoints.output_dir().to_path_buf(),
        })
    }
}

/// Progress lines are emitted on optimizer steps divisible by `log_every`
pub fn should_log(global_step: usize, log_every: usize) -> bool {
    log_every > 0 && global_step > 0 && global_step % log_every == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Example, Language};
    use crate::models::{ByteTokenizer, Seq2SeqConfig};

    fn tiny_base() -> BaseModel {
        let config = Seq2SeqConfig {
            vocab_size: 259,
            d_model: 16,
            num_heads: 2,
            num_encoder_layers: 1,
            num_decoder_layers: 1,
            d_ff: 32,
            max_position: 64,
            dropout: 0.0,
            ..Seq2SeqConfig::default()
        };
        BaseModel::random(config, &Device::Cpu).unwrap()
    }

    fn tiny_config(output_dir: PathBuf) -> TrainConfig {
        let mut config = TrainConfig::default();
        config.model.max_seq_len = 24;
        config.model.device = crate::config::DevicePreference::Cpu;
        config.optim.train_batch_size = 1;
        config.optim.eval_batch_size = 2;
        config.optim.gradient_accumulation = 2;
        config.optim.epochs = 1;
        config.optim.warmup_steps = 0;
        config.optim.learning_rate = 1e-2;
        config.lora.rank = 2;
        config.lora.alpha = 4;
        config.lora.dropout = 0.0;
        config.run.output_dir = output_dir;
        config.run.log_every = 1;
        config
    }

    fn examples(n: usize) -> Vec<TokenizedExample> {
        let tokenizer: Arc<dyn TextTokenizer> = Arc::new(ByteTokenizer::new());
        let normalizer = ExampleNormalizer::new(tokenizer, 24, true);
        (0..n)
            .map(|i| {
                let ex = Example::new(format!("task {}", i), "", format!("fn f{}() {{}}", i));
                normalizer.normalize(&ex).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_run_moves_through_phases() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny_base();
        let mut trainer = Trainer::new(
            tiny_config(dir.path().to_path_buf()),
            &base,
            Arc::new(ByteTokenizer::new()),
            examples(3),
            Some(examples(2)),
        )
        .unwrap();
        assert_eq!(trainer.state().phase, TrainPhase::Idle);
        assert_eq!(trainer.planned_steps(), 2);

        let summary = trainer.run().unwrap();
        assert_eq!(summary.global_step, 2);
        assert_eq!(summary.evals.len(), 1);
        assert!(summary.evals[0].perplexity > 1.0);
        assert_eq!(trainer.state().phase, TrainPhase::Done);
        assert!(dir.path().join("adapter_model.safetensors").exists());

        let err = trainer.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::RunFinished { global_step: 2 })
        ));
    }

    #[test]
    fn test_log_predicate() {
        let logged: Vec<usize> = (0..=10).filter(|&step| should_log(step, 4)).collect();
        assert_eq!(logged, vec![4, 8]);
        assert!(should_log(3, 1));
        assert!(!should_log(3, 0));
    }

    #[test]
    fn test_running_loss_restarts_each_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path().to_path_buf());
        config.optim.gradient_accumulation = 1;
        config.optim.epochs = 2;
        config.run.log_every = 2;
        let base = tiny_base();
        let mut trainer =
            Trainer::new(config, &base, Arc::new(ByteTokenizer::new()), examples(5), None).unwrap();
        let progress = ProgressBar::hidden();

        for epoch in 0..2 {
            let steps = trainer.run_epoch(epoch, &progress).unwrap();
            let state = trainer.state();

            let expected_steps: Vec<usize> = (epoch * 5 + 1..=epoch * 5 + 5).collect();
            let seen: Vec<usize> = steps.iter().map(|s| s.global_step).collect();
            assert_eq!(seen, expected_steps);

            // Only this epoch's steps contribute
            assert_eq!(state.epoch_steps, 5);
            let epoch_loss: f64 = steps.iter().map(|s| s.loss).sum();
            assert!((state.running_loss - epoch_loss).abs() < 1e-9);

            for step in &steps {
                assert_eq!(step.logged, step.global_step % 2 == 0);
            }
        }
    }

    #[test]
    fn test_logging_only_on_step_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path().to_path_buf());
        config.optim.accumulation_boundary = AccumulationBoundary::Drop;
        config.run.log_every = 1;
        let base = tiny_base();
        let mut trainer =
            Trainer::new(config, &base, Arc::new(ByteTokenizer::new()), examples(5), None).unwrap();

        // 5 micro-batches, accumulation 2: steps close after batches 2 and 4
        let steps = trainer.run_epoch(0, &ProgressBar::hidden()).unwrap();
        assert_eq!(steps.len(), 2);
        assert!(steps.iter().all(|s| s.micro_batches == 2 && s.logged));
        assert_eq!(trainer.state().global_step, 2);
    }

    #[test]
    fn test_failed_run_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("not-a-directory");
        std::fs::write(&output, "occupied").unwrap();

        let mut config = tiny_config(output);
        config.optim.gradient_accumulation = 1;
        let base = tiny_base();
        let mut trainer =
            Trainer::new(config, &base, Arc::new(ByteTokenizer::new()), examples(3), None).unwrap();
        assert_eq!(trainer.planned_steps(), 3);

        assert!(trainer.run().is_err());
        assert_eq!(trainer.state().phase, TrainPhase::Failed);
        assert_eq!(trainer.state().global_step, 3);

        let err = trainer.run().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainError>(),
            Some(TrainError::RunFailed { global_step: 3 })
        ));
        assert_eq!(trainer.state().global_step, 3);
    }

    #[test]
    fn test_empty_training_set_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Trainer::new(
            tiny_config(dir.path().to_path_buf()),
            &tiny_base(),
            Arc::new(ByteTokenizer::new()),
            Vec::new(),
            None,
        );
        assert!(matches!(
            result.err().unwrap().downcast_ref::<TrainError>(),
            Some(TrainError::EmptyDataset(_))
        ));
    }

    #[test]
    fn test_empty_eval_set_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let base = tiny_base();
        let mut trainer = Trainer::new(
            tiny_config(dir.path().to_path_buf()),
            &base,
            Arc::new(ByteTokenizer::new()),
            examples(2),
            Some(Vec::new()),
        )
        .unwrap();
        assert!(trainer.evaluate().unwrap().is_none());
    }

    #[test]
    fn test_seq_len_must_fit_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path().to_path_buf());
        config.model.max_seq_len = 128;
        let result = Trainer::new(
            config,
            &tiny_base(),
            Arc::new(ByteTokenizer::new()),
            examples(2),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_weighted_training_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = tiny_config(dir.path().to_path_buf());
        config.language.cross_language_learning = true;
        config.language.rust_weight = 2.0;
        let base = tiny_base();
        let train = examples(2);
        assert!(train.iter().all(|ex| ex.language == Some(Language::Rust)));

        let mut trainer =
            Trainer::new(config, &base, Arc::new(ByteTokenizer::new()), train, None).unwrap();
        let summary = trainer.run().unwrap();
        assert_eq!(summary.global_step, 1);
        assert!(summary.final_train_loss.unwrap().is_finite());
    }
}
