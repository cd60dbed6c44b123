// codetune - LoRA fine-tuning for instruction-to-code models
// Main entry point

use anyhow::Result;
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codetune::config::{default_config_path, load_config, TrainConfig};
use codetune::errors::{wrap_error_with_suggestion, UserFriendlyError};
use codetune::models::{init_base_model, load_tokenizer, AdapterBuilder, BaseModel, LoraConfig, Seq2SeqConfig};
use codetune::training::{Sampling, SpotChecker, Trainer, DEFAULT_MAX_NEW_TOKENS, DEFAULT_NUM_EXAMPLES};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "codetune")]
#[command(about = "LoRA fine-tuning with language-weighted loss", version)]
struct Args {
    /// Configuration file (default: ~/.codetune/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Fine-tune adapters on a JSONL dataset
    Train(TrainArgs),
    /// Create a randomly initialised base model with a byte tokenizer
    InitBase(InitBaseArgs),
    /// Write the default configuration as TOML
    InitConfig {
        /// Destination file
        path: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print trainable and total parameter counts
    Params,
    /// Generate answers for the first few examples with a trained adapter
    SpotCheck(SpotCheckArgs),
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long)]
    train_file: Option<PathBuf>,
    #[arg(long)]
    eval_file: Option<PathBuf>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    base_model: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    /// Weight the loss per language
    #[arg(long)]
    cross_language_learning: bool,
    #[arg(long)]
    rust_weight: Option<f64>,
    #[arg(long)]
    elixir_weight: Option<f64>,
    /// Plain instruction prompts without language augmentation
    #[arg(long)]
    generic_prompts: bool,
    /// Hide the progress bar
    #[arg(long)]
    no_progress: bool,
}

impl TrainArgs {
    fn apply(self, config: &mut TrainConfig) {
        if let Some(path) = self.train_file {
            config.data.train_file = path;
        }
        if let Some(path) = self.eval_file {
            config.data.eval_file = Some(path);
        }
        if let Some(dir) = self.output_dir {
            config.run.output_dir = dir;
        }
        if let Some(dir) = self.base_model {
            config.model.base_model = dir;
        }
        if let Some(epochs) = self.epochs {
            config.optim.epochs = epochs;
        }
        if let Some(lr) = self.learning_rate {
            config.optim.learning_rate = lr;
        }
        if self.cross_language_learning {
            config.language.cross_language_learning = true;
        }
        if let Some(w) = self.rust_weight {
            config.language.rust_weight = w;
        }
        if let Some(w) = self.elixir_weight {
            config.language.elixir_weight = w;
        }
        if self.generic_prompts {
            config.language.language_aware = false;
        }
    }
}

#[derive(Parser, Debug)]
struct InitBaseArgs {
    /// Output directory
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    d_model: Option<usize>,
    #[arg(long)]
    num_heads: Option<usize>,
    /// Encoder and decoder layer count
    #[arg(long)]
    layers: Option<usize>,
    #[arg(long)]
    d_ff: Option<usize>,
    #[arg(long)]
    max_position: Option<usize>,
}

#[derive(Parser, Debug)]
struct SpotCheckArgs {
    /// Directory holding adapter_model.safetensors
    #[arg(long)]
    adapter: PathBuf,
    /// Examples JSONL (default: the configured eval or train file)
    #[arg(long)]
    examples: Option<PathBuf>,
    #[arg(long)]
    base_model: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_NUM_EXAMPLES)]
    num_examples: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_NEW_TOKENS)]
    max_new_tokens: usize,
    /// Sampling temperature (0 = greedy)
    #[arg(long, default_value_t = 0.0)]
    temperature: f64,
    /// Nucleus sampling threshold
    #[arg(long)]
    top_p: Option<f64>,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Command::Train(train_args) => run_train(args.config.as_deref(), train_args),
        Command::InitBase(init_args) => run_init_base(init_args),
        Command::InitConfig { path, force } => run_init_config(&path, force),
        Command::Params => run_params(args.config.as_deref()),
        Command::SpotCheck(spot_args) => run_spot_check(args.config.as_deref(), spot_args),
    }
}

/// Initialize tracing subscriber
fn init_tracing() {
    // Default: INFO level, overridden with RUST_LOG
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    // Bridge log crate → tracing
    tracing_log::LogTracer::init().ok();
}

/// Explicit --config, else the default path when it exists
fn resolve_config(path: Option<&Path>) -> Result<TrainConfig> {
    match path {
        Some(path) => load_config(Some(path)),
        None => {
            let default = default_config_path().filter(|p| p.exists());
            load_config(default.as_deref())
        }
    }
}

fn run_train(config_path: Option<&Path>, args: TrainArgs) -> Result<()> {
    let mut config = resolve_config(config_path)?;
    let show_progress = !args.no_progress && std::io::stderr().is_terminal();
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        base_model = ?config.model.base_model,
        train_file = ?config.data.train_file,
        output_dir = ?config.run.output_dir,
        "Starting training"
    );

    let mut trainer = Trainer::from_config(config)?.with_progress(show_progress);
    let summary = trainer.run()?;

    println!("{}", summary.parameters);
    println!(
        "Finished {} optimizer steps over {} epochs",
        summary.global_step, summary.epochs
    );
    if let Some(loss) = summary.final_train_loss {
        println!("Final train loss: {:.4}", loss);
    }
    if let Some(eval) = summary.evals.last() {
        println!(
            "Final eval loss: {:.4} (perplexity {:.2})",
            eval.loss, eval.perplexity
        );
    }
    println!("Adapter saved to {}", summary.output_dir.display());
    Ok(())
}

fn run_init_base(args: InitBaseArgs) -> Result<()> {
    let defaults = Seq2SeqConfig::small();
    let layers = args.layers.unwrap_or(defaults.num_encoder_layers);
    let config = Seq2SeqConfig {
        d_model: args.d_model.unwrap_or(defaults.d_model),
        num_heads: args.num_heads.unwrap_or(defaults.num_heads),
        num_encoder_layers: layers,
        num_decoder_layers: layers,
        d_ff: args.d_ff.unwrap_or(defaults.d_ff),
        max_position: args.max_position.unwrap_or(defaults.max_position),
        ..defaults
    };
    config.validate()?;

    init_base_model(config, &args.output, &candle_core::Device::Cpu)?;
    println!("Base model written to {}", args.output.display());
    Ok(())
}

fn run_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(wrap_error_with_suggestion(
            format!("{} already exists", path.display()),
            "Pass --force to overwrite it"
        ));
    }
    TrainConfig::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn run_params(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let device = config.model.device.device()?;
    let base = BaseModel::load(&config.model.base_model, &device)
        .user_context_with_suggestion(
            "Could not load the base model",
            "Create one with `codetune init-base --output <dir>` or set model.base_model",
        )?;
    let model =
        AdapterBuilder::new(LoraConfig::from_section(&config.lora), config.run.seed).build(&base)?;
    println!("{}", model.parameter_report());
    Ok(())
}

fn run_spot_check(config_path: Option<&Path>, args: SpotCheckArgs) -> Result<()> {
    let config = resolve_config(config_path)?;
    let device = config.model.device.device()?;
    let base_dir = args.base_model.unwrap_or_else(|| config.model.base_model.clone());
    let examples = args
        .examples
        .or_else(|| config.data.eval_file.clone())
        .unwrap_or_else(|| config.data.train_file.clone());

    let base = BaseModel::load(&base_dir, &device)?;
    let tokenizer = load_tokenizer(&base_dir)?;
    let checker = SpotChecker::load(&base, &args.adapter, Arc::clone(&tokenizer), config.model.max_seq_len)
        .user_context_with_suggestion(
            "Could not load the adapter",
            "Point --adapter at an output directory written by `codetune train`",
        )?
        .with_max_new_tokens(args.max_new_tokens)
        .with_sampling(Sampling {
            temperature: args.temperature,
            top_p: args.top_p,
            seed: args.seed,
        });

    for sample in checker.run(&examples, args.num_examples)? {
        println!("{}", sample);
    }
    Ok(())
}
