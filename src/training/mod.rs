// Training: loss, optimization, the epoch loop and its output

pub mod checkpoint;
pub mod loss;
pub mod optimizer;
pub mod scheduler;
pub mod spot_check;
pub mod trainer;

pub use checkpoint::{
    load_checkpoint, Checkpoint, CheckpointManager, TrainingRecord, CHECKPOINT_METADATA_FILE,
    TRAINING_CONFIG_FILE,
};
pub use loss::{cross_entropy, per_example_cross_entropy, ExampleLosses, LossEvaluator};
pub use optimizer::{clip_grad_norm, compute_grad_norm, GradientAccumulator};
pub use scheduler::{cosine_with_warmup, CosineSchedule};
pub use spot_check::{Sampling, SpotCheckSample, SpotChecker, DEFAULT_MAX_NEW_TOKENS, DEFAULT_NUM_EXAMPLES};
pub use trainer::{should_log, EvalReport, StepOutcome, Trainer, TrainingState, TrainingSummary, TrainPhase};
