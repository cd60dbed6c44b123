// Learning-rate schedule: linear warmup followed by cosine decay to zero

/// Learning-rate multiplier for `step`
///
/// - Warmup: linear ramp from 0 to 1 over `warmup_steps`
/// - Decay: half-cosine from 1 to 0 over the remaining steps
pub fn cosine_with_warmup(step: usize, warmup_steps: usize, total_steps: usize) -> f64 {
    if step < warmup_steps {
        return step as f64 / warmup_steps.max(1) as f64;
    }
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
    let progress = ((step - warmup_steps) as f64 / decay_steps as f64).min(1.0);
    (0.5 * (1.0 + (std::f64::consts::PI * progress).cos())).max(0.0)
}

/// Stateful schedule advanced once per optimizer step
#[derive(Debug, Clone)]
pub struct CosineSchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
}

impl CosineSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
            step: 0,
        }
    }

    /// Learning rate for the next optimizer step
    pub fn lr(&self) -> f64 {
        self.base_lr * cosine_with_warmup(self.step, self.warmup_steps, self.total_steps)
    }

    pub fn advance(&mut self) {
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }
}
