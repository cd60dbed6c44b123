// Gradient accumulation and global-norm clipping over trainable variables

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

/// Sums gradients of `vars` across micro-batches
///
/// Only the variables' gradients are kept between micro-batches; each
/// incoming `GradStore` is dropped as soon as they are copied out.
pub struct GradientAccumulator {
    vars: Vec<Var>,
    sums: Vec<Option<Tensor>>,
    micro_batches: usize,
}

impl GradientAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        let sums = vec![None; vars.len()];
        Self {
            vars,
            sums,
            micro_batches: 0,
        }
    }

    /// Micro-batches accumulated in the current window
    pub fn micro_batches(&self) -> usize {
        self.micro_batches
    }

    pub fn is_empty(&self) -> bool {
        self.micro_batches == 0
    }

    /// Add one micro-batch's gradients
    pub fn add(&mut self, grads: GradStore) -> Result<()> {
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let next = match sum.take() {
                Some(prev) => (prev + g)?,
                None => g.clone(),
            };
            *sum = Some(next.detach());
        }
        self.micro_batches += 1;
        Ok(())
    }

    /// Close the window: gradients averaged over its micro-batches
    ///
    /// A flushed partial window is divided by the micro-batches it holds,
    /// not by the configured accumulation size.
    pub fn finish(&mut self) -> Result<Option<GradStore>> {
        let count = std::mem::take(&mut self.micro_batches);
        if count == 0 {
            return Ok(None);
        }

        let mut store = variable_store(&self.vars)?;
        for (var, sum) in self.vars.iter().zip(self.sums.iter_mut()) {
            match sum.take() {
                Some(g) => {
                    let avg = if count > 1 { (g / count as f64)? } else { g };
                    store.insert(var.as_tensor(), avg);
                }
                None => {
                    store.remove(var.as_tensor());
                }
            }
        }
        Ok(Some(store))
    }

    /// Drop a partial window without stepping
    pub fn discard(&mut self) {
        self.sums.iter_mut().for_each(|sum| *sum = None);
        self.micro_batches = 0;
    }
}

/// A `GradStore` whose entries are `vars` plus a few scalars
fn variable_store(vars: &[Var]) -> Result<GradStore> {
    let mut total: Option<Tensor> = None;
    for var in vars {
        let part = var.as_tensor().sum_all()?;
        total = Some(match total {
            Some(t) => (t + part)?,
            None => part,
        });
    }
    let total = total.context("No trainable variables to accumulate")?;
    Ok(total.backward()?)
}

/// Total L2 norm of the gradients of `vars`
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt())
}

/// Scale gradients so their global norm is at most `max_norm`; returns the
/// norm before clipping
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let norm = compute_grad_norm(grads, vars)?;
    if norm > max_norm {
        let coef = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Tensor};

    fn grads_for(var: &Var, scale: f64) -> GradStore {
        let loss = (var.as_tensor().sum_all().unwrap() * scale).unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn test_accumulate_and_average() {
        let var = Var::from_tensor(&Tensor::new(&[1f32, 2., 3.], &Device::Cpu).unwrap()).unwrap();
        let mut acc = GradientAccumulator::new(vec![var.clone()]);
        acc.add(grads_for(&var, 1.0)).unwrap();
        acc.add(grads_for(&var, 3.0)).unwrap();
        assert_eq!(acc.micro_batches(), 2);

        let store = acc.finish().unwrap().unwrap();
        let g = store.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![2.0, 2.0, 2.0]);
        assert!(acc.is_empty());
        assert!(acc.finish().unwrap().is_none());
    }

    #[test]
    fn test_window_keeps_only_variable_gradients() {
        let var = Var::from_tensor(&Tensor::new(&[1f32, -2.], &Device::Cpu).unwrap()).unwrap();
        let mut acc = GradientAccumulator::new(vec![var.clone()]);

        // d/dx sum((2x)^2) = 8x
        let doubled = (var.as_tensor() * 2.0).unwrap();
        let loss = doubled.sqr().unwrap().sum_all().unwrap();
        acc.add(loss.backward().unwrap()).unwrap();

        let store = acc.finish().unwrap().unwrap();
        assert!(store.get(&doubled).is_none());
        let g = store.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![8.0, -16.0]);
    }

    #[test]
    fn test_var_without_gradient_is_absent() {
        let used = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let unused = Var::from_tensor(&Tensor::new(&[5f32], &Device::Cpu).unwrap()).unwrap();
        let mut acc = GradientAccumulator::new(vec![used.clone(), unused.clone()]);
        acc.add(grads_for(&used, 1.0)).unwrap();

        let store = acc.finish().unwrap().unwrap();
        assert!(store.get(used.as_tensor()).is_some());
        assert!(store.get(unused.as_tensor()).is_none());
    }

    #[test]
    fn test_discard_clears_window() {
        let var = Var::from_tensor(&Tensor::new(&[1f32], &Device::Cpu).unwrap()).unwrap();
        let mut acc = GradientAccumulator::new(vec![var.clone()]);
        acc.add(grads_for(&var, 1.0)).unwrap();
        acc.discard();
        assert!(acc.is_empty());
        assert!(acc.finish().unwrap().is_none());
    }

    #[test]
    fn test_clip_grad_norm() {
        let var = Var::from_tensor(&Tensor::new(&[0f32, 0.], &Device::Cpu).unwrap()).unwrap();
        // d/dx (3x0 + 4x1) = [3, 4], norm 5
        let weights = Tensor::new(&[3f32, 4.], &Device::Cpu).unwrap();
        let loss = (var.as_tensor() * &weights).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();

        let vars = vec![var.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = compute_grad_norm(&grads, &vars).unwrap();
        assert!((clipped - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_clip_leaves_small_gradients() {
        let var = Var::from_tensor(&Tensor::new(&[0f32, 0.], &Device::Cpu).unwrap()).unwrap();
        let mut grads = grads_for(&var, 0.1);
        let vars = vec![var.clone()];
        clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        let g = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((g[0] - 0.1).abs() < 1e-6);
    }
}
