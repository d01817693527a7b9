//! AdamW optimizer over named parameters.
//!
//! Operates on the `HashMap<String, Var>` parameter maps the networks
//! expose, keeping per-name first/second moments so the full optimizer state
//! can be exported to and restored from a checkpoint.

use anyhow::Result;
use candle_core::{backprop::GradStore, Tensor, Var};
use std::collections::HashMap;

pub struct AdamW {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,

    // Exponential moving averages of gradients and squared gradients.
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,

    // Step counter
    step: usize,
}

impl AdamW {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_params(learning_rate, 0.9, 0.999, 1e-8, 0.0)
    }

    pub fn with_params(
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    /// Increment step counter - called once per optimization step, before
    /// the per-parameter updates of that step.
    pub fn step(&mut self) {
        self.step += 1;
    }

    /// Update learning rate (driven by the LR scheduler).
    pub fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    pub fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    /// Update a single parameter from its gradient.
    pub fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let grad = grad.detach();

        if !self.m.contains_key(name) {
            self.m.insert(name.to_string(), grad.zeros_like()?);
            self.v.insert(name.to_string(), grad.zeros_like()?);
        }

        let m = &self.m[name];
        let v = &self.v[name];

        // Update biased first and second moment estimates
        let m_new = ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
        let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

        // Bias correction; step is always >= 1 here
        let step = self.step.max(1);
        let m_hat = (&m_new / (1.0 - self.beta1.powi(step as i32)))?;
        let v_hat = (&v_new / (1.0 - self.beta2.powi(step as i32)))?;

        self.m.insert(name.to_string(), m_new);
        self.v.insert(name.to_string(), v_new);

        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;

        // Decoupled weight decay, applied to the parameter directly rather
        // than through the gradient.
        let mut new_value = (param.as_tensor() - (update * self.learning_rate)?)?;
        if self.weight_decay > 0.0 {
            new_value =
                (new_value - (param.as_tensor() * (self.learning_rate * self.weight_decay))?)?;
        }

        param.set(&new_value)?;
        Ok(())
    }

    /// Apply one optimizer step to every parameter that received a gradient.
    pub fn update_all(
        &mut self,
        params: &HashMap<String, Var>,
        grads: &GradStore,
    ) -> Result<()> {
        for (name, param) in params {
            if let Some(grad) = grads.get(param.as_tensor()) {
                let grad = grad.clone();
                self.update(name, param, &grad)?;
            }
        }
        Ok(())
    }

    /// Moment tensors for checkpoint saving.
    pub fn get_state_tensors(&self) -> (HashMap<String, Tensor>, HashMap<String, Tensor>) {
        (self.m.clone(), self.v.clone())
    }

    /// Restore moment tensors from a checkpoint.
    pub fn load_state_tensors(
        &mut self,
        m: HashMap<String, Tensor>,
        v: HashMap<String, Tensor>,
    ) {
        self.m = m;
        self.v = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn descends_a_quadratic() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::from_vec(vec![5.0f32], &[1], &device)?)?;
        let params = HashMap::from([("w".to_string(), w.clone())]);
        let mut opt = AdamW::new(0.1);

        // Few enough steps that the iterate never crosses the optimum, so
        // the loss is monotone.
        let mut last = f32::INFINITY;
        for _ in 0..30 {
            // loss = w^2
            let loss = w.as_tensor().sqr()?.sum_all()?;
            let grads = loss.backward()?;
            opt.step();
            opt.update_all(&params, &grads)?;

            let value = loss.to_scalar::<f32>()?;
            assert!(value <= last, "loss increased: {last} -> {value}");
            last = value;
        }
        assert!(last < 25.0);
        Ok(())
    }

    #[test]
    fn weight_decay_shrinks_parameters_without_gradient_signal() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::from_vec(vec![2.0f32], &[1], &device)?)?;
        let mut opt = AdamW::with_params(0.1, 0.9, 0.999, 1e-8, 0.5);

        opt.step();
        // Zero gradient: the only movement comes from decoupled decay.
        let zero_grad = Tensor::zeros(&[1], candle_core::DType::F32, &device)?;
        opt.update("w", &w, &zero_grad)?;

        let value = w.as_tensor().to_vec1::<f32>()?[0];
        assert!(value < 2.0);
        assert!((value - (2.0 - 2.0 * 0.1 * 0.5)).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn state_round_trips() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::from_vec(vec![1.0f32, -1.0], &[2], &device)?)?;
        let grad = Tensor::from_vec(vec![0.5f32, 0.25], &[2], &device)?;
        let mut opt = AdamW::new(0.01);
        opt.step();
        opt.update("w", &w, &grad)?;

        let (m, v) = opt.get_state_tensors();
        let mut restored = AdamW::new(0.01);
        restored.set_step(opt.get_step());
        restored.load_state_tensors(m, v);
        assert_eq!(restored.get_step(), 1);

        // Identical follow-up updates on both optimizers stay in lockstep.
        let w2 = Var::from_tensor(w.as_tensor())?;
        opt.step();
        restored.step();
        opt.update("w", &w, &grad)?;
        restored.update("w", &w2, &grad)?;
        assert_eq!(
            w.as_tensor().to_vec1::<f32>()?,
            w2.as_tensor().to_vec1::<f32>()?
        );
        Ok(())
    }
}
