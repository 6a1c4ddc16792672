//! Adam optimizer with named per-parameter state
//!
//! Keeps full-precision first/second moment estimates keyed by parameter
//! name so the state can be exported into epoch checkpoints.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use std::collections::HashMap;

pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,

    // First/second moment estimates
    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,

    // Step counter
    step: usize,
}

impl Adam {
    pub fn new(learning_rate: f64, beta1: f64) -> Self {
        Self::with_params(learning_rate, beta1, 0.999, 1e-8)
    }

    pub fn with_params(learning_rate: f64, beta1: f64, beta2: f64, eps: f64) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    /// Increment step counter - should be called once per optimization step
    pub fn step(&mut self) {
        self.step += 1;
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    pub fn beta1(&self) -> f64 {
        self.beta1
    }

    pub fn beta2(&self) -> f64 {
        self.beta2
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Update a single parameter
    pub fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        // Note: step counter should be incremented separately via step()
        let grad_f32 = grad.to_dtype(DType::F32)?;

        if !self.m.contains_key(name) {
            let zeros = Tensor::zeros_like(&grad_f32)?;
            self.m.insert(name.to_string(), zeros.clone());
            self.v.insert(name.to_string(), zeros);
        }
        let m = &self.m[name];
        let v = &self.v[name];

        // Update biased first moment estimate
        let m_new = ((m * self.beta1)? + (grad_f32.clone() * (1.0 - self.beta1))?)?;

        // Update biased second raw moment estimate
        let v_new = ((v * self.beta2)? + (grad_f32.sqr()? * (1.0 - self.beta2))?)?;

        self.m.insert(name.to_string(), m_new.clone());
        self.v.insert(name.to_string(), v_new.clone());

        // Bias-corrected moment estimates; max(step, 1) avoids division by
        // zero if update() runs before the first step() call
        let step = self.step.max(1);
        let m_hat = (m_new / (1.0 - self.beta1.powi(step as i32)))?;
        let v_hat = (v_new / (1.0 - self.beta2.powi(step as i32)))?;
        let v_hat = v_hat.clamp(0.0, f64::INFINITY)?;

        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
        let update = update.to_dtype(param.dtype())?;
        let new_value = (param.as_tensor() - (update * self.learning_rate)?)?;
        param.set(&new_value)?;

        Ok(())
    }

    /// Get state as tensors for checkpoint saving
    pub fn state_tensors(&self) -> HashMap<String, (Tensor, Tensor)> {
        let mut state = HashMap::new();
        for (name, m) in &self.m {
            if let Some(v) = self.v.get(name) {
                state.insert(name.clone(), (m.clone(), v.clone()));
            }
        }
        state
    }

    /// Load state from tensors
    pub fn load_state_tensors(
        &mut self,
        state: HashMap<String, (Tensor, Tensor)>,
        step: usize,
    ) {
        self.m.clear();
        self.v.clear();
        for (name, (m, v)) in state {
            self.m.insert(name.clone(), m);
            self.v.insert(name, v);
        }
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn adam_walks_a_quadratic_downhill() {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(10.0f32, &device).unwrap()).unwrap();
        let mut optimizer = Adam::new(0.1, 0.9);

        let mut losses = Vec::new();
        for _ in 0..100 {
            let diff = (var.as_tensor() - 3.0).unwrap();
            let loss = diff.sqr().unwrap();
            losses.push(loss.to_scalar::<f32>().unwrap());
            let grads = loss.backward().unwrap();
            let grad = grads.get(var.as_tensor()).unwrap().clone();
            optimizer.step();
            optimizer.update("x", &var, &grad).unwrap();
        }

        assert!(losses[99] < losses[0]);
        let x = var.as_tensor().to_scalar::<f32>().unwrap();
        assert!((x - 3.0).abs() < 1.0, "x ended at {x}");
    }

    #[test]
    fn state_export_covers_every_updated_parameter() {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, 2.0], &device).unwrap()).unwrap();
        let grad = Tensor::new(&[0.5f32, -0.5], &device).unwrap();
        let mut optimizer = Adam::new(0.01, 0.5);
        optimizer.step();
        optimizer.update("w", &var, &grad).unwrap();

        let state = optimizer.state_tensors();
        assert_eq!(state.len(), 1);
        let (m, v) = &state["w"];
        assert_eq!(m.dims(), grad.dims());
        assert_eq!(v.dims(), grad.dims());
        assert_eq!(optimizer.get_step(), 1);
    }
}
