//! Per-step gradient buffer
//!
//! Gradients live in a resource scoped to a single batch step: the buffer is
//! created empty (zeroed) at step start, filled from one backward pass, and
//! consumed by exactly one optimizer update. Dropping it ends the window, so
//! a later step can never read stale gradients.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use std::collections::HashMap;

use super::adam::Adam;

pub struct StepGradients {
    grads: HashMap<String, Tensor>,
}

impl StepGradients {
    /// Pulls this step's gradients out of a backward pass. Parameters that
    /// did not participate in the graph (e.g. normalization running
    /// statistics) simply have no entry.
    pub fn collect(named_params: &[(String, Var)], store: &GradStore) -> Result<Self> {
        let mut grads = Self {
            grads: HashMap::new(),
        };
        for (name, param) in named_params {
            if let Some(grad) = store.get(param.as_tensor()) {
                grads.accumulate(name, grad)?;
            }
        }
        Ok(grads)
    }

    pub fn accumulate(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        if let Some(acc) = self.grads.get_mut(name) {
            *acc = (acc.clone() + grad)?;
        } else {
            self.grads.insert(name.to_string(), grad.clone());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.grads.get(name)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Consumes the buffer, applying one Adam update per parameter that
    /// received a gradient.
    pub fn apply(self, optimizer: &mut Adam, named_params: &[(String, Var)]) -> Result<()> {
        for (name, param) in named_params {
            if let Some(grad) = self.grads.get(name) {
                optimizer.update(name, param, grad)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn accumulate_sums_repeated_contributions() {
        let device = Device::Cpu;
        let grad = Tensor::new(&[1.0f32, 2.0], &device).unwrap();
        let mut grads = StepGradients {
            grads: HashMap::new(),
        };
        grads.accumulate("w", &grad).unwrap();
        grads.accumulate("w", &grad).unwrap();
        let summed = grads.get("w").unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(summed, vec![2.0, 4.0]);
    }

    #[test]
    fn apply_consumes_the_buffer_and_moves_parameters() {
        let device = Device::Cpu;
        let var = Var::from_tensor(&Tensor::new(&[1.0f32, 1.0], &device).unwrap()).unwrap();
        let named = vec![("w".to_string(), var.clone())];

        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let store = loss.backward().unwrap();
        let grads = StepGradients::collect(&named, &store).unwrap();
        assert_eq!(grads.len(), 1);

        let mut optimizer = Adam::new(0.1, 0.9);
        optimizer.step();
        grads.apply(&mut optimizer, &named).unwrap();
        let moved = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(moved[0] < 1.0 && moved[1] < 1.0);
    }
}
