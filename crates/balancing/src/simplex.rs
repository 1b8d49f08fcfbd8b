//! Helpers for task weight distributions.
//!
//! Every weight vector the controllers hand out is a point on the probability
//! simplex: non-negative entries that sum to one. [`TaskWeights`] wraps such a
//! vector as a detached `F32` tensor so it can be multiplied into the task
//! losses without pulling the controller's own variables into the caller's
//! backward pass.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops;

use crate::errors::{BalancingError, Result};

/// A normalized weight vector over tasks.
#[derive(Debug, Clone)]
pub struct TaskWeights {
    tensor: Tensor,
}

impl TaskWeights {
    pub(crate) fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let tensor = tensor.detach();
        let values = tensor.to_vec1::<f32>()?;
        ensure_finite_f32("task weights", &values)?;
        Ok(Self { tensor })
    }

    /// Uniform distribution over `num_tasks` entries.
    pub fn uniform(num_tasks: usize, device: &Device) -> Result<Self> {
        if num_tasks == 0 {
            return Err(BalancingError::configuration(
                "num_tasks must be greater than zero",
            ));
        }
        let value = 1.0 / num_tasks as f32;
        let tensor = Tensor::from_vec(vec![value; num_tasks], num_tasks, device)?;
        Ok(Self { tensor })
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn len(&self) -> usize {
        self.tensor.elem_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.tensor.to_vec1::<f32>()?)
    }

    /// Forms `Σ w_i · loss_i` for the parameter update pass.
    ///
    /// The weights enter as constants, so gradients of the result only reach
    /// the parameters the losses were computed from.
    pub fn combine(&self, losses: &[Tensor]) -> Result<Tensor> {
        if losses.len() != self.len() {
            return Err(BalancingError::configuration(format!(
                "expected {} task losses to combine, got {}",
                self.len(),
                losses.len()
            )));
        }
        let flat = losses
            .iter()
            .map(|loss| loss.flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        for (idx, loss) in flat.iter().enumerate() {
            if loss.elem_count() != 1 {
                return Err(BalancingError::configuration(format!(
                    "task loss {} must be a scalar, got {} elements",
                    idx,
                    loss.elem_count()
                )));
            }
        }
        let stacked = Tensor::cat(&flat, 0)?;
        let weights = self
            .tensor
            .to_device(stacked.device())?
            .to_dtype(stacked.dtype())?;
        Ok(stacked.mul(&weights)?.sum_all()?)
    }

    pub(crate) fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            tensor: self.tensor.to_device(device)?,
        })
    }
}

/// Numerically stable softmax over host values.
pub(crate) fn softmax(values: &[f64]) -> Vec<f64> {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = values.iter().map(|v| (v - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|v| v / total).collect()
}

/// Softmax over a one-dimensional tensor, rejecting non-finite inputs and outputs.
pub(crate) fn softmax_tensor(label: &str, logits: &Tensor) -> Result<Tensor> {
    ensure_finite_f32(label, &logits.to_dtype(DType::F32)?.to_vec1::<f32>()?)?;
    let normalized = ops::softmax(logits, D::Minus1)?;
    ensure_finite_f32(label, &normalized.to_vec1::<f32>()?)?;
    Ok(normalized)
}

pub(crate) fn ensure_finite(label: &str, values: &[f64]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        None => Ok(()),
        Some(idx) => Err(BalancingError::numeric(format!(
            "{} produced a non-finite value {} at task {}",
            label, values[idx], idx
        ))),
    }
}

pub(crate) fn ensure_finite_f32(label: &str, values: &[f32]) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        None => Ok(()),
        Some(idx) => Err(BalancingError::numeric(format!(
            "{} produced a non-finite value {} at task {}",
            label, values[idx], idx
        ))),
    }
}

/// Index of the smallest entry, lowest index on ties.
pub(crate) fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (idx, value) in values.iter().enumerate().skip(1) {
        if *value < values[best] {
            best = idx;
        }
    }
    best
}

/// Index of the largest entry, lowest index on ties.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (idx, value) in values.iter().enumerate().skip(1) {
        if *value > values[best] {
            best = idx;
        }
    }
    best
}
