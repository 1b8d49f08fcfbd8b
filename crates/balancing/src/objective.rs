//! The gradient capability the balancers rely on.
//!
//! A task loss only has to report its detached value and the magnitude of its
//! gradient with respect to the shared parameters. Candle keeps the forward
//! graph alive for as long as the loss tensor is alive and every `backward`
//! call returns a fresh [`GradStore`], so repeated diagnostic passes over the
//! same forward output never accumulate into each other or into the caller's
//! own update pass.

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{
    errors::{BalancingError, Result},
    simplex::ensure_finite,
};

/// A differentiable scalar objective.
pub trait TaskObjective {
    type Gradients;

    /// The scalar value with no gradient attached.
    fn value(&self) -> Result<f64>;

    /// Runs an isolated backward pass, leaving the forward graph usable.
    ///
    /// There is no retain-graph flag: a candle graph lives as long as the loss
    /// tensor does, so every call may backpropagate through it again.
    fn backward(&self) -> Result<Self::Gradients>;

    /// `sqrt(Σ_p ||∂self/∂p||²)` over the given parameters.
    fn gradient_norm_of(&self, params: &[Var]) -> Result<f64>;
}

impl TaskObjective for Tensor {
    type Gradients = GradStore;

    fn value(&self) -> Result<f64> {
        let flat = self.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        match flat.as_slice() {
            [value] => Ok(*value as f64),
            other => Err(BalancingError::configuration(format!(
                "task loss must be a scalar, got {} elements",
                other.len()
            ))),
        }
    }

    fn backward(&self) -> Result<GradStore> {
        Ok(Tensor::backward(self)?)
    }

    fn gradient_norm_of(&self, params: &[Var]) -> Result<f64> {
        let grads = TaskObjective::backward(self)?;
        let mut total = 0.0;
        for (idx, param) in params.iter().enumerate() {
            let grad = grads.get(param.as_tensor()).ok_or_else(|| {
                BalancingError::configuration(format!(
                    "shared parameter {} receives no gradient from the task loss",
                    idx
                ))
            })?;
            total += squared_l2_norm(grad)?;
        }
        Ok(total.sqrt())
    }
}

fn squared_l2_norm(tensor: &Tensor) -> Result<f64> {
    let squared = tensor
        .to_dtype(DType::F32)?
        .sqr()?
        .sum_all()?
        .to_vec0::<f32>()?;
    Ok(squared as f64)
}

/// Detached values of every task loss, checked for NaN/Inf.
pub fn loss_values<L: TaskObjective>(losses: &[L]) -> Result<Vec<f64>> {
    let values = losses
        .iter()
        .map(TaskObjective::value)
        .collect::<Result<Vec<_>>>()?;
    ensure_finite("task loss", &values)?;
    Ok(values)
}

/// Per-task gradient norms against the shared parameters, one isolated pass per task.
pub fn shared_gradient_norms<L: TaskObjective>(losses: &[L], params: &[Var]) -> Result<Vec<f64>> {
    let norms = losses
        .iter()
        .map(|loss| loss.gradient_norm_of(params))
        .collect::<Result<Vec<_>>>()?;
    ensure_finite("gradient norm", &norms)?;
    Ok(norms)
}
