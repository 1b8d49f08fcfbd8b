use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::errors::{BalancingError, Result};

/// Cross entropy over `(batch, classes)` logits with optional label smoothing.
#[derive(Debug, Clone)]
pub struct CrossEntropyLoss {
    label_smoothing: f32,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(mut self, smoothing: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&smoothing) {
            return Err(BalancingError::configuration(
                "label smoothing must be in [0, 1) for cross entropy",
            ));
        }
        self.label_smoothing = smoothing;
        Ok(self)
    }

    pub fn label_smoothing(&self) -> f32 {
        self.label_smoothing
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (batch, classes) = match logits.dims() {
            [batch, classes] => (*batch, *classes),
            dims => {
                return Err(BalancingError::configuration(format!(
                    "cross entropy expects (batch, classes) logits, got {:?}",
                    dims
                )))
            }
        };
        if batch == 0 || classes == 0 {
            return Err(BalancingError::configuration(
                "cross entropy needs at least one sample and one class",
            ));
        }
        if targets.dims() != [batch].as_slice() {
            return Err(BalancingError::configuration(format!(
                "targets must have shape ({},), got {:?}",
                batch,
                targets.dims()
            )));
        }

        let targets = match targets.dtype() {
            DType::U32 => targets.to_device(logits.device())?,
            DType::I64 | DType::U8 => targets.to_device(logits.device())?.to_dtype(DType::U32)?,
            dtype => {
                return Err(BalancingError::configuration(format!(
                    "unsupported target dtype {:?} for cross entropy",
                    dtype
                )))
            }
        };

        let log_probs = ops::log_softmax(logits, D::Minus1)?;
        let nll = log_probs
            .gather(&targets.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?;

        let per_sample = if self.label_smoothing > 0.0 {
            let smoothing = self.label_smoothing as f64;
            let uniform = log_probs.mean(1)?.neg()?;
            (nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing, 0.0)?)?
        } else {
            nll
        };

        Ok(per_sample.mean_all()?)
    }
}

impl Default for CrossEntropyLoss {
    fn default() -> Self {
        Self {
            label_smoothing: 0.0,
        }
    }
}

/// Root mean squared error between equally shaped tensors.
pub fn rmse(predictions: &Tensor, targets: &Tensor) -> Result<Tensor> {
    if predictions.dims() != targets.dims() {
        return Err(BalancingError::configuration(format!(
            "rmse shape mismatch: predictions {:?} vs targets {:?}",
            predictions.dims(),
            targets.dims()
        )));
    }
    let targets = targets
        .to_device(predictions.device())?
        .to_dtype(predictions.dtype())?;
    Ok(predictions.sub(&targets)?.sqr()?.mean_all()?.sqrt()?)
}
