use candle_core::{DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{BalancingError, Result},
    simplex::{softmax_tensor, TaskWeights},
};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamSettings {
    fn default() -> Self {
        Self {
            learning_rate: 0.025,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Learnable task weights together with the Adam state that trains them.
#[derive(Debug)]
pub struct TaskWeightState {
    weights: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    step: usize,
    settings: AdamSettings,
}

/// An Adam step computed but not yet written back.
#[derive(Debug)]
pub(crate) struct PendingUpdate {
    weights: Tensor,
    first_moment: Tensor,
    second_moment: Tensor,
    step: usize,
}

impl PendingUpdate {
    pub(crate) fn normalized(&self) -> Result<TaskWeights> {
        TaskWeights::from_tensor(&softmax_tensor("learnable task weights", &self.weights)?)
    }
}

impl TaskWeightState {
    pub fn new(num_tasks: usize, settings: AdamSettings, device: &Device) -> Result<Self> {
        if num_tasks == 0 {
            return Err(BalancingError::configuration(
                "num_tasks must be greater than zero",
            ));
        }
        Ok(Self {
            weights: Var::ones(num_tasks, DType::F32, device)?,
            first_moment: Tensor::zeros(num_tasks, DType::F32, device)?,
            second_moment: Tensor::zeros(num_tasks, DType::F32, device)?,
            step: 0,
            settings,
        })
    }

    pub fn var(&self) -> &Var {
        &self.weights
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn settings(&self) -> AdamSettings {
        self.settings
    }

    pub fn device(&self) -> &Device {
        self.weights.as_tensor().device()
    }

    /// `softmax` of the current learnable weights.
    pub fn normalized(&self) -> Result<TaskWeights> {
        TaskWeights::from_tensor(&softmax_tensor(
            "learnable task weights",
            self.weights.as_tensor(),
        )?)
    }

    pub(crate) fn plan_step(&self, grad: &Tensor) -> Result<PendingUpdate> {
        let cfg = self.settings;
        let step = self.step + 1;
        let bias_correction1 = 1.0 - cfg.beta1.powi(step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        let grad = grad.to_dtype(DType::F32)?.detach();
        let new_m = self
            .first_moment
            .affine(cfg.beta1, 0.0)?
            .add(&grad.affine(1.0 - cfg.beta1, 0.0)?)?;
        let new_v = self
            .second_moment
            .affine(cfg.beta2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

        let m_hat = new_m.affine(scale_m, 0.0)?;
        let v_hat = new_v.affine(scale_v, 0.0)?;
        let denom = v_hat.sqrt()?.affine(1.0, cfg.epsilon)?;
        let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;
        let next = self.weights.as_tensor().detach().sub(&update)?;

        Ok(PendingUpdate {
            weights: next,
            first_moment: new_m,
            second_moment: new_v,
            step,
        })
    }

    pub(crate) fn apply(&mut self, update: PendingUpdate) -> Result<()> {
        self.weights.set(&update.weights)?;
        self.first_moment = update.first_moment;
        self.second_moment = update.second_moment;
        self.step = update.step;
        Ok(())
    }

    /// Moves the weights and both moment buffers to `device`.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        let weights = self.weights.as_tensor().to_device(device)?;
        self.weights = Var::from_tensor(&weights)?;
        self.first_moment = self.first_moment.to_device(device)?;
        self.second_moment = self.second_moment.to_device(device)?;
        Ok(())
    }

    /// Device of every tensor field, in declaration order.
    pub fn field_devices(&self) -> [&Device; 3] {
        [
            self.weights.as_tensor().device(),
            self.first_moment.device(),
            self.second_moment.device(),
        ]
    }

    pub fn state(&self) -> Result<TaskWeightSnapshot> {
        Ok(TaskWeightSnapshot {
            weights: self.weights.as_tensor().to_vec1::<f32>()?,
            first_moment: self.first_moment.to_vec1::<f32>()?,
            second_moment: self.second_moment.to_vec1::<f32>()?,
            step: self.step,
        })
    }

    pub fn load_state(&mut self, state: TaskWeightSnapshot) -> Result<()> {
        let expected = self.weights.as_tensor().elem_count();
        if state.weights.len() != expected
            || state.first_moment.len() != expected
            || state.second_moment.len() != expected
        {
            return Err(BalancingError::configuration(format!(
                "task weight state size mismatch: expected {} entries",
                expected
            )));
        }
        let device = self.device().clone();
        let weights = Tensor::from_vec(state.weights, expected, &device)?;
        let first_moment = Tensor::from_vec(state.first_moment, expected, &device)?;
        let second_moment = Tensor::from_vec(state.second_moment, expected, &device)?;
        self.weights.set(&weights)?;
        self.first_moment = first_moment;
        self.second_moment = second_moment;
        self.step = state.step;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskWeightSnapshot {
    pub weights: Vec<f32>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub step: usize,
}
