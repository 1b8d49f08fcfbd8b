//! Conditional-gradient task weighting.
//!
//! Each call scores tasks by `0.9·ln(1 + loss) + 0.1·w_prev`, picks the vertex
//! of the simplex at the lowest score and moves part of the way toward it. The
//! step size decays as `2 / (t + 2)` and is further damped by
//! `exp(−β · mean(loss))`.

use std::collections::VecDeque;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{ensure_task_count, BalancingError, Result},
    objective::{loss_values, TaskObjective},
    simplex::{argmin, ensure_finite, softmax_tensor, TaskWeights},
};

const PSEUDO_GRADIENT_LOSS_SHARE: f64 = 0.9;
const PSEUDO_GRADIENT_INERTIA_SHARE: f64 = 0.1;
const HISTORY_WARN_THRESHOLD: usize = 1 << 20;

#[derive(Debug, Clone)]
enum WeightSlot {
    Uninitialized,
    Ready(TaskWeights),
}

#[derive(Debug)]
pub struct FrankWolfeBalancer {
    num_tasks: usize,
    max_iter: usize,
    beta: f64,
    iteration: u64,
    weights: WeightSlot,
    history: VecDeque<Vec<f64>>,
    history_limit: Option<usize>,
    device: Device,
}

#[derive(Debug)]
pub(crate) struct FrankWolfePlan {
    losses: Vec<f64>,
    pub(crate) vertex: usize,
    pub(crate) gamma: f64,
    pub(crate) weights: TaskWeights,
}

impl FrankWolfeBalancer {
    pub fn new(num_tasks: usize, max_iter: usize, beta: f64, device: &Device) -> Result<Self> {
        if num_tasks == 0 {
            return Err(BalancingError::configuration(
                "num_tasks must be greater than zero",
            ));
        }
        if !beta.is_finite() || beta < 0.0 {
            return Err(BalancingError::configuration(
                "frank-wolfe beta must be finite and non-negative",
            ));
        }
        Ok(Self {
            num_tasks,
            max_iter,
            beta,
            iteration: 0,
            weights: WeightSlot::Uninitialized,
            history: VecDeque::new(),
            history_limit: None,
            device: device.clone(),
        })
    }

    /// Keeps at most `limit` entries of loss history, dropping the oldest.
    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    /// Iteration hint carried from configuration; calls are not capped by it.
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn loss_history(&self) -> impl Iterator<Item = &[f64]> {
        self.history.iter().map(Vec::as_slice)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Current weights, uniform before the first update.
    pub fn weights(&self) -> Result<TaskWeights> {
        match &self.weights {
            WeightSlot::Ready(weights) => Ok(weights.clone()),
            WeightSlot::Uninitialized => TaskWeights::uniform(self.num_tasks, &self.device),
        }
    }

    pub fn update_weights<L: TaskObjective>(&mut self, losses: &[L]) -> Result<TaskWeights> {
        ensure_task_count(self.num_tasks, losses.len())?;
        let values = loss_values(losses)?;
        let plan = self.plan(values)?;
        Ok(self.commit(plan))
    }

    pub(crate) fn plan(&self, losses: Vec<f64>) -> Result<FrankWolfePlan> {
        ensure_task_count(self.num_tasks, losses.len())?;
        ensure_finite("task loss", &losses)?;

        let prev = self.weights()?;
        let prev_values: Vec<f64> = prev.to_vec()?.into_iter().map(f64::from).collect();

        let pseudo_gradient: Vec<f64> = losses
            .iter()
            .zip(&prev_values)
            .map(|(loss, weight)| {
                PSEUDO_GRADIENT_LOSS_SHARE * loss.ln_1p() + PSEUDO_GRADIENT_INERTIA_SHARE * weight
            })
            .collect();
        ensure_finite("frank-wolfe pseudo-gradient", &pseudo_gradient)?;

        let vertex = argmin(&pseudo_gradient);
        let gamma = self.step_size(&losses);
        ensure_finite("frank-wolfe step size", &[gamma])?;

        // ln(1 + s) for the one-hot vertex s.
        let mut barrier = vec![0f32; self.num_tasks];
        barrier[vertex] = std::f32::consts::LN_2;
        let barrier = Tensor::from_vec(barrier, self.num_tasks, &self.device)?;

        let blended = prev
            .as_tensor()
            .affine(1.0 - gamma, 0.0)?
            .add(&barrier.affine(gamma, 0.0)?)?;
        let weights = TaskWeights::from_tensor(&softmax_tensor("frank-wolfe weights", &blended)?)?;

        log::debug!(
            "frank-wolfe plan: iteration={} pseudo_gradient={:?} vertex={} gamma={:.6}",
            self.iteration,
            pseudo_gradient,
            vertex,
            gamma
        );

        Ok(FrankWolfePlan {
            losses,
            vertex,
            gamma,
            weights,
        })
    }

    pub(crate) fn commit(&mut self, plan: FrankWolfePlan) -> TaskWeights {
        self.weights = WeightSlot::Ready(plan.weights.clone());
        self.iteration += 1;
        self.history.push_back(plan.losses);
        match self.history_limit {
            Some(limit) => {
                while self.history.len() > limit {
                    self.history.pop_front();
                }
            }
            None if self.history.len() == HISTORY_WARN_THRESHOLD => {
                log::warn!(
                    "frank-wolfe loss history reached {} entries; set a history limit for long runs",
                    HISTORY_WARN_THRESHOLD
                );
            }
            None => {}
        }
        plan.weights
    }

    fn step_size(&self, losses: &[f64]) -> f64 {
        let mean = losses.iter().sum::<f64>() / losses.len() as f64;
        let base = (2.0 / (self.iteration as f64 + 2.0)).min(1.0);
        base * (-self.beta * mean).exp()
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        if let WeightSlot::Ready(weights) = &self.weights {
            self.weights = WeightSlot::Ready(weights.to_device(device)?);
        }
        self.device = device.clone();
        Ok(())
    }

    pub fn state(&self) -> Result<FrankWolfeState> {
        let weights = match &self.weights {
            WeightSlot::Ready(weights) => Some(weights.to_vec()?),
            WeightSlot::Uninitialized => None,
        };
        Ok(FrankWolfeState {
            iteration: self.iteration,
            weights,
            history: self.history.iter().cloned().collect(),
        })
    }

    pub fn load_state(&mut self, state: FrankWolfeState) -> Result<()> {
        if state
            .history
            .iter()
            .any(|entry| entry.len() != self.num_tasks)
        {
            return Err(BalancingError::configuration(
                "frank-wolfe history entry does not match the task count",
            ));
        }
        let weights = match state.weights {
            Some(values) => {
                ensure_task_count(self.num_tasks, values.len())?;
                let tensor = Tensor::from_vec(values, self.num_tasks, &self.device)?;
                WeightSlot::Ready(TaskWeights::from_tensor(&tensor)?)
            }
            None => WeightSlot::Uninitialized,
        };
        self.weights = weights;
        self.iteration = state.iteration;
        self.history = state.history.into_iter().collect();
        if let Some(limit) = self.history_limit {
            while self.history.len() > limit {
                self.history.pop_front();
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FrankWolfeState {
    pub iteration: u64,
    pub weights: Option<Vec<f32>>,
    pub history: Vec<Vec<f64>>,
}
