//! Gradient-magnitude balancing.
//!
//! Task losses are normalized against the losses seen on the first call and
//! the learnable weights are nudged so each task's weighted gradient norm on
//! the shared parameters tracks `gradNorm_i · r_i^α`, where `r_i` is the task's
//! relative rate of loss improvement.
//!
//! The default [`BalanceLoss::Reference`] objective `Σ|gradNorm_i − target_i|`
//! does not involve the learnable weights, so its gradient is zero and the
//! proposal stays at its current point. [`BalanceLoss::Weighted`] scales each
//! norm by its learnable weight, under which tasks that improve slowly
//! (`r_i > 1`) gain weight.

use candle_core::{Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::BalanceLoss,
    errors::{ensure_shared_params, ensure_task_count, BalancingError, Result},
    objective::{loss_values, shared_gradient_norms, TaskObjective},
    optimizer::{AdamSettings, PendingUpdate, TaskWeightSnapshot, TaskWeightState},
    simplex::{ensure_finite, TaskWeights},
};

/// First observed losses; captured once, then frozen until an explicit reset.
#[derive(Debug, Clone, PartialEq)]
pub enum Baseline {
    Pending,
    Captured(Vec<f64>),
}

impl Baseline {
    pub fn values(&self) -> Option<&[f64]> {
        match self {
            Baseline::Pending => None,
            Baseline::Captured(values) => Some(values),
        }
    }
}

#[derive(Debug)]
pub struct GradientNormBalancer {
    num_tasks: usize,
    alpha: f64,
    balance_loss: BalanceLoss,
    baseline: Baseline,
    weights: TaskWeightState,
    last_gradient_norms: Option<Vec<f64>>,
}

/// Everything one call computes before any state changes.
#[derive(Debug)]
pub(crate) struct GradNormPlan {
    captured_baseline: Option<Vec<f64>>,
    pub(crate) gradient_norms: Vec<f64>,
    pub(crate) balance_loss: f64,
    update: PendingUpdate,
    pub(crate) weights: TaskWeights,
}

impl GradientNormBalancer {
    pub fn new(num_tasks: usize, alpha: f64, settings: AdamSettings, device: &Device) -> Result<Self> {
        if !alpha.is_finite() {
            return Err(BalancingError::configuration("alpha must be finite"));
        }
        Ok(Self {
            num_tasks,
            alpha,
            balance_loss: BalanceLoss::default(),
            baseline: Baseline::Pending,
            weights: TaskWeightState::new(num_tasks, settings, device)?,
            last_gradient_norms: None,
        })
    }

    pub fn with_balance_loss(mut self, balance_loss: BalanceLoss) -> Self {
        self.balance_loss = balance_loss;
        self
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn balance_loss(&self) -> BalanceLoss {
        self.balance_loss
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn last_gradient_norms(&self) -> Option<&[f64]> {
        self.last_gradient_norms.as_deref()
    }

    pub fn task_weights(&self) -> &TaskWeightState {
        &self.weights
    }

    /// Current `softmax` of the learnable weights.
    pub fn weights(&self) -> Result<TaskWeights> {
        self.weights.normalized()
    }

    pub fn device(&self) -> &Device {
        self.weights.device()
    }

    /// Forgets the captured baseline; the next call captures a new one.
    pub fn reset_baseline(&mut self) {
        if let Baseline::Captured(_) = self.baseline {
            log::info!("gradnorm baseline reset");
        }
        self.baseline = Baseline::Pending;
    }

    pub fn update_weights<L: TaskObjective>(
        &mut self,
        losses: &[L],
        shared_params: &[Var],
    ) -> Result<TaskWeights> {
        ensure_task_count(self.num_tasks, losses.len())?;
        let values = loss_values(losses)?;
        let plan = self.plan(losses, values, shared_params)?;
        self.commit(plan)
    }

    /// `values` are the detached losses, already read by the caller.
    pub(crate) fn plan<L: TaskObjective>(
        &self,
        losses: &[L],
        values: Vec<f64>,
        shared_params: &[Var],
    ) -> Result<GradNormPlan> {
        ensure_task_count(self.num_tasks, losses.len())?;
        ensure_task_count(self.num_tasks, values.len())?;
        ensure_shared_params(shared_params)?;
        ensure_finite("task loss", &values)?;

        let (baseline, captured_baseline) = match &self.baseline {
            Baseline::Captured(baseline) => (baseline.clone(), None),
            Baseline::Pending => (values.clone(), Some(values.clone())),
        };

        let ratios: Vec<f64> = values
            .iter()
            .zip(&baseline)
            .map(|(loss, initial)| loss / initial)
            .collect();
        ensure_finite("loss ratio", &ratios)?;
        let mean_ratio = ratios.iter().sum::<f64>() / ratios.len() as f64;
        let relative_rates: Vec<f64> = ratios.iter().map(|ratio| ratio / mean_ratio).collect();
        ensure_finite("relative training rate", &relative_rates)?;

        let gradient_norms = shared_gradient_norms(losses, shared_params)?;
        let targets: Vec<f64> = gradient_norms
            .iter()
            .zip(&relative_rates)
            .map(|(norm, rate)| norm * rate.powf(self.alpha))
            .collect();
        ensure_finite("gradient norm target", &targets)?;

        let device = self.weights.device();
        let norms_tensor = host_tensor(&gradient_norms, device)?;
        let targets_tensor = host_tensor(&targets, device)?;
        let learnable = self.weights.var().as_tensor();
        let scaled_norms = match self.balance_loss {
            BalanceLoss::Reference => norms_tensor,
            BalanceLoss::Weighted => learnable.mul(&norms_tensor)?,
        };
        let balance = scaled_norms.sub(&targets_tensor)?.abs()?.sum_all()?;
        let balance_loss = balance.to_vec0::<f32>()? as f64;
        ensure_finite("gradnorm balance loss", &[balance_loss])?;

        // No path to the learnable weights means a zero gradient.
        let grads = balance.backward()?;
        let grad = match grads.get(learnable) {
            Some(grad) => grad.clone(),
            None => learnable.zeros_like()?,
        };
        let update = self.weights.plan_step(&grad)?;
        let weights = update.normalized()?;

        log::debug!(
            "gradnorm plan ({:?}): losses={:?} rates={:?} grad_norms={:?} balance_loss={:.6}",
            self.balance_loss,
            values,
            relative_rates,
            gradient_norms,
            balance_loss
        );

        Ok(GradNormPlan {
            captured_baseline,
            gradient_norms,
            balance_loss,
            update,
            weights,
        })
    }

    pub(crate) fn commit(&mut self, plan: GradNormPlan) -> Result<TaskWeights> {
        self.weights.apply(plan.update)?;
        if let Some(baseline) = plan.captured_baseline {
            log::info!("gradnorm baseline captured: {:?}", baseline);
            self.baseline = Baseline::Captured(baseline);
        }
        self.last_gradient_norms = Some(plan.gradient_norms);
        Ok(plan.weights)
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.weights.to_device(device)
    }

    pub fn state(&self) -> Result<GradNormState> {
        Ok(GradNormState {
            baseline: self.baseline.values().map(<[f64]>::to_vec),
            weights: self.weights.state()?,
        })
    }

    pub fn load_state(&mut self, state: GradNormState) -> Result<()> {
        if let Some(baseline) = &state.baseline {
            ensure_task_count(self.num_tasks, baseline.len())?;
        }
        self.weights.load_state(state.weights)?;
        self.baseline = match state.baseline {
            Some(values) => Baseline::Captured(values),
            None => Baseline::Pending,
        };
        self.last_gradient_norms = None;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GradNormState {
    pub baseline: Option<Vec<f64>>,
    pub weights: TaskWeightSnapshot,
}

fn host_tensor(values: &[f64], device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = values.iter().map(|v| *v as f32).collect();
    Ok(Tensor::from_vec(data, values.len(), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objective::testing::{shared_var, FixedObjective};

    fn balancer() -> GradientNormBalancer {
        GradientNormBalancer::new(2, 1.5, AdamSettings::default(), &Device::Cpu).unwrap()
    }

    fn assert_simplex(weights: &TaskWeights) {
        let values = weights.to_vec().unwrap();
        assert!(values.iter().all(|w| *w >= 0.0));
        let total: f32 = values.iter().sum();
        assert!((total - 1.0).abs() < 1e-6, "weights sum to {}", total);
    }

    #[test]
    fn baseline_is_captured_once() {
        let mut balancer = balancer();
        let params = [shared_var()];
        assert_eq!(balancer.baseline(), &Baseline::Pending);

        balancer
            .update_weights(
                &[FixedObjective::new(2.0, 1.0), FixedObjective::new(1.0, 1.0)],
                &params,
            )
            .unwrap();
        assert_eq!(balancer.baseline().values(), Some(&[2.0, 1.0][..]));

        balancer
            .update_weights(
                &[FixedObjective::new(7.0, 1.0), FixedObjective::new(0.5, 1.0)],
                &params,
            )
            .unwrap();
        assert_eq!(balancer.baseline().values(), Some(&[2.0, 1.0][..]));
    }

    #[test]
    fn reset_allows_recapture() {
        let mut balancer = balancer();
        let params = [shared_var()];
        balancer
            .update_weights(
                &[FixedObjective::new(2.0, 1.0), FixedObjective::new(1.0, 1.0)],
                &params,
            )
            .unwrap();
        balancer.reset_baseline();
        assert_eq!(balancer.baseline(), &Baseline::Pending);
        balancer
            .update_weights(
                &[FixedObjective::new(4.0, 1.0), FixedObjective::new(3.0, 1.0)],
                &params,
            )
            .unwrap();
        assert_eq!(balancer.baseline().values(), Some(&[4.0, 3.0][..]));
    }

    #[test]
    fn reference_balance_loss_keeps_weights_in_place() {
        let mut balancer = balancer();
        let params = [shared_var()];
        assert_eq!(balancer.balance_loss(), BalanceLoss::Reference);
        let mut calls = vec![[1.0, 1.0]];
        calls.extend([[1.0, 0.5]; 5]);

        for [a, b] in calls {
            let weights = balancer
                .update_weights(
                    &[FixedObjective::new(a, 1.0), FixedObjective::new(b, 1.0)],
                    &params,
                )
                .unwrap();
            assert_eq!(weights.to_vec().unwrap(), vec![0.5, 0.5]);
        }
        assert_eq!(balancer.task_weights().step(), 6);
        assert_eq!(
            balancer.task_weights().var().as_tensor().to_vec1::<f32>().unwrap(),
            vec![1.0, 1.0]
        );
    }

    #[test]
    fn slower_task_gains_weight_under_weighted_loss() {
        let mut balancer = balancer().with_balance_loss(BalanceLoss::Weighted);
        let params = [shared_var()];
        balancer
            .update_weights(
                &[FixedObjective::new(1.0, 1.0), FixedObjective::new(1.0, 1.0)],
                &params,
            )
            .unwrap();
        // Task 0 has stalled while task 1 halved its loss.
        let mut weights = Vec::new();
        for _ in 0..5 {
            let update = balancer
                .update_weights(
                    &[FixedObjective::new(1.0, 1.0), FixedObjective::new(0.5, 1.0)],
                    &params,
                )
                .unwrap();
            assert_simplex(&update);
            weights = update.to_vec().unwrap();
        }
        assert!(weights[0] > weights[1], "weights {:?}", weights);
    }

    #[test]
    fn weights_always_form_a_simplex() {
        let mut balancer = balancer().with_balance_loss(BalanceLoss::Weighted);
        let params = [shared_var()];
        for step in 0..20 {
            let a = 1.0 + (step as f64 * 0.7).sin().abs();
            let b = 0.2 + (step as f64 * 0.3).cos().abs();
            let weights = balancer
                .update_weights(
                    &[FixedObjective::new(a, 3.0), FixedObjective::new(b, 0.4)],
                    &params,
                )
                .unwrap();
            assert_simplex(&weights);
        }
        assert_eq!(balancer.task_weights().step(), 20);
    }

    #[test]
    fn task_count_mismatch_leaves_state_untouched() {
        let mut balancer = balancer();
        let params = [shared_var()];
        let err = balancer
            .update_weights(
                &[
                    FixedObjective::new(1.0, 1.0),
                    FixedObjective::new(1.0, 1.0),
                    FixedObjective::new(1.0, 1.0),
                ],
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, BalancingError::Configuration(_)));
        assert_eq!(balancer.baseline(), &Baseline::Pending);
        assert_eq!(balancer.task_weights().step(), 0);
    }

    #[test]
    fn plan_reads_the_supplied_loss_values() {
        let balancer = balancer();
        let params = [shared_var()];
        let losses = [FixedObjective::new(9.0, 1.0), FixedObjective::new(9.0, 1.0)];

        let plan = balancer.plan(&losses, vec![2.0, 1.0], &params).unwrap();
        assert_eq!(plan.captured_baseline, Some(vec![2.0, 1.0]));

        let err = balancer.plan(&losses, vec![2.0], &params).unwrap_err();
        assert!(matches!(err, BalancingError::Configuration(_)));
    }

    #[test]
    fn empty_shared_params_is_rejected() {
        let mut balancer = balancer();
        let err = balancer
            .update_weights(
                &[FixedObjective::new(1.0, 1.0), FixedObjective::new(1.0, 1.0)],
                &[],
            )
            .unwrap_err();
        assert!(matches!(err, BalancingError::Configuration(_)));
    }

    #[test]
    fn zero_baseline_is_numeric_instability() {
        let mut balancer = balancer();
        let params = [shared_var()];
        let err = balancer
            .update_weights(
                &[FixedObjective::new(0.0, 1.0), FixedObjective::new(1.0, 1.0)],
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, BalancingError::NumericInstability(_)));
        assert_eq!(balancer.baseline(), &Baseline::Pending);
    }

    #[test]
    fn infinite_gradient_norm_is_rejected() {
        let mut balancer = balancer();
        let params = [shared_var()];
        let err = balancer
            .update_weights(
                &[
                    FixedObjective::new(1.0, f64::INFINITY),
                    FixedObjective::new(1.0, 1.0),
                ],
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, BalancingError::NumericInstability(_)));
        assert_eq!(balancer.task_weights().step(), 0);
    }

    #[test]
    fn works_with_candle_losses() {
        let device = Device::Cpu;
        let shared = Var::new(&[0.5f32, -1.0, 2.0], &device).unwrap();
        let x = shared.as_tensor();
        let classification = x.sqr().unwrap().sum_all().unwrap();
        let regression = x.sum_all().unwrap().affine(3.0, 0.0).unwrap();

        let mut balancer = balancer();
        let weights = balancer
            .update_weights(&[classification, regression], &[shared])
            .unwrap();
        assert_simplex(&weights);
        let norms = balancer.last_gradient_norms().unwrap();
        // ||2x|| and ||3·1||.
        assert!((norms[0] - 2.0 * 5.25f64.sqrt()).abs() < 1e-4);
        assert!((norms[1] - 27f64.sqrt()).abs() < 1e-4);
    }

    #[test]
    fn state_snapshot_restores_baseline() {
        let mut balancer = balancer();
        let params = [shared_var()];
        balancer
            .update_weights(
                &[FixedObjective::new(2.0, 1.0), FixedObjective::new(1.0, 2.0)],
                &params,
            )
            .unwrap();
        let snapshot = balancer.state().unwrap();

        let mut restored = GradientNormBalancer::new(2, 1.5, AdamSettings::default(), &Device::Cpu)
            .unwrap();
        restored.load_state(snapshot.clone()).unwrap();
        assert_eq!(restored.baseline().values(), Some(&[2.0, 1.0][..]));
        assert_eq!(restored.state().unwrap(), snapshot);
    }
}
