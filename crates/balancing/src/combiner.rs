//! Blends the GradNorm and Frank-Wolfe proposals into the final task weights.
//!
//! The blend is `λ·fw + (1 − λ)·gn`, renormalized with softmax. `λ` moves every
//! step by at least `min_lambda_step`, scaled by how far the softmax of the
//! gradient norms disagrees with the softmax of the loss values, and is
//! clamped to `[lambda_min, lambda_max]`.

use candle_core::{Device, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{CombinerConfig, DirectionRule},
    errors::{ensure_shared_params, ensure_task_count, BalancingError, Result},
    frank_wolfe::{FrankWolfeBalancer, FrankWolfeState},
    gradnorm::{GradNormState, GradientNormBalancer},
    objective::{loss_values, shared_gradient_norms, TaskObjective},
    simplex::{argmax, ensure_finite, softmax, softmax_tensor, TaskWeights},
};

/// The last lambda and gradient/loss balance disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub lambda: f64,
    pub gradient_difference: f64,
}

/// Which proposal lambda moves toward on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    TowardGradNorm,
    TowardFrankWolfe,
}

#[derive(Debug)]
pub struct AdaptiveCombiner {
    num_tasks: usize,
    gradnorm: GradientNormBalancer,
    frank_wolfe: FrankWolfeBalancer,
    settings: CombinerConfig,
    lambda: f64,
    weights: TaskWeights,
    diagnostics: Diagnostics,
    last_gradient_norms: Option<Vec<f64>>,
}

impl AdaptiveCombiner {
    pub fn new(
        gradnorm: GradientNormBalancer,
        frank_wolfe: FrankWolfeBalancer,
        settings: CombinerConfig,
    ) -> Result<Self> {
        let num_tasks = gradnorm.num_tasks();
        if frank_wolfe.num_tasks() != num_tasks {
            return Err(BalancingError::configuration(format!(
                "balancers disagree on task count: gradnorm={} frank-wolfe={}",
                num_tasks,
                frank_wolfe.num_tasks()
            )));
        }
        if settings.direction == DirectionRule::TwoTask && num_tasks != 2 {
            return Err(BalancingError::UnsupportedTaskCount {
                rule: "two_task",
                expected: 2,
                actual: num_tasks,
            });
        }
        settings.validate_bounds()?;

        let device = gradnorm.device().clone();
        let weights = TaskWeights::uniform(num_tasks, &device)?;
        let lambda = settings.initial_lambda;
        Ok(Self {
            num_tasks,
            gradnorm,
            frank_wolfe,
            settings,
            lambda,
            weights,
            diagnostics: Diagnostics {
                lambda,
                gradient_difference: 0.0,
            },
            last_gradient_norms: None,
        })
    }

    pub fn num_tasks(&self) -> usize {
        self.num_tasks
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics
    }

    pub fn weights(&self) -> &TaskWeights {
        &self.weights
    }

    pub fn settings(&self) -> &CombinerConfig {
        &self.settings
    }

    pub fn gradnorm(&self) -> &GradientNormBalancer {
        &self.gradnorm
    }

    pub fn frank_wolfe(&self) -> &FrankWolfeBalancer {
        &self.frank_wolfe
    }

    /// Gradient norms measured for the lambda rule on the last call.
    pub fn last_gradient_norms(&self) -> Option<&[f64]> {
        self.last_gradient_norms.as_deref()
    }

    pub fn device(&self) -> &Device {
        self.gradnorm.device()
    }

    pub fn reset_baseline(&mut self) {
        self.gradnorm.reset_baseline();
    }

    pub fn update_weights<L: TaskObjective>(
        &mut self,
        losses: &[L],
        shared_params: &[Var],
    ) -> Result<TaskWeights> {
        ensure_task_count(self.num_tasks, losses.len())?;
        ensure_shared_params(shared_params)?;
        let values = loss_values(losses)?;

        let gn_plan = self.gradnorm.plan(losses, values.clone(), shared_params)?;
        let fw_plan = self.frank_wolfe.plan(values.clone())?;

        let gradient_norms = if self.settings.share_gradient_norms {
            gn_plan.gradient_norms.clone()
        } else {
            shared_gradient_norms(losses, shared_params)?
        };

        let target_balance = softmax(&values);
        let current_balance = softmax(&gradient_norms);
        ensure_finite("loss balance", &target_balance)?;
        ensure_finite("gradient balance", &current_balance)?;
        let gradient_difference: f64 = current_balance
            .iter()
            .zip(&target_balance)
            .map(|(current, target)| (current - target).abs())
            .sum();

        let raw_delta = self.settings.eta * gradient_difference * self.settings.delta_scale;
        let delta = raw_delta.max(self.settings.min_lambda_step);
        ensure_finite("lambda step", &[delta])?;

        let direction = match self.settings.direction {
            DirectionRule::TwoTask => two_task_direction(&gradient_norms)?,
            DirectionRule::LargestImbalance => largest_imbalance_direction(
                &current_balance,
                &target_balance,
                &gn_plan.weights.to_vec()?,
                &fw_plan.weights.to_vec()?,
            ),
        };
        let moved = match direction {
            Direction::TowardGradNorm => self.lambda - delta,
            Direction::TowardFrankWolfe => self.lambda + delta,
        };
        let lambda = moved.clamp(self.settings.lambda_min, self.settings.lambda_max);

        let blended = fw_plan
            .weights
            .as_tensor()
            .affine(lambda, 0.0)?
            .add(&gn_plan.weights.as_tensor().affine(1.0 - lambda, 0.0)?)?;
        let weights = TaskWeights::from_tensor(&softmax_tensor("combined weights", &blended)?)?;

        log::debug!(
            "combiner: grad_norms={:?} grad_diff={:.6} delta={:.6} direction={:?} lambda={:.4}->{:.4}",
            gradient_norms,
            gradient_difference,
            delta,
            direction,
            self.lambda,
            lambda
        );

        self.gradnorm.commit(gn_plan)?;
        self.frank_wolfe.commit(fw_plan);
        self.lambda = lambda;
        self.weights = weights.clone();
        self.diagnostics = Diagnostics {
            lambda,
            gradient_difference,
        };
        self.last_gradient_norms = Some(gradient_norms);
        Ok(weights)
    }

    /// Moves every owned tensor, including both balancers, to `device`.
    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.gradnorm.to_device(device)?;
        self.frank_wolfe.to_device(device)?;
        self.weights = self.weights.to_device(device)?;
        Ok(())
    }

    pub fn state(&self) -> Result<CombinerState> {
        Ok(CombinerState {
            lambda: self.lambda,
            weights: self.weights.to_vec()?,
            diagnostics: self.diagnostics,
            gradnorm: self.gradnorm.state()?,
            frank_wolfe: self.frank_wolfe.state()?,
        })
    }

    pub fn load_state(&mut self, state: CombinerState) -> Result<()> {
        ensure_task_count(self.num_tasks, state.weights.len())?;
        if !(self.settings.lambda_min..=self.settings.lambda_max).contains(&state.lambda) {
            return Err(BalancingError::configuration(format!(
                "restored lambda {} is outside [{}, {}]",
                state.lambda, self.settings.lambda_min, self.settings.lambda_max
            )));
        }
        let tensor = candle_core::Tensor::from_vec(state.weights, self.num_tasks, self.device())?;
        let weights = TaskWeights::from_tensor(&tensor)?;
        let previous = self.gradnorm.state()?;
        self.gradnorm.load_state(state.gradnorm)?;
        if let Err(err) = self.frank_wolfe.load_state(state.frank_wolfe) {
            self.gradnorm.load_state(previous)?;
            return Err(err);
        }
        self.lambda = state.lambda;
        self.weights = weights;
        self.diagnostics = state.diagnostics;
        self.last_gradient_norms = None;
        log::info!(
            "combiner state restored: lambda={:.4} frank-wolfe iteration={}",
            self.lambda,
            self.frank_wolfe.iteration()
        );
        Ok(())
    }
}

/// Task 0 pulling harder on the shared parameters shifts weight toward GradNorm.
fn two_task_direction(gradient_norms: &[f64]) -> Result<Direction> {
    match gradient_norms {
        [first, second] if first > second => Ok(Direction::TowardGradNorm),
        [_, _] => Ok(Direction::TowardFrankWolfe),
        other => Err(BalancingError::UnsupportedTaskCount {
            rule: "two_task",
            expected: 2,
            actual: other.len(),
        }),
    }
}

/// Finds the task whose gradient share most exceeds its loss share and moves
/// toward whichever proposal gives that task more weight, GradNorm on ties.
///
/// With two tasks this agrees with [`two_task_direction`] whenever the
/// Frank-Wolfe proposal favors the lower-loss task that also pulls harder on
/// the shared parameters, but is not equivalent in general.
fn largest_imbalance_direction(
    current_balance: &[f64],
    target_balance: &[f64],
    gn_weights: &[f32],
    fw_weights: &[f32],
) -> Direction {
    let imbalance: Vec<f64> = current_balance
        .iter()
        .zip(target_balance)
        .map(|(current, target)| current - target)
        .collect();
    let task = argmax(&imbalance);
    if fw_weights[task] > gn_weights[task] {
        Direction::TowardFrankWolfe
    } else {
        Direction::TowardGradNorm
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombinerState {
    pub lambda: f64,
    pub weights: Vec<f32>,
    pub diagnostics: Diagnostics,
    pub gradnorm: GradNormState,
    pub frank_wolfe: FrankWolfeState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BalancingConfig,
        objective::testing::{shared_var, FixedObjective},
    };

    fn combiner(config: &BalancingConfig) -> AdaptiveCombiner {
        config.build(&Device::Cpu).unwrap()
    }

    #[test]
    fn diagnostics_default_before_first_call() {
        let combiner = combiner(&BalancingConfig::default());
        assert_eq!(
            combiner.diagnostics(),
            Diagnostics {
                lambda: 0.5,
                gradient_difference: 0.0
            }
        );
        assert_eq!(combiner.weights().to_vec().unwrap(), vec![0.5, 0.5]);
    }

    #[test]
    fn dominant_first_task_lowers_lambda() {
        let mut combiner = combiner(&BalancingConfig::default());
        let params = [shared_var()];
        combiner
            .update_weights(
                &[FixedObjective::new(1.0, 5.0), FixedObjective::new(1.0, 1.0)],
                &params,
            )
            .unwrap();
        assert!(combiner.lambda() < 0.5);
    }

    #[test]
    fn dominant_second_task_raises_lambda() {
        let mut combiner = combiner(&BalancingConfig::default());
        let params = [shared_var()];
        combiner
            .update_weights(
                &[FixedObjective::new(1.0, 1.0), FixedObjective::new(1.0, 5.0)],
                &params,
            )
            .unwrap();
        assert!(combiner.lambda() > 0.5);
    }

    #[test]
    fn gradient_difference_matches_softmax_disagreement() {
        let mut combiner = combiner(&BalancingConfig::default());
        let params = [shared_var()];
        combiner
            .update_weights(
                &[FixedObjective::new(2.0, 1.0), FixedObjective::new(1.0, 3.0)],
                &params,
            )
            .unwrap();
        let target = softmax(&[2.0, 1.0]);
        let current = softmax(&[1.0, 3.0]);
        let expected = (current[0] - target[0]).abs() + (current[1] - target[1]).abs();
        let diagnostics = combiner.diagnostics();
        assert!((diagnostics.gradient_difference - expected).abs() < 1e-12);
        // 0.1 · diff · 2.0 exceeds the floor here.
        assert!((diagnostics.lambda - (0.5 + 0.2 * expected)).abs() < 1e-12);
    }

    #[test]
    fn minimum_step_engages_for_small_disagreement() {
        let mut config = BalancingConfig::default();
        config.combiner.eta = 1e-4;
        let mut combiner = combiner(&config);
        let params = [shared_var()];
        combiner
            .update_weights(
                &[FixedObjective::new(1.0, 2.0), FixedObjective::new(1.0, 1.0)],
                &params,
            )
            .unwrap();
        let change = (combiner.lambda() - 0.5).abs();
        assert!(change >= 0.01 - 1e-12, "lambda moved by {}", change);
    }

    #[test]
    fn lambda_is_clamped_to_bounds() {
        let mut combiner = combiner(&BalancingConfig::default());
        let params = [shared_var()];
        for _ in 0..100 {
            combiner
                .update_weights(
                    &[FixedObjective::new(0.1, 50.0), FixedObjective::new(9.0, 0.1)],
                    &params,
                )
                .unwrap();
            assert!((0.1..=0.9).contains(&combiner.lambda()));
        }
        assert!((combiner.lambda() - 0.1).abs() < 1e-12);
    }

    #[test]
    fn shared_norms_skip_the_second_pass() {
        let mut config = BalancingConfig::default();
        config.combiner.share_gradient_norms = true;
        let mut combiner = combiner(&config);
        let params = [shared_var()];
        combiner
            .update_weights(
                &[FixedObjective::new(1.0, 4.0), FixedObjective::new(1.0, 2.0)],
                &params,
            )
            .unwrap();
        assert_eq!(combiner.last_gradient_norms(), Some(&[4.0, 2.0][..]));
        assert_eq!(
            combiner.gradnorm().last_gradient_norms(),
            combiner.last_gradient_norms()
        );
    }

    #[test]
    fn two_task_rule_rejects_other_task_counts() {
        let mut config = BalancingConfig::default();
        config.num_tasks = 3;
        let err = config.build(&Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            BalancingError::UnsupportedTaskCount {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn largest_imbalance_rule_handles_three_tasks() {
        let mut config = BalancingConfig::default();
        config.num_tasks = 3;
        config.combiner.direction = DirectionRule::LargestImbalance;
        let mut combiner = combiner(&config);
        let params = [shared_var()];
        for step in 0..30 {
            let shift = step as f64 * 0.1;
            let weights = combiner
                .update_weights(
                    &[
                        FixedObjective::new(1.0 + shift, 3.0),
                        FixedObjective::new(0.5, 1.0),
                        FixedObjective::new(2.0, 0.2 + shift),
                    ],
                    &params,
                )
                .unwrap()
                .to_vec()
                .unwrap();
            assert_eq!(weights.len(), 3);
            assert!((weights.iter().sum::<f32>() - 1.0).abs() < 1e-6);
            assert!((0.1..=0.9).contains(&combiner.lambda()));
        }
    }

    #[test]
    fn largest_imbalance_moves_toward_the_proposal_favoring_the_task() {
        let current = [0.7, 0.2, 0.1];
        let target = [0.3, 0.4, 0.3];
        assert_eq!(
            largest_imbalance_direction(&current, &target, &[0.2, 0.4, 0.4], &[0.5, 0.3, 0.2]),
            Direction::TowardFrankWolfe
        );
        assert_eq!(
            largest_imbalance_direction(&current, &target, &[0.5, 0.3, 0.2], &[0.2, 0.4, 0.4]),
            Direction::TowardGradNorm
        );
        assert_eq!(
            largest_imbalance_direction(&current, &target, &[0.5, 0.3, 0.2], &[0.5, 0.3, 0.2]),
            Direction::TowardGradNorm
        );
    }

    fn lambda_after_one_call(direction: DirectionRule, values: [f64; 2], norms: [f64; 2]) -> f64 {
        let mut config = BalancingConfig::default();
        config.combiner.direction = direction;
        let mut combiner = combiner(&config);
        combiner
            .update_weights(
                &[
                    FixedObjective::new(values[0], norms[0]),
                    FixedObjective::new(values[1], norms[1]),
                ],
                &[shared_var()],
            )
            .unwrap();
        combiner.lambda()
    }

    #[test]
    fn largest_imbalance_with_two_tasks() {
        // Task 0 dominates the gradients and Frank-Wolfe steps toward task 1:
        // both rules lower lambda by the same amount.
        let two_task = lambda_after_one_call(DirectionRule::TwoTask, [1.0, 0.5], [5.0, 1.0]);
        let imbalance =
            lambda_after_one_call(DirectionRule::LargestImbalance, [1.0, 0.5], [5.0, 1.0]);
        assert!(two_task < 0.5);
        assert_eq!(two_task, imbalance);

        // Frank-Wolfe now favors the dominant task 0, so the generalized rule
        // follows it while the two-task rule still lowers lambda.
        let two_task = lambda_after_one_call(DirectionRule::TwoTask, [0.5, 1.0], [5.0, 1.0]);
        let imbalance =
            lambda_after_one_call(DirectionRule::LargestImbalance, [0.5, 1.0], [5.0, 1.0]);
        assert!(two_task < 0.5);
        assert!(imbalance > 0.5);
        assert!(((0.5 - two_task) - (imbalance - 0.5)).abs() < 1e-12);
    }

    #[test]
    fn numeric_failure_mutates_nothing() {
        let mut combiner = combiner(&BalancingConfig::default());
        let params = [shared_var()];
        combiner
            .update_weights(
                &[FixedObjective::new(1.0, 1.0), FixedObjective::new(2.0, 1.0)],
                &params,
            )
            .unwrap();
        let before = combiner.state().unwrap();

        let err = combiner
            .update_weights(
                &[FixedObjective::new(1.0, f64::NAN), FixedObjective::new(2.0, 1.0)],
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, BalancingError::NumericInstability(_)));
        assert_eq!(combiner.state().unwrap(), before);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut combiner = combiner(&BalancingConfig::default());
        let params = [shared_var()];
        for _ in 0..3 {
            combiner
                .update_weights(
                    &[FixedObjective::new(2.0, 1.5), FixedObjective::new(1.0, 0.5)],
                    &params,
                )
                .unwrap();
        }
        let encoded = serde_json::to_string(&combiner.state().unwrap()).unwrap();
        let decoded: CombinerState = serde_json::from_str(&encoded).unwrap();

        let mut restored = BalancingConfig::default().build(&Device::Cpu).unwrap();
        restored.load_state(decoded).unwrap();
        assert_eq!(restored.lambda(), combiner.lambda());
        assert_eq!(restored.frank_wolfe().iteration(), 3);
        assert_eq!(restored.state().unwrap(), combiner.state().unwrap());
    }
}
