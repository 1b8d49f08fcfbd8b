use std::{fs, path::Path};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{
    combiner::AdaptiveCombiner,
    errors::{BalancingError, Result},
    frank_wolfe::FrankWolfeBalancer,
    gradnorm::GradientNormBalancer,
    optimizer::AdamSettings,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancingConfig {
    #[serde(default = "default_num_tasks")]
    pub num_tasks: usize,
    #[serde(default)]
    pub gradnorm: GradNormConfig,
    #[serde(default)]
    pub frank_wolfe: FrankWolfeConfig,
    #[serde(default)]
    pub combiner: CombinerConfig,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            num_tasks: default_num_tasks(),
            gradnorm: GradNormConfig::default(),
            frank_wolfe: FrankWolfeConfig::default(),
            combiner: CombinerConfig::default(),
        }
    }
}

impl BalancingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: BalancingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(BalancingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.num_tasks == 0 {
            errors.push("num_tasks must be greater than 0".to_string());
        }

        if !self.gradnorm.alpha.is_finite() {
            errors.push("gradnorm.alpha must be finite".to_string());
        }

        if !(self.gradnorm.learning_rate > 0.0) {
            errors.push("gradnorm.learning_rate must be greater than 0".to_string());
        }

        if !(0.0 < self.gradnorm.beta1 && self.gradnorm.beta1 < 1.0) {
            errors.push("gradnorm.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.gradnorm.beta2 && self.gradnorm.beta2 < 1.0) {
            errors.push("gradnorm.beta2 must be in (0, 1)".to_string());
        }

        if !(self.gradnorm.epsilon > 0.0) {
            errors.push("gradnorm.epsilon must be greater than 0".to_string());
        }

        if !(self.frank_wolfe.beta >= 0.0 && self.frank_wolfe.beta.is_finite()) {
            errors.push("frank_wolfe.beta must be finite and >= 0".to_string());
        }

        if self.frank_wolfe.max_iter == 0 {
            errors.push("frank_wolfe.max_iter must be greater than 0".to_string());
        }

        if let Some(0) = self.frank_wolfe.history_limit {
            errors.push("frank_wolfe.history_limit must be greater than 0".to_string());
        }

        errors.extend(self.combiner.bound_errors());

        if !(self.combiner.eta >= 0.0 && self.combiner.eta.is_finite()) {
            errors.push("combiner.eta must be finite and >= 0".to_string());
        }

        if !(self.combiner.delta_scale >= 0.0 && self.combiner.delta_scale.is_finite()) {
            errors.push("combiner.delta_scale must be finite and >= 0".to_string());
        }

        if self.combiner.direction == DirectionRule::TwoTask && self.num_tasks != 2 {
            errors.push(format!(
                "combiner.direction = \"two_task\" requires num_tasks = 2 (got {})",
                self.num_tasks
            ));
        }

        if !errors.is_empty() {
            return Err(BalancingError::validation(errors));
        }

        Ok(())
    }

    /// Builds the full controller on `device`.
    pub fn build(&self, device: &Device) -> Result<AdaptiveCombiner> {
        let gradnorm = GradientNormBalancer::new(
            self.num_tasks,
            self.gradnorm.alpha,
            self.gradnorm.adam_settings(),
            device,
        )?
        .with_balance_loss(self.gradnorm.balance_loss);
        let frank_wolfe = FrankWolfeBalancer::new(
            self.num_tasks,
            self.frank_wolfe.max_iter,
            self.frank_wolfe.beta,
            device,
        )?
        .with_history_limit(self.frank_wolfe.history_limit);
        AdaptiveCombiner::new(gradnorm, frank_wolfe, self.combiner.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradNormConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_gradnorm_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub balance_loss: BalanceLoss,
}

impl Default for GradNormConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            learning_rate: default_gradnorm_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            balance_loss: BalanceLoss::default(),
        }
    }
}

impl GradNormConfig {
    pub fn adam_settings(&self) -> AdamSettings {
        AdamSettings {
            learning_rate: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrankWolfeConfig {
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_frank_wolfe_beta")]
    pub beta: f64,
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Default for FrankWolfeConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            beta: default_frank_wolfe_beta(),
            history_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinerConfig {
    #[serde(default = "default_initial_lambda")]
    pub initial_lambda: f64,
    #[serde(default = "default_lambda_min")]
    pub lambda_min: f64,
    #[serde(default = "default_lambda_max")]
    pub lambda_max: f64,
    #[serde(default = "default_eta")]
    pub eta: f64,
    #[serde(default = "default_min_lambda_step")]
    pub min_lambda_step: f64,
    #[serde(default = "default_delta_scale")]
    pub delta_scale: f64,
    #[serde(default)]
    pub direction: DirectionRule,
    #[serde(default)]
    pub share_gradient_norms: bool,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            initial_lambda: default_initial_lambda(),
            lambda_min: default_lambda_min(),
            lambda_max: default_lambda_max(),
            eta: default_eta(),
            min_lambda_step: default_min_lambda_step(),
            delta_scale: default_delta_scale(),
            direction: DirectionRule::default(),
            share_gradient_norms: false,
        }
    }
}

impl CombinerConfig {
    fn bound_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !(0.0..=1.0).contains(&self.lambda_min) || !(0.0..=1.0).contains(&self.lambda_max) {
            errors.push("combiner lambda bounds must lie in [0, 1]".to_string());
        }
        if self.lambda_min > self.lambda_max {
            errors.push("combiner.lambda_min cannot exceed combiner.lambda_max".to_string());
        }
        if !(self.lambda_min..=self.lambda_max).contains(&self.initial_lambda) {
            errors.push(format!(
                "combiner.initial_lambda {} must lie in [{}, {}]",
                self.initial_lambda, self.lambda_min, self.lambda_max
            ));
        }
        if !(self.min_lambda_step >= 0.0 && self.min_lambda_step.is_finite()) {
            errors.push("combiner.min_lambda_step must be finite and >= 0".to_string());
        }
        errors
    }

    pub(crate) fn validate_bounds(&self) -> Result<()> {
        let errors = self.bound_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(BalancingError::validation(errors))
        }
    }
}

/// Objective the GradNorm sub-optimizer minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceLoss {
    /// `Σ|gradNorm_i − target_i|`; constant in the learnable weights.
    #[default]
    Reference,
    /// `Σ|w_i·gradNorm_i − target_i|`, so each step moves the learnable weights.
    Weighted,
}

/// How lambda picks its direction each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionRule {
    /// Compares the two tasks' gradient norms directly.
    #[default]
    TwoTask,
    /// Any task count: follows the proposal favoring the task whose gradient
    /// share most exceeds its loss share.
    LargestImbalance,
}

fn default_num_tasks() -> usize {
    2
}

fn default_alpha() -> f64 {
    1.5
}

fn default_gradnorm_learning_rate() -> f64 {
    0.025
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_iter() -> usize {
    10
}

fn default_frank_wolfe_beta() -> f64 {
    0.1
}

fn default_initial_lambda() -> f64 {
    0.5
}

fn default_lambda_min() -> f64 {
    0.1
}

fn default_lambda_max() -> f64 {
    0.9
}

fn default_eta() -> f64 {
    0.1
}

fn default_min_lambda_step() -> f64 {
    0.01
}

fn default_delta_scale() -> f64 {
    2.0
}
