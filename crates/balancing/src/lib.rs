//! Adaptive loss weighting for two-headed (or wider) multi-task training.
//!
//! The training loop computes its task losses, asks an [`AdaptiveCombiner`]
//! for weights, and backpropagates `Σ w_i · loss_i` itself. The controller
//! only measures gradients on the shared parameters for its own bookkeeping;
//! it never touches the caller's optimizer or gradient buffers.

pub mod combiner;
pub mod config;
pub mod errors;
pub mod frank_wolfe;
pub mod gradnorm;
pub mod loss;
pub mod objective;
pub mod optimizer;
pub mod simplex;

pub use combiner::{AdaptiveCombiner, CombinerState, Diagnostics};
pub use config::{
    BalanceLoss, BalancingConfig, CombinerConfig, DirectionRule, FrankWolfeConfig, GradNormConfig,
};
pub use errors::{BalancingError, Result};
pub use frank_wolfe::{FrankWolfeBalancer, FrankWolfeState};
pub use gradnorm::{Baseline, GradNormState, GradientNormBalancer};
pub use loss::{rmse, CrossEntropyLoss};
pub use objective::{loss_values, shared_gradient_norms, TaskObjective};
pub use optimizer::{AdamSettings, TaskWeightSnapshot, TaskWeightState};
pub use simplex::TaskWeights;
