use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{linear, AdamW, Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::Parser;
use task_balancing::{rmse, AdaptiveCombiner, BalancingConfig, CrossEntropyLoss};

const FEATURES: usize = 16;
const HIDDEN: usize = 32;
const CLASSES: usize = 2;
const LABEL_SMOOTHING: f32 = 0.1;

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("balancing run failed: {:#}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Drive the adaptive task weighting controller on a synthetic two-task model",
    long_about = None
)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Balancing config (TOML or JSON); defaults are used when omitted"
    )]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 200, help = "Number of training steps")]
    steps: usize,

    #[arg(long, default_value_t = 32, help = "Samples per synthetic batch")]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate of the model optimizer")]
    learning_rate: f64,

    #[arg(long, default_value_t = 10, help = "Print a summary every N steps")]
    log_every: usize,

    #[arg(long, help = "Recompute-free mode: reuse GradNorm's gradient norms for lambda")]
    share_gradient_norms: bool,

    #[arg(
        long,
        value_name = "PATH",
        help = "Write the final controller state as JSON"
    )]
    state_out: Option<PathBuf>,
}

/// Shared trunk feeding a diagnosis head and a cognitive-score head.
struct TwoHeadModel {
    trunk: Linear,
    trunk_out: Linear,
    classifier: Linear,
    regressor: Linear,
    shared: Vec<Var>,
    heads: Vec<Var>,
}

impl TwoHeadModel {
    fn new(device: &Device) -> Result<Self> {
        let shared_map = VarMap::new();
        let heads_map = VarMap::new();
        let shared_vb = VarBuilder::from_varmap(&shared_map, DType::F32, device);
        let heads_vb = VarBuilder::from_varmap(&heads_map, DType::F32, device);

        let trunk = linear(FEATURES, HIDDEN, shared_vb.pp("trunk.0"))?;
        let trunk_out = linear(HIDDEN, HIDDEN, shared_vb.pp("trunk.1"))?;
        let classifier = linear(HIDDEN, CLASSES, heads_vb.pp("classifier"))?;
        let regressor = linear(HIDDEN, 1, heads_vb.pp("regressor"))?;

        Ok(Self {
            trunk,
            trunk_out,
            classifier,
            regressor,
            shared: shared_map.all_vars(),
            heads: heads_map.all_vars(),
        })
    }

    fn forward(&self, inputs: &Tensor) -> Result<(Tensor, Tensor)> {
        let hidden = self.trunk.forward(inputs)?.relu()?;
        let features = self.trunk_out.forward(&hidden)?.relu()?;
        let logits = self.classifier.forward(&features)?;
        let scores = self.regressor.forward(&features)?.squeeze(1)?;
        Ok((logits, scores))
    }

    fn all_vars(&self) -> Vec<Var> {
        let mut vars = self.shared.clone();
        vars.extend(self.heads.iter().cloned());
        vars
    }
}

struct SyntheticBatch {
    inputs: Tensor,
    labels: Tensor,
    scores: Tensor,
}

/// Labels follow the sign of the feature sum; scores sit on a 0-30 scale.
fn synthetic_batch(batch_size: usize, device: &Device) -> Result<SyntheticBatch> {
    let inputs = Tensor::randn(0f32, 1f32, (batch_size, FEATURES), device)?;
    let signal = inputs.sum(1)?.affine(1.0 / (FEATURES as f64).sqrt(), 0.0)?;
    let labels = signal
        .ge(&signal.zeros_like()?)?
        .to_dtype(DType::U32)?;
    let scores = signal.tanh()?.affine(6.0, 24.0)?;
    Ok(SyntheticBatch {
        inputs,
        labels,
        scores,
    })
}

fn load_config(args: &Args) -> Result<BalancingConfig> {
    let mut config = match &args.config {
        Some(path) => BalancingConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => BalancingConfig::default(),
    };
    if args.share_gradient_norms {
        config.combiner.share_gradient_norms = true;
    }
    config.validate()?;
    if config.num_tasks != 2 {
        anyhow::bail!(
            "the synthetic model has two task heads, config asks for {}",
            config.num_tasks
        );
    }
    Ok(config)
}

fn run() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let device = Device::Cpu;

    let model = TwoHeadModel::new(&device)?;
    let mut combiner = config.build(&device)?;
    let mut optimizer = AdamW::new(
        model.all_vars(),
        ParamsAdamW {
            lr: args.learning_rate,
            ..Default::default()
        },
    )?;
    let classification_loss = CrossEntropyLoss::new().with_label_smoothing(LABEL_SMOOTHING)?;
    let log_every = args.log_every.max(1);

    log::info!(
        "starting run: steps={} batch_size={} shared_params={} direction={:?}",
        args.steps,
        args.batch_size,
        model.shared.len(),
        config.combiner.direction
    );

    for step in 1..=args.steps {
        let batch = synthetic_batch(args.batch_size, &device)?;
        let (logits, predicted) = model.forward(&batch.inputs)?;
        let losses = vec![
            classification_loss.compute(&logits, &batch.labels)?,
            rmse(&predicted, &batch.scores)?,
        ];

        let weights = combiner.update_weights(&losses, &model.shared)?;
        let total = weights.combine(&losses)?;
        optimizer.backward_step(&total)?;

        if step % log_every == 0 || step == args.steps {
            report(step, &losses, &total, &combiner)?;
        }
    }

    if let Some(path) = &args.state_out {
        let state = combiner.state()?;
        let encoded = serde_json::to_string_pretty(&state)?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write state to {}", path.display()))?;
        println!("controller state written to {}", path.display());
    }

    Ok(())
}

fn report(
    step: usize,
    losses: &[Tensor],
    total: &Tensor,
    combiner: &AdaptiveCombiner,
) -> Result<()> {
    let weights = combiner.weights().to_vec()?;
    let diagnostics = combiner.diagnostics();
    let norms = combiner.last_gradient_norms().unwrap_or(&[]);
    println!(
        "step={} cls_loss={:.4} reg_loss={:.4} total={:.4} w_cls={:.3} w_reg={:.3} lambda={:.3} grad_diff={:.4} grad_norms={:?}",
        step,
        losses[0].to_vec0::<f32>()?,
        losses[1].to_vec0::<f32>()?,
        total.to_vec0::<f32>()?,
        weights[0],
        weights[1],
        diagnostics.lambda,
        diagnostics.gradient_difference,
        norms
    );
    Ok(())
}
