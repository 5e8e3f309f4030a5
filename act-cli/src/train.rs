use std::path::PathBuf;

use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::{rngs::StdRng, SeedableRng};
use tqdm::Iter;
use tracing::info;

use act_core::{ActConfig, ActDataset, ActPolicy};

use crate::util::{best_device, load_backbone_state_dict, seed_device};

#[derive(clap::Args)]
pub struct TrainArgs {
    /// Directory of `*.safetensors` episodes.
    #[arg(long)]
    dataset_dir: PathBuf,

    /// Where `policy.safetensors`, `norm_stats.json` and `config.json` are written.
    #[arg(long)]
    output_dir: PathBuf,

    /// JSON model configuration. Missing fields take their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2000)]
    epochs: usize,

    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Integer seed for data shuffling and, on accelerators, weight initialization.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Use CPU only
    #[arg(long)]
    cpu: bool,

    /// Local safetensors file with a torchvision-layout ResNet state dict.
    #[arg(long, conflicts_with = "backbone_model_id")]
    backbone_weights: Option<PathBuf>,

    /// Hugging Face Hub model providing `model.safetensors` ResNet weights.
    #[arg(long)]
    backbone_model_id: Option<String>,
}

pub fn run(args: TrainArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ActConfig::from_file(path)?,
        None => ActConfig::default(),
    };
    info!("Model config: {config:?}");

    let device = best_device(args.cpu)?;
    seed_device(&device, args.seed)?;

    let dataset = ActDataset::load(&args.dataset_dir, &config, None)?;
    info!(
        "{} training samples, {} batches per epoch",
        dataset.len(),
        dataset.num_batches(args.batch_size)
    );

    let policy = ActPolicy::new(&config, &device)?;
    if let Some(state_dict) = load_backbone_state_dict(
        args.backbone_weights.as_deref(),
        args.backbone_model_id.as_deref(),
    )? {
        policy.load_backbone_weights(&state_dict)?;
    }

    let groups = policy.param_groups()?;
    let mut opt = AdamW::new(
        groups.rest,
        ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )?;
    let mut opt_backbone = AdamW::new(
        groups.backbone,
        ParamsAdamW {
            lr: config.lr_backbone,
            weight_decay: config.weight_decay,
            ..Default::default()
        },
    )?;

    std::fs::create_dir_all(&args.output_dir)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    for epoch in 0..args.epochs {
        let (mut loss_sum, mut l1_sum, mut kl_sum) = (0f64, 0f64, 0f64);
        let mut n_batches = 0usize;
        for batch in dataset.batches(args.batch_size, Some(&mut rng)).tqdm() {
            let batch = batch?.to_device(&device)?;
            let terms =
                policy.compute_loss(&batch.qpos, &batch.image, &batch.actions, &batch.is_pad)?;
            // One gradient store feeds both parameter groups.
            let grads = terms.loss.backward()?;
            opt.step(&grads)?;
            opt_backbone.step(&grads)?;

            loss_sum += terms.loss.to_scalar::<f32>()? as f64;
            l1_sum += terms.l1.to_scalar::<f32>()? as f64;
            kl_sum += terms.kl.to_scalar::<f32>()? as f64;
            n_batches += 1;
        }
        let n = n_batches.max(1) as f64;
        info!(
            "Epoch {epoch}: loss {:.5}, l1 {:.5}, kl {:.5}",
            loss_sum / n,
            l1_sum / n,
            kl_sum / n
        );
    }

    policy.save(args.output_dir.join("policy.safetensors"))?;
    dataset
        .norm_stats()
        .to_file(args.output_dir.join("norm_stats.json"))?;
    config.to_file(args.output_dir.join("config.json"))?;
    info!("Saved policy to {}", args.output_dir.display());
    Ok(())
}
