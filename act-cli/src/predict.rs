use std::path::PathBuf;

use candle_core::IndexOp;
use tracing::info;

use act_core::{ActConfig, ActPolicy, Episode, NormStats};

use crate::util::best_device;

#[derive(clap::Args)]
pub struct PredictArgs {
    /// Output directory of `act train`.
    #[arg(long)]
    weights_dir: PathBuf,

    /// Episode to read the observation from.
    #[arg(long)]
    episode: PathBuf,

    #[arg(long, default_value_t = 0)]
    timestep: usize,

    /// Use CPU only
    #[arg(long)]
    cpu: bool,
}

/// Prints the de-normalized (num_queries, action_dim) chunk as JSON.
pub fn run(args: PredictArgs) -> anyhow::Result<()> {
    let config = ActConfig::from_file(args.weights_dir.join("config.json"))?;
    let stats = NormStats::from_file(args.weights_dir.join("norm_stats.json"))?;
    let device = best_device(args.cpu)?;

    let policy = ActPolicy::new(&config, &device)?;
    policy.load(args.weights_dir.join("policy.safetensors"))?;

    let episode = Episode::load(&args.episode, &config.camera_names)?;
    let t = args.timestep;
    if t >= episode.len() {
        anyhow::bail!(
            "Timestep {t} is out of range for an episode of {} steps",
            episode.len()
        );
    }
    info!("Predicting step {t} of {}", args.episode.display());

    let qpos = stats
        .normalize_qpos(&episode.qpos.i(t..t + 1)?)?
        .to_device(&device)?;
    let image = episode.images.i(t..t + 1)?.to_device(&device)?;
    let actions = policy.predict(&qpos, &image)?;
    let actions = stats
        .denormalize_actions(&actions)?
        .squeeze(0)?
        .to_vec2::<f32>()?;
    println!("{}", serde_json::to_string(&actions)?);
    Ok(())
}
