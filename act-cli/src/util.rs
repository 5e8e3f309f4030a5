use std::{collections::HashMap, path::Path};

use anyhow::Context;
use candle_core::{Device, Tensor};
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};
use tracing::{info, warn};

const BACKBONE_WEIGHTS_FILE: &str = "model.safetensors";

/// Gets the best device, cpu, cuda if compiled with CUDA, or Metal
pub(crate) fn best_device(force_cpu: bool) -> candle_core::Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    #[cfg(not(feature = "metal"))]
    {
        Device::cuda_if_available(0)
    }
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0)
    }
}

/// Seed the accelerator RNG. The CPU generator cannot be seeded through candle.
pub(crate) fn seed_device(device: &Device, seed: u64) -> candle_core::Result<()> {
    match device {
        Device::Cpu => {
            warn!("Cannot seed the CPU tensor RNG, only data shuffling is seeded.");
            Ok(())
        }
        _ => device.set_seed(seed),
    }
}

/// Pretrained ResNet weights from a local safetensors file or a Hugging Face Hub model
/// (e.g. `timm/resnet18.tv_in1k`).
pub(crate) fn load_backbone_state_dict(
    path: Option<&Path>,
    model_id: Option<&str>,
) -> anyhow::Result<Option<HashMap<String, Tensor>>> {
    let file = match (path, model_id) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(model_id)) => {
            info!("Fetching `{BACKBONE_WEIGHTS_FILE}` from `{model_id}`");
            let api = ApiBuilder::new().with_progress(true).build()?;
            let repo = api.repo(Repo::with_revision(
                model_id.to_string(),
                RepoType::Model,
                "main".to_string(),
            ));
            repo.get(BACKBONE_WEIGHTS_FILE)
                .with_context(|| format!("fetching backbone weights from `{model_id}`"))?
        }
        (None, None) => {
            warn!("No pretrained backbone given, training the backbone from scratch.");
            return Ok(None);
        }
    };
    let state_dict = candle_core::safetensors::load(&file, &Device::Cpu)
        .with_context(|| format!("reading {}", file.display()))?;
    Ok(Some(state_dict))
}
