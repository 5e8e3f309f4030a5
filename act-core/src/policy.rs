use std::{collections::HashMap, path::Path};

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor, Var, D};
use candle_nn::{VarBuilder, VarMap};
use tracing::{debug, info};

use act_vision::{ImageTransform, Normalize};

use crate::{
    config::ActConfig,
    models::{
        detr_vae::{DetrVae, ForwardMode, ModelOutput},
        SplitVarBuilder,
    },
};

/// Terms of the training objective.
pub struct LossTerms {
    /// Mean absolute error over the unpadded part of the chunk.
    pub l1: Tensor,
    pub kl: Tensor,
    /// `l1 + kl_weight * kl`
    pub loss: Tensor,
}

pub enum PolicyOutput {
    Loss(LossTerms),
    /// (batch, num_queries, action_dim)
    Actions(Tensor),
}

/// Trainable variables split by optimizer group. Frozen buffers are in neither.
pub struct ParamGroups {
    pub backbone: Vec<Var>,
    pub rest: Vec<Var>,
}

/// The ACT policy: ImageNet normalization in front of the DETR-VAE model, plus the loss.
pub struct ActPolicy {
    model: DetrVae,
    params: VarMap,
    buffers: VarMap,
    normalize: Normalize,
    config: ActConfig,
    device: Device,
}

impl ActPolicy {
    pub fn new(config: &ActConfig, device: &Device) -> anyhow::Result<Self> {
        config.validate()?;
        let params = VarMap::new();
        let buffers = VarMap::new();
        let vb = SplitVarBuilder {
            params: VarBuilder::from_varmap(&params, DType::F32, device),
            buffers: VarBuilder::from_varmap(&buffers, DType::F32, device),
        };
        let model = DetrVae::new(config, vb)?;

        let n_parameters: usize = params.all_vars().iter().map(|v| v.elem_count()).sum();
        info!(
            "Number of parameters: {:.2}M ({} cameras, backbone {})",
            n_parameters as f64 / 1e6,
            model.num_cameras(),
            config.backbone
        );

        Ok(Self {
            model,
            params,
            buffers,
            normalize: Normalize::imagenet(),
            config: config.clone(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ActConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// - `qpos`: (batch, state_dim), normalized
    /// - `image`: (batch, num_cameras, 3, h, w) with values in `[0, 1]`
    pub fn forward(&self, qpos: &Tensor, image: &Tensor, mode: ForwardMode) -> Result<PolicyOutput> {
        let image = self.normalize.map(image, &self.device)?;
        let ModelOutput { a_hat, latent, .. } = self.model.forward(qpos, &image, &mode)?;

        match mode {
            ForwardMode::Training { actions, is_pad } => {
                if actions.dims() != a_hat.dims() {
                    candle_core::bail!(
                        "Expected actions of shape {:?}, got {:?}",
                        a_hat.dims(),
                        actions.dims()
                    );
                }
                let not_pad = is_pad
                    .to_dtype(a_hat.dtype())?
                    .affine(-1., 1.)?
                    .unsqueeze(D::Minus1)?;
                let all_l1 = (actions - &a_hat)?.abs()?;
                let l1 = all_l1.broadcast_mul(&not_pad)?.mean_all()?;
                let kl = match &latent.distribution {
                    Some(dist) => dist.kl_divergence()?.total,
                    None => Tensor::zeros((), l1.dtype(), l1.device())?,
                };
                let loss = (&l1 + kl.affine(self.config.kl_weight, 0.)?)?;
                Ok(PolicyOutput::Loss(LossTerms { l1, kl, loss }))
            }
            ForwardMode::Inference => Ok(PolicyOutput::Actions(a_hat)),
        }
    }

    pub fn compute_loss(
        &self,
        qpos: &Tensor,
        image: &Tensor,
        actions: &Tensor,
        is_pad: &Tensor,
    ) -> Result<LossTerms> {
        match self.forward(qpos, image, ForwardMode::Training { actions, is_pad })? {
            PolicyOutput::Loss(terms) => Ok(terms),
            PolicyOutput::Actions(_) => candle_core::bail!("Training forward returned actions"),
        }
    }

    pub fn predict(&self, qpos: &Tensor, image: &Tensor) -> Result<Tensor> {
        match self.forward(qpos, image, ForwardMode::Inference)? {
            PolicyOutput::Actions(actions) => Ok(actions),
            PolicyOutput::Loss(_) => candle_core::bail!("Inference forward returned a loss"),
        }
    }

    /// Backbone parameters get their own learning rate.
    pub fn param_groups(&self) -> anyhow::Result<ParamGroups> {
        let data = self
            .params
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut groups = ParamGroups {
            backbone: Vec::new(),
            rest: Vec::new(),
        };
        for (name, var) in data.iter() {
            if name.starts_with("backbones.") {
                groups.backbone.push(var.clone());
            } else {
                groups.rest.push(var.clone());
            }
        }
        Ok(groups)
    }

    /// Copy a torchvision-layout ResNet state dict into every camera's backbone. The
    /// classifier head and `num_batches_tracked` counters are skipped. Every name is resolved
    /// before anything is written, so an unknown tensor leaves the policy untouched. Returns how
    /// many tensors were assigned.
    pub fn load_backbone_weights(&self, state_dict: &HashMap<String, Tensor>) -> anyhow::Result<usize> {
        let mut targets = Vec::new();
        for cam in 0..self.config.camera_names.len() {
            for (key, value) in state_dict {
                if key.starts_with("fc.") || key.ends_with("num_batches_tracked") {
                    continue;
                }
                let name = format!("backbones.{cam}.body.{key}");
                match self.find_var(&name)? {
                    Some(var) => targets.push((name, var, value)),
                    None => anyhow::bail!(
                        "Pretrained tensor `{key}` has no counterpart in a {} backbone",
                        self.config.backbone
                    ),
                }
            }
        }
        for (name, var, value) in &targets {
            set_var(var, value).with_context(|| format!("assigning `{name}`"))?;
        }
        info!("Loaded {} pretrained backbone tensors.", targets.len());
        Ok(targets.len())
    }

    /// Write every parameter and buffer to a single safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut tensors = HashMap::new();
        for varmap in [&self.params, &self.buffers] {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for (name, var) in data.iter() {
                tensors.insert(name.clone(), var.as_tensor().clone());
            }
        }
        candle_core::safetensors::save(&tensors, path.as_ref())
            .with_context(|| format!("saving weights to {}", path.as_ref().display()))?;
        debug!("Saved {} tensors to {}", tensors.len(), path.as_ref().display());
        Ok(())
    }

    /// Load weights written by [`ActPolicy::save`]. Every variable of this policy must be present.
    pub fn load(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let tensors = candle_core::safetensors::load(path.as_ref(), &self.device)
            .with_context(|| format!("loading weights from {}", path.as_ref().display()))?;
        for varmap in [&self.params, &self.buffers] {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            for (name, var) in data.iter() {
                let value = tensors
                    .get(name)
                    .with_context(|| format!("missing tensor `{name}`"))?;
                set_var(var, value)?;
            }
        }
        Ok(())
    }

    /// Look `name` up in either var map.
    fn find_var(&self, name: &str) -> anyhow::Result<Option<Var>> {
        for varmap in [&self.params, &self.buffers] {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            if let Some(var) = data.get(name) {
                return Ok(Some(var.clone()));
            }
        }
        Ok(None)
    }
}

fn set_var(var: &Var, value: &Tensor) -> Result<()> {
    var.set(&value.to_dtype(var.dtype())?.to_device(var.device())?)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use candle_core::{DType, Device, Tensor};

    use super::ActPolicy;
    use crate::config::ActConfig;

    fn tiny() -> ActConfig {
        ActConfig {
            hidden_dim: 16,
            nheads: 2,
            dim_feedforward: 32,
            enc_layers: 1,
            dec_layers: 2,
            num_queries: 3,
            state_dim: 2,
            action_dim: 2,
            ..Default::default()
        }
    }

    #[test]
    fn buffers_are_not_trainable() {
        let policy = ActPolicy::new(&tiny(), &Device::Cpu).unwrap();
        let groups = policy.param_groups().unwrap();
        assert!(!groups.backbone.is_empty());
        assert!(!groups.rest.is_empty());
        let n_groups = groups.backbone.len() + groups.rest.len();
        assert_eq!(n_groups, policy.params.all_vars().len());
        let buffers = policy.buffers.data().lock().unwrap();
        assert!(buffers.keys().all(|k| k.starts_with("backbones.")));
        assert!(buffers.contains_key("backbones.0.body.bn1.running_mean"));
    }

    #[test]
    fn pretrained_weights_are_copied() {
        let policy = ActPolicy::new(&tiny(), &Device::Cpu).unwrap();
        let mut state_dict = HashMap::new();
        state_dict.insert(
            "bn1.running_var".to_string(),
            Tensor::full(4f64, 64, &Device::Cpu).unwrap(),
        );
        state_dict.insert(
            "conv1.weight".to_string(),
            Tensor::zeros((64, 3, 7, 7), DType::F32, &Device::Cpu).unwrap(),
        );
        state_dict.insert(
            "fc.weight".to_string(),
            Tensor::zeros((1000, 512), DType::F32, &Device::Cpu).unwrap(),
        );
        state_dict.insert(
            "bn1.num_batches_tracked".to_string(),
            Tensor::zeros((), DType::I64, &Device::Cpu).unwrap(),
        );
        assert_eq!(policy.load_backbone_weights(&state_dict).unwrap(), 2);

        let buffers = policy.buffers.data().lock().unwrap();
        let rv = buffers["backbones.0.body.bn1.running_var"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert!(rv.iter().all(|v| *v == 4.));
    }

    #[test]
    fn unknown_pretrained_tensor_is_an_error() {
        let policy = ActPolicy::new(&tiny(), &Device::Cpu).unwrap();
        let mut state_dict = HashMap::new();
        state_dict.insert(
            "layer1.0.conv3.weight".to_string(),
            Tensor::zeros((256, 64, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(policy.load_backbone_weights(&state_dict).is_err());
    }

    #[test]
    fn failed_load_leaves_backbone_untouched() {
        let policy = ActPolicy::new(&tiny(), &Device::Cpu).unwrap();
        let mut state_dict = HashMap::new();
        state_dict.insert(
            "bn1.running_var".to_string(),
            Tensor::full(4f32, 64, &Device::Cpu).unwrap(),
        );
        state_dict.insert(
            "layer1.0.conv3.weight".to_string(),
            Tensor::zeros((256, 64, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(policy.load_backbone_weights(&state_dict).is_err());

        let buffers = policy.buffers.data().lock().unwrap();
        let rv = buffers["backbones.0.body.bn1.running_var"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert!(rv.iter().all(|v| *v == 1.));
    }
}
