use candle_core::{DType, IndexOp, Module, Result, Tensor};
use candle_nn::{conv2d, embedding, linear, Conv2d, Embedding, Linear};
use tracing::warn;

use super::{
    backbone::{build_backbone, Joiner},
    transformer::{Transformer, TransformerEncoder},
    NestedTensor, SplitVarBuilder,
};
use crate::config::ActConfig;

/// Width of the CVAE latent code, independent of state and action dimensions.
pub const LATENT_DIM: usize = 32;

/// How a forward pass runs. Training feeds the ground-truth chunk to the CVAE encoder and
/// enables dropout, inference uses the zero latent.
#[derive(Debug, Clone, Copy)]
pub enum ForwardMode<'a> {
    Training {
        /// (batch, num_queries, action_dim)
        actions: &'a Tensor,
        /// (batch, num_queries), `1` on padded steps
        is_pad: &'a Tensor,
    },
    Inference,
}

impl ForwardMode<'_> {
    pub fn is_training(&self) -> bool {
        matches!(self, Self::Training { .. })
    }
}

/// 1D sinusoid table of shape (1, n_position, d_hid). Even channels hold the sine and odd
/// channels the cosine of `pos / 10000^(2 * (j / 2) / d_hid)`.
pub fn get_sinusoid_encoding_table(
    n_position: usize,
    d_hid: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let mut table = Vec::with_capacity(n_position * d_hid);
    for pos in 0..n_position {
        for j in 0..d_hid {
            let angle = pos as f64 / 10000f64.powf((2 * (j / 2)) as f64 / d_hid as f64);
            let v = if j % 2 == 0 { angle.sin() } else { angle.cos() };
            table.push(v as f32);
        }
    }
    Tensor::from_vec(table, (1, n_position, d_hid), device)
}

/// Prepend the two never-padded positions (CLS and joint tokens) to an action padding mask.
pub fn cvae_padding_mask(is_pad: &Tensor) -> Result<Tensor> {
    let bs = is_pad.dim(0)?;
    let cls_joint_is_pad = Tensor::zeros((bs, 2), DType::U8, is_pad.device())?;
    Tensor::cat(&[cls_joint_is_pad, is_pad.to_dtype(DType::U8)?], 1)
}

pub struct KlDivergence {
    /// Per-example sum over latent dimensions, averaged over the batch. This is the loss term.
    pub total: Tensor,
    pub dimension_wise: Tensor,
    pub mean: Tensor,
}

/// Diagonal Gaussian posterior over the latent code.
#[derive(Debug, Clone)]
pub struct LatentDistribution {
    pub mu: Tensor,
    pub logvar: Tensor,
}

impl LatentDistribution {
    /// Reparameterized sample `mu + exp(logvar / 2) * eps`.
    pub fn sample(&self) -> Result<Tensor> {
        let std = (&self.logvar / 2.)?.exp()?;
        let eps = std.randn_like(0., 1.)?;
        self.mu.add(&(std * eps)?)
    }

    /// KL divergence against the unit Gaussian. 4D inputs are flattened to (batch, channels).
    pub fn kl_divergence(&self) -> Result<KlDivergence> {
        let batch_size = self.mu.dim(0)?;
        if batch_size == 0 {
            candle_core::bail!("KL divergence needs a non-empty batch");
        }
        let flatten = |t: &Tensor| -> Result<Tensor> {
            if t.rank() == 4 {
                t.flatten_from(1)
            } else {
                Ok(t.clone())
            }
        };
        let mu = flatten(&self.mu)?;
        let logvar = flatten(&self.logvar)?;

        let klds = (((&logvar + 1.)? - mu.sqr()?)? - logvar.exp()?)?.affine(-0.5, 0.)?;
        Ok(KlDivergence {
            total: klds.sum(1)?.mean(0)?,
            dimension_wise: klds.mean(0)?,
            mean: klds.mean(1)?.mean(0)?,
        })
    }
}

pub struct LatentOutput {
    /// Projected latent token fed to the transformer, (batch, hidden_dim).
    pub latent_input: Tensor,
    /// The raw latent code, (batch, LATENT_DIM). Exactly zero outside training.
    pub latent_sample: Tensor,
    /// Present only when the CVAE encoder ran.
    pub distribution: Option<LatentDistribution>,
}

pub struct ModelOutput {
    /// (batch, num_queries, action_dim)
    pub a_hat: Tensor,
    /// (batch, num_queries, 1) padding logits
    pub is_pad_hat: Tensor,
    pub latent: LatentOutput,
}

/// DETR-style conditional VAE: one backbone per camera, a transformer CVAE encoder over
/// (CLS, qpos, action chunk) and a transformer decoder producing `num_queries` actions.
pub struct DetrVae {
    backbones: Vec<Joiner>,
    transformer: Transformer,
    encoder: Option<TransformerEncoder>,
    action_head: Linear,
    is_pad_head: Linear,
    cls_embed: Embedding,
    encoder_action_proj: Linear,
    encoder_joint_proj: Linear,
    latent_proj: Linear,
    pos_table: Tensor,
    input_proj_robot_state: Linear,
    latent_out_proj: Linear,
    additional_pos_embed: Embedding,
    input_proj: Conv2d,
    query_embed: Embedding,
    num_queries: usize,
    state_dim: usize,
    action_dim: usize,
}

impl DetrVae {
    pub fn new(cfg: &ActConfig, vb: SplitVarBuilder) -> Result<Self> {
        if cfg.vq {
            warn!("Vector-quantized latents are not supported, `vq` settings are ignored.");
        }
        let hidden_dim = cfg.hidden_dim;
        let params = vb.params.clone();

        let vb_b = vb.pp("backbones");
        let backbones = (0..cfg.camera_names.len())
            .map(|i| {
                build_backbone(
                    cfg.backbone,
                    cfg.position_embedding,
                    hidden_dim,
                    cfg.return_interm_layers,
                    cfg.dilation,
                    vb_b.pp(i),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let num_channels = match backbones.first() {
            Some(backbone) => backbone.num_channels(),
            None => candle_core::bail!("At least one camera is required"),
        };

        let encoder = if cfg.no_encoder {
            None
        } else {
            Some(TransformerEncoder::new(
                cfg,
                cfg.enc_layers,
                params.pp("encoder"),
            )?)
        };

        Ok(Self {
            backbones,
            transformer: Transformer::new(cfg, params.pp("transformer"))?,
            encoder,
            action_head: linear(hidden_dim, cfg.action_dim, params.pp("action_head"))?,
            is_pad_head: linear(hidden_dim, 1, params.pp("is_pad_head"))?,
            cls_embed: embedding(1, hidden_dim, params.pp("cls_embed"))?,
            encoder_action_proj: linear(
                cfg.action_dim,
                hidden_dim,
                params.pp("encoder_action_proj"),
            )?,
            encoder_joint_proj: linear(
                cfg.state_dim,
                hidden_dim,
                params.pp("encoder_joint_proj"),
            )?,
            latent_proj: linear(hidden_dim, LATENT_DIM * 2, params.pp("latent_proj"))?,
            pos_table: get_sinusoid_encoding_table(2 + cfg.num_queries, hidden_dim, params.device())?
                .to_dtype(params.dtype())?,
            input_proj_robot_state: linear(
                cfg.state_dim,
                hidden_dim,
                params.pp("input_proj_robot_state"),
            )?,
            latent_out_proj: linear(LATENT_DIM, hidden_dim, params.pp("latent_out_proj"))?,
            additional_pos_embed: embedding(2, hidden_dim, params.pp("additional_pos_embed"))?,
            input_proj: conv2d(
                num_channels,
                hidden_dim,
                1,
                Default::default(),
                params.pp("input_proj"),
            )?,
            query_embed: embedding(cfg.num_queries, hidden_dim, params.pp("query_embed"))?,
            num_queries: cfg.num_queries,
            state_dim: cfg.state_dim,
            action_dim: cfg.action_dim,
        })
    }

    pub fn num_cameras(&self) -> usize {
        self.backbones.len()
    }

    /// Obtain the latent code and its embedding. The CVAE encoder only runs in training mode;
    /// otherwise (or without an encoder) the latent is the zero vector.
    pub fn encode(&self, qpos: &Tensor, mode: &ForwardMode) -> Result<LatentOutput> {
        let (bs, state_dim) = qpos.dims2()?;
        if state_dim != self.state_dim {
            candle_core::bail!("Expected qpos with {} dims, got {state_dim}", self.state_dim);
        }

        let (latent_sample, distribution) = match (mode, &self.encoder) {
            (ForwardMode::Training { actions, is_pad }, Some(encoder)) => {
                let (a_bs, seq, action_dim) = actions.dims3()?;
                if a_bs != bs || is_pad.dims() != [bs, seq] {
                    candle_core::bail!(
                        "Batch mismatch: qpos {:?}, actions {:?}, is_pad {:?}",
                        qpos.dims(),
                        actions.dims(),
                        is_pad.dims()
                    );
                }
                if seq != self.num_queries {
                    candle_core::bail!(
                        "Action sequence length {seq} does not match num_queries {}",
                        self.num_queries
                    );
                }
                if action_dim != self.action_dim {
                    candle_core::bail!(
                        "Expected actions with {} dims, got {action_dim}",
                        self.action_dim
                    );
                }

                let action_embed = actions.apply(&self.encoder_action_proj)?;
                let qpos_embed = qpos.apply(&self.encoder_joint_proj)?.unsqueeze(1)?;
                let cls_embed = self
                    .cls_embed
                    .embeddings()
                    .unsqueeze(0)?
                    .repeat((bs, 1, 1))?;
                let encoder_input = Tensor::cat(&[cls_embed, qpos_embed, action_embed], 1)?;
                let is_pad = cvae_padding_mask(is_pad)?;

                let encoder_output =
                    encoder.forward(&encoder_input, Some(&is_pad), Some(&self.pos_table), true)?;
                // [CLS] output only
                let latent_info = encoder_output.i((.., 0))?.apply(&self.latent_proj)?;
                let distribution = LatentDistribution {
                    mu: latent_info.narrow(1, 0, LATENT_DIM)?,
                    logvar: latent_info.narrow(1, LATENT_DIM, LATENT_DIM)?,
                };
                (distribution.sample()?, Some(distribution))
            }
            _ => (
                Tensor::zeros((bs, LATENT_DIM), qpos.dtype(), qpos.device())?,
                None,
            ),
        };

        Ok(LatentOutput {
            latent_input: latent_sample.apply(&self.latent_out_proj)?,
            latent_sample,
            distribution,
        })
    }

    /// - `qpos`: (batch, state_dim)
    /// - `image`: (batch, num_cameras, 3, h, w), already normalized
    pub fn forward(&self, qpos: &Tensor, image: &Tensor, mode: &ForwardMode) -> Result<ModelOutput> {
        let (bs, num_cams, _, _, _) = image.dims5()?;
        if num_cams != self.backbones.len() {
            candle_core::bail!(
                "Expected {} cameras, got {num_cams}",
                self.backbones.len()
            );
        }
        if qpos.dim(0)? != bs {
            candle_core::bail!(
                "Batch mismatch: qpos {:?}, image {:?}",
                qpos.dims(),
                image.dims()
            );
        }
        let train = mode.is_training();
        let latent = self.encode(qpos, mode)?;

        let mut all_cam_features = Vec::with_capacity(num_cams);
        let mut all_cam_pos = Vec::with_capacity(num_cams);
        for (cam_id, backbone) in self.backbones.iter().enumerate() {
            let cam = image.i((.., cam_id))?.contiguous()?;
            let (mut features, mut pos) = backbone.forward(&NestedTensor::new(cam, None)?)?;
            // Only the deepest feature map is projected.
            let (Some(features), Some(pos)) = (features.pop(), pos.pop()) else {
                candle_core::bail!("Backbone returned no feature maps");
            };
            all_cam_features.push(features.tensors().apply(&self.input_proj)?);
            all_cam_pos.push(pos);
        }
        let proprio_input = qpos.apply(&self.input_proj_robot_state)?;
        // Fold the camera axis into the width axis.
        let src = Tensor::cat(&all_cam_features, 3)?;
        let pos = Tensor::cat(&all_cam_pos, 3)?;

        let hs = self
            .transformer
            .forward(
                &src,
                None,
                self.query_embed.embeddings(),
                &pos,
                &latent.latent_input,
                &proprio_input,
                self.additional_pos_embed.embeddings(),
                train,
            )?
            .i(0)?;

        Ok(ModelOutput {
            a_hat: self.action_head.forward(&hs)?,
            is_pad_hat: self.is_pad_head.forward(&hs)?,
            latent,
        })
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, IndexOp, Tensor};

    use super::*;

    #[test]
    fn sinusoid_table_values() {
        let table = get_sinusoid_encoding_table(4, 6, &Device::Cpu).unwrap();
        assert_eq!(table.dims(), &[1, 4, 6]);
        let row0 = table.i((0, 0)).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(row0, vec![0., 1., 0., 1., 0., 1.]);
        let got = table.i((0, 3, 2)).unwrap().to_scalar::<f32>().unwrap();
        let want = (3f64 / 10000f64.powf(2. / 6.)).sin() as f32;
        assert!((got - want).abs() < 1e-6);
    }

    #[test]
    fn kl_of_standard_normal_is_zero() {
        let dist = LatentDistribution {
            mu: Tensor::zeros((3, LATENT_DIM), DType::F32, &Device::Cpu).unwrap(),
            logvar: Tensor::zeros((3, LATENT_DIM), DType::F32, &Device::Cpu).unwrap(),
        };
        let kl = dist.kl_divergence().unwrap();
        assert_eq!(kl.total.to_scalar::<f32>().unwrap(), 0.);
        assert_eq!(kl.mean.to_scalar::<f32>().unwrap(), 0.);
        assert_eq!(kl.dimension_wise.dims(), &[LATENT_DIM]);
    }

    #[test]
    fn kl_is_non_negative() {
        let dist = LatentDistribution {
            mu: Tensor::randn(0f32, 2f32, (4, 8), &Device::Cpu).unwrap(),
            logvar: Tensor::randn(0f32, 1f32, (4, 8), &Device::Cpu).unwrap(),
        };
        let kl = dist.kl_divergence().unwrap();
        let total = kl.total.to_scalar::<f32>().unwrap();
        assert!(total.is_finite() && total >= 0.);
        // total is the per-example sum, mean the per-example average.
        let mean = kl.mean.to_scalar::<f32>().unwrap();
        assert!((total / 8. - mean).abs() < 1e-4);
    }

    #[test]
    fn kl_known_value_and_4d_inputs() {
        // mu = 1, logvar = 0 gives 0.5 per dimension.
        let dist = LatentDistribution {
            mu: Tensor::ones((2, 4, 1, 1), DType::F32, &Device::Cpu).unwrap(),
            logvar: Tensor::zeros((2, 4, 1, 1), DType::F32, &Device::Cpu).unwrap(),
        };
        let kl = dist.kl_divergence().unwrap();
        assert!((kl.total.to_scalar::<f32>().unwrap() - 2.).abs() < 1e-6);
        assert_eq!(kl.dimension_wise.to_vec1::<f32>().unwrap(), vec![0.5; 4]);
    }

    #[test]
    fn kl_rejects_empty_batch() {
        let dist = LatentDistribution {
            mu: Tensor::zeros((0, LATENT_DIM), DType::F32, &Device::Cpu).unwrap(),
            logvar: Tensor::zeros((0, LATENT_DIM), DType::F32, &Device::Cpu).unwrap(),
        };
        assert!(dist.kl_divergence().is_err());
    }

    #[test]
    fn sample_with_tiny_variance_is_mu() {
        let mu = Tensor::new(&[[1f32, -2., 3.]], &Device::Cpu).unwrap();
        let dist = LatentDistribution {
            mu: mu.clone(),
            logvar: Tensor::full(-60f32, (1, 3), &Device::Cpu).unwrap(),
        };
        let sample = dist.sample().unwrap().to_vec2::<f32>().unwrap();
        for (s, m) in sample[0].iter().zip([1f32, -2., 3.]) {
            assert!((s - m).abs() < 1e-6);
        }
    }

    #[test]
    fn cls_and_joint_are_never_padded() {
        let is_pad = Tensor::ones((2, 3), DType::U8, &Device::Cpu).unwrap();
        let mask = cvae_padding_mask(&is_pad).unwrap();
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![vec![0, 0, 1, 1, 1], vec![0, 0, 1, 1, 1]]
        );
    }
}
