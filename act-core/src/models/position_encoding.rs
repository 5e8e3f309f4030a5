use std::f64::consts::PI;

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{embedding, Embedding, VarBuilder};

use super::NestedTensor;
use crate::config::PositionEmbeddingType;

// https://github.com/facebookresearch/detr/blob/main/models/position_encoding.py

/// Fixed 2D sine/cosine embedding, normalized to `[0, 2π]` over each image.
#[derive(Debug, Clone)]
pub struct PositionEmbeddingSine {
    num_pos_feats: usize,
    temperature: f64,
    normalize: bool,
    scale: f64,
}

impl PositionEmbeddingSine {
    pub fn new(num_pos_feats: usize, temperature: f64, normalize: bool) -> Self {
        Self {
            num_pos_feats,
            temperature,
            normalize,
            scale: 2. * PI,
        }
    }

    /// Returns (b, 2 * num_pos_feats, h, w) where `b` is the mask batch, or 1 without a mask.
    pub fn forward(&self, tensor_list: &NestedTensor) -> Result<Tensor> {
        let x = tensor_list.tensors();
        let (_, _, h, w) = x.dims4()?;
        let not_mask = match tensor_list.mask() {
            Some(mask) => mask.to_dtype(DType::F32)?.affine(-1., 1.)?,
            None => Tensor::ones((1, h, w), DType::F32, x.device())?,
        };
        let mut y_embed = not_mask.cumsum(1)?;
        let mut x_embed = not_mask.cumsum(2)?;
        if self.normalize {
            let eps = 1e-6;
            y_embed = y_embed
                .broadcast_div(&(y_embed.narrow(1, h - 1, 1)? + eps)?)?
                .affine(self.scale, 0.)?;
            x_embed = x_embed
                .broadcast_div(&(x_embed.narrow(2, w - 1, 1)? + eps)?)?
                .affine(self.scale, 0.)?;
        }

        // Channels 2i and 2i + 1 share the frequency temperature^(2i / num_pos_feats).
        let half = self.num_pos_feats / 2;
        let dim_t = (0..half)
            .map(|i| {
                self.temperature
                    .powf(2. * i as f64 / self.num_pos_feats as f64) as f32
            })
            .collect::<Vec<_>>();
        let dim_t = Tensor::from_vec(dim_t, (1, 1, 1, half), x.device())?;

        let interleave = |embed: &Tensor| -> Result<Tensor> {
            let pos = embed.unsqueeze(D::Minus1)?.broadcast_div(&dim_t)?;
            Tensor::stack(&[pos.sin()?, pos.cos()?], 4)?.flatten_from(3)
        };
        let pos_y = interleave(&y_embed)?;
        let pos_x = interleave(&x_embed)?;
        Tensor::cat(&[pos_y, pos_x], 3)?
            .permute((0, 3, 1, 2))?
            .contiguous()
    }
}

/// Absolute embedding learned per row and per column.
#[derive(Debug, Clone)]
pub struct PositionEmbeddingLearned {
    row_embed: Embedding,
    col_embed: Embedding,
}

impl PositionEmbeddingLearned {
    pub const MAX_SIDE: usize = 50;

    pub fn new(num_pos_feats: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            row_embed: embedding(Self::MAX_SIDE, num_pos_feats, vb.pp("row_embed"))?,
            col_embed: embedding(Self::MAX_SIDE, num_pos_feats, vb.pp("col_embed"))?,
        })
    }

    pub fn forward(&self, tensor_list: &NestedTensor) -> Result<Tensor> {
        let x = tensor_list.tensors();
        let (b, _, h, w) = x.dims4()?;
        if h > Self::MAX_SIDE || w > Self::MAX_SIDE {
            candle_core::bail!(
                "Learned position embedding supports at most {0}x{0} feature maps, got {h}x{w}",
                Self::MAX_SIDE
            );
        }
        let dev = self.col_embed.embeddings().device();
        let i = Tensor::arange(0u32, w as u32, dev)?;
        let j = Tensor::arange(0u32, h as u32, dev)?;
        let x_emb = self.col_embed.forward(&i)?;
        let y_emb = self.row_embed.forward(&j)?;
        let pos = Tensor::cat(
            &[
                x_emb.unsqueeze(0)?.repeat((h, 1, 1))?,
                y_emb.unsqueeze(1)?.repeat((1, w, 1))?,
            ],
            D::Minus1,
        )?;
        pos.permute((2, 0, 1))?
            .unsqueeze(0)?
            .repeat((b, 1, 1, 1))?
            .contiguous()
    }
}

#[derive(Debug, Clone)]
pub enum PositionEmbedding {
    Sine(PositionEmbeddingSine),
    Learned(PositionEmbeddingLearned),
}

impl PositionEmbedding {
    /// Each of the row/column halves gets `hidden_dim / 2` channels.
    pub fn new(kind: PositionEmbeddingType, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let n_steps = hidden_dim / 2;
        Ok(match kind {
            PositionEmbeddingType::Sine => {
                Self::Sine(PositionEmbeddingSine::new(n_steps, 10000., true))
            }
            PositionEmbeddingType::Learned => {
                Self::Learned(PositionEmbeddingLearned::new(n_steps, vb)?)
            }
        })
    }

    /// The embedding depends only on the spatial layout (and mask), never on feature values.
    pub fn forward(&self, tensor_list: &NestedTensor) -> Result<Tensor> {
        let pos = match self {
            Self::Sine(pe) => pe.forward(tensor_list)?,
            Self::Learned(pe) => pe.forward(tensor_list)?,
        };
        pos.to_dtype(tensor_list.tensors().dtype())
    }
}
