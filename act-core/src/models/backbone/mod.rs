use candle_core::{DType, Result, Tensor};
use indexmap::IndexMap;

use super::{position_encoding::PositionEmbedding, NestedTensor, SplitVarBuilder};
use crate::config::{BackboneVariant, PositionEmbeddingType};

mod frozen_bn;
mod resnet;

pub use frozen_bn::FrozenBatchNorm2d;
pub use resnet::ResNet;

/// Visual encoder backbone (ResNet with frozen BatchNorm).
#[derive(Debug, Clone)]
pub struct Backbone {
    body: ResNet,
    return_interm_layers: bool,
    num_channels: usize,
}

impl Backbone {
    pub fn new(
        variant: BackboneVariant,
        return_interm_layers: bool,
        dilation: bool,
        vb: SplitVarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            body: ResNet::new(variant, dilation, vb)?,
            return_interm_layers,
            num_channels: variant.num_channels(),
        })
    }

    /// Channels of the last stage, which is what the projection layer consumes.
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Stage outputs keyed `"0"`..`"3"` when intermediate layers are requested, otherwise only
    /// the last stage under `"0"`. Masks are resized to each feature map.
    pub fn forward(&self, tensor_list: &NestedTensor) -> Result<IndexMap<String, NestedTensor>> {
        let stages = self.body.forward_stages(tensor_list.tensors(), 3)?;
        let selected: Vec<Tensor> = if self.return_interm_layers {
            stages
        } else {
            stages.into_iter().skip(3).collect()
        };

        let mut out = IndexMap::with_capacity(selected.len());
        for (name, x) in selected.into_iter().enumerate() {
            let mask = match tensor_list.mask() {
                Some(mask) => {
                    let (_, _, h, w) = x.dims4()?;
                    Some(
                        mask.to_dtype(DType::F32)?
                            .unsqueeze(1)?
                            .upsample_nearest2d(h, w)?
                            .squeeze(1)?
                            .to_dtype(DType::U8)?,
                    )
                }
                None => None,
            };
            out.insert(name.to_string(), NestedTensor::new(x, mask)?);
        }
        Ok(out)
    }
}

/// Visual encoder backbone + 2D positional encoding.
#[derive(Debug, Clone)]
pub struct Joiner {
    backbone: Backbone,
    position_embedding: PositionEmbedding,
}

impl Joiner {
    pub fn new(backbone: Backbone, position_embedding: PositionEmbedding) -> Self {
        Self {
            backbone,
            position_embedding,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.backbone.num_channels()
    }

    /// Returns the backbone outputs (all intermediate stages when requested) and one positional
    /// embedding per output, cast to the feature dtype.
    pub fn forward(&self, tensor_list: &NestedTensor) -> Result<(Vec<NestedTensor>, Vec<Tensor>)> {
        let xs = self.backbone.forward(tensor_list)?;
        let mut out = Vec::with_capacity(xs.len());
        let mut pos = Vec::with_capacity(xs.len());
        for (_, x) in xs {
            pos.push(
                self.position_embedding
                    .forward(&x)?
                    .to_dtype(x.tensors().dtype())?,
            );
            out.push(x);
        }
        Ok((out, pos))
    }
}

/// Build one camera's backbone. ResNet weights live under `body`, learned position
/// tables under `position`.
pub fn build_backbone(
    variant: BackboneVariant,
    position_embedding: PositionEmbeddingType,
    hidden_dim: usize,
    return_interm_layers: bool,
    dilation: bool,
    vb: SplitVarBuilder,
) -> Result<Joiner> {
    let position_embedding =
        PositionEmbedding::new(position_embedding, hidden_dim, vb.params.pp("position"))?;
    let backbone = Backbone::new(variant, return_interm_layers, dilation, vb.pp("body"))?;
    Ok(Joiner::new(backbone, position_embedding))
}
