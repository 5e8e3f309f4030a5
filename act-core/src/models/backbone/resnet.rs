use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv2d_no_bias, Conv2d, Conv2dConfig};

use super::frozen_bn::FrozenBatchNorm2d;
use crate::{config::BackboneVariant, models::SplitVarBuilder};

// https://github.com/pytorch/vision/blob/main/torchvision/models/resnet.py

fn conv3x3(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    dilation: usize,
    vb: &SplitVarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: dilation,
        stride,
        dilation,
        ..Default::default()
    };
    conv2d_no_bias(in_planes, out_planes, 3, cfg, vb.params.clone())
}

fn conv1x1(
    in_planes: usize,
    out_planes: usize,
    stride: usize,
    vb: &SplitVarBuilder,
) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        stride,
        ..Default::default()
    };
    conv2d_no_bias(in_planes, out_planes, 1, cfg, vb.params.clone())
}

fn frozen_bn(num_features: usize, vb: &SplitVarBuilder) -> Result<FrozenBatchNorm2d> {
    FrozenBatchNorm2d::new(num_features, vb.buffers.clone())
}

/// `downsample.0` is the strided 1x1 conv, `downsample.1` its norm.
#[derive(Debug, Clone)]
struct Downsample {
    conv: Conv2d,
    bn: FrozenBatchNorm2d,
}

impl Downsample {
    fn new(in_planes: usize, out_planes: usize, stride: usize, vb: SplitVarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv1x1(in_planes, out_planes, stride, &vb.pp(0))?,
            bn: frozen_bn(out_planes, &vb.pp(1))?,
        })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.conv)?.apply(&self.bn)
    }
}

#[derive(Debug, Clone)]
struct BasicBlock {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    conv2: Conv2d,
    bn2: FrozenBatchNorm2d,
    downsample: Option<Downsample>,
}

impl BasicBlock {
    const EXPANSION: usize = 1;

    fn new(
        in_planes: usize,
        planes: usize,
        stride: usize,
        dilation: usize,
        downsample: Option<Downsample>,
        vb: SplitVarBuilder,
    ) -> Result<Self> {
        if dilation > 1 {
            candle_core::bail!("Dilation > 1 not supported in BasicBlock");
        }
        Ok(Self {
            conv1: conv3x3(in_planes, planes, stride, 1, &vb.pp("conv1"))?,
            bn1: frozen_bn(planes, &vb.pp("bn1"))?,
            conv2: conv3x3(planes, planes, 1, 1, &vb.pp("conv2"))?,
            bn2: frozen_bn(planes, &vb.pp("bn2"))?,
            downsample,
        })
    }
}

impl Module for BasicBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(xs)?,
            None => xs.clone(),
        };
        let out = xs.apply(&self.conv1)?.apply(&self.bn1)?.relu()?;
        let out = out.apply(&self.conv2)?.apply(&self.bn2)?;
        (out + identity)?.relu()
    }
}

#[derive(Debug, Clone)]
struct Bottleneck {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    conv2: Conv2d,
    bn2: FrozenBatchNorm2d,
    conv3: Conv2d,
    bn3: FrozenBatchNorm2d,
    downsample: Option<Downsample>,
}

impl Bottleneck {
    const EXPANSION: usize = 4;

    fn new(
        in_planes: usize,
        planes: usize,
        stride: usize,
        dilation: usize,
        downsample: Option<Downsample>,
        vb: SplitVarBuilder,
    ) -> Result<Self> {
        let out_planes = planes * Self::EXPANSION;
        Ok(Self {
            conv1: conv1x1(in_planes, planes, 1, &vb.pp("conv1"))?,
            bn1: frozen_bn(planes, &vb.pp("bn1"))?,
            conv2: conv3x3(planes, planes, stride, dilation, &vb.pp("conv2"))?,
            bn2: frozen_bn(planes, &vb.pp("bn2"))?,
            conv3: conv1x1(planes, out_planes, 1, &vb.pp("conv3"))?,
            bn3: frozen_bn(out_planes, &vb.pp("bn3"))?,
            downsample,
        })
    }
}

impl Module for Bottleneck {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(xs)?,
            None => xs.clone(),
        };
        let out = xs.apply(&self.conv1)?.apply(&self.bn1)?.relu()?;
        let out = out.apply(&self.conv2)?.apply(&self.bn2)?.relu()?;
        let out = out.apply(&self.conv3)?.apply(&self.bn3)?;
        (out + identity)?.relu()
    }
}

#[derive(Debug, Clone)]
enum ResidualBlock {
    Basic(BasicBlock),
    Bottleneck(Bottleneck),
}

impl Module for ResidualBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Basic(block) => block.forward(xs),
            Self::Bottleneck(block) => block.forward(xs),
        }
    }
}

/// ResNet body without the classification head. Every norm layer is frozen.
#[derive(Debug, Clone)]
pub struct ResNet {
    conv1: Conv2d,
    bn1: FrozenBatchNorm2d,
    stages: Vec<Vec<ResidualBlock>>,
}

impl ResNet {
    /// With `dilation`, the last stage trades its stride for a dilation of 2.
    pub fn new(variant: BackboneVariant, dilation: bool, vb: SplitVarBuilder) -> Result<Self> {
        let conv1 = conv2d_no_bias(
            3,
            64,
            7,
            Conv2dConfig {
                padding: 3,
                stride: 2,
                ..Default::default()
            },
            vb.params.pp("conv1"),
        )?;
        let bn1 = frozen_bn(64, &vb.pp("bn1"))?;

        let bottleneck = variant.uses_bottleneck();
        let expansion = if bottleneck {
            Bottleneck::EXPANSION
        } else {
            BasicBlock::EXPANSION
        };

        let mut in_planes = 64;
        let mut cur_dilation = 1;
        let mut stages = Vec::with_capacity(4);
        for (stage_idx, (planes, depth)) in [64, 128, 256, 512]
            .into_iter()
            .zip(variant.stage_depths())
            .enumerate()
        {
            let vb_s = vb.pp(format!("layer{}", stage_idx + 1));
            let mut stride = if stage_idx == 0 { 1 } else { 2 };
            let previous_dilation = cur_dilation;
            if dilation && stage_idx == 3 {
                cur_dilation *= stride;
                stride = 1;
            }

            let mut blocks = Vec::with_capacity(depth);
            for block_idx in 0..depth {
                let vb_b = vb_s.pp(block_idx);
                let (block_stride, block_dilation) = if block_idx == 0 {
                    (stride, previous_dilation)
                } else {
                    (1, cur_dilation)
                };
                let downsample = if block_idx == 0 && (stride != 1 || in_planes != planes * expansion)
                {
                    Some(Downsample::new(
                        in_planes,
                        planes * expansion,
                        stride,
                        vb_b.pp("downsample"),
                    )?)
                } else {
                    None
                };
                let block = if bottleneck {
                    ResidualBlock::Bottleneck(Bottleneck::new(
                        in_planes,
                        planes,
                        block_stride,
                        block_dilation,
                        downsample,
                        vb_b,
                    )?)
                } else {
                    ResidualBlock::Basic(BasicBlock::new(
                        in_planes,
                        planes,
                        block_stride,
                        block_dilation,
                        downsample,
                        vb_b,
                    )?)
                };
                blocks.push(block);
                in_planes = planes * expansion;
            }
            stages.push(blocks);
        }

        Ok(Self { conv1, bn1, stages })
    }

    /// Run the network through stage `last_stage` (0-based) and return the output of every
    /// stage visited.
    pub fn forward_stages(&self, xs: &Tensor, last_stage: usize) -> Result<Vec<Tensor>> {
        let mut xs = xs.apply(&self.conv1)?.apply(&self.bn1)?.relu()?;
        // Replicating the border is equivalent to -inf padding for a max pool.
        xs = xs
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;

        let mut outputs = Vec::with_capacity(last_stage + 1);
        for stage in self.stages.iter().take(last_stage + 1) {
            for block in stage {
                xs = block.forward(&xs)?;
            }
            outputs.push(xs.clone());
        }
        Ok(outputs)
    }
}
