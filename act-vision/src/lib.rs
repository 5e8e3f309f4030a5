//! Camera frame preprocessing: decoding to tensors and per-channel normalization.

use candle_core::{Device, Result, Tensor};
use image::DynamicImage;
mod transforms;
pub(crate) mod utils;
pub use transforms::{Normalize, ToTensor};

/// Per-channel mean of the ImageNet training set, used by the pretrained ResNet backbones.
pub const IMAGENET_MEAN: [f64; 3] = [0.485, 0.456, 0.406];
/// Per-channel standard deviation of the ImageNet training set.
pub const IMAGENET_STD: [f64; 3] = [0.229, 0.224, 0.225];

pub trait ImageTransform {
    type Input;
    type Output;

    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output>;
}

/// An input transform producing a tensor, followed by tensor-to-tensor transforms in order.
#[derive(Clone, Copy)]
pub struct Transforms<'a> {
    pub input: &'a dyn ImageTransform<Input = DynamicImage, Output = Tensor>,
    pub inner_transforms: &'a [&'a dyn ImageTransform<Input = Tensor, Output = Tensor>],
}

pub trait ApplyTransforms<'a> {
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor>;
}

impl<'a> ApplyTransforms<'a> for DynamicImage {
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor> {
        let mut res = transforms.input.map(self, device)?;
        for transform in transforms.inner_transforms {
            res = transform.map(&res, device)?;
        }
        Ok(res)
    }
}

impl<'a> ApplyTransforms<'a> for [DynamicImage] {
    /// Transform every frame and stack the results on a new leading axis. Frames must share a size.
    fn apply(&self, transforms: Transforms<'a>, device: &Device) -> Result<Tensor> {
        let frames = self
            .iter()
            .map(|frame| frame.apply(transforms, device))
            .collect::<Result<Vec<_>>>()?;
        Tensor::stack(&frames, 0)
    }
}
