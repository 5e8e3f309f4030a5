use crate::utils::image_to_pixels;
use candle_core::{DType, Device, Result, Tensor, D};
use image::DynamicImage;

use crate::{ImageTransform, IMAGENET_MEAN, IMAGENET_STD};

/// Convert an image to a tensor. This converts the data from being in `[0, 255]` to `[0.0, 1.0]`.
/// The tensor's shape is (3, height, width).
pub struct ToTensor;

impl ImageTransform for ToTensor {
    type Input = DynamicImage;
    type Output = Tensor;
    fn map(&self, x: &Self::Input, device: &Device) -> Result<Self::Output> {
        image_to_pixels(x, device)? / 255.0f64
    }
}

/// Normalize the image data based on the mean and standard deviation.
/// The value is computed as follows:
/// `
/// x[channel]=(x[channel] - mean[channel]) / std[channel]
/// `
///
/// The channel axis is the third from last, so this accepts a single image (channels, height, width)
/// as well as batched layouts such as (batch, camera, channels, height, width).
pub struct Normalize {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl Normalize {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN.to_vec(),
            std: IMAGENET_STD.to_vec(),
        }
    }

    fn stat(values: &[f64], x: &Tensor) -> Result<Tensor> {
        let values = values.iter().map(|v| *v as f32).collect::<Vec<_>>();
        Tensor::from_vec(values, (x.dim(D::Minus(3))?, 1, 1), x.device())?.to_dtype(x.dtype())
    }
}

impl ImageTransform for Normalize {
    type Input = Tensor;
    type Output = Self::Input;

    fn map(&self, x: &Self::Input, _: &Device) -> Result<Self::Output> {
        if x.rank() < 3 {
            candle_core::bail!("Expected at least (channels, height, width), got {:?}", x.dims());
        }
        let num_channels = x.dim(D::Minus(3))?;
        if self.mean.len() != num_channels || self.std.len() != num_channels {
            candle_core::bail!("Num channels must match number of mean and std.");
        }
        let x = if x.dtype() == DType::U8 {
            x.to_dtype(DType::F32)?
        } else {
            x.clone()
        };
        let mean = Self::stat(&self.mean, &x)?;
        let std = Self::stat(&self.std, &x)?;
        x.broadcast_sub(&mean)?.broadcast_div(&std)
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_to_tensor() {
        use candle_core::Device;
        use image::{ColorType, DynamicImage};

        use crate::ImageTransform;

        use super::ToTensor;

        let image = DynamicImage::new(4, 5, ColorType::Rgb8);
        let res = ToTensor.map(&image, &Device::Cpu).unwrap();
        assert_eq!(res.dims(), &[3, 5, 4])
    }

    #[test]
    fn test_to_tensor_drops_alpha() {
        use candle_core::Device;
        use image::{ColorType, DynamicImage};

        use crate::ImageTransform;

        use super::ToTensor;

        let image = DynamicImage::new(2, 2, ColorType::Rgba8);
        let res = ToTensor.map(&image, &Device::Cpu).unwrap();
        assert_eq!(res.dims(), &[3, 2, 2])
    }

    #[test]
    fn test_normalize() {
        use crate::{ImageTransform, Normalize};
        use candle_core::{DType, Device, Tensor};

        let image = Tensor::zeros((3, 5, 4), DType::U8, &Device::Cpu).unwrap();
        let res = Normalize {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        }
        .map(&image, &Device::Cpu)
        .unwrap();
        assert_eq!(res.dims(), &[3, 5, 4]);
        let values = res.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (*v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_normalize_batched_per_channel() {
        use crate::{ImageTransform, Normalize};
        use candle_core::{DType, Device, IndexOp, Tensor};

        let image = Tensor::ones((2, 3, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let res = Normalize {
            mean: vec![0.0, 0.5, 1.0],
            std: vec![1.0, 0.5, 2.0],
        }
        .map(&image, &Device::Cpu)
        .unwrap();
        assert_eq!(res.dims(), &[2, 3, 3, 4, 4]);
        let expected = [1.0f32, 1.0, 0.0];
        for (c, want) in expected.iter().enumerate() {
            let got = res.i((1, 2, c, 3, 0)).unwrap().to_scalar::<f32>().unwrap();
            assert!((got - want).abs() < 1e-6, "channel {c}: {got} != {want}");
        }
    }

    #[test]
    fn test_normalize_rejects_channel_mismatch() {
        use crate::{ImageTransform, Normalize};
        use candle_core::{DType, Device, Tensor};

        let image = Tensor::zeros((4, 5, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(Normalize::imagenet().map(&image, &Device::Cpu).is_err());
    }
}
