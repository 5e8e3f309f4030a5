use std::fmt::Display;

use candle_core::{Device, Result, Tensor};

/// A batched tensor together with an optional padding mask.
///
/// The tensor is laid out (batch, ..., height, width) and the mask, when present, is a
/// `u8` tensor of shape (batch, height, width) where `1` marks padded positions.
#[derive(Debug, Clone)]
pub struct NestedTensor {
    tensors: Tensor,
    mask: Option<Tensor>,
}

impl NestedTensor {
    pub fn new(tensors: Tensor, mask: Option<Tensor>) -> Result<Self> {
        if let Some(mask) = &mask {
            let dims = tensors.dims();
            if dims.len() < 3 || mask.rank() != 3 {
                candle_core::bail!(
                    "NestedTensor expects (batch, .., h, w) with a (batch, h, w) mask, got {:?} and {:?}",
                    dims,
                    mask.dims()
                );
            }
            let expected = [dims[0], dims[dims.len() - 2], dims[dims.len() - 1]];
            if mask.dims() != expected {
                candle_core::bail!(
                    "NestedTensor mask shape {:?} does not match tensor shape {:?}",
                    mask.dims(),
                    dims
                );
            }
            if !mask.device().same_device(tensors.device()) {
                candle_core::bail!("NestedTensor mask and tensor live on different devices");
            }
        }
        Ok(Self { tensors, mask })
    }

    /// Move both the tensor and its mask to `device`, producing a new instance.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let tensors = self.tensors.to_device(device)?;
        let mask = self
            .mask
            .as_ref()
            .map(|mask| mask.to_device(device))
            .transpose()?;
        Self::new(tensors, mask)
    }

    pub fn tensors(&self) -> &Tensor {
        &self.tensors
    }

    pub fn mask(&self) -> Option<&Tensor> {
        self.mask.as_ref()
    }

    pub fn decompose(self) -> (Tensor, Option<Tensor>) {
        (self.tensors, self.mask)
    }
}

impl Display for NestedTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tensors)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::NestedTensor;

    #[test]
    fn to_device_preserves_values() {
        let dev = Device::Cpu;
        let t = Tensor::arange(0f32, 24f32, &dev)
            .unwrap()
            .reshape((2, 1, 3, 4))
            .unwrap();
        let mask = Tensor::from_vec(
            (0..24u8).map(|i| i % 2).collect::<Vec<_>>(),
            (2, 3, 4),
            &dev,
        )
        .unwrap();
        let nested = NestedTensor::new(t.clone(), Some(mask.clone())).unwrap();
        let moved = nested.to_device(&Device::Cpu).unwrap();

        let (t2, mask2) = moved.decompose();
        assert_eq!(
            t.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            t2.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            mask.flatten_all().unwrap().to_vec1::<u8>().unwrap(),
            mask2.unwrap().flatten_all().unwrap().to_vec1::<u8>().unwrap()
        );
    }

    #[test]
    fn to_device_without_mask() {
        let t = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let moved = NestedTensor::new(t, None)
            .unwrap()
            .to_device(&Device::Cpu)
            .unwrap();
        assert!(moved.mask().is_none());
        assert_eq!(moved.tensors().dims(), &[1, 3, 2, 2]);
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let t = Tensor::ones((2, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::zeros((1, 4, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(NestedTensor::new(t, Some(mask)).is_err());
    }
}
