use candle_core::{DType, Device, Result, Tensor};
use image::{DynamicImage, GenericImageView};

/// Output is (3, h, w), alpha is dropped.
pub(crate) fn image_to_pixels(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (w, h) = image.dimensions();
    let data = image.to_rgb8().into_raw();
    let data = Tensor::from_vec(data, (h as usize, w as usize, 3), device)?;
    data.permute((2, 0, 1))?.to_dtype(DType::F32)
}
