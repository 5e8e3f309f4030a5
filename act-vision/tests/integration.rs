use act_vision::{ApplyTransforms, Normalize, ToTensor, Transforms};
use candle_core::Device;
use image::{ColorType, DynamicImage};

#[test]
fn normalize() {
    let image = DynamicImage::new(3, 4, ColorType::Rgb8);
    let transforms = Transforms {
        input: &ToTensor,
        inner_transforms: &[&Normalize {
            mean: vec![0.5, 0.5, 0.5],
            std: vec![0.5, 0.5, 0.5],
        }],
    };
    let transformed = image.apply(transforms, &Device::Cpu).unwrap();
    assert_eq!(transformed.dims(), &[3, 4, 3]);
}

#[test]
fn imagenet_normalize_black_frame() {
    let image = DynamicImage::new(2, 2, ColorType::Rgb8);
    let transforms = Transforms {
        input: &ToTensor,
        inner_transforms: &[&Normalize::imagenet()],
    };
    let transformed = image.apply(transforms, &Device::Cpu).unwrap();
    let red = transformed
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()[0];
    assert!((red - (-0.485 / 0.229) as f32).abs() < 1e-5);
}

#[test]
fn stacked_frames() {
    let frames = vec![
        DynamicImage::new(5, 2, ColorType::Rgb8),
        DynamicImage::new(5, 2, ColorType::Rgba8),
    ];
    let transforms = Transforms {
        input: &ToTensor,
        inner_transforms: &[],
    };
    let stacked = frames[..].apply(transforms, &Device::Cpu).unwrap();
    assert_eq!(stacked.dims(), &[2, 3, 2, 5]);

    let mismatched = vec![
        DynamicImage::new(5, 2, ColorType::Rgb8),
        DynamicImage::new(4, 2, ColorType::Rgb8),
    ];
    assert!(mismatched[..].apply(transforms, &Device::Cpu).is_err());
}
