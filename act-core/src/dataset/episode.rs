use std::path::Path;

use candle_core::{DType, Device, IndexOp, Tensor};
use tracing::debug;

use act_vision::{ApplyTransforms, ToTensor, Transforms};

use super::DatasetError;

pub const ACTION_KEY: &str = "action";
pub const QPOS_KEY: &str = "observations.qpos";
pub const IMAGE_KEY_PREFIX: &str = "observations.images.";

/// One recorded demonstration, kept on the CPU.
#[derive(Debug, Clone)]
pub struct Episode {
    /// (T, action_dim)
    pub actions: Tensor,
    /// (T, state_dim)
    pub qpos: Tensor,
    /// (T, num_cameras, 3, h, w), values in `[0, 1]`
    pub images: Tensor,
}

impl Episode {
    pub fn len(&self) -> usize {
        self.actions.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a safetensors episode. Camera frames are stored either raw, as (T, h, w, 3) `u8`,
    /// or encoded (PNG/JPEG), as (T, max_len) `u8` rows padded with zeros.
    pub fn load(path: impl AsRef<Path>, camera_names: &[String]) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)?;
        let get = |key: &str| {
            tensors.get(key).ok_or_else(|| DatasetError::MissingTensor {
                path: path.to_path_buf(),
                key: key.to_string(),
            })
        };

        let actions = get(ACTION_KEY)?.to_dtype(DType::F32)?;
        let qpos = get(QPOS_KEY)?.to_dtype(DType::F32)?;
        let (time_steps, _) = actions.dims2()?;
        if qpos.dims2()?.0 != time_steps {
            return Err(DatasetError::ShapeMismatch(format!(
                "{}: {time_steps} actions but {} joint positions",
                path.display(),
                qpos.dims()[0]
            )));
        }

        let mut cameras = Vec::with_capacity(camera_names.len());
        for cam in camera_names {
            let frames = get(&format!("{IMAGE_KEY_PREFIX}{cam}"))?;
            let frames = match frames.rank() {
                4 => raw_frames(frames)?,
                2 => decode_frames(frames)?,
                _ => {
                    return Err(DatasetError::ShapeMismatch(format!(
                        "{}: camera `{cam}` frames have unsupported shape {:?}",
                        path.display(),
                        frames.dims()
                    )))
                }
            };
            if frames.dim(0)? != time_steps {
                return Err(DatasetError::ShapeMismatch(format!(
                    "{}: camera `{cam}` has {} frames for {time_steps} steps",
                    path.display(),
                    frames.dim(0)?
                )));
            }
            cameras.push(frames);
        }
        let images = Tensor::stack(&cameras, 1)?;
        debug!(
            "Loaded episode {} with {time_steps} steps, images {:?}",
            path.display(),
            images.dims()
        );

        Ok(Self {
            actions,
            qpos,
            images,
        })
    }
}

/// (T, h, w, 3) u8 to (T, 3, h, w) in `[0, 1]`.
fn raw_frames(frames: &Tensor) -> Result<Tensor, DatasetError> {
    let (_, _, _, c) = frames.dims4()?;
    if c != 3 {
        return Err(DatasetError::ShapeMismatch(format!(
            "expected RGB frames, got {c} channels"
        )));
    }
    Ok((frames
        .to_dtype(DType::F32)?
        .permute((0, 3, 1, 2))?
        .contiguous()?
        / 255.0f64)?)
}

fn decode_frames(frames: &Tensor) -> Result<Tensor, DatasetError> {
    let rows = frames.to_dtype(DType::U8)?;
    let mut decoded = Vec::with_capacity(rows.dim(0)?);
    for i in 0..rows.dim(0)? {
        let bytes = rows.i(i)?.to_vec1::<u8>()?;
        decoded.push(image::load_from_memory(&bytes)?);
    }
    let transforms = Transforms {
        input: &ToTensor,
        inner_transforms: &[],
    };
    Ok(decoded[..].apply(transforms, &Device::Cpu)?)
}

/// Slice one `num_queries` window of future actions per timestep.
///
/// Returns the (T, num_queries, action_dim) chunks, zero past the episode end, and the
/// (T, num_queries) `u8` padding mask which is 1 exactly where `t + j >= T`.
pub fn chunk_actions(actions: &Tensor, num_queries: usize) -> candle_core::Result<(Tensor, Tensor)> {
    let (time_steps, action_dim) = actions.dims2()?;
    if num_queries == 0 {
        candle_core::bail!("num_queries must be positive");
    }
    let padded = if num_queries > 1 {
        let zero_pad = Tensor::zeros(
            (num_queries - 1, action_dim),
            actions.dtype(),
            actions.device(),
        )?;
        Tensor::cat(&[actions, &zero_pad], 0)?
    } else {
        actions.clone()
    };
    let windows = (0..time_steps)
        .map(|t| padded.narrow(0, t, num_queries))
        .collect::<candle_core::Result<Vec<_>>>()?;
    let chunks = Tensor::stack(&windows, 0)?;

    let mask = (0..time_steps)
        .flat_map(|t| (0..num_queries).map(move |j| u8::from(t + j >= time_steps)))
        .collect::<Vec<_>>();
    let is_pad = Tensor::from_vec(mask, (time_steps, num_queries), actions.device())?;
    Ok((chunks, is_pad))
}
