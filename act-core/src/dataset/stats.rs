use std::path::Path;

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

use super::{DatasetError, Episode};

const MIN_STD: f64 = 1e-2;

/// Per-dimension statistics used to standardize joint positions and actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormStats {
    pub action_mean: Vec<f32>,
    pub action_std: Vec<f32>,
    pub qpos_mean: Vec<f32>,
    pub qpos_std: Vec<f32>,
}

/// Mean and unbiased std over rows of a (n, dim) tensor, std clipped from below.
fn mean_std(xs: &Tensor) -> Result<(Vec<f32>, Vec<f32>)> {
    let xs = xs.to_dtype(DType::F32)?;
    let n = xs.dim(0)?;
    let mean = xs.mean_keepdim(0)?;
    let denom = n.saturating_sub(1).max(1) as f64;
    let std = (xs.broadcast_sub(&mean)?.sqr()?.sum(0)? / denom)?
        .sqrt()?
        .maximum(MIN_STD)?;
    Ok((mean.squeeze(0)?.to_vec1()?, std.to_vec1()?))
}

impl NormStats {
    pub fn compute(episodes: &[Episode]) -> std::result::Result<Self, DatasetError> {
        if episodes.is_empty() {
            return Err(DatasetError::Empty);
        }
        let actions = episodes.iter().map(|e| &e.actions).collect::<Vec<_>>();
        let qpos = episodes.iter().map(|e| &e.qpos).collect::<Vec<_>>();
        let (action_mean, action_std) = mean_std(&Tensor::cat(&actions, 0)?)?;
        let (qpos_mean, qpos_std) = mean_std(&Tensor::cat(&qpos, 0)?)?;
        Ok(Self {
            action_mean,
            action_std,
            qpos_mean,
            qpos_std,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, DatasetError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> std::result::Result<(), DatasetError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn standardize(xs: &Tensor, mean: &[f32], std: &[f32]) -> Result<Tensor> {
        let mean = Tensor::new(mean, xs.device())?.to_dtype(xs.dtype())?;
        let std = Tensor::new(std, xs.device())?.to_dtype(xs.dtype())?;
        xs.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    fn destandardize(xs: &Tensor, mean: &[f32], std: &[f32]) -> Result<Tensor> {
        let mean = Tensor::new(mean, xs.device())?.to_dtype(xs.dtype())?;
        let std = Tensor::new(std, xs.device())?.to_dtype(xs.dtype())?;
        xs.broadcast_mul(&std)?.broadcast_add(&mean)
    }

    /// Standardize joint positions; the last axis is the state dimension.
    pub fn normalize_qpos(&self, qpos: &Tensor) -> Result<Tensor> {
        Self::standardize(qpos, &self.qpos_mean, &self.qpos_std)
    }

    pub fn normalize_actions(&self, actions: &Tensor) -> Result<Tensor> {
        Self::standardize(actions, &self.action_mean, &self.action_std)
    }

    /// Map predicted actions back to joint space.
    pub fn denormalize_actions(&self, actions: &Tensor) -> Result<Tensor> {
        Self::destandardize(actions, &self.action_mean, &self.action_std)
    }
}
