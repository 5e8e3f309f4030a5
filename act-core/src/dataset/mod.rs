use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom};
use thiserror::Error;
use tracing::info;

use crate::config::ActConfig;

mod episode;
mod stats;

pub use episode::{chunk_actions, Episode, ACTION_KEY, IMAGE_KEY_PREFIX, QPOS_KEY};
pub use stats::NormStats;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("No episodes found")]
    Empty,

    #[error("{path:?} has no tensor `{key}`")]
    MissingTensor { path: PathBuf, key: String },

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("IoError: {0:?}")]
    IoError(#[from] std::io::Error),

    #[error("Json Error: {0:?}")]
    JsonError(#[from] serde_json::Error),

    #[error("Image Error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// A mini-batch ready for [`crate::ActPolicy::compute_loss`].
#[derive(Debug, Clone)]
pub struct Batch {
    /// (batch, num_cameras, 3, h, w)
    pub image: Tensor,
    /// (batch, state_dim)
    pub qpos: Tensor,
    /// (batch, num_queries, action_dim)
    pub actions: Tensor,
    /// (batch, num_queries)
    pub is_pad: Tensor,
}

impl Batch {
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            image: self.image.to_device(device)?,
            qpos: self.qpos.to_device(device)?,
            actions: self.actions.to_device(device)?,
            is_pad: self.is_pad.to_device(device)?,
        })
    }

    pub fn len(&self) -> usize {
        self.qpos.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Every timestep of every episode as one training sample, with normalized joint positions
/// and action chunks.
pub struct ActDataset {
    image: Tensor,
    qpos: Tensor,
    actions: Tensor,
    is_pad: Tensor,
    norm_stats: NormStats,
}

/// The `*.safetensors` files of `dir`, sorted by name.
pub fn episode_paths(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, DatasetError> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

impl ActDataset {
    /// Load every episode of `dir`. Statistics are computed over the episodes unless given.
    pub fn load(
        dir: impl AsRef<Path>,
        config: &ActConfig,
        norm_stats: Option<NormStats>,
    ) -> Result<Self, DatasetError> {
        let episodes = episode_paths(dir.as_ref())?
            .iter()
            .map(|path| Episode::load(path, &config.camera_names))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Loaded {} episodes from {}",
            episodes.len(),
            dir.as_ref().display()
        );
        Self::from_episodes(&episodes, config.num_queries, norm_stats)
    }

    pub fn from_episodes(
        episodes: &[Episode],
        num_queries: usize,
        norm_stats: Option<NormStats>,
    ) -> Result<Self, DatasetError> {
        let Some(first) = episodes.iter().find(|e| !e.is_empty()) else {
            return Err(DatasetError::Empty);
        };
        let frame_dims = &first.images.dims()[1..];
        if episodes
            .iter()
            .any(|e| !e.is_empty() && &e.images.dims()[1..] != frame_dims)
        {
            return Err(DatasetError::ShapeMismatch(
                "episodes disagree on camera count or frame size".to_string(),
            ));
        }
        let norm_stats = match norm_stats {
            Some(stats) => stats,
            None => NormStats::compute(episodes)?,
        };

        let mut images = Vec::with_capacity(episodes.len());
        let mut qpos = Vec::with_capacity(episodes.len());
        let mut actions = Vec::with_capacity(episodes.len());
        let mut is_pad = Vec::with_capacity(episodes.len());
        for episode in episodes.iter().filter(|e| !e.is_empty()) {
            let normalized = norm_stats.normalize_actions(&episode.actions)?;
            let (chunks, mask) = chunk_actions(&normalized, num_queries)?;
            images.push(&episode.images);
            qpos.push(norm_stats.normalize_qpos(&episode.qpos)?);
            actions.push(chunks);
            is_pad.push(mask);
        }

        Ok(Self {
            image: Tensor::cat(&images, 0)?,
            qpos: Tensor::cat(&qpos, 0)?,
            actions: Tensor::cat(&actions, 0)?,
            is_pad: Tensor::cat(&is_pad, 0)?,
            norm_stats,
        })
    }

    pub fn len(&self) -> usize {
        self.qpos.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn norm_stats(&self) -> &NormStats {
        &self.norm_stats
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// Batches over the whole dataset. The last batch may be smaller. With `rng`, the sample
    /// order is shuffled.
    pub fn batches(&self, batch_size: usize, rng: Option<&mut StdRng>) -> Batches<'_> {
        let mut order = (0..self.len() as u32).collect::<Vec<_>>();
        if let Some(rng) = rng {
            order.shuffle(rng);
        }
        Batches {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            pos: 0,
        }
    }

    fn select(&self, indices: &[u32]) -> candle_core::Result<Batch> {
        let ids = Tensor::new(indices, self.qpos.device())?;
        Ok(Batch {
            image: self.image.index_select(&ids, 0)?,
            qpos: self.qpos.index_select(&ids, 0)?,
            actions: self.actions.index_select(&ids, 0)?,
            is_pad: self.is_pad.index_select(&ids, 0)?,
        })
    }
}

pub struct Batches<'a> {
    dataset: &'a ActDataset,
    order: Vec<u32>,
    batch_size: usize,
    pos: usize,
}

impl Iterator for Batches<'_> {
    type Item = candle_core::Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.order.len() {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.order.len());
        let batch = self.dataset.select(&self.order[self.pos..end]);
        self.pos = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.pos).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}
