//! Action Chunking Transformer (ACT) policies: a ResNet visual backbone, a transformer CVAE
//! and an encoder-decoder predicting chunks of future actions from joint positions and
//! camera frames.

pub mod config;
pub mod dataset;
pub mod models;
mod policy;
mod utils;

pub use config::{ActConfig, BackboneVariant, ConfigError, PositionEmbeddingType};
pub use dataset::{chunk_actions, ActDataset, Batch, DatasetError, Episode, NormStats};
pub use models::detr_vae::{ForwardMode, LatentDistribution, LATENT_DIM};
pub use policy::{ActPolicy, LossTerms, ParamGroups, PolicyOutput};
pub use utils::debug::initialize_logging;
