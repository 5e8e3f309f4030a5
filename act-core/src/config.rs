use std::{fmt::Display, path::Path, str::FromStr};

use candle_nn::Activation;
use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_512() -> usize {
    512
}
fn default_8() -> usize {
    8
}
fn default_3200() -> usize {
    3200
}
fn default_4() -> usize {
    4
}
fn default_7() -> usize {
    7
}
fn default_14() -> usize {
    14
}
fn default_100() -> usize {
    100
}
fn default_dropout() -> f32 {
    0.1
}
fn default_kl_weight() -> f64 {
    10.0
}
fn default_lr() -> f64 {
    1e-5
}
fn default_weight_decay() -> f64 {
    1e-4
}
fn default_false() -> bool {
    false
}
fn default_act() -> Activation {
    Activation::Relu
}
fn default_cameras() -> Vec<String> {
    vec!["top".to_string()]
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("`{0}` is not a supported backbone. Expected one of resnet18, resnet34, resnet50, resnet101, resnet152.")]
    UnknownBackbone(String),

    #[error("`{0}` is not a supported position embedding. Expected `sine` or `learned`.")]
    UnknownPositionEmbedding(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IoError: {0:?}")]
    IoError(#[from] std::io::Error),

    #[error("Json Error: {0:?}")]
    JsonError(#[from] serde_json::Error),
}

/// The ResNet flavours the visual backbone can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackboneVariant {
    #[default]
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
    Resnet152,
}

impl BackboneVariant {
    /// Number of residual blocks in each of the four stages.
    pub fn stage_depths(&self) -> [usize; 4] {
        match self {
            Self::Resnet18 => [2, 2, 2, 2],
            Self::Resnet34 | Self::Resnet50 => [3, 4, 6, 3],
            Self::Resnet101 => [3, 4, 23, 3],
            Self::Resnet152 => [3, 8, 36, 3],
        }
    }

    pub fn uses_bottleneck(&self) -> bool {
        !matches!(self, Self::Resnet18 | Self::Resnet34)
    }

    /// Channels of the last stage's feature map.
    pub fn num_channels(&self) -> usize {
        if self.uses_bottleneck() {
            2048
        } else {
            512
        }
    }
}

impl FromStr for BackboneVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resnet18" => Ok(Self::Resnet18),
            "resnet34" => Ok(Self::Resnet34),
            "resnet50" => Ok(Self::Resnet50),
            "resnet101" => Ok(Self::Resnet101),
            "resnet152" => Ok(Self::Resnet152),
            other => Err(ConfigError::UnknownBackbone(other.to_string())),
        }
    }
}

impl Display for BackboneVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet34 => "resnet34",
            Self::Resnet50 => "resnet50",
            Self::Resnet101 => "resnet101",
            Self::Resnet152 => "resnet152",
        };
        write!(f, "{name}")
    }
}

impl TryFrom<String> for BackboneVariant {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackboneVariant> for String {
    fn from(value: BackboneVariant) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PositionEmbeddingType {
    #[default]
    Sine,
    Learned,
}

impl FromStr for PositionEmbeddingType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sine" | "v2" => Ok(Self::Sine),
            "learned" | "v3" => Ok(Self::Learned),
            other => Err(ConfigError::UnknownPositionEmbedding(other.to_string())),
        }
    }
}

impl Display for PositionEmbeddingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sine => write!(f, "sine"),
            Self::Learned => write!(f, "learned"),
        }
    }
}

impl TryFrom<String> for PositionEmbeddingType {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PositionEmbeddingType> for String {
    fn from(value: PositionEmbeddingType) -> Self {
        value.to_string()
    }
}

/// Model and optimizer hyperparameters of an ACT policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActConfig {
    #[serde(default = "default_512")]
    pub hidden_dim: usize,
    #[serde(default = "default_8")]
    pub nheads: usize,
    #[serde(default = "default_3200")]
    pub dim_feedforward: usize,
    /// Layers of both the transformer encoder and the CVAE encoder.
    #[serde(default = "default_4")]
    pub enc_layers: usize,
    #[serde(default = "default_7")]
    pub dec_layers: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_false")]
    pub pre_norm: bool,
    #[serde(default = "default_act")]
    pub activation: Activation,

    #[serde(default)]
    pub backbone: BackboneVariant,
    #[serde(default)]
    pub position_embedding: PositionEmbeddingType,
    #[serde(default = "default_false")]
    pub dilation: bool,
    #[serde(default = "default_false")]
    pub return_interm_layers: bool,
    #[serde(default = "default_cameras")]
    pub camera_names: Vec<String>,

    #[serde(default = "default_100")]
    pub num_queries: usize,
    #[serde(default = "default_kl_weight")]
    pub kl_weight: f64,
    #[serde(default = "default_14")]
    pub state_dim: usize,
    #[serde(default = "default_14")]
    pub action_dim: usize,
    #[serde(default = "default_false")]
    pub no_encoder: bool,

    // Vector-quantized latents are not implemented, these are carried as inert settings.
    #[serde(default = "default_false")]
    pub vq: bool,
    #[serde(default)]
    pub vq_class: Option<usize>,
    #[serde(default)]
    pub vq_dim: Option<usize>,

    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_lr")]
    pub lr_backbone: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for ActConfig {
    fn default() -> Self {
        Self {
            hidden_dim: default_512(),
            nheads: default_8(),
            dim_feedforward: default_3200(),
            enc_layers: default_4(),
            dec_layers: default_7(),
            dropout: default_dropout(),
            pre_norm: false,
            activation: default_act(),
            backbone: BackboneVariant::default(),
            position_embedding: PositionEmbeddingType::default(),
            dilation: false,
            return_interm_layers: false,
            camera_names: default_cameras(),
            num_queries: default_100(),
            kl_weight: default_kl_weight(),
            state_dim: default_14(),
            action_dim: default_14(),
            no_encoder: false,
            vq: false,
            vq_class: None,
            vq_dim: None,
            lr: default_lr(),
            lr_backbone: default_lr(),
            weight_decay: default_weight_decay(),
        }
    }
}

impl ActConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.camera_names.is_empty() {
            return invalid("at least one camera name is required".to_string());
        }
        if self.num_queries == 0 {
            return invalid("`num_queries` must be positive".to_string());
        }
        if self.nheads == 0 || self.hidden_dim % self.nheads != 0 {
            return invalid(format!(
                "`hidden_dim` ({}) must be divisible by `nheads` ({})",
                self.hidden_dim, self.nheads
            ));
        }
        if self.hidden_dim == 0 || self.hidden_dim % 4 != 0 {
            return invalid(format!(
                "`hidden_dim` ({}) must be a positive multiple of 4",
                self.hidden_dim
            ));
        }
        if self.enc_layers == 0 || self.dec_layers == 0 {
            return invalid("`enc_layers` and `dec_layers` must be positive".to_string());
        }
        if self.state_dim == 0 || self.action_dim == 0 || self.dim_feedforward == 0 {
            return invalid(
                "`state_dim`, `action_dim` and `dim_feedforward` must be positive".to_string(),
            );
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return invalid(format!("`dropout` ({}) must be in [0, 1)", self.dropout));
        }
        if self.dilation && !self.backbone.uses_bottleneck() {
            return invalid(format!(
                "dilation is only supported by bottleneck backbones, not {}",
                self.backbone
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_json() {
        let cfg: ActConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ActConfig::default());
        assert_eq!(cfg.backbone, BackboneVariant::Resnet18);
        assert_eq!(cfg.hidden_dim, 512);
        cfg.validate().unwrap();
    }

    #[test]
    fn backbone_names() {
        assert_eq!(
            "resnet50".parse::<BackboneVariant>().unwrap(),
            BackboneVariant::Resnet50
        );
        assert_eq!(BackboneVariant::Resnet34.num_channels(), 512);
        assert_eq!(BackboneVariant::Resnet101.num_channels(), 2048);
        assert!(matches!(
            "vgg16".parse::<BackboneVariant>(),
            Err(ConfigError::UnknownBackbone(name)) if name == "vgg16"
        ));
    }

    #[test]
    fn unknown_backbone_in_json_is_rejected() {
        let res = serde_json::from_str::<ActConfig>(r#"{"backbone": "resnet9"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn vq_fields_are_accepted() {
        let cfg: ActConfig =
            serde_json::from_str(r#"{"vq": true, "vq_class": 4, "vq_dim": 16}"#).unwrap();
        assert!(cfg.vq);
        assert_eq!(cfg.vq_class, Some(4));
        cfg.validate().unwrap();
    }

    #[test]
    fn validation_errors() {
        let mut cfg = ActConfig {
            hidden_dim: 30,
            nheads: 3,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        cfg.hidden_dim = 512;
        cfg.nheads = 8;
        cfg.camera_names.clear();
        assert!(cfg.validate().is_err());

        let cfg = ActConfig {
            dilation: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ActConfig {
            dilation: true,
            backbone: BackboneVariant::Resnet50,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }
}
