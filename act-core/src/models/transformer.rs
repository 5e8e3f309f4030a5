use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{layer_norm, linear, Activation, Dropout, LayerNorm, Linear, VarBuilder};

use crate::config::ActConfig;

// https://github.com/facebookresearch/detr/blob/main/models/transformer.py

fn with_pos_embed(xs: &Tensor, pos: Option<&Tensor>) -> Result<Tensor> {
    match pos {
        Some(pos) => xs.broadcast_add(pos),
        None => Ok(xs.clone()),
    }
}

/// Multi-head attention over batch-first inputs (batch, seq, d_model).
#[derive(Debug, Clone)]
struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
    dropout: Dropout,
    neg_inf: Tensor,
}

impl MultiHeadAttention {
    fn new(d_model: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let head_dim = d_model / num_heads;
        Ok(Self {
            q_proj: linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: linear(d_model, d_model, vb.pp("v_proj"))?,
            out_proj: linear(d_model, d_model, vb.pp("out_proj"))?,
            num_heads,
            head_dim,
            scale: 1. / (head_dim as f64).sqrt(),
            dropout: Dropout::new(dropout),
            neg_inf: Tensor::new(f32::NEG_INFINITY, vb.device())?.to_dtype(vb.dtype())?,
        })
    }

    /// `key_padding_mask` is (batch, key_len) with `1` on keys that must be ignored.
    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (b_sz, q_len, d_model) = query.dims3()?;
        let k_len = key.dim(1)?;

        let q = self
            .q_proj
            .forward(query)?
            .reshape((b_sz, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(key)?
            .reshape((b_sz, k_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(value)?
            .reshape((b_sz, k_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let attn_weights = (q.matmul(&k.t()?)? * self.scale)?;
        let attn_weights = match key_padding_mask {
            Some(mask) => {
                let shape = attn_weights.shape();
                let mask = mask
                    .to_dtype(DType::U8)?
                    .unsqueeze(1)?
                    .unsqueeze(1)?
                    .broadcast_as(shape)?;
                mask.where_cond(&self.neg_inf.broadcast_as(shape)?, &attn_weights)?
            }
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = self.dropout.forward(&attn_weights, train)?;

        attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, q_len, d_model))?
            .apply(&self.out_proj)
    }
}

/// Shared feed-forward block: linear2(dropout(activation(linear1(x)))).
#[derive(Debug, Clone)]
struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    activation: Activation,
    dropout: Dropout,
}

impl FeedForward {
    fn new(cfg: &ActConfig, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            linear1: linear(cfg.hidden_dim, cfg.dim_feedforward, vb.pp("linear1"))?,
            linear2: linear(cfg.dim_feedforward, cfg.hidden_dim, vb.pp("linear2"))?,
            activation: cfg.activation,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.linear1)?.apply(&self.activation)?;
        self.dropout.forward(&xs, train)?.apply(&self.linear2)
    }
}

#[derive(Debug, Clone)]
pub struct TransformerEncoderLayer {
    self_attn: MultiHeadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout1: Dropout,
    dropout2: Dropout,
    normalize_before: bool,
}

impl TransformerEncoderLayer {
    pub fn new(cfg: &ActConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(
                cfg.hidden_dim,
                cfg.nheads,
                cfg.dropout,
                vb.pp("self_attn"),
            )?,
            ffn: FeedForward::new(cfg, &vb)?,
            norm1: layer_norm(cfg.hidden_dim, 1e-5, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.hidden_dim, 1e-5, vb.pp("norm2"))?,
            dropout1: Dropout::new(cfg.dropout),
            dropout2: Dropout::new(cfg.dropout),
            normalize_before: cfg.pre_norm,
        })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        src_key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        if self.normalize_before {
            let src2 = src.apply(&self.norm1)?;
            let q = with_pos_embed(&src2, pos)?;
            let src2 = self
                .self_attn
                .forward(&q, &q, &src2, src_key_padding_mask, train)?;
            let src = (src + self.dropout1.forward(&src2, train)?)?;
            let src2 = self.ffn.forward(&src.apply(&self.norm2)?, train)?;
            src + self.dropout2.forward(&src2, train)?
        } else {
            let q = with_pos_embed(src, pos)?;
            let src2 = self
                .self_attn
                .forward(&q, &q, src, src_key_padding_mask, train)?;
            let src = (src + self.dropout1.forward(&src2, train)?)?.apply(&self.norm1)?;
            let src2 = self.ffn.forward(&src, train)?;
            (src + self.dropout2.forward(&src2, train)?)?.apply(&self.norm2)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    layers: Vec<TransformerEncoderLayer>,
    norm: Option<LayerNorm>,
}

impl TransformerEncoder {
    /// The trailing norm only exists in pre-norm mode, where the last layer leaves its
    /// output unnormalized.
    pub fn new(cfg: &ActConfig, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let vb_l = vb.pp("layers");
        let layers = (0..num_layers)
            .map(|i| TransformerEncoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = if cfg.pre_norm {
            Some(layer_norm(cfg.hidden_dim, 1e-5, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self { layers, norm })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        src_key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut output = src.clone();
        for layer in &self.layers {
            output = layer.forward(&output, src_key_padding_mask, pos, train)?;
        }
        match &self.norm {
            Some(norm) => output.apply(norm),
            None => Ok(output),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformerDecoderLayer {
    self_attn: MultiHeadAttention,
    multihead_attn: MultiHeadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    dropout1: Dropout,
    dropout2: Dropout,
    dropout3: Dropout,
    normalize_before: bool,
}

impl TransformerDecoderLayer {
    pub fn new(cfg: &ActConfig, vb: VarBuilder) -> Result<Self> {
        let attn = |name: &str| {
            MultiHeadAttention::new(cfg.hidden_dim, cfg.nheads, cfg.dropout, vb.pp(name))
        };
        let norm = |name: &str| layer_norm(cfg.hidden_dim, 1e-5, vb.pp(name));
        Ok(Self {
            self_attn: attn("self_attn")?,
            multihead_attn: attn("multihead_attn")?,
            ffn: FeedForward::new(cfg, &vb)?,
            norm1: norm("norm1")?,
            norm2: norm("norm2")?,
            norm3: norm("norm3")?,
            dropout1: Dropout::new(cfg.dropout),
            dropout2: Dropout::new(cfg.dropout),
            dropout3: Dropout::new(cfg.dropout),
            normalize_before: cfg.pre_norm,
        })
    }

    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        memory_key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        if self.normalize_before {
            let tgt2 = tgt.apply(&self.norm1)?;
            let q = with_pos_embed(&tgt2, query_pos)?;
            let tgt2 = self.self_attn.forward(&q, &q, &tgt2, None, train)?;
            let tgt = (tgt + self.dropout1.forward(&tgt2, train)?)?;

            let tgt2 = tgt.apply(&self.norm2)?;
            let tgt2 = self.multihead_attn.forward(
                &with_pos_embed(&tgt2, query_pos)?,
                &with_pos_embed(memory, pos)?,
                memory,
                memory_key_padding_mask,
                train,
            )?;
            let tgt = (tgt + self.dropout2.forward(&tgt2, train)?)?;

            let tgt2 = self.ffn.forward(&tgt.apply(&self.norm3)?, train)?;
            tgt + self.dropout3.forward(&tgt2, train)?
        } else {
            let q = with_pos_embed(tgt, query_pos)?;
            let tgt2 = self.self_attn.forward(&q, &q, tgt, None, train)?;
            let tgt = (tgt + self.dropout1.forward(&tgt2, train)?)?.apply(&self.norm1)?;

            let tgt2 = self.multihead_attn.forward(
                &with_pos_embed(&tgt, query_pos)?,
                &with_pos_embed(memory, pos)?,
                memory,
                memory_key_padding_mask,
                train,
            )?;
            let tgt = (tgt + self.dropout2.forward(&tgt2, train)?)?.apply(&self.norm2)?;

            let tgt2 = self.ffn.forward(&tgt, train)?;
            (tgt + self.dropout3.forward(&tgt2, train)?)?.apply(&self.norm3)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    layers: Vec<TransformerDecoderLayer>,
    norm: LayerNorm,
}

impl TransformerDecoder {
    pub fn new(cfg: &ActConfig, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let vb_l = vb.pp("layers");
        let layers = (0..num_layers)
            .map(|i| TransformerDecoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            norm: layer_norm(cfg.hidden_dim, 1e-5, vb.pp("norm"))?,
        })
    }

    /// Returns the normalized output of every layer stacked as (layers, batch, queries, d_model).
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        memory_key_padding_mask: Option<&Tensor>,
        pos: Option<&Tensor>,
        query_pos: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let mut output = tgt.clone();
        let mut intermediate = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            output = layer.forward(
                &output,
                memory,
                memory_key_padding_mask,
                pos,
                query_pos,
                train,
            )?;
            intermediate.push(output.apply(&self.norm)?);
        }
        Tensor::stack(&intermediate, 0)
    }
}

/// Transformer encoder-decoder fusing camera features with the latent and proprioceptive tokens.
#[derive(Debug, Clone)]
pub struct Transformer {
    encoder: TransformerEncoder,
    decoder: TransformerDecoder,
    d_model: usize,
}

impl Transformer {
    pub fn new(cfg: &ActConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: TransformerEncoder::new(cfg, cfg.enc_layers, vb.pp("encoder"))?,
            decoder: TransformerDecoder::new(cfg, cfg.dec_layers, vb.pp("decoder"))?,
            d_model: cfg.hidden_dim,
        })
    }

    /// - `src`: (batch, d_model, h, w) projected camera features, cameras folded into `w`
    /// - `mask`: optional (batch, h, w) padding mask over `src`
    /// - `query_embed`: (num_queries, d_model)
    /// - `pos_embed`: (1 or batch, d_model, h, w)
    /// - `latent_input`, `proprio_input`: (batch, d_model)
    /// - `additional_pos_embed`: (2, d_model), positions of the latent and proprio tokens
    ///
    /// Returns (dec_layers, batch, num_queries, d_model).
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        src: &Tensor,
        mask: Option<&Tensor>,
        query_embed: &Tensor,
        pos_embed: &Tensor,
        latent_input: &Tensor,
        proprio_input: &Tensor,
        additional_pos_embed: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (bs, c, h, w) = src.dims4()?;
        if c != self.d_model {
            candle_core::bail!("Expected {} source channels, got {c}", self.d_model);
        }
        let src = src.flatten_from(2)?.transpose(1, 2)?;
        let pos_embed = pos_embed
            .flatten_from(2)?
            .transpose(1, 2)?
            .broadcast_as((bs, h * w, c))?;
        let query_embed = query_embed.unsqueeze(0)?.broadcast_as((
            bs,
            query_embed.dim(0)?,
            c,
        ))?;
        let additional_pos_embed = additional_pos_embed.unsqueeze(0)?.broadcast_as((bs, 2, c))?;

        let pos_embed = Tensor::cat(&[&additional_pos_embed, &pos_embed], 1)?;
        let addition_input = Tensor::stack(&[latent_input, proprio_input], 1)?;
        let src = Tensor::cat(&[&addition_input, &src], 1)?;
        let mask = match mask {
            Some(mask) => {
                let extra = Tensor::zeros((bs, 2), DType::U8, mask.device())?;
                Some(Tensor::cat(
                    &[extra, mask.to_dtype(DType::U8)?.flatten_from(1)?],
                    1,
                )?)
            }
            None => None,
        };

        let tgt = query_embed.zeros_like()?;
        let memory = self
            .encoder
            .forward(&src, mask.as_ref(), Some(&pos_embed), train)?;
        self.decoder.forward(
            &tgt,
            &memory,
            mask.as_ref(),
            Some(&pos_embed),
            Some(&query_embed),
            train,
        )
    }
}
