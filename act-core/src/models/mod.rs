use candle_nn::VarBuilder;

pub mod backbone;
pub mod detr_vae;
mod nested_tensor;
pub mod position_encoding;
pub mod transformer;

pub use nested_tensor::NestedTensor;

/// A pair of builders walking the same module path: `params` hands out trainable variables,
/// `buffers` hands out frozen state (batch-norm statistics) that is never given to an optimizer.
#[derive(Clone)]
pub struct SplitVarBuilder<'a> {
    pub params: VarBuilder<'a>,
    pub buffers: VarBuilder<'a>,
}

impl<'a> SplitVarBuilder<'a> {
    pub fn pp<S: ToString>(&self, s: S) -> Self {
        let s = s.to_string();
        Self {
            params: self.params.pp(&s),
            buffers: self.buffers.pp(s),
        }
    }
}
