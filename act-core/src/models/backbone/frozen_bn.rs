use candle_core::{Module, Result, Tensor};
use candle_nn::{init::Init, VarBuilder};

const EPS: f64 = 1e-5;

/// BatchNorm2d where the batch statistics and the affine parameters are fixed.
///
/// All four tensors are detached when read so gradients never reach them. They still share
/// storage with the variables they came from, which lets pretrained statistics be copied in
/// after construction.
#[derive(Debug, Clone)]
pub struct FrozenBatchNorm2d {
    weight: Tensor,
    bias: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
}

impl FrozenBatchNorm2d {
    pub fn new(num_features: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(num_features, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(num_features, "bias", Init::Const(0.))?;
        let running_mean = vb.get_with_hints(num_features, "running_mean", Init::Const(0.))?;
        let running_var = vb.get_with_hints(num_features, "running_var", Init::Const(1.))?;
        Ok(Self::from_tensors(weight, bias, running_mean, running_var))
    }

    pub fn from_tensors(
        weight: Tensor,
        bias: Tensor,
        running_mean: Tensor,
        running_var: Tensor,
    ) -> Self {
        Self {
            weight: weight.detach(),
            bias: bias.detach(),
            running_mean: running_mean.detach(),
            running_var: running_var.detach(),
        }
    }
}

impl Module for FrozenBatchNorm2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let n = self.weight.dim(0)?;
        let scale = (&self.weight * (&self.running_var + EPS)?.powf(-0.5)?)?;
        let shift = (&self.bias - (&self.running_mean * &scale)?)?;
        let scale = scale.reshape((1, n, 1, 1))?.to_dtype(xs.dtype())?;
        let shift = shift.reshape((1, n, 1, 1))?.to_dtype(xs.dtype())?;
        xs.broadcast_mul(&scale)?.broadcast_add(&shift)
    }
}
