//! 2D convolution strategy.

use candle_core::Tensor;
use candle_nn::Conv2d;
use tracing::trace;

use super::{LayerKind, LoraFactors, WeightDecomposition};
use crate::error::{DoraError, Result};

/// Norm of each output filter over `(in, kh, kw)`, shaped `(out, 1, 1, 1)`.
pub(crate) fn weight_norm(weight: &Tensor) -> Result<Tensor> {
    if weight.rank() != 4 {
        return Err(DoraError::DimensionMismatch {
            message: format!("conv2d weight must be 4D, got {:?}", weight.dims()),
        });
    }
    Ok(weight.sqr()?.sum_keepdim((1, 2, 3))?.sqrt()?)
}

impl WeightDecomposition {
    /// DoRA forward for a 2D convolution.
    ///
    /// The reweighted kernel `m * W' / (||W'||_c + eps)` is convolved once with
    /// the base layer's stride, padding, dilation and groups; the bias is added
    /// unscaled.
    ///
    /// # Errors
    ///
    /// Returns an error if this decomposition is not a convolution, is
    /// uninitialized, or the input is not `(batch, channels, h, w)`.
    pub fn forward_conv2d(
        &self,
        input: &Tensor,
        factors: &LoraFactors,
        scaling: f64,
        base: &Conv2d,
    ) -> Result<Tensor> {
        self.expect_kind(LayerKind::Conv2d)?;

        let weight = base.weight().detach().to_dtype(input.dtype())?;
        let composed = self.composed_weight(&weight, factors, scaling)?;
        let scale = self.magnitude_scale(&composed)?;
        let kernel = composed.broadcast_mul(&scale)?;

        let config = base.config();
        let output = input.conv2d(
            &kernel,
            config.padding,
            config.stride,
            config.dilation,
            config.groups,
        )?;
        let output = match base.bias() {
            Some(bias) => {
                let bias = bias.to_dtype(input.dtype())?.reshape((1, bias.dim(0)?, 1, 1))?;
                output.broadcast_add(&bias)?
            }
            None => output,
        };

        trace!(input = ?input.dims(), output = ?output.dims(), "dora conv2d forward");
        Ok(output)
    }
}
