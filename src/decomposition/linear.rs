//! Dense layer strategy.

use candle_core::{Module, Tensor};
use candle_nn::Linear;
use tracing::trace;

use super::{channel_norm, LayerKind, LoraFactors, WeightDecomposition};
use crate::base::LinearBase;
use crate::error::Result;

/// Row norms of a `(out_features, in_features)` weight, shaped `(out, 1)`.
pub(crate) fn weight_norm(weight: &Tensor) -> Result<Tensor> {
    channel_norm(weight)
}

impl WeightDecomposition {
    /// DoRA forward for a dense layer.
    ///
    /// Rebuilds `W' = W + s * ΔW`, rescales each output row by
    /// `m / (||W'||_c + eps)` and applies the linear operator once:
    /// `x @ (scale * W')^T + bias`.
    ///
    /// # Errors
    ///
    /// Returns an error if this decomposition is not dense, is uninitialized,
    /// or the input and factor shapes do not line up.
    pub fn forward_linear<B>(
        &self,
        input: &Tensor,
        factors: &LoraFactors,
        scaling: f64,
        base: &B,
    ) -> Result<Tensor>
    where
        B: LinearBase + ?Sized,
    {
        self.expect_kind(LayerKind::Dense)?;

        let weight = self.orient(&base.forward_weight()?)?.to_dtype(input.dtype())?;
        let composed = self.composed_weight(&weight, factors, scaling)?;
        let scale = self.magnitude_scale(&composed)?;
        let reweighted = composed.broadcast_mul(&scale)?;

        let bias = base
            .bias()
            .map(|bias| bias.to_dtype(input.dtype()))
            .transpose()?;
        let output = Linear::new(reweighted, bias).forward(input)?;

        trace!(input = ?input.dims(), output = ?output.dims(), "dora linear forward");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::QuantizedLinear;
    use crate::decomposition::{epsilon, InitOptions};
    use crate::error::DoraError;
    use crate::gather::LocalParams;
    use approx::assert_abs_diff_eq;
    use candle_core::quantized::GgmlDType;
    use candle_core::{DType, Device, Var};

    fn init(base: &Linear, factors: &LoraFactors) -> Result<WeightDecomposition> {
        let mut dora = WeightDecomposition::new(LayerKind::Dense);
        dora.update_layer(base, factors, 1.0, &LocalParams, InitOptions::default())?;
        Ok(dora)
    }

    #[test]
    fn test_zero_scaling_matches_base_output() -> Result<()> {
        let device = Device::Cpu;
        let base = Linear::new(
            Tensor::new(&[[3f32, 4.]], &device)?,
            Some(Tensor::new(&[0.5f32], &device)?),
        );
        let factors = LoraFactors::new(
            Tensor::randn(0f32, 1f32, (2, 2), &device)?,
            Tensor::randn(0f32, 1f32, (1, 2), &device)?,
        );
        let dora = init(&base, &factors)?;

        let input = Tensor::new(&[[1f32, 2.], [-1., 0.5]], &device)?;
        let expected = base.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;
        let output = dora.forward_linear(&input, &factors, 0.0, &base)?;
        let output = output.flatten_all()?.to_vec1::<f32>()?;

        assert_abs_diff_eq!(expected[0], 11.5, epsilon = 1e-6);
        for (got, want) in output.iter().zip(&expected) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_forward_shape_batched() -> Result<()> {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::randn(0f32, 1f32, (16, 8), &device)?, None);
        let factors = LoraFactors::new(
            Tensor::randn(0f32, 1f32, (4, 8), &device)?,
            Tensor::randn(0f32, 1f32, (16, 4), &device)?,
        );
        let dora = init(&base, &factors)?;

        let input = Tensor::randn(0f32, 1f32, (2, 5, 8), &device)?;
        let output = dora.forward_linear(&input, &factors, 0.25, &base)?;
        assert_eq!(output.dims(), &[2, 5, 16]);
        Ok(())
    }

    #[test]
    fn test_forward_is_deterministic() -> Result<()> {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::randn(0f32, 1f32, (6, 4), &device)?, None);
        let factors = LoraFactors::new(
            Tensor::randn(0f32, 1f32, (2, 4), &device)?,
            Tensor::randn(0f32, 1f32, (6, 2), &device)?,
        );
        let dora = init(&base, &factors)?;

        let input = Tensor::randn(0f32, 1f32, (3, 4), &device)?;
        let first = dora.forward_linear(&input, &factors, 0.5, &base)?.to_vec2::<f32>()?;
        let second = dora.forward_linear(&input, &factors, 0.5, &base)?.to_vec2::<f32>()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_zero_channel_stays_finite() -> Result<()> {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::new(&[[0f32, 0.], [1., 2.]], &device)?, None);
        let factors = LoraFactors::new(
            Tensor::randn(0f32, 1f32, (1, 2), &device)?,
            Tensor::zeros((2, 1), DType::F32, &device)?,
        );
        let dora = init(&base, &factors)?;

        let input = Tensor::new(&[[1f32, 1.]], &device)?;
        let output = dora.forward_linear(&input, &factors, 1.0, &base)?.to_vec2::<f32>()?;
        assert!(output[0].iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(output[0][0], 0.0);
        Ok(())
    }

    #[test]
    fn test_norm_is_detached_from_factors() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1f32, (3, 4), &device)?;
        let base = Linear::new(weight.clone(), None);
        let down = Var::randn(0f32, 1f32, (2, 4), &device)?;
        let up = Var::randn(0f32, 1f32, (3, 2), &device)?;
        let factors = LoraFactors::new(down.as_tensor().clone(), up.as_tensor().clone());
        let dora = init(&base, &factors)?;
        let scaling = 0.5;

        let input = Tensor::randn(0f32, 1f32, (5, 4), &device)?;
        let output = dora.forward_linear(&input, &factors, scaling, &base)?;
        let grads = output.sqr()?.sum_all()?.backward()?;

        // Same computation with the per-row scale frozen into a constant.
        let delta = up.matmul(&down)?.affine(scaling, 0.0)?;
        let composed = weight.add(&delta)?;
        let norm_values = composed.sqr()?.sum_keepdim(1)?.sqrt()?.flatten_all()?.to_vec1::<f32>()?;
        let norm = Tensor::from_vec(norm_values, (3, 1), &device)?.affine(1.0, epsilon(DType::F32))?;
        let magnitude_values = dora.magnitude()?.flatten_all()?.to_vec1::<f32>()?;
        let magnitude = Tensor::from_vec(magnitude_values, (3, 1), &device)?;
        let scale = magnitude.div(&norm)?;
        let reference = input.matmul(&composed.broadcast_mul(&scale)?.t()?)?;
        let reference_grads = reference.sqr()?.sum_all()?.backward()?;

        for var in [&down, &up] {
            let got = grads.get(var).ok_or(DoraError::Uninitialized)?;
            let want = reference_grads.get(var).ok_or(DoraError::Uninitialized)?;
            let got = got.flatten_all()?.to_vec1::<f32>()?;
            let want = want.flatten_all()?.to_vec1::<f32>()?;
            for (g, w) in got.iter().zip(&want) {
                assert!((g - w).abs() <= 1e-3 * w.abs().max(1.0), "{g} vs {w}");
            }
        }
        assert!(grads.get(dora.magnitude()?).is_some());
        Ok(())
    }

    #[test]
    fn test_quantized_base() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1f32, (4, 32), &device)?;
        let base = QuantizedLinear::quantize(&weight, GgmlDType::Q8_0, None)?;
        let factors = LoraFactors::new(
            Tensor::randn(0f32, 1f32, (2, 32), &device)?,
            Tensor::zeros((4, 2), DType::F32, &device)?,
        );
        let mut dora = WeightDecomposition::new(LayerKind::Dense);
        dora.update_layer(&base, &factors, 1.0, &LocalParams, InitOptions::default())?;
        assert_eq!(dora.weight_shape().map(|s| s.dims().to_vec()), Some(vec![4, 32]));

        let magnitude = dora.magnitude()?.flatten_all()?.to_vec1::<f32>()?;
        for (row, m) in weight.to_vec2::<f32>()?.iter().zip(magnitude) {
            let expected = row.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!(((m - expected) / expected).abs() < 2e-2);
        }

        let input = Tensor::randn(0f32, 1f32, (3, 32), &device)?;
        let output = dora.forward_linear(&input, &factors, 1.0, &base)?;
        assert_eq!(output.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn test_wrong_kind_rejected() -> Result<()> {
        let device = Device::Cpu;
        let base = Linear::new(Tensor::ones((2, 2), DType::F32, &device)?, None);
        let factors = LoraFactors::new(
            Tensor::ones((1, 2), DType::F32, &device)?,
            Tensor::zeros((2, 1), DType::F32, &device)?,
        );
        let dora = WeightDecomposition::new(LayerKind::Conv2d);
        let input = Tensor::ones((1, 2), DType::F32, &device)?;
        let result = dora.forward_linear(&input, &factors, 1.0, &base);
        assert!(matches!(result, Err(DoraError::LayerKindMismatch { .. })));
        Ok(())
    }
}
