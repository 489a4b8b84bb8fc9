//! Base layer capabilities consumed by the weight decomposition.
//!
//! The decomposition never inspects a base layer by type. Everything it needs is
//! reached through two capabilities:
//! - [`WeightShapeProvider`]: the logical weight shape, plus quantization metadata
//!   when the stored parameter is packed
//! - [`Dequantize`]: a materialized, full-precision copy of the weight
//!
//! [`BaseLayer`] implements both for the candle layers DoRA can wrap.

use std::sync::Arc;

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{Device, Module, Shape, Tensor};
use candle_nn::{Conv2d, Embedding, Linear};

use crate::decomposition::LayerKind;
use crate::error::Result;

/// Metadata describing a quantized weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuantizationInfo {
    /// Shape of the weight once dequantized.
    pub shape: Shape,
    /// Quantization format.
    pub dtype: GgmlDType,
}

/// Shape of a base layer weight as reported by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightShapeInfo {
    /// Shape of the stored parameter (packed storage for quantized weights).
    pub shape: Shape,
    /// Present when the parameter is quantized.
    pub quantization: Option<QuantizationInfo>,
}

impl WeightShapeInfo {
    /// Shape info for a plain, non-quantized weight.
    #[must_use]
    pub fn plain(shape: Shape) -> Self {
        Self {
            shape,
            quantization: None,
        }
    }

    /// The full-size shape; the quantization shape wins over the storage shape.
    #[must_use]
    pub fn logical_shape(&self) -> &Shape {
        self.quantization
            .as_ref()
            .map_or(&self.shape, |quant| &quant.shape)
    }
}

/// Capability reporting the shape of a base layer weight.
pub trait WeightShapeProvider {
    /// Report the weight shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the shape cannot be determined.
    fn weight_shape(&self) -> Result<WeightShapeInfo>;
}

/// Adapts a closure into a [`WeightShapeProvider`].
pub struct ShapeFn<F>(pub F);

impl<F> WeightShapeProvider for ShapeFn<F>
where
    F: Fn() -> Result<WeightShapeInfo>,
{
    fn weight_shape(&self) -> Result<WeightShapeInfo> {
        (self.0)()
    }
}

/// Capability producing a materialized weight.
///
/// Implementations must return a fresh tensor that owns its storage, never a
/// view aliasing the live parameter, so callers may use it freely.
pub trait Dequantize {
    /// Materialize the full-precision weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the parameter representation is not supported.
    fn dequantize(&self) -> Result<Tensor>;
}

/// A dense base layer: a dequantizable weight plus an optional bias.
pub trait LinearBase: Dequantize {
    /// Full-precision weight as read by the forward pass.
    ///
    /// Unlike [`Dequantize::dequantize`] this may share storage with the live
    /// parameter; it is detached and never written to.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight cannot be materialized.
    fn forward_weight(&self) -> Result<Tensor> {
        self.dequantize()
    }

    /// Bias added after the matrix multiply.
    fn bias(&self) -> Option<&Tensor>;
}

impl Dequantize for Linear {
    fn dequantize(&self) -> Result<Tensor> {
        Ok(self.weight().copy()?.detach())
    }
}

impl WeightShapeProvider for Linear {
    fn weight_shape(&self) -> Result<WeightShapeInfo> {
        Ok(WeightShapeInfo::plain(self.weight().shape().clone()))
    }
}

impl LinearBase for Linear {
    fn forward_weight(&self) -> Result<Tensor> {
        Ok(self.weight().detach())
    }

    fn bias(&self) -> Option<&Tensor> {
        Linear::bias(self)
    }
}

impl Dequantize for Embedding {
    fn dequantize(&self) -> Result<Tensor> {
        Ok(self.embeddings().copy()?.detach())
    }
}

impl WeightShapeProvider for Embedding {
    fn weight_shape(&self) -> Result<WeightShapeInfo> {
        Ok(WeightShapeInfo::plain(self.embeddings().shape().clone()))
    }
}

impl Dequantize for Conv2d {
    fn dequantize(&self) -> Result<Tensor> {
        Ok(self.weight().copy()?.detach())
    }
}

impl WeightShapeProvider for Conv2d {
    fn weight_shape(&self) -> Result<WeightShapeInfo> {
        Ok(WeightShapeInfo::plain(self.weight().shape().clone()))
    }
}

/// Dense layer whose weight is stored as a ggml-quantized [`QTensor`].
#[derive(Debug, Clone)]
pub struct QuantizedLinear {
    weight: Arc<QTensor>,
    bias: Option<Tensor>,
}

impl QuantizedLinear {
    /// Wrap an already quantized weight.
    #[must_use]
    pub fn new(weight: QTensor, bias: Option<Tensor>) -> Self {
        Self {
            weight: Arc::new(weight),
            bias,
        }
    }

    /// Quantize a full-precision `(out_features, in_features)` weight.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight cannot be quantized to `dtype`, e.g. when
    /// `in_features` is not a multiple of the format's block size.
    pub fn quantize(weight: &Tensor, dtype: GgmlDType, bias: Option<Tensor>) -> Result<Self> {
        let weight = QTensor::quantize(weight, dtype)?;
        Ok(Self::new(weight, bias))
    }

    /// The quantized weight.
    #[must_use]
    pub fn qtensor(&self) -> &QTensor {
        &self.weight
    }

    /// Device holding the quantized weight.
    #[must_use]
    pub fn device(&self) -> Device {
        self.weight.device()
    }
}

impl Dequantize for QuantizedLinear {
    fn dequantize(&self) -> Result<Tensor> {
        Ok(self.weight.dequantize(&self.weight.device())?)
    }
}

impl WeightShapeProvider for QuantizedLinear {
    fn weight_shape(&self) -> Result<WeightShapeInfo> {
        Ok(WeightShapeInfo {
            shape: Shape::from(self.weight.storage_size_in_bytes()),
            quantization: Some(QuantizationInfo {
                shape: self.weight.shape().clone(),
                dtype: self.weight.dtype(),
            }),
        })
    }
}

impl LinearBase for QuantizedLinear {
    fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }
}

/// A frozen base layer that can be wrapped by a DoRA adapter.
#[derive(Debug, Clone)]
pub enum BaseLayer {
    /// Dense layer with full-precision weight.
    Linear(Linear),
    /// Dense layer with quantized weight.
    QuantizedLinear(QuantizedLinear),
    /// Embedding table, stored `(vocab, features)`.
    Embedding(Embedding),
    /// 2D convolution, weight `(out, in / groups, kh, kw)`.
    Conv2d(Conv2d),
}

impl BaseLayer {
    /// Layer kind the decomposition must be built for.
    #[must_use]
    pub fn kind(&self) -> LayerKind {
        match self {
            Self::Linear(_) | Self::QuantizedLinear(_) => LayerKind::Dense,
            Self::Embedding(_) => LayerKind::Embedding,
            Self::Conv2d(_) => LayerKind::Conv2d,
        }
    }

    /// Device holding the base weight.
    #[must_use]
    pub fn device(&self) -> Device {
        match self {
            Self::Linear(linear) => linear.weight().device().clone(),
            Self::QuantizedLinear(linear) => linear.device(),
            Self::Embedding(embedding) => embedding.embeddings().device().clone(),
            Self::Conv2d(conv) => conv.weight().device().clone(),
        }
    }

    /// Output of the unadapted layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the base operator fails.
    pub fn forward_base(&self, input: &Tensor) -> Result<Tensor> {
        let output = match self {
            Self::Linear(linear) => linear.forward(input)?,
            Self::QuantizedLinear(linear) => {
                let weight = linear.dequantize()?;
                Linear::new(weight, linear.bias.clone()).forward(input)?
            }
            Self::Embedding(embedding) => embedding.forward(input)?,
            Self::Conv2d(conv) => conv.forward(input)?,
        };
        Ok(output)
    }
}

impl Dequantize for BaseLayer {
    fn dequantize(&self) -> Result<Tensor> {
        match self {
            Self::Linear(linear) => linear.dequantize(),
            Self::QuantizedLinear(linear) => linear.dequantize(),
            Self::Embedding(embedding) => embedding.dequantize(),
            Self::Conv2d(conv) => conv.dequantize(),
        }
    }
}

impl WeightShapeProvider for BaseLayer {
    fn weight_shape(&self) -> Result<WeightShapeInfo> {
        match self {
            Self::Linear(linear) => linear.weight_shape(),
            Self::QuantizedLinear(linear) => linear.weight_shape(),
            Self::Embedding(embedding) => embedding.weight_shape(),
            Self::Conv2d(conv) => conv.weight_shape(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_plain_shape_info() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::new(Tensor::zeros((3, 5), DType::F32, &device)?, None);
        let info = linear.weight_shape()?;
        assert!(info.quantization.is_none());
        assert_eq!(info.logical_shape().dims(), &[3, 5]);
        Ok(())
    }

    #[test]
    fn test_quantized_shape_info() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::randn(0f32, 1f32, (4, 32), &device)?;
        let linear = QuantizedLinear::quantize(&weight, GgmlDType::Q8_0, None)?;

        let info = linear.weight_shape()?;
        assert_eq!(info.logical_shape().dims(), &[4, 32]);
        assert_ne!(info.shape.dims(), &[4, 32]);
        assert_eq!(
            info.quantization.as_ref().map(|q| q.dtype),
            Some(GgmlDType::Q8_0)
        );
        assert_eq!(linear.qtensor().dtype(), GgmlDType::Q8_0);

        let dequantized = linear.dequantize()?;
        assert_eq!(dequantized.dims(), &[4, 32]);
        Ok(())
    }

    #[test]
    fn test_shape_fn_provider() -> Result<()> {
        let provider = ShapeFn(|| Ok(WeightShapeInfo::plain(Shape::from((2, 7)))));
        assert_eq!(provider.weight_shape()?.logical_shape().dims(), &[2, 7]);
        Ok(())
    }

    #[test]
    fn test_base_layer_kind() -> Result<()> {
        let device = Device::Cpu;
        let table = Tensor::zeros((10, 4), DType::F32, &device)?;
        let base = BaseLayer::Embedding(Embedding::new(table, 4));
        assert_eq!(base.kind(), LayerKind::Embedding);
        assert_eq!(base.dequantize()?.dims(), &[10, 4]);

        let ids = Tensor::new(&[2u32, 5], &device)?;
        assert_eq!(base.forward_base(&ids)?.dims(), &[2, 4]);
        Ok(())
    }

    #[test]
    fn test_forward_weight_is_detached_view() -> Result<()> {
        let device = Device::Cpu;
        let var = candle_core::Var::randn(0f32, 1f32, (3, 4), &device)?;
        let linear = Linear::new(var.as_tensor().clone(), None);

        let weight = linear.forward_weight()?;
        assert!(!weight.is_variable());
        assert_eq!(
            weight.to_vec2::<f32>()?,
            var.as_tensor().to_vec2::<f32>()?
        );

        let grads = weight.sum_all()?.backward()?;
        assert!(grads.get(var.as_tensor()).is_none());
        Ok(())
    }
}
